//! REST connection to a graph database
//!
//! Async client using reqwest against a REST++ style endpoint: schema
//! introspection, query installation, query execution and publication
//! triggers, all answering with JSON envelopes.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{CountResult, Envelope, FetchRequest, GraphConnection};
use crate::broker::BrokerConfig;
use crate::error::TransportError;
use crate::schema::{AttrKind, Attribute, EdgeType, GraphSchema, VertexType};

/// Configuration for the REST connection
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Base URL, e.g. `http://localhost:9000`
    pub host: String,
    pub graph: String,
    /// Bearer token
    pub token: Option<String>,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost:9000".into(),
            graph: "MyGraph".into(),
            token: None,
            connect_timeout_secs: 10,
            request_timeout_secs: 300,
        }
    }
}

impl ConnectionConfig {
    /// Read `GRAPH_HOST`, `GRAPH_NAME` and `GRAPH_TOKEN`, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("GRAPH_HOST").unwrap_or(defaults.host),
            graph: std::env::var("GRAPH_NAME").unwrap_or(defaults.graph),
            token: std::env::var("GRAPH_TOKEN").ok(),
            ..defaults
        }
    }
}

/// Schema document returned by the introspection endpoint
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RestSchema {
    #[serde(default)]
    vertex_types: Vec<RestVertexType>,
    #[serde(default)]
    edge_types: Vec<RestEdgeType>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RestVertexType {
    name: String,
    #[serde(default)]
    attributes: Vec<RestAttribute>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RestEdgeType {
    name: String,
    from_vertex_type_name: String,
    to_vertex_type_name: String,
    #[serde(default = "directed_default")]
    is_directed: bool,
    #[serde(default)]
    attributes: Vec<RestAttribute>,
}

fn directed_default() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RestAttribute {
    attribute_name: String,
    attribute_type: RestAttributeType,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RestAttributeType {
    name: String,
    value_type_name: Option<String>,
}

impl RestAttribute {
    fn into_attribute(self) -> Attribute {
        Attribute {
            kind: AttrKind::from_type_name(
                &self.attribute_type.name,
                self.attribute_type.value_type_name.as_deref(),
            ),
            name: self.attribute_name,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SchemaEnvelope {
    #[serde(default)]
    error: bool,
    #[serde(default)]
    message: String,
    results: Option<RestSchema>,
}

/// Body of a publication trigger
#[derive(Debug, Serialize)]
struct PublishRequest<'a> {
    #[serde(flatten)]
    request: &'a FetchRequest,
    channel: &'a str,
    broker_address: &'a str,
    broker_username: Option<&'a str>,
    broker_password: Option<&'a str>,
}

/// Graph database client using reqwest
pub struct RestConnection {
    client: Client,
    config: ConnectionConfig,
}

impl RestConnection {
    pub fn new(config: ConnectionConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| TransportError::Unreachable {
                endpoint: config.host.clone(),
                reason: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    fn query_url(&self, query: &str) -> String {
        format!("{}/query/{}/{}", self.config.host, self.config.graph, query)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.config.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn map_error(&self, e: reqwest::Error, partition: Option<u32>) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout {
                partition,
                after: Duration::from_secs(self.config.request_timeout_secs),
            }
        } else {
            TransportError::Unreachable {
                endpoint: self.config.host.clone(),
                reason: e.to_string(),
            }
        }
    }

    async fn send(&self, builder: RequestBuilder, partition: Option<u32>) -> Result<Response, TransportError> {
        let resp = self
            .authorized(builder)
            .send()
            .await
            .map_err(|e| self.map_error(e, partition))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let message = resp.text().await.unwrap_or_default();
            return Err(TransportError::Rejected { status, message });
        }
        Ok(resp)
    }

    /// Read a response body, giving up once it grows past `limit`
    async fn read_limited(
        &self,
        mut resp: Response,
        limit: u64,
        partition: Option<u32>,
    ) -> Result<Bytes, TransportError> {
        if let Some(size) = resp.content_length() {
            if size > limit {
                return Err(TransportError::PayloadTooLarge { size, limit });
            }
        }

        let mut body = BytesMut::new();
        while let Some(chunk) = resp.chunk().await.map_err(|e| self.map_error(e, partition))? {
            body.extend_from_slice(&chunk);
            if body.len() as u64 > limit {
                return Err(TransportError::PayloadTooLarge {
                    size: body.len() as u64,
                    limit,
                });
            }
        }
        Ok(body.freeze())
    }

    async fn envelope<T: serde::de::DeserializeOwned>(
        &self,
        resp: Response,
        partition: Option<u32>,
    ) -> Result<Vec<T>, TransportError> {
        let status = resp.status().as_u16();
        let envelope: Envelope<T> = resp.json().await.map_err(|e| TransportError::DecodeFailed {
            partition,
            reason: e.to_string(),
        })?;
        envelope.into_results(status)
    }
}

#[async_trait]
impl GraphConnection for RestConnection {
    fn graph_name(&self) -> &str {
        &self.config.graph
    }

    fn endpoint(&self) -> String {
        self.config.host.clone()
    }

    async fn schema(&self) -> Result<GraphSchema, TransportError> {
        let url = format!("{}/gsqlserver/gsql/schema", self.config.host);
        let resp = self
            .send(self.client.get(&url).query(&[("graph", &self.config.graph)]), None)
            .await?;

        let envelope: SchemaEnvelope = resp.json().await.map_err(|e| TransportError::DecodeFailed {
            partition: None,
            reason: format!("schema: {}", e),
        })?;
        if envelope.error {
            return Err(TransportError::Rejected {
                status: 200,
                message: envelope.message,
            });
        }
        let rest = envelope.results.ok_or_else(|| TransportError::DecodeFailed {
            partition: None,
            reason: "schema response has no results".into(),
        })?;

        let mut schema = GraphSchema::new(self.config.graph.clone());
        for vertex in rest.vertex_types {
            schema.vertex_types.insert(
                vertex.name.clone(),
                VertexType {
                    name: vertex.name,
                    attributes: vertex.attributes.into_iter().map(RestAttribute::into_attribute).collect(),
                },
            );
        }
        for edge in rest.edge_types {
            schema.edge_types.insert(
                edge.name.clone(),
                EdgeType {
                    name: edge.name,
                    from_type: edge.from_vertex_type_name,
                    to_type: edge.to_vertex_type_name,
                    directed: edge.is_directed,
                    attributes: edge.attributes.into_iter().map(RestAttribute::into_attribute).collect(),
                },
            );
        }

        debug!(
            "Introspected {}: {} vertex types, {} edge types",
            self.config.graph,
            schema.vertex_types.len(),
            schema.edge_types.len()
        );
        Ok(schema)
    }

    async fn install_query(&self, query: &str) -> Result<(), TransportError> {
        let url = format!("{}/gsqlserver/gsql/queries/install", self.config.host);
        let resp = self
            .send(
                self.client
                    .post(&url)
                    .query(&[("graph", self.config.graph.as_str()), ("query", query)]),
                None,
            )
            .await?;
        self.envelope::<serde_json::Value>(resp, None).await?;
        debug!("Installed query {} on {}", query, self.config.graph);
        Ok(())
    }

    async fn count(&self, request: &FetchRequest) -> Result<usize, TransportError> {
        let counting = request.counting();
        let resp = self
            .send(self.client.post(self.query_url(&request.query)).json(&counting), None)
            .await?;
        let results: Vec<CountResult> = self.envelope(resp, None).await?;
        results
            .first()
            .map(|r| r.count)
            .ok_or_else(|| TransportError::DecodeFailed {
                partition: None,
                reason: "count response has no results".into(),
            })
    }

    async fn fetch(&self, request: &FetchRequest, limit: u64) -> Result<Bytes, TransportError> {
        let partition = request.partitions.first().copied();
        let resp = self
            .send(self.client.post(self.query_url(&request.query)).json(request), partition)
            .await?;
        let body = self.read_limited(resp, limit, partition).await?;

        debug!(
            "Fetched {} bytes for partitions {:?} of {}",
            body.len(),
            request.partitions,
            request.query
        );
        Ok(body)
    }

    async fn publish(
        &self,
        request: &FetchRequest,
        channel: &str,
        broker: &BrokerConfig,
    ) -> Result<(), TransportError> {
        let url = format!("{}/publish", self.query_url(&request.query));
        let body = PublishRequest {
            request,
            channel,
            broker_address: &broker.address,
            broker_username: broker.username.as_deref(),
            broker_password: broker.password.as_deref(),
        };
        let resp = self.send(self.client.post(&url).json(&body), None).await?;
        self.envelope::<serde_json::Value>(resp, None).await?;

        debug!("Triggered publication of {} to channel {}", request.query, channel);
        Ok(())
    }
}
