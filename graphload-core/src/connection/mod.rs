//! Graph database collaborators
//!
//! A connection answers schema introspection, installs the partitioning
//! queries and executes them either as a bulk fetch or as a publication to
//! a broker channel.

pub mod memory;
pub mod rest;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::broker::BrokerConfig;
use crate::data::config::{AttributeSelection, LoaderConfig, LoaderKind};
use crate::data::partition::PartitionPlan;
use crate::error::TransportError;
use crate::schema::{ElementKind, GraphSchema};

pub use memory::{Faults, MemoryGraph};
pub use rest::{ConnectionConfig, RestConnection};

/// Parameters of one partitioning query execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchRequest {
    /// Installed query name
    pub query: String,
    pub kind: LoaderKind,
    pub vertex_types: Vec<String>,
    pub edge_types: Vec<String>,
    pub vertex_attributes: AttributeSelection,
    pub edge_attributes: AttributeSelection,
    pub filter_by: Option<String>,
    pub num_batches: usize,
    /// 0 keeps the natural element order
    pub seed: u64,
    /// Partitions to return; empty means all of them
    pub partitions: Vec<u32>,
    /// Only count the filtered elements
    pub count_only: bool,
}

impl FetchRequest {
    pub fn new(config: &LoaderConfig, schema: &GraphSchema) -> Self {
        let types = |element: ElementKind| {
            if config.kind.includes(element) {
                config.selection(element).types(schema, element)
            } else {
                Vec::new()
            }
        };

        Self {
            query: config.kind.query_name().to_string(),
            kind: config.kind,
            vertex_types: types(ElementKind::Vertex),
            edge_types: types(ElementKind::Edge),
            vertex_attributes: config.vertex_attributes.clone(),
            edge_attributes: config.edge_attributes.clone(),
            filter_by: config.filter_by.clone(),
            num_batches: 1,
            seed: 0,
            partitions: Vec::new(),
            count_only: false,
        }
    }

    /// Request that counts the partitioned element set
    pub fn counting(&self) -> Self {
        Self {
            count_only: true,
            ..self.clone()
        }
    }

    /// Apply the split of one production pass
    pub fn with_plan(mut self, plan: &PartitionPlan) -> Self {
        self.num_batches = plan.num_batches;
        self.seed = plan.seed;
        self
    }

    /// Restrict the request to one partition
    pub fn for_partition(&self, partition: u32) -> Self {
        Self {
            partitions: vec![partition],
            ..self.clone()
        }
    }

    /// Types of the partitioned element kind
    pub fn partitioned_types(&self) -> &[String] {
        match self.kind.partitioned_element() {
            ElementKind::Vertex => &self.vertex_types,
            ElementKind::Edge => &self.edge_types,
        }
    }
}

/// Response envelope shared by every query endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    #[serde(default)]
    pub error: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default = "Vec::new")]
    pub results: Vec<T>,
}

impl<T> Envelope<T> {
    pub fn ok(results: Vec<T>) -> Self {
        Self {
            error: false,
            message: String::new(),
            results,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            error: true,
            message: message.into(),
            results: Vec::new(),
        }
    }

    /// Results, or `Rejected` when the server flagged an error
    pub fn into_results(self, status: u16) -> Result<Vec<T>, TransportError> {
        if self.error {
            Err(TransportError::Rejected {
                status,
                message: self.message,
            })
        } else {
            Ok(self.results)
        }
    }
}

/// Result row of a counting request
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CountResult {
    pub count: usize,
}

/// A connection to one graph
#[async_trait]
pub trait GraphConnection: Send + Sync {
    fn graph_name(&self) -> &str;

    /// Human readable endpoint, used in error messages
    fn endpoint(&self) -> String;

    async fn schema(&self) -> Result<GraphSchema, TransportError>;

    /// Install (compile) a partitioning query on the server
    async fn install_query(&self, query: &str) -> Result<(), TransportError>;

    /// Number of elements the request partitions
    async fn count(&self, request: &FetchRequest) -> Result<usize, TransportError>;

    /// Execute the request and return the raw response envelope.
    ///
    /// Responses larger than `limit` bytes fail with `PayloadTooLarge`.
    async fn fetch(&self, request: &FetchRequest, limit: u64) -> Result<Bytes, TransportError>;

    /// Have the server publish every partition of the request to `channel`.
    ///
    /// Resolves once publication has been triggered; messages arrive on the
    /// broker independently.
    async fn publish(
        &self,
        request: &FetchRequest,
        channel: &str,
        broker: &BrokerConfig,
    ) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::AttrKind;

    #[test]
    fn test_request_types_follow_kind() {
        let schema = GraphSchema::new("Cora")
            .with_vertex("Paper", &[("x", AttrKind::Vector)])
            .with_edge("Cite", "Paper", "Paper", &[]);

        let vertex = LoaderConfig::builder().build().unwrap();
        let request = FetchRequest::new(&vertex, &schema);
        assert_eq!(request.query, "graphload_vertex_batch");
        assert_eq!(request.vertex_types, vec!["Paper".to_string()]);
        assert!(request.edge_types.is_empty());
        assert!(request.counting().count_only);

        let graph = LoaderConfig::builder().kind(LoaderKind::Graph).build().unwrap();
        let request = FetchRequest::new(&graph, &schema);
        assert_eq!(request.partitioned_types(), &["Cite".to_string()]);
        assert_eq!(request.for_partition(3).partitions, vec![3]);
    }

    #[test]
    fn test_envelope_rejection() {
        let envelope: Envelope<CountResult> =
            serde_json::from_str(r#"{"error": true, "message": "query not installed"}"#).unwrap();
        assert_eq!(
            envelope.into_results(200).unwrap_err(),
            TransportError::Rejected {
                status: 200,
                message: "query not installed".into()
            }
        );
    }
}
