//! REST connection against an in-process HTTP server

mod common;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use common::*;
use graphload_core::connection::{ConnectionConfig, FetchRequest, GraphConnection, MemoryGraph, RestConnection};
use graphload_core::data::{Column, Frames, LoaderData};
use graphload_core::{Batch, LoaderConfig, LoaderError, LoaderFactory, LoaderState, TransportError};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

const TOKEN: &str = "secret-token";

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |v| v == format!("Bearer {}", TOKEN))
}

fn json_body(body: bytes::Bytes) -> Response {
    ([(header::CONTENT_TYPE, "application/json")], body).into_response()
}

fn upstream_error(e: TransportError) -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
}

async fn schema(headers: HeaderMap, Query(params): Query<HashMap<String, String>>) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if params.get("graph").map(String::as_str) != Some("Cora") {
        return Json(json!({"error": true, "message": "unknown graph"})).into_response();
    }
    Json(json!({
        "error": false,
        "message": "",
        "results": {
            "VertexTypes": [{
                "Name": "Paper",
                "Attributes": [
                    {"AttributeName": "x", "AttributeType": {"Name": "LIST", "ValueTypeName": "DOUBLE"}},
                    {"AttributeName": "y", "AttributeType": {"Name": "INT"}},
                    {"AttributeName": "is_train", "AttributeType": {"Name": "BOOL"}}
                ]
            }],
            "EdgeTypes": [{
                "Name": "Cite",
                "FromVertexTypeName": "Paper",
                "ToVertexTypeName": "Paper",
                "IsDirected": true,
                "Attributes": [
                    {"AttributeName": "is_train", "AttributeType": {"Name": "BOOL"}}
                ]
            }]
        }
    }))
    .into_response()
}

async fn install(
    State(graph): State<Arc<MemoryGraph>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let query = params.get("query").cloned().unwrap_or_default();
    match graph.install_query(&query).await {
        Ok(()) => Json(json!({"error": false, "message": "", "results": []})).into_response(),
        Err(e) => Json(json!({"error": true, "message": e.to_string()})).into_response(),
    }
}

async fn run_query(
    State(graph): State<Arc<MemoryGraph>>,
    Path((_graph, _query)): Path<(String, String)>,
    headers: HeaderMap,
    Json(request): Json<FetchRequest>,
) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match graph.fetch(&request, u64::MAX).await {
        Ok(body) => json_body(body),
        Err(e) => upstream_error(e),
    }
}

/// Serve `graph` on an ephemeral port from a thread of its own
fn serve(graph: Arc<MemoryGraph>) -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap();
    listener.set_nonblocking(true).unwrap();

    let app = Router::new()
        .route("/gsqlserver/gsql/schema", get(schema))
        .route("/gsqlserver/gsql/queries/install", post(install))
        .route("/query/:graph/:query", post(run_query))
        .with_state(graph);

    std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            axum::serve(listener, app).await.unwrap();
        });
    });
    format!("http://{}", address)
}

fn connect(host: String, token: Option<&str>) -> Arc<RestConnection> {
    Arc::new(
        RestConnection::new(ConnectionConfig {
            host,
            graph: "Cora".into(),
            token: token.map(str::to_string),
            ..Default::default()
        })
        .unwrap(),
    )
}

#[test]
fn test_rest_pass_covers_every_vertex_once() {
    let graph = Arc::new(cora_graph());
    let factory = LoaderFactory::new(connect(serve(graph.clone()), Some(TOKEN))).unwrap();
    assert!(factory.schema().vertex_types.contains_key("Paper"));

    let config = LoaderConfig::builder()
        .vertex_attributes(["x", "y"])
        .num_batches(5)
        .build()
        .unwrap();
    let mut loader = factory.loader(config).unwrap();

    let batches: Vec<Batch> = (&mut loader).map(|b| b.unwrap()).collect();
    assert_eq!(batches.len(), 5);
    assert_exact_cover(&vertex_ids(&batches), CORA_PAPERS);
    let table = batches[0].vertices.as_ref().and_then(Frames::single).unwrap();
    assert!(matches!(table.column("x"), Some(Column::Vector { dim: FEATURE_DIM, .. })));
    assert_eq!(graph.installed_queries(), vec!["graphload_vertex_batch".to_string()]);
}

#[test]
fn test_rest_filtered_single_batch() {
    let graph = Arc::new(cora_graph());
    let factory = LoaderFactory::new(connect(serve(graph), Some(TOKEN))).unwrap();

    let config = LoaderConfig::builder()
        .vertex_attributes(["y", "is_train"])
        .filter_by("is_train")
        .num_batches(1)
        .build()
        .unwrap();
    let mut loader = factory.loader(config).unwrap();

    match loader.data().unwrap() {
        LoaderData::Batch(batch) => {
            assert_eq!(batch.num_vertices(), CORA_TRAIN);
            let table = batch.vertices.as_ref().and_then(Frames::single).unwrap();
            assert!(table.column("is_train").and_then(Column::as_bool).unwrap().iter().all(|b| *b));
        }
        LoaderData::Loader(_) => panic!("expected a single batch"),
    }
}

#[test]
fn test_rest_rejects_missing_token() {
    let host = serve(Arc::new(cora_graph()));
    let err = LoaderFactory::new(connect(host, None)).unwrap_err();
    assert!(matches!(
        err,
        LoaderError::Transport(TransportError::Rejected { status: 401, .. })
    ));
}

#[test]
fn test_rest_payload_limit() {
    let factory = LoaderFactory::new(connect(serve(Arc::new(cora_graph())), Some(TOKEN))).unwrap();
    let config = LoaderConfig::builder()
        .vertex_attributes(["x"])
        .num_batches(2)
        .payload_limit(4096)
        .build()
        .unwrap();
    let mut loader = factory.loader(config).unwrap();

    assert!(matches!(
        loader.next(),
        Some(Err(LoaderError::Transport(TransportError::PayloadTooLarge { limit: 4096, .. })))
    ));
    assert_eq!(loader.state(), LoaderState::Cancelled);
}

#[test]
fn test_rest_unreachable_host() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let host = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let err = LoaderFactory::new(connect(host, Some(TOKEN))).unwrap_err();
    assert!(matches!(err, LoaderError::Transport(TransportError::Unreachable { .. })));
}
