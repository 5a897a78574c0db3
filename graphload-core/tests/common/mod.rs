//! Shared fixtures for loader integration tests

#![allow(dead_code)]

use graphload_core::broker::{BrokerConfig, MemoryBroker};
use graphload_core::connection::MemoryGraph;
use graphload_core::runtime::RuntimeConfig;
use graphload_core::schema::{AttrKind, GraphSchema};
use graphload_core::{Batch, LoaderFactory};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;

pub const CORA_PAPERS: usize = 2708;
pub const CORA_TRAIN: usize = 140;
pub const FEATURE_DIM: usize = 8;
pub const NUM_CLASSES: i64 = 7;

pub fn cora_schema() -> GraphSchema {
    GraphSchema::new("Cora")
        .with_vertex(
            "Paper",
            &[
                ("id", AttrKind::Int),
                ("x", AttrKind::Vector),
                ("y", AttrKind::Int),
                ("is_train", AttrKind::Bool),
            ],
        )
        .with_edge("Cite", "Paper", "Paper", &[("is_train", AttrKind::Bool)])
}

/// Feature vector of paper `i`, space-separated as the database stores it
fn features(i: usize) -> String {
    (0..FEATURE_DIM)
        .map(|d| if (i + d) % 5 == 0 { "1" } else { "0" })
        .collect::<Vec<_>>()
        .join(" ")
}

/// A Cora-shaped graph: 2708 papers, the first 140 in the training split,
/// and two citations per paper
pub fn cora_graph() -> MemoryGraph {
    let mut graph = MemoryGraph::new(cora_schema());
    for i in 0..CORA_PAPERS {
        graph.add_vertex(
            "Paper",
            i.to_string(),
            [
                ("id", json!(i)),
                ("x", json!(features(i))),
                ("y", json!(i as i64 % NUM_CLASSES)),
                ("is_train", json!(i < CORA_TRAIN)),
            ],
        );
    }
    for i in 0..CORA_PAPERS {
        for target in [(i * 7 + 1) % CORA_PAPERS, (i * 13 + 5) % CORA_PAPERS] {
            graph.add_edge(
                "Cite",
                i.to_string(),
                target.to_string(),
                [("is_train", json!(i % 10 == 0))],
            );
        }
    }
    graph
}

pub const CORA_CITATIONS: usize = 2 * CORA_PAPERS;

/// A small graph with two vertex and two edge types
pub fn academic_graph() -> MemoryGraph {
    let schema = GraphSchema::new("Academic")
        .with_vertex("Paper", &[("x", AttrKind::Vector), ("y", AttrKind::Int)])
        .with_vertex("Author", &[("name", AttrKind::Categorical), ("h_index", AttrKind::Float)])
        .with_edge("Writes", "Author", "Paper", &[("order", AttrKind::Int)])
        .with_edge("Cites", "Paper", "Paper", &[]);

    let mut graph = MemoryGraph::new(schema);
    for i in 0..30 {
        graph.add_vertex(
            "Paper",
            format!("paper{}", i),
            [("x", json!([i as f64, 1.0])), ("y", json!(i % 3))],
        );
    }
    for i in 0..10 {
        graph.add_vertex(
            "Author",
            format!("author{}", i),
            [("name", json!(format!("Author {}", i))), ("h_index", json!(i as f64 / 2.0))],
        );
    }
    for i in 0..30 {
        graph.add_edge(
            "Writes",
            format!("author{}", i % 10),
            format!("paper{}", i),
            [("order", json!(i % 2))],
        );
        graph.add_edge("Cites", format!("paper{}", i), format!("paper{}", (i + 1) % 30), Vec::<(String, Value)>::new());
    }
    graph
}

pub const SHARED_IDS: usize = 10;
pub const SHARED_ID_EDGES: usize = 3 * SHARED_IDS;

/// Users and items numbered from 0 in each type, so every id exists twice
pub fn shared_id_graph() -> MemoryGraph {
    let schema = GraphSchema::new("Ratings")
        .with_vertex("User", &[("age", AttrKind::Int)])
        .with_vertex("Item", &[("price", AttrKind::Float)])
        .with_edge("Rates", "User", "Item", &[])
        .with_edge("Follows", "User", "User", &[]);

    let mut graph = MemoryGraph::new(schema);
    for i in 0..SHARED_IDS {
        graph.add_vertex("User", i.to_string(), [("age", json!(20 + i))]);
        graph.add_vertex("Item", i.to_string(), [("price", json!(i as f64 * 1.5))]);
    }
    let none = Vec::<(String, Value)>::new;
    for i in 0..SHARED_IDS {
        graph.add_edge("Rates", i.to_string(), i.to_string(), none());
        graph.add_edge("Rates", i.to_string(), ((i + 3) % SHARED_IDS).to_string(), none());
        graph.add_edge("Follows", i.to_string(), ((i + 1) % SHARED_IDS).to_string(), none());
    }
    graph
}

/// A factory over `graph`, with the in-process broker attached
pub struct Fixture {
    pub graph: Arc<MemoryGraph>,
    pub broker: Arc<MemoryBroker>,
    pub factory: LoaderFactory,
}

impl Fixture {
    pub fn new(graph: MemoryGraph) -> Self {
        let broker = MemoryBroker::new();
        let graph = Arc::new(graph.with_broker(broker.clone()));
        let factory = LoaderFactory::with_runtime(
            graph.clone(),
            RuntimeConfig {
                worker_threads: 2,
                ..Default::default()
            },
        )
        .unwrap();

        Self {
            graph,
            broker,
            factory,
        }
    }

    pub fn cora() -> Self {
        Self::new(cora_graph())
    }

    /// Same as `cora()`, with streamed transport enabled
    pub fn cora_streamed() -> Self {
        let fixture = Self::cora();
        fixture
            .factory
            .configure_broker(BrokerConfig::new("memory://broker"), fixture.broker.clone());
        fixture
    }
}

pub fn vertex_ids(batches: &[Batch]) -> Vec<String> {
    batches
        .iter()
        .flat_map(|b| b.vertex_ids())
        .map(str::to_string)
        .collect()
}

/// Assert every paper appears exactly once
pub fn assert_exact_cover(ids: &[String], expected: usize) {
    assert_eq!(ids.len(), expected, "row count");
    let unique: HashSet<&String> = ids.iter().collect();
    assert_eq!(unique.len(), expected, "duplicate rows");
}
