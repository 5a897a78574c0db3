//! In-process graph
//!
//! Holds vertices and edges in memory and answers the partitioning queries
//! the same way the database does: the filtered element set in canonical
//! order, permuted by the request seed, cut into `num_batches` contiguous
//! ranges. Faults can be injected to exercise failure paths.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use rand::seq::SliceRandom;
use rand::{rngs::StdRng, SeedableRng};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{CountResult, Envelope, FetchRequest, GraphConnection};
use crate::broker::{BrokerConfig, MemoryBroker};
use crate::data::batch::{RawBatch, RawSection, RawTable, EDGE_SOURCE, EDGE_TARGET, IS_SEED, VERTEX_ID};
use crate::data::config::{AttributeSelection, LoaderKind};
use crate::data::partition::partition_range;
use crate::error::TransportError;
use crate::schema::{ElementKind, GraphSchema};

/// Names of the partitioning queries this graph can run
const KNOWN_QUERIES: [&str; 4] = [
    "graphload_vertex_batch",
    "graphload_edge_batch",
    "graphload_graph_batch",
    "graphload_neighbor_batch",
];

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryVertex {
    pub id: String,
    pub attributes: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryEdge {
    pub source: String,
    pub target: String,
    pub attributes: BTreeMap<String, Value>,
}

/// Injected failures
#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// Every call fails with `Unreachable`
    pub unreachable: bool,
    /// Fetches touching these partitions fail with `Unreachable`
    pub unreachable_partitions: HashSet<u32>,
    /// Delay before answering a fetch
    pub fetch_delay: Option<Duration>,
    /// Delay before publishing each message
    pub publish_delay: Option<Duration>,
    /// Published with a payload that does not match its checksum
    pub corrupt_partitions: HashSet<u32>,
    /// Published twice
    pub duplicate_partitions: HashSet<u32>,
    /// Never published
    pub withheld_partitions: HashSet<u32>,
    /// Publish partitions from last to first
    pub reverse_publish: bool,
}

#[derive(Default)]
struct Calls {
    install: AtomicUsize,
    count: AtomicUsize,
    fetch: AtomicUsize,
    publish: AtomicUsize,
}

/// Graph held in process memory
pub struct MemoryGraph {
    schema: GraphSchema,
    vertices: BTreeMap<String, Vec<MemoryVertex>>,
    edges: BTreeMap<String, Vec<MemoryEdge>>,
    broker: Option<Arc<MemoryBroker>>,
    faults: Mutex<Faults>,
    installed: Mutex<BTreeSet<String>>,
    calls: Calls,
}

/// One partitioned element
#[derive(Clone, Copy)]
enum Element<'a> {
    Vertex(&'a str, &'a MemoryVertex),
    Edge(&'a str, &'a MemoryEdge),
}

type VertexKey<'a> = (&'a str, &'a str);

impl MemoryGraph {
    pub fn new(schema: GraphSchema) -> Self {
        Self {
            schema,
            vertices: BTreeMap::new(),
            edges: BTreeMap::new(),
            broker: None,
            faults: Mutex::new(Faults::default()),
            installed: Mutex::new(BTreeSet::new()),
            calls: Calls::default(),
        }
    }

    /// Publish streamed partitions to this broker
    pub fn with_broker(mut self, broker: Arc<MemoryBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn add_vertex<I, K>(&mut self, type_name: &str, id: impl Into<String>, attributes: I)
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        self.vertices
            .entry(type_name.to_string())
            .or_default()
            .push(MemoryVertex {
                id: id.into(),
                attributes: attributes.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            });
    }

    pub fn add_edge<I, K>(
        &mut self,
        type_name: &str,
        source: impl Into<String>,
        target: impl Into<String>,
        attributes: I,
    ) where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        self.edges
            .entry(type_name.to_string())
            .or_default()
            .push(MemoryEdge {
                source: source.into(),
                target: target.into(),
                attributes: attributes.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            });
    }

    /// Injected failures, adjustable at any time
    pub fn faults(&self) -> MutexGuard<'_, Faults> {
        self.faults.lock()
    }

    pub fn installed_queries(&self) -> Vec<String> {
        self.installed.lock().iter().cloned().collect()
    }

    pub fn install_calls(&self) -> usize {
        self.calls.install.load(Ordering::Relaxed)
    }

    pub fn count_calls(&self) -> usize {
        self.calls.count.load(Ordering::Relaxed)
    }

    pub fn fetch_calls(&self) -> usize {
        self.calls.fetch.load(Ordering::Relaxed)
    }

    pub fn publish_calls(&self) -> usize {
        self.calls.publish.load(Ordering::Relaxed)
    }

    fn unreachable(&self, reason: &str) -> TransportError {
        TransportError::Unreachable {
            endpoint: self.endpoint(),
            reason: reason.to_string(),
        }
    }

    /// The filtered partitioned set in canonical order
    fn elements(&self, request: &FetchRequest) -> Vec<Element<'_>> {
        let passes = |attributes: &BTreeMap<String, Value>| match &request.filter_by {
            Some(attribute) => attributes.get(attribute).map_or(false, truthy),
            None => true,
        };

        let mut elements = Vec::new();
        match request.kind.partitioned_element() {
            ElementKind::Vertex => {
                for type_name in &request.vertex_types {
                    if let Some((name, vertices)) = self.vertices.get_key_value(type_name.as_str()) {
                        elements.extend(
                            vertices
                                .iter()
                                .filter(|v| passes(&v.attributes))
                                .map(|v| Element::Vertex(name.as_str(), v)),
                        );
                    }
                }
            }
            ElementKind::Edge => {
                for type_name in &request.edge_types {
                    if let Some((name, edges)) = self.edges.get_key_value(type_name.as_str()) {
                        elements.extend(
                            edges
                                .iter()
                                .filter(|e| passes(&e.attributes))
                                .map(|e| Element::Edge(name.as_str(), e)),
                        );
                    }
                }
            }
        }
        elements
    }

    /// Elements assigned to `partition`
    fn partition<'a>(&self, elements: &[Element<'a>], request: &FetchRequest, partition: u32) -> Vec<Element<'a>> {
        let mut order: Vec<usize> = (0..elements.len()).collect();
        if request.seed != 0 {
            order.shuffle(&mut StdRng::seed_from_u64(request.seed));
        }
        let range = partition_range(elements.len(), request.num_batches, partition as usize);
        order[range].iter().map(|&i| elements[i]).collect()
    }

    fn vertex_key<'a>(&'a self, type_name: &str, id: &str) -> Option<(VertexKey<'a>, &'a MemoryVertex)> {
        let (name, vertices) = self.vertices.get_key_value(type_name)?;
        let vertex = vertices.iter().find(|v| v.id == id)?;
        Some(((name.as_str(), vertex.id.as_str()), vertex))
    }

    fn build_batch(&self, request: &FetchRequest, elements: &[Element<'_>], partition: u32) -> RawBatch {
        let members = self.partition(elements, request, partition);
        let mut batch = RawBatch {
            partition,
            vertices: None,
            edges: None,
        };

        match request.kind {
            LoaderKind::Vertex => {
                let rows: Vec<_> = members
                    .iter()
                    .filter_map(|e| match e {
                        Element::Vertex(t, v) => Some((*t, *v, None)),
                        Element::Edge(..) => None,
                    })
                    .collect();
                batch.vertices = Some(self.vertex_section(request, &rows));
            }
            LoaderKind::Edge => {
                let rows = edge_rows(&members);
                batch.edges = Some(self.edge_section(request, &rows));
            }
            LoaderKind::Graph => {
                let rows = edge_rows(&members);
                let mut seen = HashSet::new();
                let mut vertices = Vec::new();
                for (edge_type, edge) in &rows {
                    let Some(schema) = self.schema.edge_type(edge_type) else {
                        continue;
                    };
                    for (vertex_type, id) in [(&schema.from_type, &edge.source), (&schema.to_type, &edge.target)] {
                        if let Some((key, vertex)) = self.vertex_key(vertex_type, id) {
                            if seen.insert(key) {
                                vertices.push((key.0, vertex, None));
                            }
                        }
                    }
                }
                batch.vertices = Some(self.vertex_section(request, &vertices));
                batch.edges = Some(self.edge_section(request, &rows));
            }
            LoaderKind::Neighbor {
                num_neighbors,
                num_hops,
            } => {
                let seeds: Vec<VertexKey<'_>> = members
                    .iter()
                    .filter_map(|e| match e {
                        Element::Vertex(t, v) => Some((*t, v.id.as_str())),
                        Element::Edge(..) => None,
                    })
                    .collect();
                let (vertices, edges) = self.sample(request, &seeds, num_neighbors, num_hops);
                batch.vertices = Some(self.vertex_section(request, &vertices));
                batch.edges = Some(self.edge_section(request, &edges));
            }
        }

        batch
    }

    /// Take up to `num_neighbors` neighbors per vertex for `num_hops` hops
    #[allow(clippy::type_complexity)]
    fn sample<'a>(
        &'a self,
        request: &FetchRequest,
        seeds: &[VertexKey<'a>],
        num_neighbors: usize,
        num_hops: usize,
    ) -> (
        Vec<(&'a str, &'a MemoryVertex, Option<bool>)>,
        Vec<(&'a str, &'a MemoryEdge)>,
    ) {
        let mut adjacency: HashMap<VertexKey<'a>, Vec<(&'a str, &'a MemoryEdge, VertexKey<'a>)>> =
            HashMap::new();
        for type_name in &request.edge_types {
            let (Some((name, edges)), Some(schema)) =
                (self.edges.get_key_value(type_name.as_str()), self.schema.edge_type(type_name))
            else {
                continue;
            };
            for edge in edges {
                let from = (schema.from_type.as_str(), edge.source.as_str());
                let to = (schema.to_type.as_str(), edge.target.as_str());
                adjacency.entry(from).or_default().push((name.as_str(), edge, to));
                adjacency.entry(to).or_default().push((name.as_str(), edge, from));
            }
        }

        let mut visited: HashSet<VertexKey<'a>> = seeds.iter().copied().collect();
        let mut order: Vec<VertexKey<'a>> = seeds.to_vec();
        let mut taken: HashSet<*const MemoryEdge> = HashSet::new();
        let mut edges = Vec::new();
        let mut frontier = seeds.to_vec();

        for _ in 0..num_hops {
            let mut next = Vec::new();
            for key in &frontier {
                for (edge_type, edge, neighbor) in adjacency.get(key).into_iter().flatten().take(num_neighbors) {
                    if taken.insert(*edge as *const MemoryEdge) {
                        edges.push((*edge_type, *edge));
                    }
                    if visited.insert(*neighbor) {
                        order.push(*neighbor);
                        next.push(*neighbor);
                    }
                }
            }
            frontier = next;
        }

        let seed_set: HashSet<VertexKey<'a>> = seeds.iter().copied().collect();
        let vertices = order
            .into_iter()
            .filter_map(|key| {
                self.vertex_key(key.0, key.1)
                    .map(|(k, v)| (k.0, v, Some(seed_set.contains(&key))))
            })
            .collect();
        (vertices, edges)
    }

    fn vertex_section(
        &self,
        request: &FetchRequest,
        rows: &[(&str, &MemoryVertex, Option<bool>)],
    ) -> RawSection {
        let sampled = matches!(request.kind, LoaderKind::Neighbor { .. });
        section(&request.vertex_attributes, rows, |r| r.0, |rows, attributes| {
            let mut table = RawTable::new();
            table.push_column(VERTEX_ID, rows.iter().map(|r| Value::from(r.1.id.clone())).collect());
            if sampled {
                table.push_column(IS_SEED, rows.iter().map(|r| Value::from(r.2.unwrap_or(false))).collect());
            }
            for attribute in attributes {
                table.push_column(attribute.clone(), attribute_values(rows.iter().map(|r| &r.1.attributes), attribute));
            }
            table
        })
    }

    fn edge_section(&self, request: &FetchRequest, rows: &[(&str, &MemoryEdge)]) -> RawSection {
        section(&request.edge_attributes, rows, |r| r.0, |rows, attributes| {
            let mut table = RawTable::new();
            table.push_column(EDGE_SOURCE, rows.iter().map(|r| Value::from(r.1.source.clone())).collect());
            table.push_column(EDGE_TARGET, rows.iter().map(|r| Value::from(r.1.target.clone())).collect());
            for attribute in attributes {
                table.push_column(attribute.clone(), attribute_values(rows.iter().map(|r| &r.1.attributes), attribute));
            }
            table
        })
    }

    fn count_elements(&self, request: &FetchRequest) -> usize {
        self.elements(request).len()
    }

    fn requested_partitions(request: &FetchRequest) -> Vec<u32> {
        if request.partitions.is_empty() {
            (0..request.num_batches as u32).collect()
        } else {
            request.partitions.clone()
        }
    }
}

fn edge_rows<'a>(members: &[Element<'a>]) -> Vec<(&'a str, &'a MemoryEdge)> {
    members
        .iter()
        .filter_map(|e| match e {
            Element::Edge(t, edge) => Some((*t, *edge)),
            Element::Vertex(..) => None,
        })
        .collect()
}

/// Flat table for a uniform selection, one table per selected type otherwise
fn section<R>(
    selection: &AttributeSelection,
    rows: &[R],
    type_of: impl Fn(&R) -> &str,
    build: impl Fn(&[&R], &[String]) -> RawTable,
) -> RawSection {
    match selection {
        AttributeSelection::Uniform(attributes) => {
            let all: Vec<&R> = rows.iter().collect();
            RawSection::Flat(build(&all, attributes))
        }
        AttributeSelection::ByType(map) => {
            let mut tables = BTreeMap::new();
            for (type_name, attributes) in map {
                let typed: Vec<&R> = rows.iter().filter(|r| type_of(r) == type_name.as_str()).collect();
                tables.insert(type_name.clone(), build(&typed, attributes));
            }
            RawSection::Typed(tables)
        }
    }
}

/// Values of one attribute, `null` where an element lacks it
fn attribute_values<'a>(
    rows: impl Iterator<Item = &'a BTreeMap<String, Value>>,
    attribute: &str,
) -> Vec<Value> {
    rows.map(|attributes| attributes.get(attribute).cloned().unwrap_or(Value::Null))
        .collect()
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::String(s) => matches!(s.to_ascii_lowercase().as_str(), "true" | "1"),
        _ => false,
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Bytes, TransportError> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| TransportError::DecodeFailed {
            partition: None,
            reason: e.to_string(),
        })
}

#[async_trait]
impl GraphConnection for MemoryGraph {
    fn graph_name(&self) -> &str {
        &self.schema.graph
    }

    fn endpoint(&self) -> String {
        format!("memory://{}", self.schema.graph)
    }

    async fn schema(&self) -> Result<GraphSchema, TransportError> {
        if self.faults.lock().unreachable {
            return Err(self.unreachable("connection refused"));
        }
        Ok(self.schema.clone())
    }

    async fn install_query(&self, query: &str) -> Result<(), TransportError> {
        self.calls.install.fetch_add(1, Ordering::Relaxed);
        if !KNOWN_QUERIES.contains(&query) {
            return Err(TransportError::Rejected {
                status: 404,
                message: format!("no template for query {}", query),
            });
        }
        self.installed.lock().insert(query.to_string());
        debug!("Installed query {} on {}", query, self.schema.graph);
        Ok(())
    }

    async fn count(&self, request: &FetchRequest) -> Result<usize, TransportError> {
        self.calls.count.fetch_add(1, Ordering::Relaxed);
        if self.faults.lock().unreachable {
            return Err(self.unreachable("connection refused"));
        }
        Ok(self.count_elements(request))
    }

    async fn fetch(&self, request: &FetchRequest, limit: u64) -> Result<Bytes, TransportError> {
        self.calls.fetch.fetch_add(1, Ordering::Relaxed);
        let faults = self.faults.lock().clone();

        if let Some(delay) = faults.fetch_delay {
            tokio::time::sleep(delay).await;
        }
        if faults.unreachable {
            return Err(self.unreachable("connection refused"));
        }
        if !self.installed.lock().contains(&request.query) {
            return encode(&Envelope::<Value>::failed(format!(
                "query {} is not installed",
                request.query
            )));
        }
        if request.count_only {
            return encode(&Envelope::ok(vec![CountResult {
                count: self.count_elements(request),
            }]));
        }

        let partitions = Self::requested_partitions(request);
        if let Some(p) = partitions.iter().find(|p| faults.unreachable_partitions.contains(p)) {
            return Err(self.unreachable(&format!("partition {} unavailable", p)));
        }

        let elements = self.elements(request);
        let results: Vec<RawBatch> = partitions
            .iter()
            .map(|&p| self.build_batch(request, &elements, p))
            .collect();
        let body = encode(&Envelope::ok(results))?;

        if body.len() as u64 > limit {
            return Err(TransportError::PayloadTooLarge {
                size: body.len() as u64,
                limit,
            });
        }
        Ok(body)
    }

    async fn publish(
        &self,
        request: &FetchRequest,
        channel: &str,
        broker: &BrokerConfig,
    ) -> Result<(), TransportError> {
        self.calls.publish.fetch_add(1, Ordering::Relaxed);
        let faults = self.faults.lock().clone();

        if faults.unreachable {
            return Err(self.unreachable("connection refused"));
        }
        let target = self.broker.clone().ok_or_else(|| TransportError::Unreachable {
            endpoint: broker.address.clone(),
            reason: "no broker attached to graph".into(),
        })?;

        let mut partitions = Self::requested_partitions(request);
        if faults.reverse_publish {
            partitions.reverse();
        }

        let elements = self.elements(request);
        let mut messages = Vec::with_capacity(partitions.len());
        for &p in &partitions {
            if faults.withheld_partitions.contains(&p) {
                continue;
            }
            let payload = encode(&self.build_batch(request, &elements, p))?;
            let checksum = crc32c::crc32c(&payload);
            let payload = if faults.corrupt_partitions.contains(&p) {
                Bytes::from(format!("{{\"partition\": {}, \"vertices\": ", p))
            } else {
                payload
            };
            messages.push((p, payload, checksum));
        }
        drop(elements);

        for (p, payload, checksum) in messages {
            if let Some(delay) = faults.publish_delay {
                tokio::time::sleep(delay).await;
            }
            target.publish(channel, Some(p), payload.clone(), Some(checksum));
            if faults.duplicate_partitions.contains(&p) {
                target.publish(channel, Some(p), payload, Some(checksum));
            }
        }

        debug!("Published {} partitions to {}", partitions.len(), channel);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::config::LoaderConfig;
    use crate::schema::AttrKind;
    use serde_json::json;

    fn graph() -> MemoryGraph {
        let schema = GraphSchema::new("toy")
            .with_vertex("Person", &[("age", AttrKind::Int), ("is_train", AttrKind::Bool)])
            .with_edge("Knows", "Person", "Person", &[]);
        let mut graph = MemoryGraph::new(schema);
        for i in 0..10 {
            graph.add_vertex(
                "Person",
                format!("p{}", i),
                [("age", json!(20 + i)), ("is_train", json!(i % 2 == 0))],
            );
        }
        for i in 0..9 {
            graph.add_edge("Knows", format!("p{}", i), format!("p{}", i + 1), Vec::<(String, Value)>::new());
        }
        graph
    }

    fn request(config: &LoaderConfig, graph: &MemoryGraph, num_batches: usize, seed: u64) -> FetchRequest {
        let mut request = FetchRequest::new(config, &graph.schema);
        request.num_batches = num_batches;
        request.seed = seed;
        request
    }

    fn vids(batch: &RawBatch) -> Vec<String> {
        match &batch.vertices {
            Some(RawSection::Flat(table)) => table.columns[VERTEX_ID]
                .iter()
                .map(|v| v.as_str().unwrap().to_string())
                .collect(),
            _ => Vec::new(),
        }
    }

    #[test]
    fn test_partitions_are_disjoint_and_complete() {
        let graph = graph();
        let config = LoaderConfig::builder().vertex_attributes(["age"]).build().unwrap();

        for seed in [0, 42] {
            let request = request(&config, &graph, 3, seed);
            let elements = graph.elements(&request);
            let mut all: Vec<String> = (0..3)
                .flat_map(|p| vids(&graph.build_batch(&request, &elements, p)))
                .collect();
            assert_eq!(all.len(), 10);
            all.sort();
            all.dedup();
            assert_eq!(all.len(), 10);
        }
    }

    #[test]
    fn test_filter_and_count() {
        let graph = graph();
        let config = LoaderConfig::builder().filter_by("is_train").build().unwrap();
        let request = request(&config, &graph, 1, 0);
        assert_eq!(graph.count_elements(&request), 5);
    }

    #[test]
    fn test_neighbor_sampling_marks_seeds() {
        let graph = graph();
        let config = LoaderConfig::builder()
            .kind(LoaderKind::Neighbor {
                num_neighbors: 1,
                num_hops: 1,
            })
            .build()
            .unwrap();
        let request = request(&config, &graph, 10, 0);
        let elements = graph.elements(&request);

        let batch = graph.build_batch(&request, &elements, 0);
        let Some(RawSection::Flat(table)) = &batch.vertices else {
            panic!("expected flat vertices");
        };
        assert_eq!(table.columns[VERTEX_ID], vec![json!("p0"), json!("p1")]);
        assert_eq!(table.columns[IS_SEED], vec![json!(true), json!(false)]);
    }

    #[tokio::test]
    async fn test_fetch_requires_installed_query() {
        let graph = graph();
        let config = LoaderConfig::builder().build().unwrap();
        let request = request(&config, &graph, 1, 0);

        let body = graph.fetch(&request, u64::MAX).await.unwrap();
        let envelope: Envelope<Value> = serde_json::from_slice(&body).unwrap();
        assert!(envelope.error);

        graph.install_query(&request.query).await.unwrap();
        let body = graph.fetch(&request, u64::MAX).await.unwrap();
        let envelope: Envelope<RawBatch> = serde_json::from_slice(&body).unwrap();
        assert_eq!(envelope.results.len(), 1);

        let too_small = graph.fetch(&request, 16).await;
        assert!(matches!(too_small, Err(TransportError::PayloadTooLarge { .. })));
    }
}
