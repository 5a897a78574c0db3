//! Loader configuration
//!
//! `LoaderConfig` is immutable once built. The builder resolves the
//! `batch_size` / `num_batches` pair and rejects combinations that can only
//! fail later.
//!
//! ```ignore
//! let config = LoaderConfig::builder()
//!     .kind(LoaderKind::Vertex)
//!     .vertex_attributes(["id", "x", "y"])
//!     .num_batches(10)
//!     .shuffle(true)
//!     .filter_by("is_train")
//!     .build()?;
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use super::callback::CallbackSpec;
use crate::error::ConfigError;
use crate::schema::{ElementKind, GraphSchema};
use crate::{DEFAULT_BUFFER_SIZE, DEFAULT_NUM_BATCHES, DEFAULT_PAYLOAD_LIMIT, DEFAULT_TIMEOUT_SECS};

/// What one partition contains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoaderKind {
    /// Vertex tables
    Vertex,
    /// Edge tables
    Edge,
    /// Edge partition plus endpoint vertices
    Graph,
    /// Subgraph sampled around seed vertices
    Neighbor { num_neighbors: usize, num_hops: usize },
}

impl LoaderKind {
    /// Element kind whose set is partitioned
    pub fn partitioned_element(&self) -> ElementKind {
        match self {
            LoaderKind::Vertex | LoaderKind::Neighbor { .. } => ElementKind::Vertex,
            LoaderKind::Edge | LoaderKind::Graph => ElementKind::Edge,
        }
    }

    /// Batches carry both vertices and edges
    pub fn is_subgraph(&self) -> bool {
        matches!(self, LoaderKind::Graph | LoaderKind::Neighbor { .. })
    }

    pub fn includes(&self, element: ElementKind) -> bool {
        self.is_subgraph() || self.partitioned_element() == element
    }

    /// Name of the server-side partitioning query for this kind
    pub fn query_name(&self) -> &'static str {
        match self {
            LoaderKind::Vertex => "graphload_vertex_batch",
            LoaderKind::Edge => "graphload_edge_batch",
            LoaderKind::Graph => "graphload_graph_batch",
            LoaderKind::Neighbor { .. } => "graphload_neighbor_batch",
        }
    }
}

/// Attribute selection for one element kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeSelection {
    /// Same attributes for every type, batch columns are flattened
    Uniform(Vec<String>),
    /// Per-type attributes, batch tables are keyed by type
    ByType(BTreeMap<String, Vec<String>>),
}

impl Default for AttributeSelection {
    fn default() -> Self {
        AttributeSelection::Uniform(Vec::new())
    }
}

impl AttributeSelection {
    pub fn is_heterogeneous(&self) -> bool {
        matches!(self, AttributeSelection::ByType(_))
    }

    /// Element types the selection covers
    pub fn types(&self, schema: &GraphSchema, kind: ElementKind) -> Vec<String> {
        match self {
            AttributeSelection::Uniform(_) => schema.type_names(kind),
            AttributeSelection::ByType(map) => map.keys().cloned().collect(),
        }
    }

    /// Attributes requested for a type; `None` when the type is not selected
    pub fn attributes_for(&self, type_name: &str) -> Option<&[String]> {
        match self {
            AttributeSelection::Uniform(attrs) => Some(attrs),
            AttributeSelection::ByType(map) => map.get(type_name).map(Vec::as_slice),
        }
    }

    /// Check every selected type and attribute against the schema
    pub fn validate(&self, schema: &GraphSchema, kind: ElementKind) -> Result<(), ConfigError> {
        match self {
            AttributeSelection::Uniform(attrs) => {
                for attr in attrs {
                    let known = schema.type_names(kind).iter().any(|t| {
                        schema.attribute_kind(kind, t, attr).is_ok()
                    });
                    if !known {
                        return Err(ConfigError::UnknownAttribute {
                            element_type: kind.as_str().to_string(),
                            attribute: attr.clone(),
                        });
                    }
                }
            }
            AttributeSelection::ByType(map) => {
                for (type_name, attrs) in map {
                    schema.attributes(kind, type_name)?;
                    for attr in attrs {
                        schema.attribute_kind(kind, type_name, attr)?;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Resolved batch sizing. Exactly one parameter is ever given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sizing {
    BatchSize(usize),
    NumBatches(usize),
}

impl Sizing {
    /// Resolve the user-facing pair into a single sizing parameter
    pub fn resolve(batch_size: Option<usize>, num_batches: Option<usize>) -> Result<Self, ConfigError> {
        match (batch_size, num_batches) {
            (Some(_), Some(_)) => Err(ConfigError::BothSizingParameters),
            (None, None) => Err(ConfigError::NoSizingParameter),
            (Some(0), None) => Err(ConfigError::ZeroSizing {
                parameter: "batch_size",
            }),
            (None, Some(0)) => Err(ConfigError::ZeroSizing {
                parameter: "num_batches",
            }),
            (Some(size), None) => Ok(Sizing::BatchSize(size)),
            (None, Some(count)) => Ok(Sizing::NumBatches(count)),
        }
    }
}

/// Shape of the delivered batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// Typed tables only
    #[default]
    Table,
    /// Tables plus a COO edge list over batch-local vertex indices
    EdgeIndex,
    /// Tables plus compressed sparse rows over batch-local vertex indices
    Csr,
}

/// How partitions travel from the database to this process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// One synchronous request per partition
    #[default]
    Bulk,
    /// Server publishes partitions to a broker channel
    Streamed,
}

/// Immutable loader configuration
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub kind: LoaderKind,
    pub vertex_attributes: AttributeSelection,
    pub edge_attributes: AttributeSelection,
    pub sizing: Sizing,
    pub shuffle: bool,
    /// Fixed shuffle seed; a fresh seed per pass when `None`
    pub seed: Option<u64>,
    /// Boolean attribute gating inclusion
    pub filter_by: Option<String>,
    pub output_format: OutputFormat,
    pub add_self_loop: bool,
    /// Loader identity, also the broker channel name
    pub loader_id: String,
    /// Queue capacity between producer and consumer
    pub buffer_size: usize,
    /// Per-request / per-message wait limit
    pub timeout: Duration,
    pub callback: Option<CallbackSpec>,
    pub transport: TransportKind,
    /// Largest accepted bulk response in bytes
    pub payload_limit: u64,
}

impl LoaderConfig {
    pub fn builder() -> LoaderConfigBuilder {
        LoaderConfigBuilder::default()
    }

    /// Attribute selection for one element kind
    pub fn selection(&self, kind: ElementKind) -> &AttributeSelection {
        match kind {
            ElementKind::Vertex => &self.vertex_attributes,
            ElementKind::Edge => &self.edge_attributes,
        }
    }
}

/// Builder for LoaderConfig with method chaining
pub struct LoaderConfigBuilder {
    kind: LoaderKind,
    vertex_attributes: AttributeSelection,
    edge_attributes: AttributeSelection,
    batch_size: Option<usize>,
    num_batches: Option<usize>,
    shuffle: bool,
    seed: Option<u64>,
    filter_by: Option<String>,
    output_format: OutputFormat,
    add_self_loop: bool,
    loader_id: Option<String>,
    buffer_size: usize,
    timeout: Duration,
    callback: Option<CallbackSpec>,
    transport: TransportKind,
    payload_limit: u64,
}

impl Default for LoaderConfigBuilder {
    fn default() -> Self {
        Self {
            kind: LoaderKind::Vertex,
            vertex_attributes: AttributeSelection::default(),
            edge_attributes: AttributeSelection::default(),
            batch_size: None,
            num_batches: None,
            shuffle: false,
            seed: None,
            filter_by: None,
            output_format: OutputFormat::Table,
            add_self_loop: false,
            loader_id: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            callback: None,
            transport: TransportKind::Bulk,
            payload_limit: DEFAULT_PAYLOAD_LIMIT,
        }
    }
}

impl LoaderConfigBuilder {
    pub fn kind(mut self, kind: LoaderKind) -> Self {
        self.kind = kind;
        self
    }

    /// Same vertex attributes for every vertex type
    pub fn vertex_attributes<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.vertex_attributes =
            AttributeSelection::Uniform(attributes.into_iter().map(Into::into).collect());
        self
    }

    /// Same edge attributes for every edge type
    pub fn edge_attributes<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.edge_attributes =
            AttributeSelection::Uniform(attributes.into_iter().map(Into::into).collect());
        self
    }

    /// Explicit selection, e.g. a per-type mapping
    pub fn vertex_selection(mut self, selection: AttributeSelection) -> Self {
        self.vertex_attributes = selection;
        self
    }

    pub fn edge_selection(mut self, selection: AttributeSelection) -> Self {
        self.edge_attributes = selection;
        self
    }

    /// Rows per batch; exclusive with `num_batches`
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    /// Number of batches per pass; exclusive with `batch_size`
    pub fn num_batches(mut self, count: usize) -> Self {
        self.num_batches = Some(count);
        self
    }

    pub fn shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn filter_by(mut self, attribute: impl Into<String>) -> Self {
        self.filter_by = Some(attribute.into());
        self
    }

    pub fn output_format(mut self, format: OutputFormat) -> Self {
        self.output_format = format;
        self
    }

    pub fn add_self_loop(mut self, add: bool) -> Self {
        self.add_self_loop = add;
        self
    }

    pub fn loader_id(mut self, id: impl Into<String>) -> Self {
        self.loader_id = Some(id.into());
        self
    }

    /// Queue capacity.
    ///
    /// - Too low: the producer stalls behind a slow consumer step.
    /// - Too high: more assembled batches held in memory.
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn callback(mut self, callback: CallbackSpec) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    pub fn payload_limit(mut self, bytes: u64) -> Self {
        self.payload_limit = bytes;
        self
    }

    /// Build and validate the configuration.
    pub fn build(self) -> Result<LoaderConfig, ConfigError> {
        let sizing = match (self.batch_size, self.num_batches) {
            (None, None) => Sizing::resolve(None, Some(DEFAULT_NUM_BATCHES))?,
            (batch_size, num_batches) => Sizing::resolve(batch_size, num_batches)?,
        };

        if self.buffer_size == 0 {
            return Err(ConfigError::InvalidBufferSize);
        }
        if self.add_self_loop && !self.kind.is_subgraph() {
            return Err(ConfigError::SelfLoopRequiresSubgraph);
        }
        if self.output_format != OutputFormat::Table && !self.kind.is_subgraph() {
            return Err(ConfigError::FormatRequiresSubgraph {
                format: format!("{:?}", self.output_format),
            });
        }

        Ok(LoaderConfig {
            kind: self.kind,
            vertex_attributes: self.vertex_attributes,
            edge_attributes: self.edge_attributes,
            sizing,
            shuffle: self.shuffle,
            seed: self.seed,
            filter_by: self.filter_by,
            output_format: self.output_format,
            add_self_loop: self.add_self_loop,
            loader_id: self
                .loader_id
                .unwrap_or_else(|| format!("graphload_{}", uuid::Uuid::new_v4().simple())),
            buffer_size: self.buffer_size,
            timeout: self.timeout,
            callback: self.callback,
            transport: self.transport,
            payload_limit: self.payload_limit,
        })
    }
}

/// Serializable mirror of the construction parameters.
///
/// Lets loaders be described in JSON; the callback is referenced by the name
/// it was registered under in the factory.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoaderOptions {
    #[serde(default)]
    pub kind: Option<LoaderKind>,
    #[serde(default)]
    pub vertex_attributes: Option<AttributeSelection>,
    #[serde(default)]
    pub edge_attributes: Option<AttributeSelection>,
    pub batch_size: Option<usize>,
    pub num_batches: Option<usize>,
    #[serde(default)]
    pub shuffle: bool,
    pub seed: Option<u64>,
    pub filter_by: Option<String>,
    #[serde(default)]
    pub output_format: OutputFormat,
    #[serde(default)]
    pub add_self_loop: bool,
    pub loader_id: Option<String>,
    pub buffer_size: Option<usize>,
    pub timeout_secs: Option<u64>,
    pub callback: Option<String>,
    #[serde(default)]
    pub transport: TransportKind,
    pub payload_limit: Option<u64>,
}

impl LoaderOptions {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::InvalidOptions {
            reason: e.to_string(),
        })
    }

    pub fn into_config(self) -> Result<LoaderConfig, ConfigError> {
        let mut builder = LoaderConfig::builder()
            .kind(self.kind.unwrap_or(LoaderKind::Vertex))
            .shuffle(self.shuffle)
            .output_format(self.output_format)
            .add_self_loop(self.add_self_loop)
            .transport(self.transport);

        if let Some(selection) = self.vertex_attributes {
            builder = builder.vertex_selection(selection);
        }
        if let Some(selection) = self.edge_attributes {
            builder = builder.edge_selection(selection);
        }
        if let Some(size) = self.batch_size {
            builder = builder.batch_size(size);
        }
        if let Some(count) = self.num_batches {
            builder = builder.num_batches(count);
        }
        if let Some(seed) = self.seed {
            builder = builder.seed(seed);
        }
        if let Some(attribute) = self.filter_by {
            builder = builder.filter_by(attribute);
        }
        if let Some(id) = self.loader_id {
            builder = builder.loader_id(id);
        }
        if let Some(size) = self.buffer_size {
            builder = builder.buffer_size(size);
        }
        if let Some(secs) = self.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        if let Some(name) = self.callback {
            builder = builder.callback(CallbackSpec::Named(name));
        }
        if let Some(limit) = self.payload_limit {
            builder = builder.payload_limit(limit);
        }
        builder.build()
    }
}
