//! Error types for the batch loader
//!
//! Three families mirror where a failure originates: construction-time
//! configuration, the transport that retrieves partitions, and the assembly
//! of wire tables into typed batches.

use std::time::Duration;
use thiserror::Error;

use crate::data::loader::LoaderState;

/// Primary error type for all loader operations
#[derive(Debug, Error)]
pub enum LoaderError {
    /// Invalid or contradictory construction parameters
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Retrieval of a partition failed
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A wire batch could not be assembled
    #[error("data error: {0}")]
    Data(#[from] DataError),

    /// The user callback rejected a batch
    #[error("callback failed: {message}")]
    Callback { message: String },

    /// Operation not allowed in the current lifecycle state
    #[error("operation not allowed while loader is {state:?}")]
    InvalidState { state: LoaderState },

    /// The background producer stopped without an end-of-stream marker
    #[error("producer stopped before signalling end of stream")]
    ProducerLost,

    /// Runtime construction or task failure
    #[error("runtime error: {message}")]
    Runtime { message: String },
}

/// Construction-time failures. Always raised before production starts.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("batch_size and num_batches are mutually exclusive")]
    BothSizingParameters,

    #[error("one of batch_size or num_batches is required")]
    NoSizingParameter,

    #[error("{parameter} must be greater than 0")]
    ZeroSizing { parameter: &'static str },

    #[error("buffer_size must be greater than 0")]
    InvalidBufferSize,

    #[error("{num_batches} partitions exceed the partition id range")]
    TooManyPartitions { num_batches: usize },

    #[error("filter attribute {attribute} on {element_type} is not boolean")]
    FilterNotBoolean {
        element_type: String,
        attribute: String,
    },

    #[error("filter attribute {attribute} does not exist on {element_type}")]
    UnknownFilterAttribute {
        element_type: String,
        attribute: String,
    },

    #[error("attribute {attribute} does not exist on {element_type}")]
    UnknownAttribute {
        element_type: String,
        attribute: String,
    },

    #[error("element type {name} is not part of the graph schema")]
    UnknownElementType { name: String },

    #[error("callback {name} is not invocable")]
    CallbackNotInvocable { name: String },

    #[error("loader already has a configured callback; pass only one")]
    ConflictingCallbacks,

    #[error("streamed transport requires broker configuration")]
    BrokerNotConfigured,

    #[error("output format {format} requires a subgraph loader")]
    FormatRequiresSubgraph { format: String },

    #[error("add_self_loop requires a subgraph loader")]
    SelfLoopRequiresSubgraph,

    #[error("installing query {query} failed: {reason}")]
    QueryInstallFailed { query: String, reason: String },

    #[error("invalid loader options: {reason}")]
    InvalidOptions { reason: String },
}

/// Failures while retrieving a partition from the remote side
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("{endpoint} unreachable: {reason}")]
    Unreachable { endpoint: String, reason: String },

    #[error("response of {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: u64, limit: u64 },

    #[error("partition {partition:?} timed out after {after:?}")]
    Timeout {
        partition: Option<u32>,
        after: Duration,
    },

    #[error("partition {partition:?} could not be decoded: {reason}")]
    DecodeFailed {
        partition: Option<u32>,
        reason: String,
    },

    #[error("server rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
}

/// Failures while turning a wire batch into a typed batch
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DataError {
    #[error(
        "vector attribute {attribute} has length {found} at row {row}, expected {expected}"
    )]
    InconsistentVectorLength {
        attribute: String,
        expected: usize,
        found: usize,
        row: usize,
    },

    #[error("attribute {attribute} missing from {element_type} table")]
    UnknownAttribute {
        element_type: String,
        attribute: String,
    },

    #[error("column {column} has {found} rows, table has {expected}")]
    RaggedTable {
        column: String,
        expected: usize,
        found: usize,
    },

    #[error("{element_type} table has no {column} identifier column")]
    MissingIdentifier {
        element_type: String,
        column: &'static str,
    },

    #[error("attribute {attribute} row {row}: cannot decode {value}")]
    InvalidValue {
        attribute: String,
        row: usize,
        value: String,
    },

    #[error("edge endpoint {vertex} is not in the batch vertex set")]
    UnknownEndpoint { vertex: String },
}

impl LoaderError {
    /// Returns true if this failure ends the current production pass.
    ///
    /// Only a decode failure reported by a transport that isolates messages
    /// is survivable; the caller passes that capability in.
    pub fn is_terminal(&self, isolates_decode_failures: bool) -> bool {
        !matches!(
            (self, isolates_decode_failures),
            (LoaderError::Transport(TransportError::DecodeFailed { .. }), true)
        )
    }

    /// Returns true if this is a configuration failure
    pub fn is_config(&self) -> bool {
        matches!(self, LoaderError::Config(_))
    }
}

impl TransportError {
    /// Partition the failure belongs to, when known
    pub fn partition(&self) -> Option<u32> {
        match self {
            TransportError::Timeout { partition, .. }
            | TransportError::DecodeFailed { partition, .. } => *partition,
            _ => None,
        }
    }
}

/// Result type alias for loader operations
pub type Result<T> = std::result::Result<T, LoaderError>;
