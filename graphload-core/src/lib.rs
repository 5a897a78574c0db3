//! graphload core - streaming batch loader for graph databases
//!
//! This crate turns a remote graph into a sequence of training batches:
//! - Partition planning over the filtered vertex or edge set
//! - Retrieval per partition, either bulk or through a message broker
//! - Assembly of wire tables into typed, optionally graph-shaped batches
//! - A background producer feeding a bounded buffer, with reset and cancellation

pub mod broker;
pub mod connection;
pub mod data;
pub mod error;
pub mod factory;
pub mod metrics;
pub mod runtime;
pub mod schema;
pub mod transport;

pub use data::{Batch, GraphLoader, LoaderConfig, LoaderData, LoaderKind, LoaderState};
pub use error::{ConfigError, DataError, LoaderError, Result, TransportError};
pub use factory::LoaderFactory;
pub use runtime::LoaderRuntime;

/// Default queue capacity between producer and consumer
pub const DEFAULT_BUFFER_SIZE: usize = 4;

/// Default number of batches when neither sizing parameter is given
pub const DEFAULT_NUM_BATCHES: usize = 1;

/// Default ceiling for a bulk response body
pub const DEFAULT_PAYLOAD_LIMIT: u64 = 512 * 1024 * 1024;

/// Default per-request wait limit in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;
