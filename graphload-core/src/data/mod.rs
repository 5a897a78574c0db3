//! Batch loading pipeline
//!
//! Configuration, partition planning, wire-to-batch assembly, the user
//! callback stage and the producer/consumer handoff behind `GraphLoader`.

pub mod assembler;
pub mod batch;
pub mod callback;
pub mod config;
pub mod loader;
pub mod partition;
pub(crate) mod producer;
pub mod queue;

pub use assembler::Assembler;
pub use batch::{Batch, Column, Frames, RawBatch, RawSection, RawTable, Table, Topology};
pub use callback::{BatchCallback, CallbackRegistry, CallbackSpec, TryCallback};
pub use config::{
    AttributeSelection, LoaderConfig, LoaderConfigBuilder, LoaderKind, LoaderOptions, OutputFormat, Sizing,
    TransportKind,
};
pub use loader::{GraphLoader, LoaderData, LoaderState};
pub use partition::{PartitionPlan, PartitionPlanner, PartitionSpec};
pub use queue::Slot;
