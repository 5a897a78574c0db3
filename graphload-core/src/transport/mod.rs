//! Partition transports
//!
//! Both variants answer "next raw batch, or done" so the producer is written
//! once. Bulk asks the server for one partition at a time in plan order;
//! streamed has the server publish every partition to a broker channel and
//! yields them in arrival order.

pub mod bulk;
pub mod streamed;

use async_trait::async_trait;
use std::sync::Arc;

use crate::broker::{Broker, BrokerConfig};
use crate::connection::{FetchRequest, GraphConnection};
use crate::data::batch::RawBatch;
use crate::data::config::{LoaderConfig, TransportKind};
use crate::data::partition::PartitionPlan;
use crate::error::{ConfigError, TransportError};

pub use bulk::BulkTransport;
pub use streamed::StreamedTransport;

/// Source of raw partitions for one production pass
#[async_trait]
pub trait Transport: Send {
    /// Prepare the pass (subscribe, trigger publication)
    async fn open(&mut self) -> Result<(), TransportError>;

    /// Next raw batch; `None` once every partition has been delivered
    async fn next_raw(&mut self) -> Option<Result<RawBatch, TransportError>>;

    /// Release everything held for the pass
    async fn close(&mut self);

    /// Partition currently being waited on, when known
    fn current_partition(&self) -> Option<u32>;

    /// Whether a `DecodeFailed` affects only its own partition
    fn isolates_decode_failures(&self) -> bool;
}

/// Build the transport a loader configuration asks for
pub fn for_config(
    config: &LoaderConfig,
    connection: Arc<dyn GraphConnection>,
    broker: Option<(BrokerConfig, Arc<dyn Broker>)>,
    request: FetchRequest,
    plan: &PartitionPlan,
) -> Result<Box<dyn Transport>, ConfigError> {
    match config.transport {
        TransportKind::Bulk => Ok(Box::new(BulkTransport::new(
            connection,
            request,
            plan,
            config.payload_limit,
        ))),
        TransportKind::Streamed => {
            let (broker_config, broker) = broker.ok_or(ConfigError::BrokerNotConfigured)?;
            Ok(Box::new(StreamedTransport::new(
                connection,
                broker,
                broker_config,
                request,
                config.loader_id.clone(),
                plan.len(),
            )))
        }
    }
}
