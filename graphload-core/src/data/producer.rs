//! Background producer
//!
//! Runs on its own task, driving the transport across the planned
//! partitions and pushing assembled batches onto the bounded queue. Every
//! way out of the loop leaves a marker on the queue (end of stream or a
//! fatal failure) unless the consumer is already gone.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, error, warn};

use super::assembler::Assembler;
use super::batch::Batch;
use super::callback::CallbackStage;
use super::loader::{LoaderState, StateCell};
use super::queue::{Slot, SlotSender};
use crate::error::{LoaderError, Result, TransportError};
use crate::metrics::{standard, LoaderStats};
use crate::runtime::ShutdownSignal;
use crate::transport::Transport;

/// How a production pass ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Failed,
    /// Shutdown requested or consumer gone
    Stopped,
}

/// Turns raw partitions into delivered items
pub(crate) struct Pipeline<T> {
    pub assembler: Arc<Assembler>,
    pub callback: CallbackStage<T>,
    pub timeout: Duration,
    pub stats: Arc<LoaderStats>,
}

impl<T> Pipeline<T> {
    /// Wait for the next raw batch, bounded by the per-request timeout
    async fn next(&self, transport: &mut dyn Transport) -> Option<Result<T>> {
        let start = Instant::now();
        let raw = match timeout(self.timeout, transport.next_raw()).await {
            Ok(Some(Ok(raw))) => raw,
            Ok(Some(Err(e))) => return Some(Err(e.into())),
            Ok(None) => return None,
            Err(_) => {
                return Some(Err(TransportError::Timeout {
                    partition: transport.current_partition(),
                    after: self.timeout,
                }
                .into()))
            }
        };
        self.stats.record_fetch(start);

        let partition = raw.partition;
        let batch = self
            .assembler
            .assemble(raw)
            .map_err(LoaderError::from)
            .and_then(|batch| self.callback.apply(batch));
        if let Err(e) = &batch {
            debug!("Partition {} failed after retrieval: {}", partition, e);
        }
        Some(batch)
    }

    /// Produce the only item of a single-partition pass, inline
    pub async fn single(&self, mut transport: Box<dyn Transport>) -> Result<T> {
        if let Err(e) = transport.open().await {
            transport.close().await;
            return Err(e.into());
        }
        let result = self.next(transport.as_mut()).await;
        transport.close().await;

        match result {
            Some(Ok(batch)) => {
                self.stats.record_batch();
                Ok(batch)
            }
            Some(Err(e)) => {
                self.stats.record_failure();
                Err(e)
            }
            // The plan promised one partition
            None => self.callback.apply(Batch::default()),
        }
    }
}

/// Background producer of one pass
pub(crate) struct Producer<T> {
    pub pipeline: Pipeline<T>,
    pub transport: Box<dyn Transport>,
    pub sender: SlotSender<T>,
    pub shutdown: ShutdownSignal,
    pub state: Arc<StateCell>,
    pub generation: u64,
}

impl<T: Send + 'static> Producer<T> {
    pub async fn run(mut self) {
        debug!("Producer {} starting", self.generation);
        standard::ACTIVE_PRODUCERS.inc();

        let shutdown = self.shutdown.clone();
        let outcome = tokio::select! {
            outcome = self.produce() => outcome,
            _ = shutdown.wait() => Outcome::Stopped,
        };

        self.transport.close().await;
        standard::ACTIVE_PRODUCERS.dec();
        debug!("Producer {} finished: {:?}", self.generation, outcome);
    }

    async fn produce(&mut self) -> Outcome {
        if let Err(e) = self.transport.open().await {
            return self.fail(e.into()).await;
        }

        let isolates = self.transport.isolates_decode_failures();
        loop {
            match self.pipeline.next(self.transport.as_mut()).await {
                None => return self.complete().await,
                Some(Ok(batch)) => {
                    if self.sender.send(Slot::Batch(batch)).await.is_err() {
                        return Outcome::Stopped;
                    }
                    self.pipeline.stats.record_batch();
                }
                Some(Err(e)) if e.is_terminal(isolates) => return self.fail(e).await,
                Some(Err(e)) => {
                    warn!("Skipping failed partition: {}", e);
                    self.pipeline.stats.record_failure();
                    let slot = Slot::Failed {
                        error: e,
                        fatal: false,
                    };
                    if self.sender.send(slot).await.is_err() {
                        return Outcome::Stopped;
                    }
                }
            }
        }
    }

    async fn complete(&mut self) -> Outcome {
        self.state
            .transition(self.generation, LoaderState::Exhausted);
        if self.sender.send(Slot::End).await.is_err() {
            return Outcome::Stopped;
        }
        Outcome::Completed
    }

    async fn fail(&mut self, error: LoaderError) -> Outcome {
        error!("Production pass cancelled: {}", error);
        self.pipeline.stats.record_failure();
        self.state
            .transition(self.generation, LoaderState::Cancelled);
        let _ = self
            .sender
            .send(Slot::Failed { error, fatal: true })
            .await;
        Outcome::Failed
    }
}
