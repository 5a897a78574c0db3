//! Streamed transport
//!
//! Subscribes to the loader's broker channel, then asks the server to
//! publish. Messages are committed one by one as they arrive. A message that
//! fails its checksum or does not decode fails only its own partition;
//! redelivered partitions are committed and skipped.

use async_trait::async_trait;
use std::collections::HashSet;
use std::future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::Transport;
use crate::broker::{Broker, BrokerConfig, BrokerMessage, Subscription};
use crate::connection::{FetchRequest, GraphConnection};
use crate::data::batch::RawBatch;
use crate::error::TransportError;

pub struct StreamedTransport {
    connection: Arc<dyn GraphConnection>,
    broker: Arc<dyn Broker>,
    broker_config: BrokerConfig,
    request: FetchRequest,
    channel: String,
    expected: usize,
    /// Partitions delivered or failed so far
    seen: HashSet<u32>,
    /// Failed messages that carried no partition key
    anonymous_failures: usize,
    subscription: Option<Box<dyn Subscription>>,
    trigger: Option<JoinHandle<Result<(), TransportError>>>,
}

impl StreamedTransport {
    pub fn new(
        connection: Arc<dyn GraphConnection>,
        broker: Arc<dyn Broker>,
        broker_config: BrokerConfig,
        request: FetchRequest,
        channel: String,
        expected: usize,
    ) -> Self {
        Self {
            connection,
            broker,
            broker_config,
            request,
            channel,
            expected,
            seen: HashSet::new(),
            anonymous_failures: 0,
            subscription: None,
            trigger: None,
        }
    }

    fn delivered(&self) -> usize {
        self.seen.len() + self.anonymous_failures
    }

    fn lost(&self, reason: &str) -> TransportError {
        TransportError::Unreachable {
            endpoint: self.broker_config.address.clone(),
            reason: reason.to_string(),
        }
    }

    /// Decode one message; `None` for a redelivered partition
    fn accept(&mut self, message: &BrokerMessage) -> Option<Result<RawBatch, TransportError>> {
        if let Some(key) = message.key {
            if !self.seen.insert(key) {
                debug!("Skipping redelivered partition {} on {}", key, self.channel);
                return None;
            }
        }

        let decoded = message.verify().and_then(|()| {
            serde_json::from_slice::<RawBatch>(&message.payload).map_err(|e| TransportError::DecodeFailed {
                partition: message.key,
                reason: e.to_string(),
            })
        });

        match decoded {
            Ok(raw) => {
                if message.key.is_none() && !self.seen.insert(raw.partition) {
                    debug!("Skipping redelivered partition {} on {}", raw.partition, self.channel);
                    return None;
                }
                Some(Ok(raw))
            }
            Err(e) => {
                if message.key.is_none() {
                    self.anonymous_failures += 1;
                }
                warn!("Message {} on {} failed to decode: {}", message.offset, self.channel, e);
                Some(Err(e))
            }
        }
    }
}

#[async_trait]
impl Transport for StreamedTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        // Subscribe before triggering so no message can be published unseen
        let subscription = self.broker.subscribe(&self.channel, &self.broker_config).await?;
        self.subscription = Some(subscription);

        let connection = self.connection.clone();
        let request = self.request.clone();
        let channel = self.channel.clone();
        let broker_config = self.broker_config.clone();
        self.trigger = Some(tokio::spawn(async move {
            connection.publish(&request, &channel, &broker_config).await
        }));

        debug!(
            "Streaming {} partitions over channel {}",
            self.expected, self.channel
        );
        Ok(())
    }

    async fn next_raw(&mut self) -> Option<Result<RawBatch, TransportError>> {
        loop {
            if self.delivered() >= self.expected {
                return None;
            }

            let Some(subscription) = self.subscription.as_mut() else {
                return Some(Err(self.lost("subscription not open")));
            };
            let trigger = &mut self.trigger;
            let pending_trigger = async {
                match trigger.as_mut() {
                    Some(handle) => handle.await,
                    None => future::pending().await,
                }
            };

            let message = tokio::select! {
                message = subscription.recv() => message,
                outcome = pending_trigger => {
                    self.trigger = None;
                    match outcome {
                        Ok(Ok(())) => continue,
                        Ok(Err(e)) => return Some(Err(e)),
                        Err(e) => return Some(Err(self.lost(&format!("publication task failed: {}", e)))),
                    }
                }
            };

            let Some(message) = message else {
                return Some(Err(self.lost("subscription closed")));
            };
            if let Some(subscription) = self.subscription.as_mut() {
                if let Err(e) = subscription.commit(&message).await {
                    return Some(Err(e));
                }
            }
            if let Some(result) = self.accept(&message) {
                return Some(result);
            }
        }
    }

    async fn close(&mut self) {
        if let Some(trigger) = self.trigger.take() {
            trigger.abort();
        }
        self.subscription = None;
        self.broker.release(&self.channel).await;
        debug!("Closed channel {}", self.channel);
    }

    fn current_partition(&self) -> Option<u32> {
        None
    }

    fn isolates_decode_failures(&self) -> bool {
        true
    }
}
