//! In-process broker
//!
//! Per-channel unbounded queues with offset tracking. Publishers and the
//! subscriber may arrive in any order: the first of them creates the channel.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use super::{Broker, BrokerConfig, BrokerMessage, Subscription};
use crate::error::TransportError;

struct Channel {
    tx: mpsc::UnboundedSender<BrokerMessage>,
    rx: Option<mpsc::UnboundedReceiver<BrokerMessage>>,
    next_offset: u64,
    committed: Arc<Mutex<Vec<u64>>>,
}

impl Channel {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Some(rx),
            next_offset: 0,
            committed: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

/// Broker living inside the process
#[derive(Default)]
pub struct MemoryBroker {
    channels: Mutex<HashMap<String, Channel>>,
    /// Required `(username, password)`, if any
    credentials: Option<(String, String)>,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A broker that rejects subscriptions with other credentials
    pub fn with_credentials(username: impl Into<String>, password: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            channels: Mutex::new(HashMap::new()),
            credentials: Some((username.into(), password.into())),
        })
    }

    /// Append a message to `channel`, returning its offset
    pub fn publish(&self, channel: &str, key: Option<u32>, payload: Bytes, checksum: Option<u32>) -> u64 {
        let mut channels = self.channels.lock();
        let state = channels
            .entry(channel.to_string())
            .or_insert_with(Channel::new);

        let offset = state.next_offset;
        state.next_offset += 1;
        // The receiver may already be gone; the message is then dropped
        let _ = state.tx.send(BrokerMessage {
            channel: channel.to_string(),
            offset,
            key,
            payload,
            checksum,
        });
        offset
    }

    /// Offsets committed on `channel` so far
    pub fn committed(&self, channel: &str) -> Vec<u64> {
        self.channels
            .lock()
            .get(channel)
            .map(|c| c.committed.lock().clone())
            .unwrap_or_default()
    }

    pub fn has_channel(&self, channel: &str) -> bool {
        self.channels.lock().contains_key(channel)
    }

    fn authorize(&self, config: &BrokerConfig) -> Result<(), TransportError> {
        match &self.credentials {
            Some((username, password))
                if config.username.as_deref() != Some(username.as_str())
                    || config.password.as_deref() != Some(password.as_str()) =>
            {
                Err(TransportError::Unreachable {
                    endpoint: config.address.clone(),
                    reason: "authentication failed".into(),
                })
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn subscribe(
        &self,
        channel: &str,
        config: &BrokerConfig,
    ) -> Result<Box<dyn Subscription>, TransportError> {
        self.authorize(config)?;

        let mut channels = self.channels.lock();
        let state = channels
            .entry(channel.to_string())
            .or_insert_with(Channel::new);
        let rx = state.rx.take().ok_or_else(|| TransportError::Unreachable {
            endpoint: config.address.clone(),
            reason: format!("channel {} already has a subscriber", channel),
        })?;

        debug!("Subscribed to channel {}", channel);
        Ok(Box::new(MemorySubscription {
            rx,
            committed: state.committed.clone(),
        }))
    }

    async fn release(&self, channel: &str) {
        if self.channels.lock().remove(channel).is_some() {
            debug!("Released channel {}", channel);
        }
    }
}

struct MemorySubscription {
    rx: mpsc::UnboundedReceiver<BrokerMessage>,
    committed: Arc<Mutex<Vec<u64>>>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn recv(&mut self) -> Option<BrokerMessage> {
        self.rx.recv().await
    }

    async fn commit(&mut self, message: &BrokerMessage) -> Result<(), TransportError> {
        self.committed.lock().push(message.offset);
        Ok(())
    }
}
