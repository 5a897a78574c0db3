//! Message broker seam for streamed delivery
//!
//! The server publishes one message per partition to a channel named after
//! the loader; the loader subscribes to that channel and commits each
//! message on its own.

pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;

use crate::error::TransportError;

pub use memory::MemoryBroker;

/// Connection details of the broker, shared by every streamed loader of a factory
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct BrokerConfig {
    /// host:port of the broker
    pub address: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl BrokerConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            username: None,
            password: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Read `LOADER_BROKER_ADDRESS` and optional credentials.
    ///
    /// Returns `None` when no address is set.
    pub fn from_env() -> Option<Self> {
        let address = std::env::var("LOADER_BROKER_ADDRESS").ok()?;
        Some(Self {
            address,
            username: std::env::var("LOADER_BROKER_USERNAME").ok(),
            password: std::env::var("LOADER_BROKER_PASSWORD").ok(),
        })
    }
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("address", &self.address)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// One delivered message
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerMessage {
    pub channel: String,
    /// Position in the channel, used for commits
    pub offset: u64,
    /// Partition the publisher keyed the message with
    pub key: Option<u32>,
    pub payload: Bytes,
    /// CRC32C of the payload as published
    pub checksum: Option<u32>,
}

impl BrokerMessage {
    /// Compare the payload against the published checksum
    pub fn verify(&self) -> Result<(), TransportError> {
        match self.checksum {
            Some(expected) => {
                let actual = crc32c::crc32c(&self.payload);
                if actual == expected {
                    Ok(())
                } else {
                    Err(TransportError::DecodeFailed {
                        partition: self.key,
                        reason: format!(
                            "checksum mismatch: expected {:08x}, got {:08x}",
                            expected, actual
                        ),
                    })
                }
            }
            None => Ok(()),
        }
    }
}

/// A broker the loader can subscribe to
#[async_trait]
pub trait Broker: Send + Sync {
    async fn subscribe(
        &self,
        channel: &str,
        config: &BrokerConfig,
    ) -> Result<Box<dyn Subscription>, TransportError>;

    /// Tear down a channel and everything still queued on it
    async fn release(&self, channel: &str);
}

/// A live consumer subscription
#[async_trait]
pub trait Subscription: Send {
    /// Next message in arrival order; `None` once the channel is gone
    async fn recv(&mut self) -> Option<BrokerMessage>;

    /// Acknowledge one message
    async fn commit(&mut self, message: &BrokerMessage) -> Result<(), TransportError>;
}

/// Factory-wide broker lifecycle
#[derive(Clone, Default)]
pub enum BrokerSettings {
    #[default]
    Unconfigured,
    Configured {
        config: BrokerConfig,
        broker: Arc<dyn Broker>,
    },
}

impl BrokerSettings {
    pub fn is_configured(&self) -> bool {
        matches!(self, BrokerSettings::Configured { .. })
    }
}

impl fmt::Debug for BrokerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerSettings::Unconfigured => f.write_str("Unconfigured"),
            BrokerSettings::Configured { config, .. } => {
                f.debug_struct("Configured").field("config", config).finish()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_verification() {
        let payload = Bytes::from_static(b"{\"partition\":1}");
        let mut message = BrokerMessage {
            channel: "c".into(),
            offset: 0,
            key: Some(1),
            checksum: Some(crc32c::crc32c(&payload)),
            payload,
        };
        assert!(message.verify().is_ok());

        message.payload = Bytes::from_static(b"garbage");
        assert!(matches!(
            message.verify(),
            Err(TransportError::DecodeFailed { partition: Some(1), .. })
        ));
    }

    #[test]
    fn test_password_is_redacted() {
        let config = BrokerConfig::new("localhost:9092").with_credentials("loader", "secret");
        let printed = format!("{:?}", config);
        assert!(printed.contains("localhost:9092"));
        assert!(!printed.contains("secret"));
    }
}
