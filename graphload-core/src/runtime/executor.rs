//! Tokio runtime executor configuration
//!
//! One multi-threaded runtime per factory. Producer tasks and transport I/O
//! run on it; the consumer blocks on it for single-partition passes and
//! queue reads.

use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;

use crate::error::{LoaderError, Result};

/// Configuration for the loader runtime
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Worker threads for transport I/O and assembly
    pub worker_threads: usize,
    /// How long `shutdown` waits for in-flight tasks
    pub shutdown_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let cpus = num_cpus::get();
        Self {
            worker_threads: cpus.clamp(2, 8),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// Runtime that owns loader background work
pub struct LoaderRuntime {
    runtime: Runtime,
    config: RuntimeConfig,
}

impl LoaderRuntime {
    /// Create a new runtime with the given configuration
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.worker_threads.max(1))
            .thread_name("graphload-io")
            .enable_all()
            .build()
            .map_err(|e| LoaderError::Runtime {
                message: format!("Failed to create loader runtime: {}", e),
            })?;

        Ok(Self { runtime, config })
    }

    /// Spawn a background task
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.runtime.spawn(future)
    }

    /// Run a future to completion on the calling thread
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    pub fn handle(&self) -> Handle {
        self.runtime.handle().clone()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Stop the runtime, waiting up to the configured timeout
    pub fn shutdown(self) {
        self.runtime.shutdown_timeout(self.config.shutdown_timeout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_creation() {
        let runtime = LoaderRuntime::new(RuntimeConfig::default()).unwrap();

        let handle = runtime.spawn(async { 21 * 2 });
        let result = runtime.block_on(handle).unwrap();

        assert_eq!(result, 42);
    }
}
