//! Async runtime management
//!
//! The loader drives network I/O on a dedicated Tokio runtime so the
//! consumer thread stays synchronous.

pub mod executor;
pub mod shutdown;

pub use executor::{LoaderRuntime, RuntimeConfig};
pub use shutdown::ShutdownSignal;
