//! Per-batch callbacks
//!
//! A callback transforms each assembled batch before it is queued, and what
//! it returns is what the consumer receives. Batch-to-batch callbacks are
//! either handed over directly or referenced by name from the factory's
//! registry; a name that resolves to nothing is rejected before any work is
//! started. Callbacks producing another type (a tensor-graph conversion, a
//! feature matrix) go through `LoaderFactory::loader_with`.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::batch::Batch;
use crate::error::{ConfigError, LoaderError, Result};

/// A transformation applied to every batch, yielding `T`
pub trait BatchCallback<T = Batch>: Send + Sync {
    fn invoke(&self, batch: Batch) -> Result<T>;
}

impl<F, T> BatchCallback<T> for F
where
    F: Fn(Batch) -> T + Send + Sync,
{
    fn invoke(&self, batch: Batch) -> Result<T> {
        Ok(self(batch))
    }
}

/// Wraps a fallible closure; its error message surfaces as `LoaderError::Callback`
pub struct TryCallback<F>(pub F);

impl<F, T, E> BatchCallback<T> for TryCallback<F>
where
    F: Fn(Batch) -> std::result::Result<T, E> + Send + Sync,
    E: fmt::Display,
{
    fn invoke(&self, batch: Batch) -> Result<T> {
        (self.0)(batch).map_err(|e| LoaderError::Callback {
            message: e.to_string(),
        })
    }
}

/// How a loader refers to its callback
#[derive(Clone)]
pub enum CallbackSpec {
    Function(Arc<dyn BatchCallback>),
    /// Looked up in the factory registry when the loader is created
    Named(String),
}

impl CallbackSpec {
    pub fn function<C: BatchCallback + 'static>(callback: C) -> Self {
        CallbackSpec::Function(Arc::new(callback))
    }
}

impl fmt::Debug for CallbackSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallbackSpec::Function(_) => f.write_str("Function(..)"),
            CallbackSpec::Named(name) => f.debug_tuple("Named").field(name).finish(),
        }
    }
}

/// Named callbacks shared by all loaders of one factory
#[derive(Default, Clone)]
pub struct CallbackRegistry {
    callbacks: Arc<RwLock<HashMap<String, Arc<dyn BatchCallback>>>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<C: BatchCallback + 'static>(&self, name: impl Into<String>, callback: C) {
        self.callbacks.write().insert(name.into(), Arc::new(callback));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn BatchCallback>> {
        self.callbacks.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.callbacks.read().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Hands the assembled batch through unchanged
struct Identity;

impl BatchCallback<Batch> for Identity {
    fn invoke(&self, batch: Batch) -> Result<Batch> {
        Ok(batch)
    }
}

/// The resolved callback of one loader
pub struct CallbackStage<T = Batch> {
    callback: Arc<dyn BatchCallback<T>>,
    identity: bool,
}

impl<T> Clone for CallbackStage<T> {
    fn clone(&self) -> Self {
        Self {
            callback: self.callback.clone(),
            identity: self.identity,
        }
    }
}

impl CallbackStage<Batch> {
    /// Resolve `spec`; unknown names are not invocable
    pub fn new(spec: Option<&CallbackSpec>, registry: &CallbackRegistry) -> std::result::Result<Self, ConfigError> {
        let callback = match spec {
            None => return Ok(Self::default()),
            Some(CallbackSpec::Function(f)) => Arc::clone(f),
            Some(CallbackSpec::Named(name)) => registry
                .get(name)
                .ok_or_else(|| ConfigError::CallbackNotInvocable { name: name.clone() })?,
        };
        Ok(Self {
            callback,
            identity: false,
        })
    }
}

impl Default for CallbackStage<Batch> {
    fn default() -> Self {
        Self {
            callback: Arc::new(Identity),
            identity: true,
        }
    }
}

impl<T> CallbackStage<T> {
    /// Stage converting every batch into `T`
    pub fn typed(callback: Arc<dyn BatchCallback<T>>) -> Self {
        Self {
            callback,
            identity: false,
        }
    }

    pub fn is_identity(&self) -> bool {
        self.identity
    }

    pub fn apply(&self, batch: Batch) -> Result<T> {
        self.callback.invoke(batch)
    }
}

impl<T> fmt::Debug for CallbackStage<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackStage")
            .field("identity", &self.is_identity())
            .finish()
    }
}
