//! Loader factory
//!
//! Owns everything loaders share: the graph connection, the introspected
//! schema, the runtime, broker settings, named callbacks and the set of
//! queries already installed on the server.

use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::broker::{Broker, BrokerConfig, BrokerSettings};
use crate::connection::GraphConnection;
use crate::data::callback::{BatchCallback, CallbackRegistry, CallbackStage};
use crate::data::config::{LoaderConfig, LoaderOptions, TransportKind};
use crate::data::loader::{GraphLoader, LoaderContext};
use crate::data::partition::PartitionPlanner;
use crate::error::{ConfigError, Result};
use crate::metrics::{gather_loader_metrics, standard};
use crate::runtime::{LoaderRuntime, RuntimeConfig};
use crate::schema::{ElementKind, GraphSchema};

/// Creates loaders against one graph
pub struct LoaderFactory {
    connection: Arc<dyn GraphConnection>,
    runtime: Arc<LoaderRuntime>,
    schema: Arc<GraphSchema>,
    broker: RwLock<BrokerSettings>,
    callbacks: CallbackRegistry,
    /// (graph, query) pairs installed by this factory
    installed: Mutex<HashSet<(String, String)>>,
}

impl LoaderFactory {
    /// Connect with a default-sized runtime, introspecting the schema
    pub fn new(connection: Arc<dyn GraphConnection>) -> Result<Self> {
        Self::with_runtime(connection, RuntimeConfig::default())
    }

    pub fn with_runtime(connection: Arc<dyn GraphConnection>, config: RuntimeConfig) -> Result<Self> {
        let runtime = Arc::new(LoaderRuntime::new(config)?);
        let schema = runtime.block_on(connection.schema())?;
        info!(
            "Connected to {} at {}: {} vertex types, {} edge types",
            connection.graph_name(),
            connection.endpoint(),
            schema.vertex_types.len(),
            schema.edge_types.len()
        );

        Ok(Self {
            connection,
            runtime,
            schema: Arc::new(schema),
            broker: RwLock::new(BrokerSettings::Unconfigured),
            callbacks: CallbackRegistry::new(),
            installed: Mutex::new(HashSet::new()),
        })
    }

    pub fn schema(&self) -> &GraphSchema {
        &self.schema
    }

    pub fn connection(&self) -> &Arc<dyn GraphConnection> {
        &self.connection
    }

    /// Enable streamed transport for loaders created from now on
    pub fn configure_broker(&self, config: BrokerConfig, broker: Arc<dyn Broker>) {
        info!("Broker configured at {}", config.address);
        *self.broker.write() = BrokerSettings::Configured { config, broker };
    }

    pub fn broker_settings(&self) -> BrokerSettings {
        self.broker.read().clone()
    }

    /// Make a callback available to loaders by name
    pub fn register_callback<C: BatchCallback + 'static>(&self, name: impl Into<String>, callback: C) {
        self.callbacks.register(name, callback);
    }

    /// Validate `config` against the schema and create an idle loader.
    ///
    /// Every configuration problem is reported here; nothing is fetched
    /// until the loader starts.
    pub fn loader(&self, config: LoaderConfig) -> Result<GraphLoader> {
        self.validate(&config)?;
        let callback = CallbackStage::new(config.callback.as_ref(), &self.callbacks)?;
        self.build(config, callback)
    }

    /// Like `loader`, with `callback` turning every batch into a `T`.
    ///
    /// The loader then yields whatever the callback returns. `config` must
    /// not carry a callback of its own.
    pub fn loader_with<T, C>(&self, config: LoaderConfig, callback: C) -> Result<GraphLoader<T>>
    where
        T: Send + 'static,
        C: BatchCallback<T> + 'static,
    {
        self.validate(&config)?;
        if config.callback.is_some() {
            return Err(ConfigError::ConflictingCallbacks.into());
        }
        self.build(config, CallbackStage::typed(Arc::new(callback)))
    }

    fn validate(&self, config: &LoaderConfig) -> Result<()> {
        for element in [ElementKind::Vertex, ElementKind::Edge] {
            if config.kind.includes(element) {
                config.selection(element).validate(&self.schema, element)?;
            }
        }

        let element = config.kind.partitioned_element();
        PartitionPlanner::new(&self.schema, element, config.selection(element).types(&self.schema, element))
            .filter_by(config.filter_by.as_deref())?;
        Ok(())
    }

    fn build<T: Send + 'static>(&self, config: LoaderConfig, callback: CallbackStage<T>) -> Result<GraphLoader<T>> {
        let broker = match &*self.broker.read() {
            BrokerSettings::Configured { config, broker } => Some((config.clone(), broker.clone())),
            BrokerSettings::Unconfigured => None,
        };
        if config.transport == TransportKind::Streamed && broker.is_none() {
            return Err(ConfigError::BrokerNotConfigured.into());
        }

        self.install(config.kind.query_name())?;
        debug!("Created loader {} ({:?})", config.loader_id, config.kind);

        let context = LoaderContext {
            runtime: self.runtime.clone(),
            connection: self.connection.clone(),
            schema: self.schema.clone(),
            broker,
        };
        Ok(GraphLoader::new(config, context, callback))
    }

    /// Create a loader from its JSON-friendly description
    pub fn loader_from_options(&self, options: LoaderOptions) -> Result<GraphLoader> {
        self.loader(options.into_config()?)
    }

    /// Install a partitioning query once per graph
    fn install(&self, query: &str) -> Result<()> {
        let key = (self.connection.graph_name().to_string(), query.to_string());
        let mut installed = self.installed.lock();
        if installed.contains(&key) {
            return Ok(());
        }

        self.runtime
            .block_on(self.connection.install_query(query))
            .map_err(|e| ConfigError::QueryInstallFailed {
                query: query.to_string(),
                reason: e.to_string(),
            })?;
        standard::QUERIES_INSTALLED.inc();
        info!("Installed {} on {}", query, key.0);
        installed.insert(key);
        Ok(())
    }

    /// Prometheus text export of process-wide loader metrics
    pub fn metrics(&self) -> String {
        gather_loader_metrics()
    }
}

impl std::fmt::Debug for LoaderFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoaderFactory")
            .field("graph", &self.connection.graph_name())
            .field("broker", &*self.broker.read())
            .finish()
    }
}
