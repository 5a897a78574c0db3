//! Graph batch loader
//!
//! Consumer-facing handle of one loader. `start()` plans the pass and either
//! computes the only batch inline (single partition) or spawns a producer
//! feeding a bounded queue that iteration drains.
//!
//! ```ignore
//! let mut loader = factory.loader(config)?;
//! for batch in &mut loader {
//!     let batch = batch?;
//!     train_step(&batch);
//! }
//! loader.reset();
//! ```
//!
//! The consumer side blocks on the loader runtime, so a loader must not be
//! driven from inside an async task.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::assembler::Assembler;
use super::batch::Batch;
use super::callback::CallbackStage;
use super::config::{LoaderConfig, TransportKind};
use super::partition::{PartitionPlan, PartitionPlanner};
use super::producer::{Pipeline, Producer};
use super::queue::{self, Slot, SlotReceiver};
use crate::broker::{Broker, BrokerConfig};
use crate::connection::{FetchRequest, GraphConnection};
use crate::error::{ConfigError, LoaderError, Result, TransportError};
use crate::metrics::{standard, LoaderStats, StatsSnapshot};
use crate::runtime::{LoaderRuntime, ShutdownSignal};
use crate::schema::GraphSchema;
use crate::transport;

/// How long `reset()` waits for a signalled producer before aborting it
const PRODUCER_GRACE: Duration = Duration::from_secs(2);

/// Loader lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoaderState {
    Idle,
    Running,
    Exhausted,
    Cancelled,
}

/// Lifecycle state shared with the producer.
///
/// Every pass gets a new generation; a producer can only move the state of
/// its own generation, so a stale producer never overwrites a newer pass.
pub(crate) struct StateCell {
    inner: Mutex<(u64, LoaderState)>,
}

impl StateCell {
    fn new() -> Self {
        Self {
            inner: Mutex::new((0, LoaderState::Idle)),
        }
    }

    pub fn get(&self) -> LoaderState {
        self.inner.lock().1
    }

    /// Idle -> Running, returning the new generation
    fn begin(&self) -> Result<u64> {
        let mut inner = self.inner.lock();
        if inner.1 != LoaderState::Idle {
            return Err(LoaderError::InvalidState { state: inner.1 });
        }
        inner.0 += 1;
        inner.1 = LoaderState::Running;
        Ok(inner.0)
    }

    /// Running -> `to`, for the given generation only
    pub fn transition(&self, generation: u64, to: LoaderState) -> bool {
        let mut inner = self.inner.lock();
        if inner.0 == generation && inner.1 == LoaderState::Running {
            inner.1 = to;
            true
        } else {
            false
        }
    }

    /// Any state -> Idle, invalidating the current generation
    fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.0 += 1;
        inner.1 = LoaderState::Idle;
    }

    fn generation(&self) -> u64 {
        self.inner.lock().0
    }
}

/// Collaborators a loader runs against
#[derive(Clone)]
pub(crate) struct LoaderContext {
    pub runtime: Arc<LoaderRuntime>,
    pub connection: Arc<dyn GraphConnection>,
    pub schema: Arc<GraphSchema>,
    pub broker: Option<(BrokerConfig, Arc<dyn Broker>)>,
}

enum Mode<T> {
    Idle,
    /// Single-partition pass: the item was computed by `start()`
    Single(Option<T>),
    Pipeline {
        receiver: SlotReceiver<T>,
        handle: JoinHandle<()>,
        shutdown: ShutdownSignal,
    },
    /// Pass ended; nothing more to yield until `reset()`
    Done,
}

/// What `data()` resolves to
pub enum LoaderData<'a, T = Batch> {
    /// The only batch of a single-partition loader
    Batch(&'a T),
    /// The loader itself, to be iterated
    Loader(&'a mut GraphLoader<T>),
}

/// Streaming batch loader.
///
/// Yields `T`, the output of the loader's callback; without a typed
/// callback that is the assembled `Batch`.
pub struct GraphLoader<T = Batch> {
    config: Arc<LoaderConfig>,
    context: LoaderContext,
    assembler: Arc<Assembler>,
    callback: CallbackStage<T>,
    state: Arc<StateCell>,
    mode: Mode<T>,
    plan: Option<PartitionPlan>,
    stats: Arc<LoaderStats>,
}

impl<T: Send + 'static> GraphLoader<T> {
    pub(crate) fn new(config: LoaderConfig, context: LoaderContext, callback: CallbackStage<T>) -> Self {
        let assembler = Arc::new(Assembler::new(context.schema.clone(), &config));
        Self {
            config: Arc::new(config),
            context,
            assembler,
            callback,
            state: Arc::new(StateCell::new()),
            mode: Mode::Idle,
            plan: None,
            stats: LoaderStats::new(),
        }
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn loader_id(&self) -> &str {
        &self.config.loader_id
    }

    pub fn state(&self) -> LoaderState {
        self.state.get()
    }

    /// Plan of the current or last pass
    pub fn plan(&self) -> Option<&PartitionPlan> {
        self.plan.as_ref()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Whether a background producer exists for the current pass
    pub fn has_producer(&self) -> bool {
        matches!(self.mode, Mode::Pipeline { .. })
    }

    /// Batches sitting in the queue
    pub fn buffered(&self) -> usize {
        match &self.mode {
            Mode::Pipeline { receiver, .. } => receiver.pending(),
            _ => 0,
        }
    }

    /// Begin a production pass. Only allowed from `Idle`.
    ///
    /// Configuration problems surface here, before anything runs in the
    /// background. A transport failure while planning or while computing a
    /// single-partition batch leaves the loader `Cancelled`.
    pub fn start(&mut self) -> Result<()> {
        let state = self.state.get();
        if state != LoaderState::Idle {
            return Err(LoaderError::InvalidState { state });
        }
        if self.config.transport == TransportKind::Streamed && self.context.broker.is_none() {
            return Err(ConfigError::BrokerNotConfigured.into());
        }
        let planner = PartitionPlanner::new(
            &self.context.schema,
            self.config.kind.partitioned_element(),
            self.config
                .selection(self.config.kind.partitioned_element())
                .types(&self.context.schema, self.config.kind.partitioned_element()),
        )
        .filter_by(self.config.filter_by.as_deref())?;

        let generation = self.state.begin()?;
        self.stats.passes_started.inc();

        let request = FetchRequest::new(&self.config, &self.context.schema);
        let total = match self.count_elements(&request) {
            Ok(total) => total,
            Err(e) => {
                self.state.transition(generation, LoaderState::Cancelled);
                return Err(e);
            }
        };

        let plan = match planner.plan(total, self.config.sizing, self.config.shuffle, self.config.seed) {
            Ok(plan) => plan,
            Err(e) => {
                self.state.reset();
                return Err(e.into());
            }
        };
        let request = request.with_plan(&plan);
        let transport = match transport::for_config(
            &self.config,
            self.context.connection.clone(),
            self.context.broker.clone(),
            request,
            &plan,
        ) {
            Ok(transport) => transport,
            Err(e) => {
                self.state.reset();
                return Err(e.into());
            }
        };
        info!(
            "Loader {} starting pass {}: {} elements in {} partitions",
            self.config.loader_id, generation, plan.total, plan.num_batches
        );

        let pipeline = Pipeline {
            assembler: self.assembler.clone(),
            callback: self.callback.clone(),
            timeout: self.config.timeout,
            stats: self.stats.clone(),
        };

        if plan.is_single() {
            self.plan = Some(plan);
            match self.context.runtime.block_on(pipeline.single(transport)) {
                Ok(batch) => {
                    self.state.transition(generation, LoaderState::Exhausted);
                    self.mode = Mode::Single(Some(batch));
                    Ok(())
                }
                Err(e) => {
                    self.state.transition(generation, LoaderState::Cancelled);
                    self.mode = Mode::Done;
                    Err(e)
                }
            }
        } else {
            let (sender, receiver) = queue::bounded(self.config.buffer_size, Some(self.stats.clone()));
            let shutdown = ShutdownSignal::new();
            let producer = Producer {
                pipeline,
                transport,
                sender,
                shutdown: shutdown.clone(),
                state: self.state.clone(),
                generation,
            };

            self.stats.producers_spawned.inc();
            standard::PRODUCERS_SPAWNED.inc();
            let handle = self.context.runtime.spawn(producer.run());
            self.plan = Some(plan);
            self.mode = Mode::Pipeline {
                receiver,
                handle,
                shutdown,
            };
            Ok(())
        }
    }

    /// Size of the filtered element set, bounded by the request timeout
    fn count_elements(&self, request: &FetchRequest) -> Result<usize> {
        let counting = self.context.connection.count(request);
        let limit = self.config.timeout;
        // The timer has to be created inside the runtime
        match self.context.runtime.block_on(async move { timeout(limit, counting).await }) {
            Ok(result) => Ok(result?),
            Err(_) => Err(TransportError::Timeout {
                partition: None,
                after: self.config.timeout,
            }
            .into()),
        }
    }

    /// Discard buffered and in-flight batches and return to `Idle`
    pub fn reset(&mut self) {
        if let Mode::Pipeline {
            mut receiver,
            mut handle,
            shutdown,
        } = std::mem::replace(&mut self.mode, Mode::Idle)
        {
            shutdown.shutdown();
            let dropped = receiver.discard();
            drop(receiver);

            if !handle.is_finished() {
                let joined = self
                    .context
                    .runtime
                    .block_on(async { timeout(PRODUCER_GRACE, &mut handle).await });
                if joined.is_err() {
                    warn!(
                        "Producer of {} did not stop within {:?}, aborting",
                        self.config.loader_id, PRODUCER_GRACE
                    );
                    handle.abort();
                }
            }
            debug!("Loader {} reset, dropped {} buffered batches", self.config.loader_id, dropped);
        }

        self.mode = Mode::Idle;
        self.state.reset();
    }

    /// Reset and start a fresh pass
    pub fn epoch(&mut self) -> Result<&mut Self> {
        self.reset();
        self.start()?;
        Ok(self)
    }

    /// The sole batch of a single-partition loader, otherwise the loader itself.
    ///
    /// Starts a pass when idle. Never starts a second pass while one is
    /// running; a single-partition batch already handed out by iteration is
    /// recomputed. A cancelled loader stays cancelled until `reset()`.
    pub fn data(&mut self) -> Result<LoaderData<'_, T>> {
        let state = self.state.get();
        if matches!(self.mode, Mode::Done) && state == LoaderState::Cancelled {
            return Err(LoaderError::InvalidState { state });
        }
        let handed_out = match self.mode {
            Mode::Single(None) => true,
            Mode::Done => state == LoaderState::Exhausted && self.plan.as_ref().is_some_and(PartitionPlan::is_single),
            _ => false,
        };
        if handed_out {
            self.reset();
        }
        if matches!(self.mode, Mode::Idle) && self.state.get() == LoaderState::Idle {
            self.start()?;
        }

        match self.mode {
            Mode::Single(Some(ref batch)) => Ok(LoaderData::Batch(batch)),
            _ => Ok(LoaderData::Loader(self)),
        }
    }

    /// End the pipeline after its last slot
    fn finish(&mut self, to: LoaderState) {
        self.state.transition(self.state.generation(), to);
        if let Mode::Pipeline { shutdown, .. } = std::mem::replace(&mut self.mode, Mode::Done) {
            shutdown.shutdown();
        }
    }

    fn next_from_queue(&mut self) -> Option<Result<T>> {
        let Mode::Pipeline { receiver, .. } = &mut self.mode else {
            return None;
        };
        let slot = self.context.runtime.block_on(receiver.recv());

        match slot {
            Some(Slot::Batch(batch)) => Some(Ok(batch)),
            Some(Slot::Failed { error, fatal: false }) => Some(Err(error)),
            Some(Slot::Failed { error, fatal: true }) => {
                self.finish(LoaderState::Cancelled);
                Some(Err(error))
            }
            Some(Slot::End) => {
                debug!("Loader {} exhausted", self.config.loader_id);
                self.finish(LoaderState::Exhausted);
                None
            }
            None => {
                warn!("Producer of {} vanished without end marker", self.config.loader_id);
                self.finish(LoaderState::Cancelled);
                Some(Err(LoaderError::ProducerLost))
            }
        }
    }
}

impl<T: Send + 'static> Iterator for GraphLoader<T> {
    type Item = Result<T>;

    /// Next batch. Starts a pass when idle; a failed start is reported once.
    fn next(&mut self) -> Option<Self::Item> {
        if matches!(self.mode, Mode::Idle) && self.state.get() == LoaderState::Idle {
            if let Err(e) = self.start() {
                self.mode = Mode::Done;
                return Some(Err(e));
            }
        }

        match &mut self.mode {
            Mode::Idle | Mode::Done => None,
            Mode::Single(batch) => {
                let batch = batch.take();
                self.mode = Mode::Done;
                batch.map(Ok)
            }
            Mode::Pipeline { .. } => self.next_from_queue(),
        }
    }
}

impl<T> Drop for GraphLoader<T> {
    fn drop(&mut self) {
        if let Mode::Pipeline {
            mut receiver,
            handle,
            shutdown,
        } = std::mem::replace(&mut self.mode, Mode::Done)
        {
            shutdown.shutdown();
            receiver.discard();
            handle.abort();
        }
    }
}

impl<T> std::fmt::Debug for GraphLoader<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphLoader")
            .field("loader_id", &self.config.loader_id)
            .field("state", &self.state.get())
            .field("plan", &self.plan)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_cell_generations() {
        let cell = StateCell::new();
        let first = cell.begin().unwrap();
        assert!(matches!(
            cell.begin(),
            Err(LoaderError::InvalidState {
                state: LoaderState::Running
            })
        ));

        cell.reset();
        let second = cell.begin().unwrap();
        assert!(second > first);

        // A producer of the first pass can no longer move the state
        assert!(!cell.transition(first, LoaderState::Exhausted));
        assert_eq!(cell.get(), LoaderState::Running);
        assert!(cell.transition(second, LoaderState::Cancelled));
        assert_eq!(cell.get(), LoaderState::Cancelled);
    }
}
