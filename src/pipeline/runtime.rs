// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Process runtime: connects the backends, starts the poller and the worker
//! pools, and drains them on shutdown.
//!
//! # Lifecycle
//!
//! ```text
//! Created → Connecting → Running → Draining → Stopped
//! ```
//!
//! Backend connections are made up front by [`Backends::connect`]; any failure
//! there is fatal. After `start`, every task watches one shutdown channel.
//! `shutdown` flips it and waits up to the grace window for in-flight
//! messages to settle before aborting what is left.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use super::dead_letter::{DeadLetterSettings, DeadLetterWorker};
use super::indexer::{IndexerSettings, IndexingWorker};
use super::poller::{ChangePoller, PollerSettings};
use super::types::PipelineState;
use crate::config::{LogFormat, SearchSyncConfig};
use crate::message::{
    DEAD_LETTER_EXCHANGE, DEAD_LETTER_QUEUE, EXCHANGE_TYPE_DIRECT, PRIMARY_EXCHANGE, PRIMARY_QUEUE, USERS_COLLECTION,
};
use crate::resilience::circuit_breaker::BackendCircuits;
use crate::search::{ensure_index, IndexSpec};
use crate::storage::amqp::AmqpBroker;
use crate::storage::meilisearch::MeiliIndex;
use crate::storage::redis::RedisCache;
use crate::storage::sql::PgStore;
use crate::storage::traits::{
    CacheStore, ConsumeOptions, MessageBroker, MessageHandler, RelationalChangeSource, SearchIndexSink,
    StorageError, UserRepository,
};

/// Which parts of the pipeline this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Poller and both worker pools
    All,
    /// Change poller only
    Scheduler,
    /// Indexing and dead-letter pools only
    Worker,
}

impl Role {
    fn runs_scheduler(self) -> bool {
        matches!(self, Self::All | Self::Scheduler)
    }

    fn runs_workers(self) -> bool {
        matches!(self, Self::All | Self::Worker)
    }
}

/// One-shot claim. Only the first `claim` returns true.
#[derive(Debug, Default)]
pub struct InitOnce {
    claimed: AtomicBool,
}

impl InitOnce {
    #[must_use]
    pub const fn new() -> Self {
        Self { claimed: AtomicBool::new(false) }
    }

    pub fn claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[must_use]
    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }
}

/// Default consumers per pool: half the available cores, at least one.
#[must_use]
pub fn default_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() / 2)
        .unwrap_or(1)
        .max(1)
}

/// Connected backend handles.
#[derive(Clone)]
pub struct Backends {
    pub cache: Arc<dyn CacheStore>,
    pub source: Arc<dyn RelationalChangeSource>,
    pub users: Arc<dyn UserRepository>,
    pub index: Arc<dyn SearchIndexSink>,
    pub broker: Arc<dyn MessageBroker>,
}

impl Backends {
    /// Connect to Redis, Postgres, Meilisearch and RabbitMQ, in that order.
    pub async fn connect(config: &SearchSyncConfig) -> Result<Self, StorageError> {
        let cache = Arc::new(RedisCache::new(&config.redis_url).await?);
        info!("Redis connected");

        let pg = Arc::new(PgStore::new(&config.database_url).await?);
        info!("Postgres connected");

        let index = Arc::new(MeiliIndex::connect(&config.meilisearch_url, config.meilisearch_key.clone()).await?);
        info!(url = %config.meilisearch_url, "Meilisearch connected");

        let broker = Arc::new(AmqpBroker::connect(&config.amqp_url).await?);

        Ok(Self {
            cache,
            source: pg.clone(),
            users: pg,
            index,
            broker,
        })
    }
}

/// A fixed-size pool of consumers sharing one handler. Spawns at most once.
pub struct WorkerPool {
    pub name: &'static str,
    pub exchange: &'static str,
    pub queue: &'static str,
    pub size: usize,
    started: InitOnce,
}

impl WorkerPool {
    #[must_use]
    pub const fn new(name: &'static str, exchange: &'static str, queue: &'static str, size: usize) -> Self {
        Self { name, exchange, queue, size, started: InitOnce::new() }
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.is_claimed()
    }

    /// Spawn `size` consumers onto `tasks`. Each gets its own channel with prefetch 1.
    ///
    /// Returns false, spawning nothing, when the pool already runs.
    pub fn spawn(
        &self,
        tasks: &mut JoinSet<()>,
        broker: Arc<dyn MessageBroker>,
        handler: Arc<dyn MessageHandler>,
        shutdown: &watch::Receiver<bool>,
    ) -> bool {
        if !self.started.claim() {
            warn!(pool = self.name, "Worker pool already started, not starting another");
            return false;
        }
        for n in 0..self.size {
            let options = ConsumeOptions {
                exchange: self.exchange.to_string(),
                exchange_type: EXCHANGE_TYPE_DIRECT.to_string(),
                queue: self.queue.to_string(),
                consumer_tag: format!("{}-{}", self.name, n),
                prefetch: 1,
            };
            let broker = broker.clone();
            let handler = handler.clone();
            let shutdown = shutdown.clone();
            let pool = self.name;
            tasks.spawn(async move {
                if let Err(e) = broker.consume(options, handler, shutdown).await {
                    error!(pool, consumer = n, error = %e, "Consumer exited with error");
                }
            });
        }
        crate::metrics::set_active_consumers(self.name, self.size);
        info!(pool = self.name, queue = self.queue, size = self.size, "Worker pool started");
        true
    }
}

pub struct SyncRuntime {
    config: SearchSyncConfig,
    backends: Backends,
    circuits: Arc<BackendCircuits>,
    scheduler_once: InitOnce,
    indexer_pool: WorkerPool,
    dead_letter_pool: WorkerPool,
    state: watch::Sender<PipelineState>,
    state_rx: watch::Receiver<PipelineState>,
    shutdown: watch::Sender<bool>,
    tasks: JoinSet<()>,
}

impl SyncRuntime {
    pub fn new(config: SearchSyncConfig, backends: Backends) -> Self {
        let (state, state_rx) = watch::channel(PipelineState::Created);
        let (shutdown, _) = watch::channel(false);
        let size = config.worker_concurrency.unwrap_or_else(default_pool_size);
        Self {
            config,
            backends,
            circuits: Arc::new(BackendCircuits::new()),
            scheduler_once: InitOnce::new(),
            indexer_pool: WorkerPool::new("indexer", PRIMARY_EXCHANGE, PRIMARY_QUEUE, size),
            dead_letter_pool: WorkerPool::new("dead_letter", DEAD_LETTER_EXCHANGE, DEAD_LETTER_QUEUE, size),
            state,
            state_rx,
            shutdown,
            tasks: JoinSet::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> PipelineState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<PipelineState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    #[must_use]
    pub fn circuits(&self) -> &BackendCircuits {
        &self.circuits
    }

    /// Spawned tasks not yet reaped: the poller plus every consumer.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    fn set_state(&self, state: PipelineState) {
        let _ = self.state.send(state);
        crate::metrics::set_pipeline_state(&state.to_string());
        info!(%state, "Pipeline state changed");
    }

    /// Prepare the index and spawn the tasks `role` asks for.
    #[tracing::instrument(skip(self))]
    pub async fn start(&mut self, role: Role) -> Result<(), StorageError> {
        self.set_state(PipelineState::Connecting);
        let spec = IndexSpec::users(USERS_COLLECTION);
        ensure_index(self.backends.index.as_ref(), &spec, self.config.task_timeout()).await?;

        let shutdown = self.shutdown.subscribe();

        if role.runs_scheduler() {
            if self.scheduler_once.claim() {
                let poller = ChangePoller::new(
                    self.backends.source.clone(),
                    self.backends.index.clone(),
                    self.backends.broker.clone(),
                    self.backends.cache.clone(),
                    PollerSettings::from_config(&self.config),
                );
                let rx = shutdown.clone();
                self.tasks.spawn(async move { poller.run(rx).await });
            } else {
                warn!("Change poller already started, not starting another");
            }
        }

        if role.runs_workers() {
            let indexer: Arc<dyn MessageHandler> = Arc::new(IndexingWorker::new(
                self.backends.index.clone(),
                self.backends.broker.clone(),
                self.backends.cache.clone(),
                self.circuits.clone(),
                IndexerSettings::from_config(&self.config),
            ));
            self.indexer_pool
                .spawn(&mut self.tasks, self.backends.broker.clone(), indexer, &shutdown);

            let dead_letter: Arc<dyn MessageHandler> = Arc::new(DeadLetterWorker::new(
                self.backends.broker.clone(),
                self.backends.cache.clone(),
                self.circuits.clone(),
                DeadLetterSettings::from_config(&self.config),
            ));
            self.dead_letter_pool
                .spawn(&mut self.tasks, self.backends.broker.clone(), dead_letter, &shutdown);
        }

        self.set_state(PipelineState::Running);
        Ok(())
    }

    /// Signal every task to stop and wait up to the grace window for them.
    pub async fn shutdown(&mut self) {
        self.set_state(PipelineState::Draining);
        let _ = self.shutdown.send(true);

        let grace = self.config.shutdown_grace();
        let tasks = &mut self.tasks;
        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    warn!(error = %e, "Pipeline task ended abnormally");
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(grace = ?grace, remaining = self.tasks.len(), "Grace window elapsed, aborting tasks");
            self.tasks.abort_all();
        }
        crate::metrics::set_active_consumers("indexer", 0);
        crate::metrics::set_active_consumers("dead_letter", 0);

        let circuits = self.circuits.metrics();
        info!(
            search_failures = circuits.search.failures,
            search_rejections = circuits.search.rejections,
            broker_failures = circuits.broker.failures,
            "Circuit totals at shutdown"
        );
        self.set_state(PipelineState::Stopped);
    }

    /// Run until SIGINT/SIGTERM, then drain.
    pub async fn run_until_signal(&mut self) {
        shutdown_signal().await;
        self.shutdown().await;
    }
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init_tracing(config: &SearchSyncConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.log_level.clone().into());

    let registry = tracing_subscriber::registry().with(env_filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = ?e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = ?e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, draining"),
        _ = terminate => info!("Received SIGTERM, draining"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{IndexAction, IndexingInstruction, QueueEnvelope};
    use crate::storage::memory::{InMemoryBroker, InMemoryCache, InMemoryIndex, InMemoryUserStore};
    use serde_json::json;

    fn in_memory() -> (Backends, Arc<InMemoryIndex>, Arc<InMemoryBroker>) {
        let store = Arc::new(InMemoryUserStore::new());
        let index = Arc::new(InMemoryIndex::new());
        let broker = Arc::new(InMemoryBroker::new());
        let backends = Backends {
            cache: Arc::new(InMemoryCache::new()),
            source: store.clone(),
            users: store,
            index: index.clone(),
            broker: broker.clone(),
        };
        (backends, index, broker)
    }

    fn config() -> SearchSyncConfig {
        let mut config = SearchSyncConfig::default();
        config.rabbitmq_secret = "s3cret".into();
        config.worker_concurrency = Some(2);
        config.shutdown_grace_secs = Some(2);
        config
    }

    #[test]
    fn test_init_once() {
        let once = InitOnce::new();
        assert!(!once.is_claimed());
        assert!(once.claim());
        assert!(!once.claim());
        assert!(once.is_claimed());
    }

    #[test]
    fn test_default_pool_size() {
        assert!(default_pool_size() >= 1);
    }

    #[test]
    fn test_roles() {
        assert!(Role::All.runs_scheduler() && Role::All.runs_workers());
        assert!(!Role::Worker.runs_scheduler());
        assert!(!Role::Scheduler.runs_workers());
    }

    #[tokio::test]
    async fn test_lifecycle_processes_queue_and_drains() {
        let (backends, index, broker) = in_memory();
        let mut runtime = SyncRuntime::new(config(), backends);
        assert_eq!(runtime.state(), PipelineState::Created);

        runtime.start(Role::Worker).await.unwrap();
        assert_eq!(runtime.state(), PipelineState::Running);

        let instr = IndexingInstruction::single(IndexAction::Insert, "u1", json!({"name": "Ada"}));
        let envelope = QueueEnvelope::primary(&instr).unwrap().signed("s3cret", 15);
        broker.publish(&envelope).await.unwrap();

        for _ in 0..200 {
            if index.document(USERS_COLLECTION, "u1").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(index.document(USERS_COLLECTION, "u1").is_some());

        runtime.shutdown().await;
        assert_eq!(runtime.state(), PipelineState::Stopped);
    }

    #[tokio::test]
    async fn test_scheduler_starts_once() {
        let (backends, _, _) = in_memory();
        let mut runtime = SyncRuntime::new(config(), backends);
        runtime.start(Role::Scheduler).await.unwrap();
        runtime.start(Role::Scheduler).await.unwrap();
        assert!(runtime.scheduler_once.is_claimed());
        assert_eq!(runtime.tasks.len(), 1);
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_worker_pools_start_once() {
        let (backends, _, _) = in_memory();
        let mut runtime = SyncRuntime::new(config(), backends);
        runtime.start(Role::Worker).await.unwrap();
        runtime.start(Role::All).await.unwrap();
        runtime.start(Role::Worker).await.unwrap();

        assert!(runtime.indexer_pool.is_started());
        assert!(runtime.dead_letter_pool.is_started());
        // poller + 2 indexer + 2 dead-letter consumers
        assert_eq!(runtime.task_count(), 5);
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_pool_spawn_claims_once() {
        let (backends, _, _) = in_memory();
        let pool = WorkerPool::new("indexer", PRIMARY_EXCHANGE, PRIMARY_QUEUE, 3);
        let handler: Arc<dyn MessageHandler> = Arc::new(IndexingWorker::new(
            backends.index.clone(),
            backends.broker.clone(),
            backends.cache.clone(),
            Arc::new(BackendCircuits::new()),
            IndexerSettings::from_config(&config()),
        ));
        let (shutdown, rx) = watch::channel(false);
        let mut tasks = JoinSet::new();

        assert!(pool.spawn(&mut tasks, backends.broker.clone(), handler.clone(), &rx));
        assert!(!pool.spawn(&mut tasks, backends.broker.clone(), handler, &rx));
        assert_eq!(tasks.len(), 3);

        let _ = shutdown.send(true);
        while tasks.join_next().await.is_some() {}
    }

    #[tokio::test]
    async fn test_start_fails_when_index_unreachable() {
        let (backends, index, _) = in_memory();
        index.set_unavailable(true);
        let mut runtime = SyncRuntime::new(config(), backends);
        assert!(runtime.start(Role::All).await.is_err());
        assert_eq!(runtime.state(), PipelineState::Connecting);
    }
}
