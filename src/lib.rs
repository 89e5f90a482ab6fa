//! # Search Sync
//!
//! Keeps a Meilisearch index eventually consistent with a PostgreSQL `users`
//! table, under at-least-once delivery and partial outages.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 UserService (create/update/delete)          │
//! │  • Writes the row, then publishes one IndexingInstruction   │
//! └─────────────────────────────────────────────────────────────┘
//!                │ row                          │ message
//!                ▼                              ▼
//! ┌───────────────────────────┐   ┌─────────────────────────────┐
//! │  PostgreSQL (ground truth)│   │  RabbitMQ  worker.search    │
//! └───────────────────────────┘   └─────────────────────────────┘
//!                │ poll since watermark         │ consume (prefetch 1)
//!                ▼                              ▼
//! ┌───────────────────────────┐   ┌─────────────────────────────┐
//! │  ChangePoller             │   │  IndexingWorker             │
//! │  • breaker-throttled      │──►│  • secret check             │
//! │  • diff vs index          │   │  • insert / update / delete │
//! │  • mark rows synced       │   └─────────────────────────────┘
//! └───────────────────────────┘         │ failure       │ ok
//!                │ direct                ▼               ▼
//!                │           ┌──────────────────┐  ┌─────────────┐
//!                └──────────►│ worker.dlq       │  │ Meilisearch │
//!                            │ DeadLetterWorker │  └─────────────┘
//!                            │ • per-queue      │
//!                            │   breaker        │──► worker.search
//!                            └──────────────────┘
//! ```
//!
//! Redis holds the change watermark and the breaker counters shared by every
//! process.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use search_sync::{Backends, Role, SearchSyncConfig, SyncRuntime};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SearchSyncConfig::load(None)?;
//!     let backends = Backends::connect(&config).await?;
//!
//!     let mut runtime = SyncRuntime::new(config, backends);
//!     runtime.start(Role::All).await?;
//!     runtime.run_until_signal().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`pipeline`]: poller, indexing and dead-letter workers, runtime
//! - [`resilience`]: shared breaker, circuit breakers, retry
//! - [`storage`]: backend traits with Postgres, Redis, Meilisearch, RabbitMQ and in-memory adapters
//! - [`search`]: filter AST and index bootstrap
//! - [`service`]: user CRUD and search
//! - [`watermark`], [`message`], [`user`]: shared data shapes

pub mod config;
pub mod message;
pub mod metrics;
pub mod pipeline;
pub mod resilience;
pub mod search;
pub mod service;
pub mod storage;
pub mod user;
pub mod watermark;

pub use config::{ConfigError, Handoff, LogFormat, SearchSyncConfig};
pub use message::{DeadLetterRecord, Disposition, IndexAction, IndexingInstruction, QueueEnvelope};
pub use pipeline::{
    Backends, ChangePoller, CycleOutcome, CycleReport, DeadLetterWorker, IndexingWorker, PipelineState, Role,
    SyncRuntime,
};
pub use resilience::breaker::{BackoffPolicy, BreakerGuard, GuardDecision, GuardPolicy};
pub use resilience::circuit_breaker::{BackendCircuits, CircuitBreaker, CircuitConfig, CircuitError};
pub use resilience::retry::RetryConfig;
pub use service::{ServiceError, UserPage, UserSearch, UserService};
pub use storage::traits::{
    CacheStore, MatchingStrategy, MessageBroker, RelationalChangeSource, SearchIndexSink, SearchQuery, SearchResults,
    StorageError,
};
pub use user::{UserDocument, UserPatch, UserProfile, UserRecord};
pub use watermark::Watermark;
pub use metrics::LatencyTimer;
