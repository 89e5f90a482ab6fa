//! The sync pipeline.
//!
//! ```text
//! Postgres ──poll──► ChangePoller ──direct──────────────────► Meilisearch
//!                        │                                        ▲
//!                        └─queue─► worker.search ─► IndexingWorker┘
//!                                        ▲               │ failure
//!                                        │               ▼
//!                                        └─ DeadLetterWorker ◄─ worker.dlq
//! ```
//!
//! - [`poller`]: periodic change detection and hand-off
//! - [`indexer`]: primary-queue consumer
//! - [`dead_letter`]: dead-letter consumer with throttled redelivery
//! - [`runtime`]: bootstrap, worker pools, shutdown

pub mod dead_letter;
pub mod indexer;
pub mod poller;
pub mod runtime;
pub mod types;

pub use dead_letter::{DeadLetterSettings, DeadLetterWorker};
pub use indexer::{IndexerSettings, IndexingWorker};
pub use poller::{diff_filter, ChangePoller, PollerSettings};
pub use runtime::{init_tracing, shutdown_signal, Backends, InitOnce, Role, SyncRuntime, WorkerPool};
pub use types::{CycleError, CycleOutcome, CycleReport, DiscardReason, IndexingError, PipelineState};
