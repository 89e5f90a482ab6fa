//! Shared types for the pipeline workers.

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

use crate::storage::traits::StorageError;

/// Runtime lifecycle state.
///
/// Use [`super::SyncRuntime::state()`] to check the current state or
/// [`super::SyncRuntime::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Just created, not yet started
    Created,
    /// Connecting to backends and preparing the index
    Connecting,
    /// Poller and worker pools running
    Running,
    /// Shutdown signal received, draining in-flight work
    Draining,
    /// All tasks finished (or the grace window ran out)
    Stopped,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Running => write!(f, "Running"),
            Self::Draining => write!(f, "Draining"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Why applying an indexing instruction failed.
#[derive(Error, Debug)]
pub enum IndexingError {
    #[error("message secret does not match")]
    Unauthorized,
    #[error("unknown action '{0}'")]
    UnknownAction(String),
    #[error("{0} requires a document id")]
    MissingId(String),
    #[error("{0} circuit open, call rejected")]
    Rejected(&'static str),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl IndexingError {
    /// Unauthorized messages are flagged `unknown` on the dead-letter queue.
    #[must_use]
    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unauthorized)
    }
}

/// A poller step that aborted the cycle.
#[derive(Error, Debug)]
pub enum CycleError {
    #[error("breaker guard failed: {0}")]
    Guard(#[source] StorageError),
    #[error("watermark unavailable: {0}")]
    Watermark(#[source] StorageError),
    #[error("change query failed: {0}")]
    Query(#[source] StorageError),
    #[error("index lookup for '{id}' failed: {source}")]
    Diff {
        id: String,
        #[source]
        source: StorageError,
    },
    #[error("{action} hand-off failed: {source}")]
    Handoff {
        action: &'static str,
        #[source]
        source: StorageError,
    },
    #[error("mark synced for '{id}' failed: {source}")]
    MarkSynced {
        id: String,
        #[source]
        source: StorageError,
    },
    #[error("could not encode batch: {0}")]
    Encode(#[from] serde_json::Error),
}

impl CycleError {
    /// Metric label for the failing step.
    #[must_use]
    pub fn step(&self) -> &'static str {
        match self {
            Self::Guard(_) => "guard",
            Self::Watermark(_) => "watermark",
            Self::Query(_) => "query",
            Self::Diff { .. } => "diff",
            Self::Handoff { .. } => "handoff",
            Self::MarkSynced { .. } => "mark_synced",
            Self::Encode(_) => "encode",
        }
    }
}

/// How a poller cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Breaker rejected the attempt
    Throttled,
    /// No watermark stored yet
    NoWatermark,
    /// Nothing changed since the watermark
    Idle,
    /// Rows were handed off and marked
    Synced,
}

impl CycleOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Throttled => "throttled",
            Self::NoWatermark => "no_watermark",
            Self::Idle => "idle",
            Self::Synced => "synced",
        }
    }
}

/// Summary of one poller cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    /// Rows returned by the change query
    pub found: usize,
    pub inserted: usize,
    pub updated: usize,
    /// Soft-deleted rows whose tombstone was handed off
    pub deleted: usize,
    /// Rows flagged synced
    pub marked: usize,
    /// Rows whose sync flag update hit no row
    pub unmarked: usize,
    /// Watermark after the cycle
    pub watermark: Option<DateTime<Utc>>,
    pub elapsed: Duration,
}

impl CycleReport {
    #[must_use]
    pub fn new(outcome: CycleOutcome) -> Self {
        Self {
            outcome,
            found: 0,
            inserted: 0,
            updated: 0,
            deleted: 0,
            marked: 0,
            unmarked: 0,
            watermark: None,
            elapsed: Duration::ZERO,
        }
    }
}

/// Why a message was dropped without being applied or retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    Undecodable,
    Unauthorized,
    EmptyPayload,
    Exhausted,
    GuardUnavailable,
    PublishFailed,
    /// Record points somewhere other than the primary queue
    ForeignDestination,
}

impl DiscardReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Undecodable => "undecodable",
            Self::Unauthorized => "unauthorized",
            Self::EmptyPayload => "empty_payload",
            Self::Exhausted => "exhausted",
            Self::GuardUnavailable => "guard_unavailable",
            Self::PublishFailed => "publish_failed",
            Self::ForeignDestination => "foreign_destination",
        }
    }
}

impl std::fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
