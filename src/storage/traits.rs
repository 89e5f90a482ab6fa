use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

use crate::message::{Disposition, IncomingMessage, QueueEnvelope};
use crate::search::Filter;
use crate::user::{NewUser, UserPatch, UserRecord};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Item not found")]
    NotFound,
    #[error("No rows affected")]
    NoRowsAffected,
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Timed out waiting for {0}")]
    Timeout(String),
}

impl StorageError {
    /// Whether retrying the same call could plausibly succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Backend(_) | Self::Timeout(_))
    }
}

/// Remaining lifetime of a cache key, as reported by `TTL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// Key does not exist (-2)
    Missing,
    /// Key exists without expiry (-1)
    Persistent,
    /// Key expires after the given duration
    Expires(Duration),
}

impl KeyTtl {
    /// Map a raw `TTL` reply (seconds) into a [`KeyTtl`].
    #[must_use]
    pub fn from_seconds(raw: i64) -> Self {
        match raw {
            -2 => Self::Missing,
            r if r < 0 => Self::Persistent,
            r => Self::Expires(Duration::from_secs(r as u64)),
        }
    }
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError>;
    async fn incr_by(&self, key: &str, by: i64) -> Result<i64, StorageError>;
    async fn ttl(&self, key: &str) -> Result<KeyTtl, StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.get(key).await?.is_some())
    }

    /// Set only when the key is absent. Returns true if this call wrote it.
    /// Default implementation is check-then-set and therefore not atomic.
    async fn set_nx(&self, key: &str, value: &str) -> Result<bool, StorageError> {
        if self.exists(key).await? {
            return Ok(false);
        }
        self.set(key, value).await?;
        Ok(true)
    }
}

/// Result of flagging a row as synchronized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncMark {
    pub id: String,
    pub is_sync: bool,
}

/// Read side of the relational store used by the change poller.
#[async_trait]
pub trait RelationalChangeSource: Send + Sync {
    /// Rows that are live, unsynced, and changed after `since`, newest first.
    async fn find_changed(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<UserRecord>, StorageError>;

    /// Soft-deleted rows whose deletion has not reached the index yet, oldest deletion first.
    async fn find_deleted(&self, limit: usize) -> Result<Vec<UserRecord>, StorageError>;

    /// Flag one row as synced, but only while its `updated_at` still equals `observed`,
    /// the value read by the poller. Returns [`StorageError::NoRowsAffected`] when the id
    /// matched nothing or the row was written again since.
    async fn mark_synced(
        &self,
        id: &str,
        observed: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> Result<SyncMark, StorageError>;
}

/// Write side of the relational store used by the user service.
#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn insert_user(&self, user: &NewUser) -> Result<UserRecord, StorageError>;
    async fn update_user(&self, id: &str, patch: &UserPatch) -> Result<UserRecord, StorageError>;
    async fn soft_delete_user(&self, id: &str) -> Result<UserRecord, StorageError>;
    async fn find_user(&self, id: &str) -> Result<Option<UserRecord>, StorageError>;
}

/// Handle for an asynchronous index task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskHandle {
    pub uid: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexStats {
    pub number_of_documents: u64,
    pub is_indexing: bool,
}

/// Index settings that hold a list of attribute names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeKind {
    Filterable,
    Sortable,
    Searchable,
    Displayed,
}

impl AttributeKind {
    /// Path segment under `/indexes/{uid}/settings/`.
    #[must_use]
    pub fn settings_path(&self) -> &'static str {
        match self {
            Self::Filterable => "filterable-attributes",
            Self::Sortable => "sortable-attributes",
            Self::Searchable => "searchable-attributes",
            Self::Displayed => "displayed-attributes",
        }
    }
}

/// Structured document lookup against the index.
#[derive(Debug, Clone, Default)]
pub struct DocumentQuery {
    pub filter: Option<Filter>,
    pub fields: Vec<String>,
    pub limit: usize,
    pub offset: usize,
}

impl DocumentQuery {
    #[must_use]
    pub fn filtered(filter: Filter) -> Self {
        Self {
            filter: Some(filter),
            fields: Vec::new(),
            limit: 20,
            offset: 0,
        }
    }

    #[must_use]
    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    #[must_use]
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

/// How many query words a hit must contain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MatchingStrategy {
    /// Drop trailing words until something matches
    #[default]
    Last,
    /// Every word must match
    All,
    /// Drop the most frequent words first
    Frequency,
}

impl MatchingStrategy {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Last => "last",
            Self::All => "all",
            Self::Frequency => "frequency",
        }
    }

    /// Parse a strategy name; anything unrecognised is `None`.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "last" => Some(Self::Last),
            "all" => Some(Self::All),
            "frequency" => Some(Self::Frequency),
            _ => None,
        }
    }
}

/// Full-text search with paging. `page` is 1-based.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    pub q: String,
    pub filter: Option<Filter>,
    /// `field:asc` / `field:desc`
    pub sort: Vec<String>,
    pub attributes_to_retrieve: Vec<String>,
    /// Highlighted copies land in each hit's `_formatted`
    pub attributes_to_highlight: Vec<String>,
    pub show_matches_position: bool,
    pub matching_strategy: MatchingStrategy,
    pub page: usize,
    pub hits_per_page: usize,
}

impl SearchQuery {
    #[must_use]
    pub fn new(q: impl Into<String>) -> Self {
        Self {
            q: q.into(),
            filter: None,
            sort: Vec::new(),
            attributes_to_retrieve: Vec::new(),
            attributes_to_highlight: Vec::new(),
            show_matches_position: false,
            matching_strategy: MatchingStrategy::default(),
            page: 1,
            hits_per_page: 20,
        }
    }

    #[must_use]
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    #[must_use]
    pub fn sort<I, S>(mut self, sort: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sort = sort.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn retrieve<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes_to_retrieve = fields.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn highlight<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes_to_highlight = fields.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn show_matches_position(mut self, show: bool) -> Self {
        self.show_matches_position = show;
        self
    }

    #[must_use]
    pub fn matching_strategy(mut self, strategy: MatchingStrategy) -> Self {
        self.matching_strategy = strategy;
        self
    }

    #[must_use]
    pub fn page(mut self, page: usize, hits_per_page: usize) -> Self {
        self.page = page.max(1);
        self.hits_per_page = hits_per_page;
        self
    }
}

/// One page of search hits.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchResults {
    pub hits: Vec<Value>,
    pub query: String,
    pub page: usize,
    pub hits_per_page: usize,
    pub total_hits: u64,
    pub total_pages: u64,
}

/// Search engine capability. Documents are JSON objects keyed by the index primary key.
#[async_trait]
pub trait SearchIndexSink: Send + Sync {
    /// Create the index with the given primary key unless it already exists.
    async fn ensure_index(&self, index: &str, primary_key: &str) -> Result<(), StorageError>;
    async fn get_document(&self, index: &str, id: &str) -> Result<Option<Value>, StorageError>;
    async fn find_documents(&self, index: &str, query: &DocumentQuery) -> Result<Vec<Value>, StorageError>;
    /// Ranked full-text search over the searchable attributes.
    async fn search(&self, index: &str, query: &SearchQuery) -> Result<SearchResults, StorageError>;
    /// Replace-by-id.
    async fn add_documents(&self, index: &str, documents: &[Value]) -> Result<TaskHandle, StorageError>;
    /// Merge-by-id.
    async fn update_documents(&self, index: &str, documents: &[Value]) -> Result<TaskHandle, StorageError>;
    async fn delete_document(&self, index: &str, id: &str) -> Result<TaskHandle, StorageError>;
    async fn stats(&self, index: &str) -> Result<IndexStats, StorageError>;
    async fn get_attributes(&self, index: &str, kind: AttributeKind) -> Result<Vec<String>, StorageError>;
    async fn update_attributes(
        &self,
        index: &str,
        kind: AttributeKind,
        attributes: &[String],
    ) -> Result<TaskHandle, StorageError>;
    /// Block until the task succeeds. Failed tasks map to [`StorageError::Backend`].
    async fn wait_for_task(&self, task: TaskHandle, timeout: Duration) -> Result<(), StorageError>;
}

/// Per-consumer settings for [`MessageBroker::consume`].
#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    pub exchange: String,
    pub exchange_type: String,
    pub queue: String,
    pub consumer_tag: String,
    pub prefetch: u16,
}

/// Callback invoked once per delivery. The returned [`Disposition`] is applied by the broker.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &IncomingMessage) -> Disposition;
}

#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Declare the envelope's exchange and queue, publish, and wait for the broker confirm.
    async fn publish(&self, envelope: &QueueEnvelope) -> Result<(), StorageError>;

    /// Consume until `shutdown` flips to true. In-flight deliveries finish before returning.
    async fn consume(
        &self,
        options: ConsumeOptions,
        handler: Arc<dyn MessageHandler>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_ttl_from_seconds() {
        assert_eq!(KeyTtl::from_seconds(-2), KeyTtl::Missing);
        assert_eq!(KeyTtl::from_seconds(-1), KeyTtl::Persistent);
        assert_eq!(KeyTtl::from_seconds(0), KeyTtl::Expires(Duration::ZERO));
        assert_eq!(KeyTtl::from_seconds(42), KeyTtl::Expires(Duration::from_secs(42)));
    }

    #[test]
    fn test_transient_errors() {
        assert!(StorageError::Backend("down".into()).is_transient());
        assert!(StorageError::Timeout("task 1".into()).is_transient());
        assert!(!StorageError::NotFound.is_transient());
        assert!(!StorageError::Decode("bad".into()).is_transient());
        assert!(!StorageError::NoRowsAffected.is_transient());
    }

    #[test]
    fn test_document_query_builder() {
        let q = DocumentQuery::filtered(Filter::eq("id", "u1"))
            .fields(["id"])
            .limit(1);
        assert_eq!(q.fields, vec!["id".to_string()]);
        assert_eq!(q.limit, 1);
        assert_eq!(q.offset, 0);
        assert!(q.filter.is_some());
    }

    #[test]
    fn test_settings_paths() {
        assert_eq!(AttributeKind::Filterable.settings_path(), "filterable-attributes");
        assert_eq!(AttributeKind::Sortable.settings_path(), "sortable-attributes");
    }
}
