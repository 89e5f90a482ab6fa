//! In-process backends.
//!
//! Each adapter implements the same capability trait as its production
//! counterpart and adds a few inspection and fault-injection helpers.
//! Expiry uses `tokio::time::Instant`, so paused-clock tests control it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;

use super::traits::{
    AttributeKind, CacheStore, ConsumeOptions, DocumentQuery, IndexStats, KeyTtl, MatchingStrategy, MessageBroker,
    MessageHandler, RelationalChangeSource, SearchIndexSink, SearchQuery, SearchResults, StorageError, SyncMark,
    TaskHandle, UserRepository,
};
use crate::message::{Disposition, IncomingMessage, QueueEnvelope};
use crate::user::{NewUser, UserPatch, UserRecord};

fn unavailable(backend: &str) -> StorageError {
    StorageError::Backend(format!("{} unavailable", backend))
}

// ═══════════════════════════════════════════════════════════════════════════
// Cache
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Default)]
pub struct InMemoryCache {
    data: DashMap<String, CacheEntry>,
    unavailable: AtomicBool,
}

impl InMemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with a backend error.
    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(unavailable("cache"));
        }
        Ok(())
    }

    fn live(&self, key: &str) -> Option<CacheEntry> {
        let now = Instant::now();
        let entry = self.data.get(key)?.value().clone();
        if entry.is_live(now) {
            Some(entry)
        } else {
            self.data.remove(key);
            None
        }
    }
}

#[async_trait]
impl CacheStore for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.check()?;
        Ok(self.live(key).map(|e| e.value))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.check()?;
        self.data.insert(
            key.to_string(),
            CacheEntry { value: value.to_string(), expires_at: None },
        );
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError> {
        self.check()?;
        self.data.insert(
            key.to_string(),
            CacheEntry { value: value.to_string(), expires_at: Some(Instant::now() + ttl) },
        );
        Ok(())
    }

    async fn incr_by(&self, key: &str, by: i64) -> Result<i64, StorageError> {
        self.check()?;
        let now = Instant::now();
        let mut entry = self.data.entry(key.to_string()).or_insert_with(|| CacheEntry {
            value: "0".to_string(),
            expires_at: None,
        });
        if !entry.is_live(now) {
            *entry = CacheEntry { value: "0".to_string(), expires_at: None };
        }
        let current: i64 = entry
            .value
            .parse()
            .map_err(|_| StorageError::Backend(format!("value at '{}' is not an integer", key)))?;
        let next = current + by;
        entry.value = next.to_string();
        Ok(next)
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, StorageError> {
        self.check()?;
        let now = Instant::now();
        Ok(match self.live(key) {
            None => KeyTtl::Missing,
            Some(CacheEntry { expires_at: None, .. }) => KeyTtl::Persistent,
            Some(CacheEntry { expires_at: Some(at), .. }) => KeyTtl::Expires(at.saturating_duration_since(now)),
        })
    }

    async fn set_nx(&self, key: &str, value: &str) -> Result<bool, StorageError> {
        self.check()?;
        if self.live(key).is_some() {
            return Ok(false);
        }
        self.data.insert(
            key.to_string(),
            CacheEntry { value: value.to_string(), expires_at: None },
        );
        Ok(true)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Relational store
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Default)]
pub struct InMemoryUserStore {
    rows: Mutex<BTreeMap<String, UserRecord>>,
    unavailable: AtomicBool,
}

impl InMemoryUserStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a row as-is (test seeding).
    pub fn put(&self, record: UserRecord) {
        self.rows.lock().insert(record.id.clone(), record);
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<UserRecord> {
        self.rows.lock().get(id).cloned()
    }

    /// Remove a row without a trace (simulates a concurrent hard delete).
    pub fn remove(&self, id: &str) {
        self.rows.lock().remove(id);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }

    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(unavailable("database"));
        }
        Ok(())
    }
}

#[async_trait]
impl RelationalChangeSource for InMemoryUserStore {
    async fn find_changed(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<UserRecord>, StorageError> {
        self.check()?;
        let mut rows: Vec<UserRecord> = self
            .rows
            .lock()
            .values()
            .filter(|r| r.deleted_at.is_none() && !r.is_sync)
            .filter(|r| match r.updated_at {
                None => r.created_at > since,
                Some(updated) => updated > since,
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn find_deleted(&self, limit: usize) -> Result<Vec<UserRecord>, StorageError> {
        self.check()?;
        let mut rows: Vec<UserRecord> = self
            .rows
            .lock()
            .values()
            .filter(|r| r.deleted_at.is_some() && !r.is_sync)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.deleted_at.cmp(&b.deleted_at));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn mark_synced(
        &self,
        id: &str,
        observed: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> Result<SyncMark, StorageError> {
        self.check()?;
        let mut rows = self.rows.lock();
        let row = rows
            .get_mut(id)
            .filter(|r| r.updated_at == observed)
            .ok_or(StorageError::NoRowsAffected)?;
        row.is_sync = true;
        row.updated_at = Some(at);
        Ok(SyncMark { id: row.id.clone(), is_sync: row.is_sync })
    }
}

#[async_trait]
impl UserRepository for InMemoryUserStore {
    async fn insert_user(&self, user: &NewUser) -> Result<UserRecord, StorageError> {
        self.check()?;
        let mut rows = self.rows.lock();
        if rows.values().any(|r| r.profile.email == user.email) {
            return Err(StorageError::Backend(format!("duplicate email '{}'", user.email)));
        }
        let record = UserRecord::new(uuid::Uuid::new_v4().to_string(), user.clone(), Utc::now());
        rows.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn update_user(&self, id: &str, patch: &UserPatch) -> Result<UserRecord, StorageError> {
        self.check()?;
        let mut rows = self.rows.lock();
        let row = rows
            .get_mut(id)
            .filter(|r| r.deleted_at.is_none())
            .ok_or(StorageError::NotFound)?;
        patch.apply_to(&mut row.profile);
        row.updated_at = Some(Utc::now());
        row.is_sync = false;
        Ok(row.clone())
    }

    async fn soft_delete_user(&self, id: &str) -> Result<UserRecord, StorageError> {
        self.check()?;
        let mut rows = self.rows.lock();
        let row = rows
            .get_mut(id)
            .filter(|r| r.deleted_at.is_none())
            .ok_or(StorageError::NotFound)?;
        let now = Utc::now();
        row.deleted_at = Some(now);
        row.updated_at = Some(now);
        row.is_sync = false;
        Ok(row.clone())
    }

    async fn find_user(&self, id: &str) -> Result<Option<UserRecord>, StorageError> {
        self.check()?;
        Ok(self.rows.lock().get(id).filter(|r| r.deleted_at.is_none()).cloned())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Search index
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct IndexState {
    primary_key: String,
    documents: BTreeMap<String, Value>,
    attributes: HashMap<AttributeKind, Vec<String>>,
}

#[derive(Default)]
pub struct InMemoryIndex {
    indexes: Mutex<HashMap<String, IndexState>>,
    next_task: AtomicU64,
    failed_tasks: Mutex<HashMap<u64, String>>,
    unavailable: AtomicBool,
    fail_tasks: AtomicBool,
}

impl InMemoryIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    /// Make enqueued write tasks fail without applying.
    pub fn set_fail_tasks(&self, fail: bool) {
        self.fail_tasks.store(fail, Ordering::SeqCst);
    }

    /// Number of tasks enqueued so far.
    #[must_use]
    pub fn task_count(&self) -> u64 {
        self.next_task.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn document(&self, index: &str, id: &str) -> Option<Value> {
        self.indexes.lock().get(index)?.documents.get(id).cloned()
    }

    #[must_use]
    pub fn documents(&self, index: &str) -> Vec<Value> {
        self.indexes
            .lock()
            .get(index)
            .map(|s| s.documents.values().cloned().collect())
            .unwrap_or_default()
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(unavailable("search index"));
        }
        Ok(())
    }

    /// Enqueue a write task. Writes apply immediately unless task failure is injected.
    fn enqueue<F>(&self, index: &str, apply: F) -> TaskHandle
    where
        F: FnOnce(&mut IndexState) -> Result<(), String>,
    {
        let uid = self.next_task.fetch_add(1, Ordering::SeqCst) + 1;
        let outcome = if self.fail_tasks.load(Ordering::SeqCst) {
            Err("injected task failure".to_string())
        } else {
            let mut indexes = self.indexes.lock();
            let state = indexes.entry(index.to_string()).or_insert_with(|| IndexState {
                primary_key: "id".to_string(),
                ..Default::default()
            });
            apply(state)
        };
        if let Err(msg) = outcome {
            self.failed_tasks.lock().insert(uid, msg);
        }
        TaskHandle { uid }
    }

    fn document_id(state: &IndexState, doc: &Value) -> Result<String, String> {
        match doc.get(&state.primary_key) {
            Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            _ => Err(format!("document is missing primary key '{}'", state.primary_key)),
        }
    }
}

fn project(doc: &Value, fields: &[String]) -> Value {
    if fields.is_empty() {
        return doc.clone();
    }
    let mut out = Map::new();
    for field in fields {
        if let Some(v) = doc.get(field) {
            out.insert(field.clone(), v.clone());
        }
    }
    Value::Object(out)
}

/// Byte ranges of every ASCII-case-insensitive occurrence of any term, sorted.
fn term_ranges(text: &str, terms: &[String]) -> Vec<(usize, usize)> {
    let haystack = text.to_ascii_lowercase();
    let mut ranges: Vec<(usize, usize)> = terms
        .iter()
        .filter(|t| !t.is_empty())
        .flat_map(|t| haystack.match_indices(t.as_str()).map(|(start, m)| (start, m.len())).collect::<Vec<_>>())
        .collect();
    ranges.sort_unstable();
    ranges
}

fn highlight(text: &str, ranges: &[(usize, usize)]) -> String {
    let mut out = String::with_capacity(text.len() + ranges.len() * 9);
    let mut cursor = 0;
    for &(start, len) in ranges {
        if start < cursor {
            continue;
        }
        out.push_str(&text[cursor..start]);
        out.push_str("<em>");
        out.push_str(&text[start..start + len]);
        out.push_str("</em>");
        cursor = start + len;
    }
    out.push_str(&text[cursor..]);
    out
}

/// String fields of `doc` that take part in full-text matching.
fn searchable_fields<'a>(doc: &'a Value, searchable: &[String]) -> Vec<(&'a str, &'a str)> {
    let every = searchable.is_empty() || searchable.iter().any(|a| a == "*");
    doc.as_object()
        .map(|fields| {
            fields
                .iter()
                .filter(|(k, _)| every || searchable.iter().any(|a| a == *k))
                .filter_map(|(k, v)| v.as_str().map(|text| (k.as_str(), text)))
                .collect()
        })
        .unwrap_or_default()
}

/// Number of matched terms, or `None` when the document misses under `strategy`.
fn relevance(doc: &Value, searchable: &[String], terms: &[String], strategy: MatchingStrategy) -> Option<usize> {
    if terms.is_empty() {
        return Some(0);
    }
    let fields = searchable_fields(doc, searchable);
    let hits: Vec<bool> = terms
        .iter()
        .map(|t| fields.iter().any(|(_, text)| text.to_ascii_lowercase().contains(t.as_str())))
        .collect();
    let matched = match strategy {
        MatchingStrategy::All => hits.iter().all(|h| *h),
        // Trailing words are dropped first, so the leading one must match
        MatchingStrategy::Last => hits[0],
        MatchingStrategy::Frequency => hits.iter().any(|h| *h),
    };
    matched.then(|| hits.iter().filter(|h| **h).count())
}

/// Numbers before strings, missing and null last.
fn compare_field(a: Option<&Value>, b: Option<&Value>) -> CmpOrdering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(CmpOrdering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Number(_)), Some(Value::String(_))) => CmpOrdering::Less,
        (Some(Value::String(_)), Some(Value::Number(_))) => CmpOrdering::Greater,
        (None | Some(Value::Null), None | Some(Value::Null)) => CmpOrdering::Equal,
        (None | Some(Value::Null), _) => CmpOrdering::Greater,
        (_, None | Some(Value::Null)) => CmpOrdering::Less,
        _ => CmpOrdering::Equal,
    }
}

fn sort_hits(hits: &mut [(usize, &Value)], sort: &[String]) {
    hits.sort_by(|(score_a, a), (score_b, b)| {
        for rule in sort {
            let (field, descending) = match rule.rsplit_once(':') {
                Some((field, dir)) => (field, dir.eq_ignore_ascii_case("desc")),
                None => (rule.as_str(), false),
            };
            let ord = compare_field(a.get(field), b.get(field));
            let ord = if descending { ord.reverse() } else { ord };
            if ord != CmpOrdering::Equal {
                return ord;
            }
        }
        score_b.cmp(score_a)
    });
}

fn search_hit(doc: &Value, query: &SearchQuery, searchable: &[String], terms: &[String]) -> Value {
    let mut hit = project(doc, &query.attributes_to_retrieve);
    let Some(fields) = hit.as_object_mut() else {
        return doc.clone();
    };

    if !query.attributes_to_highlight.is_empty() {
        let every = query.attributes_to_highlight.iter().any(|a| a == "*");
        let formatted: Map<String, Value> = fields
            .iter()
            .map(|(k, v)| {
                let value = match v {
                    Value::String(text) if every || query.attributes_to_highlight.contains(k) => {
                        Value::String(highlight(text, &term_ranges(text, terms)))
                    }
                    other => other.clone(),
                };
                (k.clone(), value)
            })
            .collect();
        fields.insert("_formatted".into(), Value::Object(formatted));
    }

    if query.show_matches_position {
        let positions: Map<String, Value> = searchable_fields(doc, searchable)
            .into_iter()
            .filter_map(|(k, text)| {
                let ranges = term_ranges(text, terms);
                (!ranges.is_empty()).then(|| {
                    let spans = ranges
                        .into_iter()
                        .map(|(start, length)| serde_json::json!({ "start": start, "length": length }))
                        .collect();
                    (k.to_string(), Value::Array(spans))
                })
            })
            .collect();
        fields.insert("_matchesPosition".into(), Value::Object(positions));
    }
    hit
}

#[async_trait]
impl SearchIndexSink for InMemoryIndex {
    async fn ensure_index(&self, index: &str, primary_key: &str) -> Result<(), StorageError> {
        self.check()?;
        self.indexes
            .lock()
            .entry(index.to_string())
            .or_insert_with(|| IndexState { primary_key: primary_key.to_string(), ..Default::default() });
        Ok(())
    }

    async fn get_document(&self, index: &str, id: &str) -> Result<Option<Value>, StorageError> {
        self.check()?;
        Ok(self.document(index, id))
    }

    async fn find_documents(&self, index: &str, query: &DocumentQuery) -> Result<Vec<Value>, StorageError> {
        self.check()?;
        let indexes = self.indexes.lock();
        let Some(state) = indexes.get(index) else {
            return Err(StorageError::NotFound);
        };
        Ok(state
            .documents
            .values()
            .filter(|doc| query.filter.as_ref().map_or(true, |f| f.matches(doc)))
            .skip(query.offset)
            .take(query.limit)
            .map(|doc| project(doc, &query.fields))
            .collect())
    }

    async fn search(&self, index: &str, query: &SearchQuery) -> Result<SearchResults, StorageError> {
        self.check()?;
        let indexes = self.indexes.lock();
        let state = indexes.get(index).ok_or(StorageError::NotFound)?;
        let searchable = state.attributes.get(&AttributeKind::Searchable).cloned().unwrap_or_default();
        let terms: Vec<String> = query.q.split_whitespace().map(str::to_ascii_lowercase).collect();

        let mut matched: Vec<(usize, &Value)> = state
            .documents
            .values()
            .filter(|doc| query.filter.as_ref().map_or(true, |f| f.matches(doc)))
            .filter_map(|doc| relevance(doc, &searchable, &terms, query.matching_strategy).map(|score| (score, doc)))
            .collect();
        sort_hits(&mut matched, &query.sort);

        let per_page = query.hits_per_page;
        let total_hits = matched.len() as u64;
        let total_pages = if per_page == 0 { 0 } else { total_hits.div_ceil(per_page as u64) };
        let hits = matched
            .iter()
            .skip(query.page.saturating_sub(1) * per_page)
            .take(per_page)
            .map(|(_, doc)| search_hit(doc, query, &searchable, &terms))
            .collect();

        Ok(SearchResults {
            hits,
            query: query.q.clone(),
            page: query.page,
            hits_per_page: per_page,
            total_hits,
            total_pages,
        })
    }

    async fn add_documents(&self, index: &str, documents: &[Value]) -> Result<TaskHandle, StorageError> {
        self.check()?;
        let documents = documents.to_vec();
        Ok(self.enqueue(index, move |state| {
            for doc in documents {
                let id = Self::document_id(state, &doc)?;
                state.documents.insert(id, doc);
            }
            Ok(())
        }))
    }

    async fn update_documents(&self, index: &str, documents: &[Value]) -> Result<TaskHandle, StorageError> {
        self.check()?;
        let documents = documents.to_vec();
        Ok(self.enqueue(index, move |state| {
            for doc in documents {
                let id = Self::document_id(state, &doc)?;
                let Value::Object(patch) = doc else {
                    return Err("document must be an object".to_string());
                };
                let slot = state
                    .documents
                    .entry(id)
                    .or_insert_with(|| Value::Object(Map::new()));
                if let Value::Object(existing) = slot {
                    existing.extend(patch);
                }
            }
            Ok(())
        }))
    }

    async fn delete_document(&self, index: &str, id: &str) -> Result<TaskHandle, StorageError> {
        self.check()?;
        let id = id.to_string();
        Ok(self.enqueue(index, move |state| {
            state.documents.remove(&id);
            Ok(())
        }))
    }

    async fn stats(&self, index: &str) -> Result<IndexStats, StorageError> {
        self.check()?;
        let indexes = self.indexes.lock();
        let state = indexes.get(index).ok_or(StorageError::NotFound)?;
        Ok(IndexStats {
            number_of_documents: state.documents.len() as u64,
            is_indexing: false,
        })
    }

    async fn get_attributes(&self, index: &str, kind: AttributeKind) -> Result<Vec<String>, StorageError> {
        self.check()?;
        let indexes = self.indexes.lock();
        let state = indexes.get(index).ok_or(StorageError::NotFound)?;
        Ok(state.attributes.get(&kind).cloned().unwrap_or_default())
    }

    async fn update_attributes(
        &self,
        index: &str,
        kind: AttributeKind,
        attributes: &[String],
    ) -> Result<TaskHandle, StorageError> {
        self.check()?;
        let attributes = attributes.to_vec();
        Ok(self.enqueue(index, move |state| {
            state.attributes.insert(kind, attributes);
            Ok(())
        }))
    }

    async fn wait_for_task(&self, task: TaskHandle, _timeout: Duration) -> Result<(), StorageError> {
        self.check()?;
        if task.uid == 0 || task.uid > self.task_count() {
            return Err(StorageError::NotFound);
        }
        match self.failed_tasks.lock().get(&task.uid) {
            Some(msg) => Err(StorageError::Backend(format!("task {} failed: {}", task.uid, msg))),
            None => Ok(()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Broker
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Default)]
pub struct InMemoryBroker {
    queues: Mutex<HashMap<String, VecDeque<IncomingMessage>>>,
    published: Mutex<Vec<QueueEnvelope>>,
    outcomes: Mutex<Vec<(String, Disposition)>>,
    notify: Notify,
    fail_publish: AtomicBool,
}

impl InMemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Every envelope accepted by `publish`, in order.
    #[must_use]
    pub fn published(&self) -> Vec<QueueEnvelope> {
        self.published.lock().clone()
    }

    #[must_use]
    pub fn published_to(&self, queue: &str) -> Vec<QueueEnvelope> {
        self.published.lock().iter().filter(|e| e.queue == queue).cloned().collect()
    }

    /// Pop the next pending message without going through a consumer.
    pub fn take(&self, queue: &str) -> Option<IncomingMessage> {
        self.queues.lock().get_mut(queue)?.pop_front()
    }

    #[must_use]
    pub fn pending(&self, queue: &str) -> usize {
        self.queues.lock().get(queue).map_or(0, VecDeque::len)
    }

    /// Dispositions applied by consumers, in order.
    #[must_use]
    pub fn outcomes(&self) -> Vec<(String, Disposition)> {
        self.outcomes.lock().clone()
    }

    /// Push a raw delivery onto a queue.
    pub fn inject(&self, message: IncomingMessage) {
        self.queues
            .lock()
            .entry(message.queue.clone())
            .or_default()
            .push_back(message);
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn publish(&self, envelope: &QueueEnvelope) -> Result<(), StorageError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(unavailable("broker"));
        }
        self.published.lock().push(envelope.clone());
        self.inject(IncomingMessage::from(envelope.clone()));
        Ok(())
    }

    async fn consume(
        &self,
        options: ConsumeOptions,
        handler: Arc<dyn MessageHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), StorageError> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            let notified = self.notify.notified();
            if let Some(message) = self.take(&options.queue) {
                let disposition = handler.handle(&message).await;
                self.outcomes.lock().push((options.queue.clone(), disposition));
                if disposition == Disposition::NackRequeue {
                    self.inject(IncomingMessage { redelivered: true, ..message });
                }
                continue;
            }
            tokio::select! {
                _ = notified => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{PRIMARY_QUEUE, USERS_COLLECTION};
    use crate::search::Filter;
    use crate::user::{UserPatch, UserProfile};
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn test_cache_expiry_follows_clock() {
        let cache = InMemoryCache::new();
        cache.set_ex("k", "v", Duration::from_secs(5)).await.unwrap();
        assert_eq!(cache.ttl("k").await.unwrap(), KeyTtl::Expires(Duration::from_secs(5)));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert_eq!(cache.ttl("k").await.unwrap(), KeyTtl::Missing);
    }

    #[tokio::test]
    async fn test_cache_incr_and_nx() {
        let cache = InMemoryCache::new();
        assert_eq!(cache.incr_by("c", 1).await.unwrap(), 1);
        assert_eq!(cache.incr_by("c", 2).await.unwrap(), 3);
        assert_eq!(cache.ttl("c").await.unwrap(), KeyTtl::Persistent);

        assert!(cache.set_nx("n", "first").await.unwrap());
        assert!(!cache.set_nx("n", "second").await.unwrap());
        assert_eq!(cache.get("n").await.unwrap().as_deref(), Some("first"));

        cache.set("s", "abc").await.unwrap();
        assert!(cache.incr_by("s", 1).await.is_err());
    }

    #[tokio::test]
    async fn test_cache_unavailable() {
        let cache = InMemoryCache::new();
        cache.set_unavailable(true);
        assert!(matches!(cache.get("k").await, Err(StorageError::Backend(_))));
    }

    #[tokio::test]
    async fn test_change_source_window() {
        let store = InMemoryUserStore::new();
        let t0 = Utc::now() - chrono::Duration::minutes(10);
        let old = UserRecord::new("old", UserProfile::default(), t0);
        let fresh = UserRecord::new("fresh", UserProfile::default(), t0 + chrono::Duration::minutes(5));
        let mut updated = UserRecord::new("updated", UserProfile::default(), t0 - chrono::Duration::minutes(5));
        updated.updated_at = Some(t0 + chrono::Duration::minutes(6));
        let mut synced = UserRecord::new("synced", UserProfile::default(), t0 + chrono::Duration::minutes(7));
        synced.is_sync = true;
        for r in [old, fresh, updated, synced] {
            store.put(r);
        }

        let rows = store.find_changed(t0 + chrono::Duration::minutes(1), 10).await.unwrap();
        let ids: Vec<&str> = rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["fresh", "updated"]);

        let mark = store.mark_synced("fresh", None, Utc::now()).await.unwrap();
        assert!(mark.is_sync);
        assert!(matches!(store.mark_synced("nope", None, Utc::now()).await, Err(StorageError::NoRowsAffected)));
    }

    #[tokio::test]
    async fn test_mark_synced_loses_to_a_newer_write() {
        let store = InMemoryUserStore::new();
        let created = Utc::now() - chrono::Duration::minutes(10);
        store.put(UserRecord::new("a", UserProfile::default(), created));
        let read = store.find_changed(created - chrono::Duration::minutes(1), 10).await.unwrap();

        let patch = UserPatch { city: Some("Leeds".into()), ..Default::default() };
        store.update_user("a", &patch).await.unwrap();

        let result = store.mark_synced("a", read[0].updated_at, Utc::now()).await;
        assert!(matches!(result, Err(StorageError::NoRowsAffected)));
        assert!(!store.get("a").unwrap().is_sync);

        let current = store.get("a").unwrap().updated_at;
        assert!(store.mark_synced("a", current, Utc::now()).await.unwrap().is_sync);
    }

    #[tokio::test]
    async fn test_find_deleted_until_marked() {
        let store = InMemoryUserStore::new();
        let t0 = Utc::now() - chrono::Duration::minutes(10);
        for id in ["live", "gone"] {
            let profile = UserProfile { email: format!("{}@example.com", id), ..Default::default() };
            store.put(UserRecord::new(id, profile, t0));
        }
        let deleted = store.soft_delete_user("gone").await.unwrap();

        let rows = store.find_deleted(10).await.unwrap();
        assert_eq!(rows.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), vec!["gone"]);
        assert!(store.find_changed(t0 - chrono::Duration::minutes(1), 10).await.unwrap().iter().all(|r| r.id == "live"));

        store.mark_synced("gone", deleted.updated_at, Utc::now()).await.unwrap();
        assert!(store.find_deleted(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_index_replace_merge_and_filter() {
        let index = InMemoryIndex::new();
        let t = index.add_documents(USERS_COLLECTION, &[json!({"id": "a", "name": "A", "city": "X"})]).await.unwrap();
        index.wait_for_task(t, Duration::from_secs(1)).await.unwrap();

        let t = index.update_documents(USERS_COLLECTION, &[json!({"id": "a", "city": "Y"})]).await.unwrap();
        index.wait_for_task(t, Duration::from_secs(1)).await.unwrap();
        assert_eq!(index.document(USERS_COLLECTION, "a").unwrap(), json!({"id": "a", "name": "A", "city": "Y"}));

        let t = index.add_documents(USERS_COLLECTION, &[json!({"id": "a", "name": "B"})]).await.unwrap();
        index.wait_for_task(t, Duration::from_secs(1)).await.unwrap();
        assert_eq!(index.document(USERS_COLLECTION, "a").unwrap(), json!({"id": "a", "name": "B"}));

        let found = index
            .find_documents(USERS_COLLECTION, &DocumentQuery::filtered(Filter::eq("name", "B")).fields(["id"]))
            .await
            .unwrap();
        assert_eq!(found, vec![json!({"id": "a"})]);
    }

    #[tokio::test]
    async fn test_index_search_ranks_filters_and_pages() {
        let index = InMemoryIndex::new();
        let docs = [
            json!({"id": "a", "name": "Ada Lovelace", "city": "London", "created_at": 3}),
            json!({"id": "b", "name": "Ada Byron", "city": "Leeds", "created_at": 2}),
            json!({"id": "c", "name": "Charles Babbage", "city": "London", "created_at": 1}),
        ];
        let t = index.add_documents(USERS_COLLECTION, &docs).await.unwrap();
        index.wait_for_task(t, Duration::from_secs(1)).await.unwrap();
        let ids = |results: &SearchResults| -> Vec<String> {
            results.hits.iter().map(|h| h["id"].as_str().unwrap().to_string()).collect()
        };

        let loose = SearchQuery::new("ada lovelace").matching_strategy(MatchingStrategy::Frequency);
        let results = index.search(USERS_COLLECTION, &loose).await.unwrap();
        assert_eq!(ids(&results), vec!["a", "b"]);

        let strict = loose.matching_strategy(MatchingStrategy::All);
        assert_eq!(ids(&index.search(USERS_COLLECTION, &strict).await.unwrap()), vec!["a"]);

        let in_london = SearchQuery::new("").filter(Filter::eq("city", "London")).sort(["created_at:asc"]);
        assert_eq!(ids(&index.search(USERS_COLLECTION, &in_london).await.unwrap()), vec!["c", "a"]);

        let second_page = SearchQuery::new("").sort(["created_at:desc"]).page(2, 2);
        let results = index.search(USERS_COLLECTION, &second_page).await.unwrap();
        assert_eq!(ids(&results), vec!["c"]);
        assert_eq!((results.total_hits, results.total_pages, results.page), (3, 2, 2));

        assert!(matches!(index.search("missing", &SearchQuery::new("x")).await, Err(StorageError::NotFound)));
    }

    #[tokio::test]
    async fn test_index_search_highlights_matches() {
        let index = InMemoryIndex::new();
        let doc = json!({"id": "a", "name": "Ada Lovelace", "city": "London"});
        let t = index.add_documents(USERS_COLLECTION, &[doc]).await.unwrap();
        index.wait_for_task(t, Duration::from_secs(1)).await.unwrap();

        let query = SearchQuery::new("ADA")
            .retrieve(["id", "name"])
            .highlight(["name"])
            .show_matches_position(true);
        let hit = index.search(USERS_COLLECTION, &query).await.unwrap().hits.remove(0);

        assert!(hit.get("city").is_none());
        assert_eq!(hit["_formatted"]["name"], json!("<em>Ada</em> Lovelace"));
        assert_eq!(hit["_formatted"]["id"], json!("a"));
        assert_eq!(hit["_matchesPosition"], json!({"name": [{"start": 0, "length": 3}]}));
    }

    #[tokio::test]
    async fn test_index_task_failure_is_reported() {
        let index = InMemoryIndex::new();
        let t = index.add_documents(USERS_COLLECTION, &[json!({"name": "no id"})]).await.unwrap();
        assert!(index.wait_for_task(t, Duration::from_secs(1)).await.is_err());

        index.set_fail_tasks(true);
        let t = index.add_documents(USERS_COLLECTION, &[json!({"id": "x"})]).await.unwrap();
        assert!(index.wait_for_task(t, Duration::from_secs(1)).await.is_err());
        assert!(index.document(USERS_COLLECTION, "x").is_none());
    }

    struct AckAll;

    #[async_trait]
    impl MessageHandler for AckAll {
        async fn handle(&self, _message: &IncomingMessage) -> Disposition {
            Disposition::Ack
        }
    }

    #[tokio::test]
    async fn test_broker_consume_until_shutdown() {
        let broker = Arc::new(InMemoryBroker::new());
        let (tx, rx) = watch::channel(false);
        let options = ConsumeOptions {
            exchange: "amqp.worker".into(),
            exchange_type: "direct".into(),
            queue: PRIMARY_QUEUE.into(),
            consumer_tag: "test".into(),
            prefetch: 1,
        };

        let consumer = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.consume(options, Arc::new(AckAll), rx).await })
        };

        broker.publish(&QueueEnvelope::primary(&json!({"n": 1})).unwrap()).await.unwrap();
        broker.publish(&QueueEnvelope::primary(&json!({"n": 2})).unwrap()).await.unwrap();

        for _ in 0..100 {
            if broker.outcomes().len() == 2 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(broker.outcomes().len(), 2);

        tx.send(true).unwrap();
        consumer.await.unwrap().unwrap();
        assert_eq!(broker.pending(PRIMARY_QUEUE), 0);
    }

    #[tokio::test]
    async fn test_broker_publish_failure() {
        let broker = InMemoryBroker::new();
        broker.set_fail_publish(true);
        assert!(broker.publish(&QueueEnvelope::primary(&json!({})).unwrap()).await.is_err());
        assert!(broker.published().is_empty());
    }
}
