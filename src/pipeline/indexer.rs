//! Indexing worker: applies primary-queue instructions to the search index.
//!
//! Anything that fails after decoding is wrapped in a [`DeadLetterRecord`]
//! and published to the dead-letter queue; the original delivery is always
//! discarded so the broker never redelivers it by itself.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::types::{DiscardReason, IndexingError};
use crate::config::SearchSyncConfig;
use crate::message::{
    DeadLetterRecord, Disposition, IncomingMessage, IndexAction, IndexingInstruction, QueueEnvelope,
    EXCHANGE_TYPE_DIRECT, HEADER_UNKNOWN, PRIMARY_EXCHANGE,
};
use crate::resilience::circuit_breaker::{BackendCircuits, CircuitError};
use crate::storage::traits::{CacheStore, MessageBroker, MessageHandler, SearchIndexSink, StorageError, TaskHandle};
use crate::watermark::Watermark;

#[derive(Debug, Clone)]
pub struct IndexerSettings {
    pub secret: String,
    pub message_ttl_secs: i64,
    pub task_timeout: Duration,
}

impl IndexerSettings {
    #[must_use]
    pub fn from_config(config: &SearchSyncConfig) -> Self {
        Self {
            secret: config.rabbitmq_secret.clone(),
            message_ttl_secs: config.message_ttl_secs,
            task_timeout: config.task_timeout(),
        }
    }
}

fn action_label(action: &IndexAction) -> &'static str {
    match action {
        IndexAction::Insert => "insert",
        IndexAction::Update => "update",
        IndexAction::Delete => "delete",
        IndexAction::Unknown(_) => "unknown",
    }
}

pub struct IndexingWorker {
    index: Arc<dyn SearchIndexSink>,
    broker: Arc<dyn MessageBroker>,
    watermark: Watermark,
    circuits: Arc<BackendCircuits>,
    settings: IndexerSettings,
}

impl IndexingWorker {
    pub fn new(
        index: Arc<dyn SearchIndexSink>,
        broker: Arc<dyn MessageBroker>,
        cache: Arc<dyn CacheStore>,
        circuits: Arc<BackendCircuits>,
        settings: IndexerSettings,
    ) -> Self {
        Self {
            index,
            broker,
            watermark: Watermark::new(cache),
            circuits,
            settings,
        }
    }

    /// Verify and apply one instruction.
    pub async fn process(&self, message: &IncomingMessage, instruction: &IndexingInstruction) -> Result<(), IndexingError> {
        if !message.headers.secret_matches(&self.settings.secret) {
            return Err(IndexingError::Unauthorized);
        }

        // Seed the watermark so the poller has a lower bound from now on
        if let Err(e) = self.watermark.touch(Utc::now()).await {
            warn!(error = %e, "Could not seed watermark");
        }

        self.apply(instruction).await
    }

    /// Dispatch on the instruction's action.
    pub async fn apply(&self, instruction: &IndexingInstruction) -> Result<(), IndexingError> {
        let uid = instruction.doc.as_str();
        let _timer = crate::metrics::LatencyTimer::new(action_label(&instruction.action));

        match &instruction.action {
            IndexAction::Insert => {
                let mut documents = instruction.documents();
                if !instruction.is_bulk {
                    if let (Some(id), Some(Value::Object(doc))) = (instruction.target_id(), documents.first_mut()) {
                        doc.entry("id").or_insert(Value::String(id));
                    }
                }
                self.write(|| self.index.add_documents(uid, &documents)).await
            }
            IndexAction::Update if instruction.is_bulk => {
                let documents = instruction.documents();
                self.write(|| self.index.update_documents(uid, &documents)).await
            }
            IndexAction::Update => {
                let id = instruction
                    .target_id()
                    .ok_or_else(|| IndexingError::MissingId("update".into()))?;
                if self.index.get_document(uid, &id).await?.is_none() {
                    return Err(StorageError::NotFound.into());
                }
                let mut patch = instruction.data.clone();
                if let Value::Object(fields) = &mut patch {
                    fields.insert("id".into(), Value::String(id));
                }
                let documents = [patch];
                self.write(|| self.index.update_documents(uid, &documents)).await
            }
            IndexAction::Delete => {
                let ids: Vec<String> = if instruction.is_bulk {
                    instruction
                        .documents()
                        .iter()
                        .filter_map(|d| d.get("id").and_then(Value::as_str).map(str::to_string))
                        .collect()
                } else {
                    let id = instruction
                        .target_id()
                        .ok_or_else(|| IndexingError::MissingId("delete".into()))?;
                    vec![id]
                };
                self.soft_delete(uid, &ids).await
            }
            IndexAction::Unknown(action) => Err(IndexingError::UnknownAction(action.clone())),
        }
    }

    /// Stamp `deleted_at` on documents that don't carry one yet.
    async fn soft_delete(&self, uid: &str, ids: &[String]) -> Result<(), IndexingError> {
        let now = Utc::now().timestamp();
        let mut patches = Vec::with_capacity(ids.len());
        for id in ids {
            let already = self
                .index
                .get_document(uid, id)
                .await?
                .is_some_and(|doc| doc.get("deleted_at").is_some_and(|v| !v.is_null()));
            if already {
                debug!(id = %id, "Document already soft-deleted");
                continue;
            }
            patches.push(json!({ "id": id, "deleted_at": now }));
        }
        if patches.is_empty() {
            return Ok(());
        }
        self.write(|| self.index.update_documents(uid, &patches)).await
    }

    /// Enqueue an index write and wait for its task, through the search circuit.
    async fn write<F, Fut>(&self, enqueue: F) -> Result<(), IndexingError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<TaskHandle, StorageError>>,
    {
        let timeout = self.settings.task_timeout;
        self.circuits
            .search
            .call(|| async move {
                let task = enqueue().await?;
                self.index.wait_for_task(task, timeout).await
            })
            .await
            .map_err(|e| match e {
                CircuitError::Rejected => IndexingError::Rejected("meilisearch"),
                CircuitError::Inner(e) => IndexingError::Storage(e),
            })
    }

    /// Wrap the failed message and publish it to the dead-letter queue.
    async fn dead_letter(&self, message: &IncomingMessage, body: Value, failure: &IndexingError) {
        let unknown = failure.is_unknown();
        let secret = if unknown { String::new() } else { self.settings.secret.clone() };
        let record = DeadLetterRecord {
            exchange: PRIMARY_EXCHANGE.to_string(),
            exchange_type: EXCHANGE_TYPE_DIRECT.to_string(),
            queue: message.queue.clone(),
            body,
            secret: secret.clone(),
            unknown,
            error: failure.to_string(),
        };

        let envelope = match QueueEnvelope::dead_letter(&record) {
            Ok(envelope) => envelope
                .signed(&secret, self.settings.message_ttl_secs)
                .with_header(HEADER_UNKNOWN, unknown),
            Err(e) => {
                error!(error = %e, "Could not encode dead-letter record");
                return;
            }
        };

        match self.circuits.broker.call(|| self.broker.publish(&envelope)).await {
            Ok(()) => {
                crate::metrics::record_dead_lettered(unknown);
                info!(queue = %message.queue, unknown, reason = %failure, "Message dead-lettered");
            }
            Err(e) => error!(error = %e, reason = %failure, "Dead-letter publish failed, message lost"),
        }
    }
}

#[async_trait]
impl MessageHandler for IndexingWorker {
    #[tracing::instrument(skip(self, message), fields(queue = %message.queue, redelivered = message.redelivered))]
    async fn handle(&self, message: &IncomingMessage) -> Disposition {
        let instruction: IndexingInstruction = match serde_json::from_slice(&message.body) {
            Ok(instruction) => instruction,
            Err(e) => {
                warn!(error = %e, "Undecodable indexing message");
                crate::metrics::record_discard("indexer", DiscardReason::Undecodable.as_str());
                return Disposition::NackDiscard;
            }
        };
        let label = action_label(&instruction.action);

        match self.process(message, &instruction).await {
            Ok(()) => {
                crate::metrics::record_indexing(label, "ok");
                debug!(action = label, bulk = instruction.is_bulk, "Instruction applied");
                Disposition::Ack
            }
            Err(e) => {
                crate::metrics::record_indexing(label, "failed");
                warn!(action = label, error = %e, "Instruction failed");
                let body = serde_json::to_value(&instruction).unwrap_or(Value::Null);
                self.dead_letter(message, body, &e).await;
                Disposition::NackDiscard
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{DEAD_LETTER_QUEUE, HEADER_SECRET, PRIMARY_QUEUE, USERS_COLLECTION, WATERMARK_KEY};
    use crate::storage::memory::{InMemoryBroker, InMemoryCache, InMemoryIndex};

    struct Harness {
        worker: IndexingWorker,
        index: Arc<InMemoryIndex>,
        broker: Arc<InMemoryBroker>,
        cache: Arc<InMemoryCache>,
    }

    fn harness() -> Harness {
        let index = Arc::new(InMemoryIndex::new());
        let broker = Arc::new(InMemoryBroker::new());
        let cache = Arc::new(InMemoryCache::new());
        let settings = IndexerSettings {
            secret: "s3cret".into(),
            message_ttl_secs: 15,
            task_timeout: Duration::from_secs(1),
        };
        let worker = IndexingWorker::new(
            index.clone(),
            broker.clone(),
            cache.clone(),
            Arc::new(BackendCircuits::new()),
            settings,
        );
        Harness { worker, index, broker, cache }
    }

    fn message(instruction: &IndexingInstruction, secret: &str) -> IncomingMessage {
        QueueEnvelope::primary(instruction)
            .unwrap()
            .signed(secret, 15)
            .into()
    }

    fn dead_letters(broker: &InMemoryBroker) -> Vec<DeadLetterRecord> {
        broker
            .published_to(DEAD_LETTER_QUEUE)
            .iter()
            .map(|e| serde_json::from_slice(&e.body).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_insert_acks_and_seeds_watermark() {
        let h = harness();
        let instr = IndexingInstruction::single(IndexAction::Insert, "u1", json!({"name": "Ada"}));

        assert_eq!(h.worker.handle(&message(&instr, "s3cret")).await, Disposition::Ack);
        assert_eq!(h.index.document(USERS_COLLECTION, "u1").unwrap()["name"], json!("Ada"));
        assert!(h.cache.get(WATERMARK_KEY).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_repeated_instruction_converges() {
        let h = harness();
        let instr = IndexingInstruction::bulk(
            IndexAction::Insert,
            vec![json!({"id": "a", "city": "Leeds"}), json!({"id": "b", "city": "York"})],
        );
        for _ in 0..3 {
            assert_eq!(h.worker.handle(&message(&instr, "s3cret")).await, Disposition::Ack);
        }
        assert_eq!(h.index.documents(USERS_COLLECTION).len(), 2);
    }

    #[tokio::test]
    async fn test_update_merges_existing() {
        let h = harness();
        let insert = IndexingInstruction::single(IndexAction::Insert, "u1", json!({"name": "Ada", "city": "London"}));
        h.worker.handle(&message(&insert, "s3cret")).await;

        let update = IndexingInstruction::single(IndexAction::Update, "u1", json!({"city": "Leeds"}));
        assert_eq!(h.worker.handle(&message(&update, "s3cret")).await, Disposition::Ack);

        let doc = h.index.document(USERS_COLLECTION, "u1").unwrap();
        assert_eq!(doc["city"], json!("Leeds"));
        assert_eq!(doc["name"], json!("Ada"));
    }

    #[tokio::test]
    async fn test_update_of_missing_document_is_dead_lettered() {
        let h = harness();
        let update = IndexingInstruction::single(IndexAction::Update, "ghost", json!({"city": "Leeds"}));
        assert_eq!(h.worker.handle(&message(&update, "s3cret")).await, Disposition::NackDiscard);

        let records = dead_letters(&h.broker);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].queue, PRIMARY_QUEUE);
        assert_eq!(records[0].secret, "s3cret");
        assert!(!records[0].unknown);
        assert!(h.index.document(USERS_COLLECTION, "ghost").is_none());
    }

    #[tokio::test]
    async fn test_delete_is_soft_and_idempotent() {
        let h = harness();
        let insert = IndexingInstruction::single(IndexAction::Insert, "u1", json!({"deleted_at": null}));
        h.worker.handle(&message(&insert, "s3cret")).await;

        let delete = IndexingInstruction::single(IndexAction::Delete, "u1", Value::Null);
        assert_eq!(h.worker.handle(&message(&delete, "s3cret")).await, Disposition::Ack);
        let first = h.index.document(USERS_COLLECTION, "u1").unwrap()["deleted_at"].clone();
        assert!(first.is_i64());

        let tasks = h.index.task_count();
        assert_eq!(h.worker.handle(&message(&delete, "s3cret")).await, Disposition::Ack);
        assert_eq!(h.index.task_count(), tasks);
        assert_eq!(h.index.document(USERS_COLLECTION, "u1").unwrap()["deleted_at"], first);
    }

    #[tokio::test]
    async fn test_wrong_secret_never_touches_index() {
        let h = harness();
        let instr = IndexingInstruction::single(IndexAction::Insert, "u1", json!({"name": "Mallory"}));

        assert_eq!(h.worker.handle(&message(&instr, "guess")).await, Disposition::NackDiscard);
        assert!(h.index.document(USERS_COLLECTION, "u1").is_none());
        assert_eq!(h.index.task_count(), 0);

        let published = h.broker.published_to(DEAD_LETTER_QUEUE);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].headers.get_bool(HEADER_UNKNOWN), Some(true));
        assert_eq!(published[0].headers.get_str(HEADER_SECRET), Some(""));
        let record: DeadLetterRecord = serde_json::from_slice(&published[0].body).unwrap();
        assert!(record.unknown);
        assert!(record.secret.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_action_is_dead_lettered() {
        let h = harness();
        let raw = br#"{"doc":"users","data":{"id":"u1"},"action":"upsert"}"#.to_vec();
        let msg: IncomingMessage = QueueEnvelope::new(PRIMARY_EXCHANGE, "direct", PRIMARY_QUEUE, raw)
            .signed("s3cret", 15)
            .into();

        assert_eq!(h.worker.handle(&msg).await, Disposition::NackDiscard);
        let records = dead_letters(&h.broker);
        assert!(records[0].error.contains("upsert"));
        assert_eq!(records[0].body["action"], json!("upsert"));
    }

    #[tokio::test]
    async fn test_undecodable_is_discarded_silently() {
        let h = harness();
        let msg: IncomingMessage = QueueEnvelope::new(PRIMARY_EXCHANGE, "direct", PRIMARY_QUEUE, b"{nope".to_vec())
            .signed("s3cret", 15)
            .into();
        assert_eq!(h.worker.handle(&msg).await, Disposition::NackDiscard);
        assert!(h.broker.published().is_empty());
    }

    #[tokio::test]
    async fn test_failed_task_dead_letters_even_if_publish_fails() {
        let h = harness();
        h.index.set_fail_tasks(true);
        h.broker.set_fail_publish(true);
        let instr = IndexingInstruction::single(IndexAction::Insert, "u1", json!({}));
        assert_eq!(h.worker.handle(&message(&instr, "s3cret")).await, Disposition::NackDiscard);
    }
}
