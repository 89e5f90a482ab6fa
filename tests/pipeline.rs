//! End-to-end pipeline scenarios over the in-memory backends.
//!
//! No containers needed; every backend is a `storage::memory` adapter, so
//! these run with the normal test suite:
//!
//! ```bash
//! cargo test --test pipeline
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;

use search_sync::message::{
    IncomingMessage, HEADER_UNKNOWN, DEAD_LETTER_QUEUE, PRIMARY_QUEUE, SCHEDULER_BREAK_KEY, USERS_COLLECTION,
};
use search_sync::pipeline::dead_letter::redelivery_key;
use search_sync::pipeline::{
    ChangePoller, CycleOutcome, DeadLetterSettings, DeadLetterWorker, IndexerSettings, IndexingWorker,
    PollerSettings,
};
use search_sync::storage::memory::{InMemoryBroker, InMemoryCache, InMemoryIndex, InMemoryUserStore};
use search_sync::storage::traits::{CacheStore, KeyTtl, MessageBroker, MessageHandler};
use search_sync::{
    BackendCircuits, DeadLetterRecord, Disposition, Handoff, IndexAction, IndexingInstruction, QueueEnvelope,
    SearchSyncConfig, UserProfile, UserRecord, UserSearch, UserService, Watermark,
};

// =============================================================================
// Fixture
// =============================================================================

struct Pipeline {
    store: Arc<InMemoryUserStore>,
    index: Arc<InMemoryIndex>,
    broker: Arc<InMemoryBroker>,
    cache: Arc<InMemoryCache>,
    poller: ChangePoller,
    indexer: IndexingWorker,
    dead_letter: DeadLetterWorker,
}

fn config(secret: &str) -> SearchSyncConfig {
    let mut config = SearchSyncConfig::default();
    config.rabbitmq_secret = secret.into();
    config.watermark_lag_secs = 0;
    config.dlq_backoff_base_ms = 0;
    config.dlq_backoff_max_ms = 0;
    config
}

fn pipeline(config: SearchSyncConfig) -> Pipeline {
    let store = Arc::new(InMemoryUserStore::new());
    let index = Arc::new(InMemoryIndex::new());
    let broker = Arc::new(InMemoryBroker::new());
    let cache = Arc::new(InMemoryCache::new());
    let circuits = Arc::new(BackendCircuits::new());

    let poller = ChangePoller::new(
        store.clone(),
        index.clone(),
        broker.clone(),
        cache.clone(),
        PollerSettings::from_config(&config),
    );
    let indexer = IndexingWorker::new(
        index.clone(),
        broker.clone(),
        cache.clone(),
        circuits.clone(),
        IndexerSettings::from_config(&config),
    );
    let dead_letter = DeadLetterWorker::new(
        broker.clone(),
        cache.clone(),
        circuits,
        DeadLetterSettings::from_config(&config),
    );
    Pipeline { store, index, broker, cache, poller, indexer, dead_letter }
}

/// Whole seconds, an hour back.
fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(Utc::now().timestamp() - 3600, 0).unwrap()
}

fn user(id: &str, created_at: DateTime<Utc>) -> UserRecord {
    let profile = UserProfile {
        name: format!("User {}", id),
        email: format!("{}@example.com", id),
        city: "London".into(),
        ..Default::default()
    };
    UserRecord::new(id, profile, created_at)
}

impl Pipeline {
    async fn seed_watermark(&self, at: DateTime<Utc>) {
        Watermark::new(self.cache.clone()).touch(at).await.unwrap();
    }

    async fn watermark(&self) -> Option<DateTime<Utc>> {
        Watermark::new(self.cache.clone()).read().await.unwrap()
    }

    /// Feed every pending message on `queue` to `handler`, like a consumer would.
    async fn drain(&self, queue: &str, handler: &dyn MessageHandler) -> Vec<Disposition> {
        let mut outcomes = Vec::new();
        while let Some(message) = self.broker.take(queue) {
            outcomes.push(handler.handle(&message).await);
        }
        outcomes
    }
}

// =============================================================================
// Change poller
// =============================================================================

#[tokio::test]
async fn new_row_is_classified_insert_and_marked() {
    let p = pipeline(config("Y"));
    let t0 = t0();
    p.seed_watermark(t0 - chrono::Duration::seconds(1)).await;
    p.store.put(user("u1", t0));

    let report = p.poller.run_cycle().await.unwrap();

    assert_eq!(report.outcome, CycleOutcome::Synced);
    assert_eq!((report.inserted, report.updated), (1, 0));
    assert_eq!(p.index.document(USERS_COLLECTION, "u1").unwrap()["name"], json!("User u1"));
    assert!(p.store.get("u1").unwrap().is_sync);
}

#[tokio::test]
async fn later_update_is_classified_update() {
    let p = pipeline(config("Y"));
    let t0 = t0();
    p.seed_watermark(t0 - chrono::Duration::seconds(1)).await;
    p.store.put(user("u1", t0));
    p.poller.run_cycle().await.unwrap();
    assert_eq!(p.watermark().await, Some(t0));

    let mut changed = p.store.get("u1").unwrap();
    changed.updated_at = Some(t0 + chrono::Duration::minutes(5));
    changed.is_sync = false;
    changed.profile.city = "Leeds".into();
    p.store.put(changed);

    let report = p.poller.run_cycle().await.unwrap();

    assert_eq!((report.inserted, report.updated), (0, 1));
    assert_eq!(p.index.document(USERS_COLLECTION, "u1").unwrap()["city"], json!("Leeds"));
    assert_eq!(p.index.documents(USERS_COLLECTION).len(), 1);
}

#[tokio::test]
async fn watermark_never_moves_backwards() {
    let p = pipeline(config("Y"));
    let t0 = t0();
    p.seed_watermark(t0).await;

    let mut seen = vec![p.watermark().await.unwrap()];
    for minutes in [10, 3, 20, 1] {
        p.store.put(user(&format!("u{}", minutes), t0 + chrono::Duration::minutes(minutes)));
        p.poller.run_cycle().await.unwrap();
        seen.push(p.watermark().await.unwrap());
    }

    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "watermark regressed: {:?}", seen);
    assert_eq!(*seen.last().unwrap(), t0 + chrono::Duration::minutes(20));
}

#[tokio::test]
async fn every_change_is_selected_exactly_once() {
    let mut config = config("Y");
    config.batch_limit = 3;
    let p = pipeline(config);
    let t0 = t0();
    p.seed_watermark(t0).await;
    for i in 1..=10 {
        p.store.put(user(&format!("u{:02}", i), t0 + chrono::Duration::seconds(i)));
    }

    let mut found = 0;
    for _ in 0..10 {
        let report = p.poller.run_cycle().await.unwrap();
        found += report.found;
        if report.outcome == CycleOutcome::Idle {
            break;
        }
    }

    assert_eq!(found, 10);
    assert_eq!(p.index.documents(USERS_COLLECTION).len(), 10);
}

#[tokio::test]
async fn unannounced_writes_reach_the_index_through_the_poller() {
    let config = config("Y");
    let p = pipeline(config.clone());
    let service = UserService::new(p.store.clone(), p.index.clone(), p.broker.clone(), &config);
    p.seed_watermark(t0()).await;
    p.broker.set_fail_publish(true);

    let ada = service.create_user(&user("ada", t0()).profile).await.unwrap();
    let report = p.poller.run_cycle().await.unwrap();
    assert_eq!(report.inserted, 1);
    assert!(service.get_user(&ada.id).await.unwrap().is_some());

    service.delete_user(&ada.id).await.unwrap();
    assert!(p.broker.published().is_empty());

    let report = p.poller.run_cycle().await.unwrap();
    assert_eq!(report.outcome, CycleOutcome::Synced);
    assert_eq!(report.deleted, 1);
    assert!(!p.index.document(USERS_COLLECTION, &ada.id).unwrap()["deleted_at"].is_null());
    assert!(p.store.get(&ada.id).unwrap().is_sync);
    assert!(service.get_user(&ada.id).await.unwrap().is_none());
    let found = service.search_users(&UserSearch { q: "User".into(), ..Default::default() }).await.unwrap();
    assert_eq!(found.total, 0);

    let report = p.poller.run_cycle().await.unwrap();
    assert_eq!(report.outcome, CycleOutcome::Idle);
}

#[tokio::test(start_paused = true)]
async fn scheduler_breaker_cools_down_and_resumes() {
    let mut config = config("Y");
    config.scheduler_break_threshold = 10;
    config.scheduler_break_cooldown_secs = 60;
    let p = pipeline(config);
    p.seed_watermark(t0()).await;

    for tick in 1..=10 {
        let report = p.poller.run_cycle().await.unwrap();
        assert_ne!(report.outcome, CycleOutcome::Throttled, "tick {} throttled early", tick);
    }
    for _ in 0..5 {
        assert_eq!(p.poller.run_cycle().await.unwrap().outcome, CycleOutcome::Throttled);
    }
    let ttl = p.cache.ttl(SCHEDULER_BREAK_KEY).await.unwrap();
    assert!(matches!(ttl, KeyTtl::Expires(d) if d <= Duration::from_secs(60)));

    tokio::time::advance(Duration::from_secs(61)).await;
    p.store.put(user("late", Utc::now()));

    let report = p.poller.run_cycle().await.unwrap();
    assert_eq!(report.outcome, CycleOutcome::Synced);
    assert!(p.index.document(USERS_COLLECTION, "late").is_some());
}

// =============================================================================
// Queue hand-off and workers
// =============================================================================

#[tokio::test]
async fn queue_handoff_reaches_index_through_worker() {
    let mut config = config("Y");
    config.handoff = Handoff::Queue;
    let p = pipeline(config);
    let t0 = t0();
    p.seed_watermark(t0).await;
    p.store.put(user("a", t0 + chrono::Duration::seconds(1)));
    p.store.put(user("b", t0 + chrono::Duration::seconds(2)));

    p.poller.run_cycle().await.unwrap();
    assert!(p.index.documents(USERS_COLLECTION).is_empty());
    assert_eq!(p.broker.pending(PRIMARY_QUEUE), 1);

    let outcomes = p.drain(PRIMARY_QUEUE, &p.indexer).await;
    assert_eq!(outcomes, vec![Disposition::Ack]);
    assert_eq!(p.index.documents(USERS_COLLECTION).len(), 2);
}

#[tokio::test]
async fn foreign_secret_is_fenced_end_to_end() {
    let p = pipeline(config("Y"));
    let instr = IndexingInstruction::single(IndexAction::Insert, "u1", json!({"name": "Mallory"}));
    p.broker
        .publish(&QueueEnvelope::primary(&instr).unwrap().signed("X", 15))
        .await
        .unwrap();

    assert_eq!(p.drain(PRIMARY_QUEUE, &p.indexer).await, vec![Disposition::NackDiscard]);
    assert!(p.index.document(USERS_COLLECTION, "u1").is_none());

    let dead = p.broker.published_to(DEAD_LETTER_QUEUE);
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].headers.get_bool(HEADER_UNKNOWN), Some(true));
    let record: DeadLetterRecord = serde_json::from_slice(&dead[0].body).unwrap();
    assert!(record.unknown);
    assert_eq!(record.secret, "");

    // The dead-letter worker refuses it as well, so it never comes back
    assert_eq!(p.drain(DEAD_LETTER_QUEUE, &p.dead_letter).await, vec![Disposition::NackDiscard]);
    assert_eq!(p.broker.pending(PRIMARY_QUEUE), 0);
}

#[tokio::test]
async fn failed_write_is_redelivered_and_converges() {
    let p = pipeline(config("Y"));
    let instr = IndexingInstruction::single(IndexAction::Insert, "u1", json!({"name": "Ada"}));
    p.broker
        .publish(&QueueEnvelope::primary(&instr).unwrap().signed("Y", 15))
        .await
        .unwrap();

    p.index.set_fail_tasks(true);
    assert_eq!(p.drain(PRIMARY_QUEUE, &p.indexer).await, vec![Disposition::NackDiscard]);
    p.index.set_fail_tasks(false);

    assert_eq!(p.drain(DEAD_LETTER_QUEUE, &p.dead_letter).await, vec![Disposition::Ack]);
    assert_eq!(p.drain(PRIMARY_QUEUE, &p.indexer).await, vec![Disposition::Ack]);
    assert_eq!(p.index.document(USERS_COLLECTION, "u1").unwrap()["name"], json!("Ada"));
}

#[tokio::test]
async fn dead_letter_budget_is_enforced_per_queue() {
    let p = pipeline(config("Y"));
    let key = redelivery_key(PRIMARY_QUEUE);
    assert_eq!(key, "WORKER.SEARCH");
    // Four redeliveries already spent out of five
    p.cache.set(&key, "4").await.unwrap();

    let record = DeadLetterRecord {
        exchange: "amqp.worker".into(),
        exchange_type: "direct".into(),
        queue: PRIMARY_QUEUE.into(),
        body: json!({"doc": "users", "id": "u1", "data": {}, "is_bulk": false, "action": "update"}),
        secret: "Y".into(),
        unknown: false,
        error: "not found".into(),
    };
    let envelope = QueueEnvelope::dead_letter(&record).unwrap().signed("Y", 15);

    let first = p.dead_letter.handle(&IncomingMessage::from(envelope.clone())).await;
    let second = p.dead_letter.handle(&IncomingMessage::from(envelope)).await;

    assert_eq!(first, Disposition::Ack);
    assert_eq!(second, Disposition::NackDiscard);
    assert_eq!(p.broker.published_to(PRIMARY_QUEUE).len(), 1);
}

#[tokio::test]
async fn dead_letter_backoff_is_applied() {
    let mut config = config("Y");
    config.dlq_backoff_base_ms = 20;
    config.dlq_backoff_max_ms = 20;
    config.backoff_jitter = 0.0;
    let p = pipeline(config);

    let record = DeadLetterRecord {
        exchange: "amqp.worker".into(),
        exchange_type: "direct".into(),
        queue: PRIMARY_QUEUE.into(),
        body: json!({"doc": "users", "data": [], "is_bulk": true, "action": "insert"}),
        secret: "Y".into(),
        unknown: false,
        error: "timeout".into(),
    };
    let message = IncomingMessage::from(QueueEnvelope::dead_letter(&record).unwrap().signed("Y", 15));

    let start = std::time::Instant::now();
    assert_eq!(p.dead_letter.handle(&message).await, Disposition::Ack);
    assert!(start.elapsed() >= Duration::from_millis(20));
}
