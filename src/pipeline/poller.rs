// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change poller: the relational store → index half of the pipeline.
//!
//! One cycle:
//!
//! ```text
//! guard(SCHEDULER:SEARCH:BREAK) ──rejected──► Throttled
//!   │
//! read watermark ──absent──► NoWatermark
//!   │
//! find_changed(W, batch_limit) + find_deleted(batch_limit) ──both empty──► Idle
//!   │
//! per changed row: index lookup in window W ──found──► update batch
//!                                            └absent─► insert batch
//! per deleted row: tombstone (projection with deleted_at)
//!   │
//! hand off updates, inserts, then tombstones (direct bulk write or one queue message each)
//!   │
//! mark every row synced, if it still has the updated_at we read
//!   │
//! batch not full? advance W to newest change - lag
//! ```
//!
//! Every index lookup happens before any index write of the same cycle.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::types::{CycleError, CycleOutcome, CycleReport};
use crate::config::{Handoff, SearchSyncConfig};
use crate::message::{IndexAction, IndexingInstruction, QueueEnvelope, SCHEDULER_BREAK_KEY, USERS_COLLECTION};
use crate::resilience::breaker::{BreakerGuard, GuardPolicy};
use crate::search::Filter;
use crate::storage::traits::{
    CacheStore, DocumentQuery, MessageBroker, RelationalChangeSource, SearchIndexSink, StorageError,
};
use crate::user::UserRecord;
use crate::watermark::Watermark;

/// Index filter matching the live document for `id` whose last change is at or after `since`.
///
/// ```text
/// deleted_at IS NULL AND id = <id> AND (
///     (updated_at IS NULL AND created_at >= W) OR (updated_at IS NOT NULL AND updated_at >= W))
/// ```
///
/// Bounds are inclusive. The watermark lands exactly on the newest indexed
/// change, and that document must still classify as present.
#[must_use]
pub fn diff_filter(id: &str, since: DateTime<Utc>) -> Filter {
    let w = since.timestamp();
    let created_window = Filter::is_null("updated_at").and(Filter::gte("created_at", w));
    let updated_window = Filter::is_not_null("updated_at").and(Filter::gte("updated_at", w));
    Filter::is_null("deleted_at")
        .and(Filter::eq("id", id))
        .and(created_window.or(updated_window))
}

/// Poller tunables, usually derived from [`SearchSyncConfig`].
#[derive(Debug, Clone)]
pub struct PollerSettings {
    pub index_uid: String,
    pub interval: Duration,
    pub batch_limit: usize,
    pub guard: GuardPolicy,
    /// Subtracted from the newest change time before the watermark moves
    pub watermark_lag: Duration,
    /// On a fresh breaker trip, move the watermark to `now - lag`
    pub skip_on_break: Option<Duration>,
    pub handoff: Handoff,
    pub task_timeout: Duration,
    pub secret: String,
    pub message_ttl_secs: i64,
}

impl PollerSettings {
    #[must_use]
    pub fn from_config(config: &SearchSyncConfig) -> Self {
        Self {
            index_uid: USERS_COLLECTION.to_string(),
            interval: config.scheduler_interval(),
            batch_limit: config.batch_limit,
            guard: GuardPolicy::new(
                config.scheduler_break_threshold,
                Duration::from_secs(config.scheduler_break_cooldown_secs),
            ),
            watermark_lag: Duration::from_secs(config.watermark_lag_secs),
            skip_on_break: config
                .watermark_skip_on_break
                .then(|| Duration::from_secs(config.watermark_skip_lag_secs)),
            handoff: config.handoff,
            task_timeout: config.task_timeout(),
            secret: config.rabbitmq_secret.clone(),
            message_ttl_secs: config.message_ttl_secs,
        }
    }
}

pub struct ChangePoller {
    source: Arc<dyn RelationalChangeSource>,
    index: Arc<dyn SearchIndexSink>,
    broker: Arc<dyn MessageBroker>,
    guard: BreakerGuard,
    watermark: Watermark,
    settings: PollerSettings,
}

impl ChangePoller {
    pub fn new(
        source: Arc<dyn RelationalChangeSource>,
        index: Arc<dyn SearchIndexSink>,
        broker: Arc<dyn MessageBroker>,
        cache: Arc<dyn CacheStore>,
        settings: PollerSettings,
    ) -> Self {
        Self {
            source,
            index,
            broker,
            guard: BreakerGuard::new(cache.clone()),
            watermark: Watermark::new(cache),
            settings,
        }
    }

    #[must_use]
    pub fn settings(&self) -> &PollerSettings {
        &self.settings
    }

    /// Tick on the configured interval until `shutdown` flips. Missed ticks are skipped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval = ?self.settings.interval, handoff = ?self.settings.handoff, "Change poller started");

        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    // Errors are logged inside and retried next tick
                    let _ = self.tick().await;
                }
            }
        }
        info!("Change poller stopped");
    }

    /// Run one cycle and record its outcome.
    pub async fn tick(&self) -> Result<CycleReport, CycleError> {
        let start = Instant::now();
        match self.run_cycle().await {
            Ok(report) => {
                crate::metrics::record_cycle(report.outcome.as_str(), start.elapsed());
                if report.outcome == CycleOutcome::Synced {
                    info!(
                        found = report.found,
                        inserted = report.inserted,
                        updated = report.updated,
                        deleted = report.deleted,
                        marked = report.marked,
                        elapsed_ms = report.elapsed.as_millis() as u64,
                        "Change cycle synced"
                    );
                } else {
                    debug!(outcome = report.outcome.as_str(), "Change cycle finished");
                }
                Ok(report)
            }
            Err(e) => {
                crate::metrics::record_cycle("failed", start.elapsed());
                warn!(step = e.step(), error = %e, "Change cycle aborted");
                Err(e)
            }
        }
    }

    /// One guarded poll → diff → hand-off → mark → advance pass.
    #[tracing::instrument(skip(self), fields(index = %self.settings.index_uid))]
    pub async fn run_cycle(&self) -> Result<CycleReport, CycleError> {
        let start = Instant::now();

        let decision = self
            .guard
            .guard(SCHEDULER_BREAK_KEY, &self.settings.guard)
            .await
            .map_err(CycleError::Guard)?;
        if !decision.proceed {
            if decision.tripped {
                self.skip_backlog().await;
            }
            debug!(count = decision.count, "Poller throttled by breaker");
            return Ok(CycleReport::new(CycleOutcome::Throttled));
        }

        let Some(since) = self.watermark.read().await.map_err(CycleError::Watermark)? else {
            debug!("No watermark yet, waiting for the first indexed message");
            return Ok(CycleReport::new(CycleOutcome::NoWatermark));
        };
        let lag = (Utc::now() - since).to_std().unwrap_or(Duration::ZERO);
        crate::metrics::set_watermark_lag(lag);

        let rows = self
            .source
            .find_changed(since, self.settings.batch_limit)
            .await
            .map_err(CycleError::Query)?;
        let deleted = self
            .source
            .find_deleted(self.settings.batch_limit)
            .await
            .map_err(CycleError::Query)?;
        crate::metrics::record_rows_found(rows.len() + deleted.len());

        let mut report = CycleReport::new(CycleOutcome::Idle);
        report.found = rows.len();
        report.watermark = Some(since);
        if rows.is_empty() && deleted.is_empty() {
            report.elapsed = start.elapsed();
            return Ok(report);
        }

        let (inserts, updates) = self.classify(&rows, since).await?;
        let tombstones = deleted
            .iter()
            .map(|row| row.to_document().to_value())
            .collect::<Result<Vec<_>, _>>()?;
        report.inserted = inserts.len();
        report.updated = updates.len();
        report.deleted = tombstones.len();
        crate::metrics::record_classified("insert", inserts.len());
        crate::metrics::record_classified("update", updates.len());
        crate::metrics::record_classified("delete", tombstones.len());

        if !updates.is_empty() {
            self.hand_off(IndexAction::Update, updates).await?;
        }
        if !inserts.is_empty() {
            self.hand_off(IndexAction::Insert, inserts).await?;
        }
        if !tombstones.is_empty() {
            self.hand_off(IndexAction::Delete, tombstones).await?;
        }

        let synced_at = Utc::now();
        for row in rows.iter().chain(&deleted) {
            match self.source.mark_synced(&row.id, row.updated_at, synced_at).await {
                Ok(mark) => {
                    report.marked += 1;
                    crate::metrics::record_mark_synced("marked");
                    debug!(id = %mark.id, is_sync = mark.is_sync, "Row marked synced");
                }
                Err(StorageError::NoRowsAffected) => {
                    report.unmarked += 1;
                    crate::metrics::record_mark_synced("no_rows");
                    warn!(id = %row.id, "Row gone or written again before mark, left for the next cycle");
                }
                Err(source) => {
                    return Err(CycleError::MarkSynced { id: row.id.clone(), source });
                }
            }
        }

        // A full batch may have left older rows behind; keep W so they stay selectable.
        if !rows.is_empty() && rows.len() < self.settings.batch_limit {
            if let Some(newest) = rows.iter().map(UserRecord::change_time).max() {
                let lag = chrono::Duration::from_std(self.settings.watermark_lag).unwrap_or_else(|_| chrono::Duration::zero());
                let stored = self
                    .watermark
                    .advance(newest - lag)
                    .await
                    .map_err(CycleError::Watermark)?;
                report.watermark = Some(stored);
            }
        }

        report.outcome = CycleOutcome::Synced;
        report.elapsed = start.elapsed();
        Ok(report)
    }

    /// Split rows into (inserts, updates) by looking each id up in the index.
    async fn classify(
        &self,
        rows: &[UserRecord],
        since: DateTime<Utc>,
    ) -> Result<(Vec<Value>, Vec<Value>), CycleError> {
        let mut inserts = Vec::new();
        let mut updates = Vec::new();

        for row in rows {
            let document = row.to_document().to_value()?;
            let query = DocumentQuery::filtered(diff_filter(&row.id, since))
                .fields(["id"])
                .limit(1);
            let found = match self.index.find_documents(&self.settings.index_uid, &query).await {
                Ok(hits) => !hits.is_empty(),
                // Index not created yet: everything is new
                Err(StorageError::NotFound) => false,
                Err(source) => return Err(CycleError::Diff { id: row.id.clone(), source }),
            };
            if found {
                updates.push(document);
            } else {
                inserts.push(document);
            }
        }
        Ok((inserts, updates))
    }

    async fn hand_off(&self, action: IndexAction, documents: Vec<Value>) -> Result<(), CycleError> {
        let label = match action {
            IndexAction::Update => "update",
            IndexAction::Delete => "delete",
            _ => "insert",
        };
        let count = documents.len();
        let handoff_err = |source| CycleError::Handoff { action: label, source };

        match self.settings.handoff {
            Handoff::Direct => {
                let uid = &self.settings.index_uid;
                // Tombstones carry the whole projection, so they replace like inserts
                let task = match action {
                    IndexAction::Update => self.index.update_documents(uid, &documents).await,
                    _ => self.index.add_documents(uid, &documents).await,
                }
                .map_err(handoff_err)?;
                self.index
                    .wait_for_task(task, self.settings.task_timeout)
                    .await
                    .map_err(handoff_err)?;
            }
            Handoff::Queue => {
                let instruction = IndexingInstruction::bulk(action, documents);
                let envelope = QueueEnvelope::primary(&instruction)?
                    .signed(&self.settings.secret, self.settings.message_ttl_secs);
                self.broker.publish(&envelope).await.map_err(handoff_err)?;
            }
        }
        debug!(action = label, count, "Batch handed off");
        Ok(())
    }

    /// Jump the watermark past a backlog the breaker gave up on.
    async fn skip_backlog(&self) {
        let Some(skip_lag) = self.settings.skip_on_break else {
            return;
        };
        let lag = chrono::Duration::from_std(skip_lag).unwrap_or_else(|_| chrono::Duration::zero());
        match self.watermark.advance(Utc::now() - lag).await {
            Ok(at) => warn!(watermark = %at, "Breaker tripped, skipping backlog"),
            Err(e) => warn!(error = %e, "Breaker tripped, watermark skip failed"),
        }
    }
}
