// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Dead-letter worker: redelivers failed instructions to where they came from.
//!
//! Only the primary indexing queue is a valid destination: a record naming
//! any other exchange or queue is discarded, whatever its body says.
//!
//! Redelivery is throttled per original queue by the shared breaker, keyed by
//! the uppercased queue name (`WORKER.SEARCH`). Once the budget is spent,
//! further dead letters for that queue are discarded until the cooldown lapses.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::types::DiscardReason;
use crate::config::SearchSyncConfig;
use crate::message::{
    DeadLetterRecord, Disposition, IncomingMessage, QueueEnvelope, EXCHANGE_TYPE_DIRECT, HEADER_UNKNOWN,
    PRIMARY_EXCHANGE, PRIMARY_QUEUE,
};
use crate::resilience::breaker::{BreakerGuard, GuardPolicy};
use crate::resilience::circuit_breaker::BackendCircuits;
use crate::storage::traits::{CacheStore, MessageBroker, MessageHandler};

#[derive(Debug, Clone)]
pub struct DeadLetterSettings {
    pub secret: String,
    pub message_ttl_secs: i64,
    pub guard: GuardPolicy,
}

impl DeadLetterSettings {
    #[must_use]
    pub fn from_config(config: &SearchSyncConfig) -> Self {
        Self {
            secret: config.rabbitmq_secret.clone(),
            message_ttl_secs: config.message_ttl_secs,
            guard: GuardPolicy::new(config.dlq_retry, Duration::from_secs(config.dlq_cooldown_secs))
                .with_backoff(config.dlq_backoff()),
        }
    }
}

/// Breaker key for redeliveries into `queue`.
#[must_use]
pub fn redelivery_key(queue: &str) -> String {
    queue.to_uppercase()
}

pub struct DeadLetterWorker {
    broker: Arc<dyn MessageBroker>,
    guard: BreakerGuard,
    circuits: Arc<BackendCircuits>,
    settings: DeadLetterSettings,
}

impl DeadLetterWorker {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        cache: Arc<dyn CacheStore>,
        circuits: Arc<BackendCircuits>,
        settings: DeadLetterSettings,
    ) -> Self {
        Self {
            broker,
            guard: BreakerGuard::new(cache),
            circuits,
            settings,
        }
    }

    fn discard(reason: DiscardReason) -> Disposition {
        crate::metrics::record_discard("dead_letter", reason.as_str());
        Disposition::NackDiscard
    }

    async fn redeliver(&self, record: DeadLetterRecord) -> Disposition {
        let key = redelivery_key(&record.queue);
        match self.guard.guard(&key, &self.settings.guard).await {
            Ok(decision) if decision.proceed => {
                debug!(key = %key, attempt = decision.count, waited = ?decision.waited, "Redelivery admitted");
            }
            Ok(decision) => {
                info!(key = %key, count = decision.count, "Redelivery budget exhausted, discarding");
                return Self::discard(DiscardReason::Exhausted);
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Breaker unavailable, discarding");
                return Self::discard(DiscardReason::GuardUnavailable);
            }
        }

        let body = match serde_json::to_vec(&record.body) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "Dead-letter payload not encodable");
                return Self::discard(DiscardReason::Undecodable);
            }
        };
        let envelope = QueueEnvelope::new(PRIMARY_EXCHANGE, EXCHANGE_TYPE_DIRECT, PRIMARY_QUEUE, body)
            .signed(&self.settings.secret, self.settings.message_ttl_secs);

        match self.circuits.broker.call(|| self.broker.publish(&envelope)).await {
            Ok(()) => {
                crate::metrics::record_redelivery(&record.queue);
                info!(exchange = %record.exchange, queue = %record.queue, "Dead letter redelivered");
                Disposition::Ack
            }
            Err(e) => {
                error!(queue = %record.queue, error = %e, "Redelivery publish failed");
                Self::discard(DiscardReason::PublishFailed)
            }
        }
    }
}

#[async_trait]
impl MessageHandler for DeadLetterWorker {
    #[tracing::instrument(skip(self, message), fields(queue = %message.queue))]
    async fn handle(&self, message: &IncomingMessage) -> Disposition {
        let unknown = message.headers.get_bool(HEADER_UNKNOWN) == Some(true);
        if unknown && !message.headers.secret_matches(&self.settings.secret) {
            info!("Refusing dead letter from an unauthorized sender");
            return Self::discard(DiscardReason::Unauthorized);
        }

        let record: DeadLetterRecord = match serde_json::from_slice(&message.body) {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "Undecodable dead letter");
                return Self::discard(DiscardReason::Undecodable);
            }
        };

        if !record.has_payload() {
            debug!(queue = %record.queue, "Dead letter without payload");
            return Self::discard(DiscardReason::EmptyPayload);
        }
        if record.exchange != PRIMARY_EXCHANGE || record.queue != PRIMARY_QUEUE {
            warn!(exchange = %record.exchange, queue = %record.queue, "Dead letter names a foreign destination");
            return Self::discard(DiscardReason::ForeignDestination);
        }
        self.redeliver(record).await
    }
}
