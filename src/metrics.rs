// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for search-sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `search_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `outcome`: throttled, no_watermark, idle, synced, failed
//! - `action`: insert, update, delete
//! - `reason`: why a message was discarded

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

// ═══════════════════════════════════════════════════════════════════════════
// Change poller
// ═══════════════════════════════════════════════════════════════════════════

/// Record one poller cycle and its outcome
pub fn record_cycle(outcome: &str, duration: Duration) {
    counter!(
        "search_sync_poller_cycles_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!("search_sync_poller_cycle_seconds").record(duration.as_secs_f64());
}

/// Record how many changed rows a cycle picked up
pub fn record_rows_found(count: usize) {
    histogram!("search_sync_poller_rows_found").record(count as f64);
}

/// Record rows classified as insert or update
pub fn record_classified(kind: &str, count: usize) {
    counter!(
        "search_sync_poller_classified_total",
        "kind" => kind.to_string()
    )
    .increment(count as u64);
}

/// Record a mark-synced result (marked, no_rows)
pub fn record_mark_synced(status: &str) {
    counter!(
        "search_sync_poller_mark_synced_total",
        "status" => status.to_string()
    )
    .increment(1);
}

/// Seconds between now and the stored watermark
pub fn set_watermark_lag(lag: Duration) {
    gauge!("search_sync_watermark_lag_seconds").set(lag.as_secs_f64());
}

// ═══════════════════════════════════════════════════════════════════════════
// Breaker
// ═══════════════════════════════════════════════════════════════════════════

/// Record a guard decision (proceed, rejected)
pub fn record_breaker_decision(key: &str, decision: &str) {
    counter!(
        "search_sync_breaker_decisions_total",
        "key" => key.to_string(),
        "decision" => decision.to_string()
    )
    .increment(1);
}

/// Record a breaker entering cooldown
pub fn record_breaker_trip(key: &str) {
    counter!(
        "search_sync_breaker_trips_total",
        "key" => key.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// Workers
// ═══════════════════════════════════════════════════════════════════════════

/// Record an indexing instruction outcome (applied, failed)
pub fn record_indexing(action: &str, status: &str) {
    counter!(
        "search_sync_indexing_total",
        "action" => action.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record index write latency
pub fn record_index_latency(action: &str, duration: Duration) {
    histogram!(
        "search_sync_index_write_seconds",
        "action" => action.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a message sent to the dead-letter queue
pub fn record_dead_lettered(unknown: bool) {
    counter!(
        "search_sync_dead_lettered_total",
        "unknown" => unknown.to_string()
    )
    .increment(1);
}

/// Record a dead-letter redelivery to its original queue
pub fn record_redelivery(queue: &str) {
    counter!(
        "search_sync_redeliveries_total",
        "queue" => queue.to_string()
    )
    .increment(1);
}

/// Record a message dropped without being applied
pub fn record_discard(worker: &str, reason: &str) {
    counter!(
        "search_sync_discarded_total",
        "worker" => worker.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Set number of running consumers for a pool
pub fn set_active_consumers(pool: &str, count: usize) {
    gauge!(
        "search_sync_active_consumers",
        "pool" => pool.to_string()
    )
    .set(count as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// Backends
// ═══════════════════════════════════════════════════════════════════════════

/// Record circuit breaker call
pub fn record_circuit_call(circuit: &str, outcome: &str) {
    counter!(
        "search_sync_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a failed connection attempt at startup
pub fn record_connection_error(backend: &str) {
    counter!(
        "search_sync_connection_errors_total",
        "backend" => backend.to_string()
    )
    .increment(1);
}

/// Record pipeline state transitions
pub fn set_pipeline_state(state: &str) {
    counter!(
        "search_sync_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// Records elapsed time for an index write when dropped
pub struct LatencyTimer {
    action: &'static str,
    start: Instant,
}

impl LatencyTimer {
    #[must_use]
    pub fn new(action: &'static str) -> Self {
        Self {
            action,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_index_latency(self.action, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    #[test]
    fn test_poller_metrics() {
        record_cycle("synced", Duration::from_millis(40));
        record_cycle("throttled", Duration::ZERO);
        record_rows_found(12);
        record_classified("insert", 7);
        record_classified("update", 5);
        record_mark_synced("marked");
        set_watermark_lag(Duration::from_secs(30));
    }

    #[test]
    fn test_worker_metrics() {
        record_indexing("insert", "applied");
        record_indexing("delete", "failed");
        record_dead_lettered(false);
        record_redelivery("worker.search");
        record_discard("dead_letter", "exhausted");
        set_active_consumers("indexing", 4);
        {
            let _timer = LatencyTimer::new("update");
        }
    }

    #[test]
    fn test_discard_counter_is_labelled() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            record_discard("indexing", "undecodable");
            record_discard("indexing", "undecodable");
        });

        let discarded: u64 = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .filter(|(key, _, _, _)| key.key().name() == "search_sync_discarded_total")
            .map(|(_, _, _, value)| match value {
                DebugValue::Counter(n) => n,
                _ => 0,
            })
            .sum();
        assert_eq!(discarded, 2);
    }
}
