// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process circuit breakers around worker writes, built on `recloser`.
//!
//! The indexing worker writes through [`BackendCircuits::search`] and both
//! workers publish through [`BackendCircuits::broker`]. While a circuit is
//! open, calls fail with [`CircuitError::Rejected`] without touching the
//! backend, so a dead search engine costs one rejected call per message
//! rather than one task timeout.
//!
//! Unlike [`super::breaker`], these counters are local to the process.

use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// Circuit open; the operation was not attempted
    #[error("circuit open, call rejected")]
    Rejected,
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> From<RecloserError<E>> for CircuitError<E> {
    fn from(err: RecloserError<E>) -> Self {
        match err {
            RecloserError::Rejected => CircuitError::Rejected,
            RecloserError::Inner(e) => CircuitError::Inner(e),
        }
    }
}

/// Trip and recovery parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitConfig {
    /// Failure share of the window (0.0 - 1.0) that opens the circuit
    pub failure_rate: f32,
    /// Calls observed while closed before the rate is evaluated
    pub window: usize,
    /// Trial calls admitted while half-open
    pub half_open_calls: usize,
    /// Time spent open before probing
    pub open_wait: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self::search()
    }
}

impl CircuitConfig {
    /// Search engine writes. Every consumer blocks on a slow engine, so trip early.
    #[must_use]
    pub fn search() -> Self {
        Self {
            failure_rate: 0.5,
            window: 10,
            half_open_calls: 3,
            open_wait: Duration::from_secs(30),
        }
    }

    /// Broker publishes. Cheap to attempt, tolerate more.
    #[must_use]
    pub fn broker() -> Self {
        Self {
            failure_rate: 0.8,
            window: 20,
            half_open_calls: 1,
            open_wait: Duration::from_secs(10),
        }
    }
}

/// Call counters of one circuit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejections: u64,
}

#[derive(Default)]
struct Counters {
    calls: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

pub struct CircuitBreaker {
    name: &'static str,
    inner: AsyncRecloser,
    counters: Counters,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: CircuitConfig) -> Self {
        let recloser = Recloser::custom()
            .error_rate(config.failure_rate)
            .closed_len(config.window.max(1))
            .half_open_len(config.half_open_calls.max(1))
            .open_wait(config.open_wait)
            .build();
        Self {
            name,
            inner: recloser.into(),
            counters: Counters::default(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Run `f` through the circuit. The future is only polled when the circuit admits the call.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.counters.calls.fetch_add(1, Ordering::Relaxed);

        match self.inner.call(f()).await {
            Ok(value) => {
                self.counters.successes.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_circuit_call(self.name, "success");
                Ok(value)
            }
            Err(RecloserError::Rejected) => {
                self.counters.rejections.fetch_add(1, Ordering::Relaxed);
                warn!(circuit = self.name, "Circuit open, call rejected");
                crate::metrics::record_circuit_call(self.name, "rejected");
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(e)) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                debug!(circuit = self.name, "Circuit call failed");
                crate::metrics::record_circuit_call(self.name, "failure");
                Err(CircuitError::Inner(e))
            }
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> CircuitSnapshot {
        CircuitSnapshot {
            calls: self.counters.calls.load(Ordering::Relaxed),
            successes: self.counters.successes.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            rejections: self.counters.rejections.load(Ordering::Relaxed),
        }
    }
}

/// The worker-side circuits.
pub struct BackendCircuits {
    /// Index writes and task waits
    pub search: CircuitBreaker,
    /// Dead-letter and redelivery publishes
    pub broker: CircuitBreaker,
}

impl Default for BackendCircuits {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendCircuits {
    pub fn new() -> Self {
        Self::with_configs(CircuitConfig::search(), CircuitConfig::broker())
    }

    pub fn with_configs(search: CircuitConfig, broker: CircuitConfig) -> Self {
        Self {
            search: CircuitBreaker::new("meilisearch", search),
            broker: CircuitBreaker::new("rabbitmq", broker),
        }
    }

    #[must_use]
    pub fn metrics(&self) -> BackendCircuitMetrics {
        BackendCircuitMetrics {
            search: self.search.snapshot(),
            broker: self.broker.snapshot(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendCircuitMetrics {
    pub search: CircuitSnapshot,
    pub broker: CircuitSnapshot,
}
