// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache-backed attempt counter with cooldown.
//!
//! Shared across processes through the cache, unlike the in-process
//! [`super::circuit_breaker::CircuitBreaker`]. Each guarded attempt:
//!
//! ```text
//! INCRBY key increment ──► count
//!   count <= threshold ──► sleep(backoff(count)), proceed
//!   count >  threshold ──► TTL key
//!        no expiry     ──► SETEX key cooldown count      (trip)
//!        1s < ttl < 3s ──► SET key increment             (renewal window)
//!                      ──► reject
//! ```
//!
//! Once the cooldown expires the key disappears and the next attempt starts
//! a fresh count.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::storage::traits::{CacheStore, KeyTtl, StorageError};

/// Delay schedule applied while under the threshold.
///
/// `delay(n) = min(base * factor^(n-1), max)`, then randomized by ±`jitter`.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub factor: f64,
    pub max: Duration,
    /// Fraction (0.0 - 1.0) of the delay randomized in either direction
    pub jitter: f64,
}

impl BackoffPolicy {
    /// No delay at all.
    #[must_use]
    pub fn none() -> Self {
        Self::fixed(Duration::ZERO)
    }

    #[must_use]
    pub fn fixed(delay: Duration) -> Self {
        Self { base: delay, factor: 1.0, max: delay, jitter: 0.0 }
    }

    #[must_use]
    pub fn exponential(base: Duration, factor: f64, max: Duration) -> Self {
        Self { base, factor, max, jitter: 0.0 }
    }

    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before attempt `attempt` (1-based). Attempt 0 never waits.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with_jitter(attempt, rand::thread_rng().gen::<f64>())
    }

    /// Delay with an explicit jitter sample in `[0.0, 1.0)`.
    pub fn delay_with_jitter(&self, attempt: u32, sample: f64) -> Duration {
        if attempt == 0 || self.max.is_zero() {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let base_ns = self.base.as_nanos() as f64 * self.factor.powi(exponent);
        let capped_ns = base_ns.min(self.max.as_nanos() as f64);
        let offset = (sample * 2.0 - 1.0) * capped_ns * self.jitter;
        Duration::from_nanos((capped_ns + offset).max(0.0).round() as u64)
    }
}

/// Parameters of one guarded call site.
#[derive(Debug, Clone, PartialEq)]
pub struct GuardPolicy {
    pub increment: i64,
    pub threshold: i64,
    pub cooldown: Duration,
    pub backoff: BackoffPolicy,
}

impl GuardPolicy {
    #[must_use]
    pub fn new(threshold: i64, cooldown: Duration) -> Self {
        Self {
            increment: 1,
            threshold,
            cooldown,
            backoff: BackoffPolicy::none(),
        }
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Outcome of [`BreakerGuard::guard`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardDecision {
    pub proceed: bool,
    /// Counter value after this attempt
    pub count: i64,
    /// Backoff slept before returning
    pub waited: Duration,
    /// This call set the cooldown
    pub tripped: bool,
}

/// Lower bound (exclusive) of the renewal window.
const RENEWAL_MIN: Duration = Duration::from_secs(1);
/// Upper bound (exclusive) of the renewal window.
const RENEWAL_MAX: Duration = Duration::from_secs(3);

#[derive(Clone)]
pub struct BreakerGuard {
    cache: Arc<dyn CacheStore>,
}

impl BreakerGuard {
    pub fn new(cache: Arc<dyn CacheStore>) -> Self {
        Self { cache }
    }

    /// Count an attempt against `key` and decide whether it may proceed.
    #[tracing::instrument(skip(self, policy), fields(threshold = policy.threshold))]
    pub async fn guard(&self, key: &str, policy: &GuardPolicy) -> Result<GuardDecision, StorageError> {
        let count = self.cache.incr_by(key, policy.increment).await?;

        if count <= policy.threshold {
            let attempt = u32::try_from(count.max(0)).unwrap_or(u32::MAX);
            let waited = policy.backoff.delay(attempt);
            if !waited.is_zero() {
                debug!(key, count, wait = ?waited, "Backing off before attempt");
                tokio::time::sleep(waited).await;
            }
            crate::metrics::record_breaker_decision(key, "proceed");
            return Ok(GuardDecision { proceed: true, count, waited, tripped: false });
        }

        let mut tripped = false;
        match self.cache.ttl(key).await? {
            KeyTtl::Missing | KeyTtl::Persistent => {
                self.cache.set_ex(key, &count.to_string(), policy.cooldown).await?;
                tripped = true;
                warn!(key, count, cooldown = ?policy.cooldown, "Breaker tripped");
                crate::metrics::record_breaker_trip(key);
            }
            KeyTtl::Expires(ttl) if ttl > RENEWAL_MIN && ttl < RENEWAL_MAX => {
                self.cache.set(key, &policy.increment.to_string()).await?;
                debug!(key, ttl = ?ttl, "Breaker counter renewed");
            }
            KeyTtl::Expires(_) => {}
        }

        crate::metrics::record_breaker_decision(key, "rejected");
        Ok(GuardDecision { proceed: false, count, waited: Duration::ZERO, tripped })
    }
}
