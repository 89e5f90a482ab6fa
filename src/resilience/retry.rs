// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded retry for backend connections and reads.
//!
//! Delays come from the same [`BackoffPolicy`] the shared breaker uses, so
//! `RetryConfig::startup()` waits 200ms, 400ms, 800ms, ... before each retry.
//!
//! ```
//! use search_sync::RetryConfig;
//!
//! assert_eq!(RetryConfig::startup().attempts, Some(5));
//! assert_eq!(RetryConfig::query().attempts, Some(3));
//! ```

use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

use super::breaker::BackoffPolicy;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first; `None` retries forever
    pub attempts: Option<usize>,
    pub backoff: BackoffPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::query()
    }
}

impl RetryConfig {
    /// Boot-time connects. Gives up after ~3s so a wrong URL aborts startup.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            attempts: Some(5),
            backoff: BackoffPolicy::exponential(Duration::from_millis(200), 2.0, Duration::from_secs(2)),
        }
    }

    /// Reads on an established connection. The caller's cycle or message fails after that.
    #[must_use]
    pub fn query() -> Self {
        Self {
            attempts: Some(3),
            backoff: BackoffPolicy::exponential(Duration::from_millis(100), 2.0, Duration::from_secs(1)),
        }
    }

    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            attempts: Some(3),
            backoff: BackoffPolicy::exponential(Duration::from_millis(1), 2.0, Duration::from_millis(10)),
        }
    }
}

/// Retry `operation` on every error.
pub async fn retry<F, Fut, T, E>(op: &str, config: &RetryConfig, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_when(op, config, |_| true, operation).await
}

/// Retry `operation` while `should_retry` accepts the error. Other errors return at once.
pub async fn retry_when<F, Fut, T, E, P>(
    op: &str,
    config: &RetryConfig,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut failed: u32 = 0;
    loop {
        let err = match operation().await {
            Ok(value) => {
                if failed > 0 {
                    info!(op, retries = failed, "Recovered after retry");
                }
                return Ok(value);
            }
            Err(err) => err,
        };
        failed += 1;

        let exhausted = config.attempts.is_some_and(|max| failed as usize >= max);
        if exhausted || !should_retry(&err) {
            return Err(err);
        }

        let wait = config.backoff.delay(failed);
        warn!(op, attempt = failed, max = ?config.attempts, error = %err, wait = ?wait, "Retrying");
        tokio::time::sleep(wait).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::traits::StorageError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Operation failing `failures` times with `make_err`, then returning 42.
    fn flaky(
        failures: usize,
        make_err: fn() -> StorageError,
    ) -> (Arc<AtomicUsize>, impl FnMut() -> futures::future::Ready<Result<u32, StorageError>>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let op = move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(if n < failures { Err(make_err()) } else { Ok(42) })
        };
        (calls, op)
    }

    fn reset() -> StorageError {
        StorageError::Backend("connection reset".into())
    }

    #[tokio::test]
    async fn test_recovers_within_budget() {
        let (calls, op) = flaky(2, reset);
        assert_eq!(retry("redis_get", &RetryConfig::test(), op).await.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_attempts() {
        let (calls, op) = flaky(usize::MAX, reset);
        let err = retry("redis_get", &RetryConfig::test(), op).await.unwrap_err();
        assert!(err.to_string().contains("connection reset"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let (calls, op) = flaky(usize::MAX, || StorageError::Decode("garbage".into()));
        let result = retry_when("sql_find_user", &RetryConfig::test(), StorageError::is_transient, op).await;
        assert!(matches!(result, Err(StorageError::Decode(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_follow_backoff() {
        let (_, op) = flaky(2, reset);
        let start = tokio::time::Instant::now();
        retry("amqp_connect", &RetryConfig::startup(), op).await.unwrap();
        // 200ms + 400ms, no jitter on the presets
        assert_eq!(start.elapsed(), Duration::from_millis(600));
    }

    #[test]
    fn test_presets() {
        assert_eq!(RetryConfig::default(), RetryConfig::query());
        assert!(RetryConfig::startup().backoff.max >= RetryConfig::query().backoff.max);
    }
}
