//! Change watermark: "rows up to this instant are already in the index".
//!
//! Stored as one RFC 3339 string under [`WATERMARK_KEY`]. The indexing worker
//! seeds it with `touch` on first message; the poller only ever moves it
//! forward.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::message::WATERMARK_KEY;
use crate::storage::traits::{CacheStore, StorageError};

const LEGACY_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[must_use]
pub fn format_watermark(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse RFC 3339, or `YYYY-MM-DD HH:MM:SS` taken as UTC.
pub fn parse_watermark(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    let raw = raw.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Ok(at.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, LEGACY_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| StorageError::Decode(format!("watermark '{}': {}", raw, e)))
}

#[derive(Clone)]
pub struct Watermark {
    cache: Arc<dyn CacheStore>,
    key: String,
}

impl Watermark {
    pub fn new(cache: Arc<dyn CacheStore>) -> Self {
        Self::with_key(cache, WATERMARK_KEY)
    }

    pub fn with_key(cache: Arc<dyn CacheStore>, key: impl Into<String>) -> Self {
        Self { cache, key: key.into() }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current value. `None` when unset.
    pub async fn read(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        match self.cache.get(&self.key).await? {
            Some(raw) => parse_watermark(&raw).map(Some),
            None => Ok(None),
        }
    }

    /// Seed the watermark with `now` unless one is already stored. Returns true if this call set it.
    pub async fn touch(&self, now: DateTime<Utc>) -> Result<bool, StorageError> {
        let created = self.cache.set_nx(&self.key, &format_watermark(now)).await?;
        if created {
            debug!(key = %self.key, "Watermark seeded");
        }
        Ok(created)
    }

    /// Move forward to `to`. Returns the value now stored; an older `to` leaves it unchanged.
    ///
    /// An unparseable stored value is overwritten.
    pub async fn advance(&self, to: DateTime<Utc>) -> Result<DateTime<Utc>, StorageError> {
        let current = match self.read().await {
            Ok(current) => current,
            Err(StorageError::Decode(reason)) => {
                warn!(key = %self.key, %reason, "Replacing unreadable watermark");
                None
            }
            Err(e) => return Err(e),
        };
        if let Some(current) = current {
            if current >= to {
                return Ok(current);
            }
        }
        self.cache.set(&self.key, &format_watermark(to)).await?;
        debug!(key = %self.key, to = %format_watermark(to), "Watermark advanced");
        Ok(to)
    }
}
