//! Redis cache backend.
//!
//! Holds the change watermark and the breaker counters. Every command is a
//! single round trip, so `INCRBY`, `SET` and `SET NX` keep their Redis
//! atomicity and no client-side locking is needed.
//!
//! Reads go through the query retry preset. Counter and write commands are
//! not retried: a replayed `INCRBY` would double count.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{cmd, Client};
use std::time::Duration;

use super::traits::{CacheStore, KeyTtl, StorageError};
use crate::resilience::retry::{retry, RetryConfig};

fn backend(e: redis::RedisError) -> StorageError {
    StorageError::Backend(e.to_string())
}

pub struct RedisCache {
    connection: ConnectionManager,
    /// Optional key prefix for namespacing (e.g., "staging:" → "staging:WORKER:SEARCH:CDC")
    prefix: String,
}

impl RedisCache {
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        Self::with_prefix(connection_string, None).await
    }

    /// Connect with startup-mode retry. A wrong URL fails the boot within seconds.
    pub async fn with_prefix(connection_string: &str, prefix: Option<&str>) -> Result<Self, StorageError> {
        let client = Client::open(connection_string).map_err(backend)?;

        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(|e| {
            crate::metrics::record_connection_error("redis");
            backend(e)
        })?;

        Ok(Self {
            connection,
            prefix: prefix.unwrap_or("").to_string(),
        })
    }

    #[inline]
    fn prefixed_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}{}", self.prefix, key)
        }
    }

    /// Round-trip a PING.
    pub async fn ping(&self) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let _: String = cmd("PING").query_async(&mut conn).await.map_err(backend)?;
        Ok(())
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);

        retry("redis_get", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let value: Option<String> = cmd("GET").arg(&key).query_async(&mut conn).await?;
                Ok(value)
            }
        })
        .await
        .map_err(backend)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let _: () = cmd("SET")
            .arg(self.prefixed_key(key))
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        // SETEX rejects 0
        let seconds = ttl.as_secs().max(1);
        let _: () = cmd("SETEX")
            .arg(self.prefixed_key(key))
            .arg(seconds)
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn incr_by(&self, key: &str, by: i64) -> Result<i64, StorageError> {
        let mut conn = self.connection.clone();
        cmd("INCRBY")
            .arg(self.prefixed_key(key))
            .arg(by)
            .query_async(&mut conn)
            .await
            .map_err(backend)
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);

        let raw: i64 = retry("redis_ttl", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let raw: i64 = cmd("TTL").arg(&key).query_async(&mut conn).await?;
                Ok(raw)
            }
        })
        .await
        .map_err(backend)?;

        Ok(KeyTtl::from_seconds(raw))
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);

        retry("redis_exists", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let found: bool = cmd("EXISTS").arg(&key).query_async(&mut conn).await?;
                Ok(found)
            }
        })
        .await
        .map_err(backend)
    }

    /// `SET key value NX`: nil reply means the key was already there.
    async fn set_nx(&self, key: &str, value: &str) -> Result<bool, StorageError> {
        let mut conn = self.connection.clone();
        let reply: Option<String> = cmd("SET")
            .arg(self.prefixed_key(key))
            .arg(value)
            .arg("NX")
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(reply.is_some())
    }
}
