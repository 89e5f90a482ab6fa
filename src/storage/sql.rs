// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! PostgreSQL backend for the `users` table.
//!
//! The table is the ground truth. The change poller reads it through
//! [`RelationalChangeSource`]; the user service writes it through
//! [`UserRepository`].
//!
//! ```sql
//! CREATE TABLE users (
//!   id            UUID PRIMARY KEY DEFAULT gen_random_uuid(),
//!   name          VARCHAR(200) NOT NULL,
//!   email         VARCHAR(200) NOT NULL UNIQUE,
//!   ...
//!   address       TEXT NOT NULL,
//!   created_at    TIMESTAMPTZ NOT NULL DEFAULT now(),
//!   updated_at    TIMESTAMPTZ,
//!   deleted_at    TIMESTAMPTZ,
//!   is_sync       BOOLEAN NOT NULL DEFAULT FALSE
//! )
//! ```
//!
//! Ids travel as text; every statement casts with `::uuid` / `::text` so the
//! rest of the crate never sees the UUID type. A malformed id is treated as
//! "no such row" rather than surfacing a cast error.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::time::Duration;
use tracing::info;

use super::traits::{RelationalChangeSource, StorageError, SyncMark, UserRepository};
use crate::resilience::retry::{retry, retry_when, RetryConfig};
use crate::user::{NewUser, UserPatch, UserProfile, UserRecord};

const USER_COLUMNS: &str = "id::text AS id, name, email, phone, date_of_birth, age, address, \
     city, state, direction, country, postal_code, created_at, updated_at, deleted_at, is_sync";

const SCHEMA: [&str; 4] = [
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id            UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        name          VARCHAR(200) NOT NULL DEFAULT '',
        email         VARCHAR(200) NOT NULL UNIQUE,
        phone         VARCHAR(200) NOT NULL DEFAULT '',
        date_of_birth VARCHAR(200) NOT NULL DEFAULT '',
        age           VARCHAR(200) NOT NULL DEFAULT '',
        address       TEXT NOT NULL DEFAULT '',
        city          VARCHAR(200) NOT NULL DEFAULT '',
        state         VARCHAR(200) NOT NULL DEFAULT '',
        direction     VARCHAR(200) NOT NULL DEFAULT '',
        country       VARCHAR(200) NOT NULL DEFAULT '',
        postal_code   VARCHAR(200) NOT NULL DEFAULT '',
        created_at    TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at    TIMESTAMPTZ,
        deleted_at    TIMESTAMPTZ,
        is_sync       BOOLEAN NOT NULL DEFAULT FALSE
    )
    "#,
    // Poller scan: live, unsynced rows only
    r#"
    CREATE INDEX IF NOT EXISTS idx_users_pending_created
        ON users (created_at) WHERE deleted_at IS NULL AND is_sync = FALSE
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_users_pending_updated
        ON users (updated_at) WHERE deleted_at IS NULL AND is_sync = FALSE
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_users_pending_deleted
        ON users (deleted_at) WHERE deleted_at IS NOT NULL AND is_sync = FALSE
    "#,
];

fn backend(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn decode(e: sqlx::Error) -> StorageError {
    StorageError::Decode(e.to_string())
}

/// Map a result row into a [`UserRecord`].
fn row_to_user(row: &PgRow) -> Result<UserRecord, StorageError> {
    Ok(UserRecord {
        id: row.try_get("id").map_err(decode)?,
        profile: UserProfile {
            name: row.try_get("name").map_err(decode)?,
            email: row.try_get("email").map_err(decode)?,
            phone: row.try_get("phone").map_err(decode)?,
            date_of_birth: row.try_get("date_of_birth").map_err(decode)?,
            age: row.try_get("age").map_err(decode)?,
            address: row.try_get("address").map_err(decode)?,
            city: row.try_get("city").map_err(decode)?,
            state: row.try_get("state").map_err(decode)?,
            direction: row.try_get("direction").map_err(decode)?,
            country: row.try_get("country").map_err(decode)?,
            postal_code: row.try_get("postal_code").map_err(decode)?,
        },
        created_at: row.try_get("created_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
        deleted_at: row.try_get("deleted_at").map_err(decode)?,
        is_sync: row.try_get("is_sync").map_err(decode)?,
    })
}

/// True when `id` parses as a UUID. Anything else can never match a row.
fn is_uuid(id: &str) -> bool {
    uuid::Uuid::parse_str(id).is_ok()
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect with startup-mode retry (fails fast if config is wrong).
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            PgPoolOptions::new()
                .max_connections(20)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(backend)
        })
        .await
        .map_err(|e| {
            crate::metrics::record_connection_error("postgres");
            e
        })?;

        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> PgPool {
        self.pool.clone()
    }

    /// Create the `users` table and its partial indexes if missing.
    pub async fn init_schema(&self) -> Result<(), StorageError> {
        for sql in SCHEMA {
            retry("sql_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql).execute(&self.pool).await.map_err(backend)
            })
            .await?;
        }
        info!("users schema ready");
        Ok(())
    }
}

#[async_trait]
impl RelationalChangeSource for PgStore {
    async fn find_changed(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<UserRecord>, StorageError> {
        let sql = format!(
            "SELECT {USER_COLUMNS} FROM users \
             WHERE deleted_at IS NULL AND is_sync = FALSE \
               AND ((updated_at IS NULL AND created_at > $1) OR (updated_at IS NOT NULL AND updated_at > $1)) \
             ORDER BY created_at DESC \
             LIMIT $2"
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows = retry_when("sql_find_changed", &RetryConfig::query(), StorageError::is_transient, || async {
            sqlx::query(&sql)
                .bind(since)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
                .map_err(backend)
        })
        .await?;

        rows.iter().map(row_to_user).collect()
    }

    async fn find_deleted(&self, limit: usize) -> Result<Vec<UserRecord>, StorageError> {
        let sql = format!(
            "SELECT {USER_COLUMNS} FROM users \
             WHERE deleted_at IS NOT NULL AND is_sync = FALSE \
             ORDER BY deleted_at ASC \
             LIMIT $1"
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows = retry_when("sql_find_deleted", &RetryConfig::query(), StorageError::is_transient, || async {
            sqlx::query(&sql).bind(limit).fetch_all(&self.pool).await.map_err(backend)
        })
        .await?;

        rows.iter().map(row_to_user).collect()
    }

    async fn mark_synced(
        &self,
        id: &str,
        observed: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> Result<SyncMark, StorageError> {
        if !is_uuid(id) {
            return Err(StorageError::NoRowsAffected);
        }
        // A write committed after the read moved updated_at; leave that row unsynced
        let row = sqlx::query(
            "UPDATE users SET is_sync = TRUE, updated_at = $2 \
             WHERE id = $1::uuid AND updated_at IS NOT DISTINCT FROM $3 \
             RETURNING id::text AS id, is_sync",
        )
        .bind(id)
        .bind(at)
        .bind(observed)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?
        .ok_or(StorageError::NoRowsAffected)?;

        Ok(SyncMark {
            id: row.try_get("id").map_err(decode)?,
            is_sync: row.try_get("is_sync").map_err(decode)?,
        })
    }
}

#[async_trait]
impl UserRepository for PgStore {
    async fn insert_user(&self, user: &NewUser) -> Result<UserRecord, StorageError> {
        let sql = format!(
            "INSERT INTO users (name, email, phone, date_of_birth, age, address, city, state, direction, country, postal_code) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             RETURNING {USER_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(&user.name)
            .bind(&user.email)
            .bind(&user.phone)
            .bind(&user.date_of_birth)
            .bind(&user.age)
            .bind(&user.address)
            .bind(&user.city)
            .bind(&user.state)
            .bind(&user.direction)
            .bind(&user.country)
            .bind(&user.postal_code)
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        row_to_user(&row)
    }

    async fn update_user(&self, id: &str, patch: &UserPatch) -> Result<UserRecord, StorageError> {
        if !is_uuid(id) {
            return Err(StorageError::NotFound);
        }
        // NULL parameters keep the current column value
        let sql = format!(
            "UPDATE users SET \
                name = COALESCE($2, name), email = COALESCE($3, email), phone = COALESCE($4, phone), \
                date_of_birth = COALESCE($5, date_of_birth), age = COALESCE($6, age), \
                address = COALESCE($7, address), city = COALESCE($8, city), state = COALESCE($9, state), \
                direction = COALESCE($10, direction), country = COALESCE($11, country), \
                postal_code = COALESCE($12, postal_code), \
                updated_at = now(), is_sync = FALSE \
             WHERE id = $1::uuid AND deleted_at IS NULL \
             RETURNING {USER_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(&patch.name)
            .bind(&patch.email)
            .bind(&patch.phone)
            .bind(&patch.date_of_birth)
            .bind(&patch.age)
            .bind(&patch.address)
            .bind(&patch.city)
            .bind(&patch.state)
            .bind(&patch.direction)
            .bind(&patch.country)
            .bind(&patch.postal_code)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .ok_or(StorageError::NotFound)?;
        row_to_user(&row)
    }

    async fn soft_delete_user(&self, id: &str) -> Result<UserRecord, StorageError> {
        if !is_uuid(id) {
            return Err(StorageError::NotFound);
        }
        let sql = format!(
            "UPDATE users SET deleted_at = now(), updated_at = now(), is_sync = FALSE \
             WHERE id = $1::uuid AND deleted_at IS NULL \
             RETURNING {USER_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .ok_or(StorageError::NotFound)?;
        row_to_user(&row)
    }

    async fn find_user(&self, id: &str) -> Result<Option<UserRecord>, StorageError> {
        if !is_uuid(id) {
            return Ok(None);
        }
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1::uuid AND deleted_at IS NULL");
        let row = retry_when("sql_find_user", &RetryConfig::query(), StorageError::is_transient, || async {
            sqlx::query(&sql)
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)
        })
        .await?;
        row.as_ref().map(row_to_user).transpose()
    }
}
