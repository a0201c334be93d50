// SPDX-License-Identifier: LGPL-2.1-or-later
// Copyright (C) 2026 Stride Project Contributors
//
// This file is part of Stride.
//
// Stride is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published by
// the Free Software Foundation, either version 2.1 of the License, or
// (at your option) any later version.
//
// Stride is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License
// along with Stride. If not, see <https://www.gnu.org/licenses/>.

//! SQL-based lock manager implementation.
//!
//! This module provides a relational database backend for the generic
//! [`LockManager`](crate::LockManager) trait:
//!
//! - One row per lock key
//! - Single-statement conditional upsert for acquisition, so there is no
//!   window between the availability check and the write
//! - Explicit TTL / expiration semantics
//!
//! Currently we implement a **SQLite** backend. PostgreSQL can be added by
//! following the same pattern with a `PgPool`.

use crate::{Lock, LockError, LockManager, LockResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::instrument;

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};

/// SQLite-based lock manager.
///
/// This backend uses a single `locks` table with the following schema:
///
/// ```sql
/// CREATE TABLE IF NOT EXISTS locks (
///   lock_key TEXT PRIMARY KEY,
///   holder_id TEXT NOT NULL,
///   acquired_at INTEGER NOT NULL,
///   expires_at INTEGER NOT NULL
/// );
/// ```
///
/// - `acquired_at` / `expires_at` are stored as UNIX epoch seconds
/// - Acquisition is `INSERT .. ON CONFLICT DO UPDATE .. WHERE expired-or-
///   same-holder`; the affected-row count tells the caller whether it won
#[derive(Clone)]
pub struct SqliteLockManager {
    pool: SqlitePool,
}

impl SqliteLockManager {
    /// Create a new SQLite lock manager.
    ///
    /// `database_url` is any valid `sqlx` SQLite URL, e.g.:
    /// - `sqlite::memory:` (in-memory)
    /// - `sqlite://locks.db`
    #[instrument(skip(database_url))]
    pub async fn new(database_url: &str) -> LockResult<Self> {
        // An in-memory database is per-connection; cap the pool at one
        // connection so every caller sees the same database.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| LockError::BackendError(format!("failed to connect SQLite: {e}")))?;

        Self::from_pool(pool).await
    }

    /// Create a lock manager over an existing pool, initializing the schema.
    pub async fn from_pool(pool: SqlitePool) -> LockResult<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS locks (
              lock_key TEXT PRIMARY KEY,
              holder_id TEXT NOT NULL,
              acquired_at INTEGER NOT NULL,
              expires_at INTEGER NOT NULL
            );
        "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| LockError::BackendError(format!("failed to create locks table: {e}")))?;

        sqlx::query(
            r#"CREATE INDEX IF NOT EXISTS idx_locks_expires_at ON locks(expires_at);"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| LockError::BackendError(format!("failed to create index: {e}")))?;

        Ok(Self { pool })
    }

    fn now_epoch_secs() -> i64 {
        Utc::now().timestamp()
    }

    fn validate(lock_key: &str, holder_id: &str, ttl_secs: i64) -> LockResult<()> {
        if lock_key.is_empty() {
            return Err(LockError::InvalidKey(lock_key.to_string()));
        }
        if holder_id.is_empty() {
            return Err(LockError::InvalidHolderId(holder_id.to_string()));
        }
        if ttl_secs <= 0 {
            return Err(LockError::InvalidTtl(ttl_secs));
        }
        Ok(())
    }

    fn lock_from_epochs(
        lock_key: String,
        holder_id: String,
        acquired_at: i64,
        expires_at: i64,
    ) -> LockResult<Lock> {
        let acquired_at = DateTime::<Utc>::from_timestamp(acquired_at, 0)
            .ok_or_else(|| LockError::BackendError("invalid acquired_at timestamp".to_string()))?;
        let expires_at = DateTime::<Utc>::from_timestamp(expires_at, 0)
            .ok_or_else(|| LockError::BackendError("invalid expires_at timestamp".to_string()))?;
        Ok(Lock {
            lock_key,
            holder_id,
            acquired_at,
            expires_at,
        })
    }
}

#[async_trait]
impl LockManager for SqliteLockManager {
    #[instrument(skip(self), fields(lock_key = %lock_key, holder_id = %holder_id))]
    async fn acquire(&self, lock_key: &str, holder_id: &str, ttl_secs: i64) -> LockResult<bool> {
        Self::validate(lock_key, holder_id, ttl_secs)?;
        let now = Self::now_epoch_secs();
        let expires_at = now + ttl_secs;

        // One conditional upsert. The WHERE on the DO UPDATE arm makes the
        // takeover atomic: the update fires only when the existing row is
        // expired or already ours, otherwise zero rows are affected.
        let result = sqlx::query(
            r#"INSERT INTO locks (lock_key, holder_id, acquired_at, expires_at)
               VALUES (?1, ?2, ?3, ?4)
               ON CONFLICT(lock_key) DO UPDATE SET
                 holder_id = excluded.holder_id,
                 acquired_at = excluded.acquired_at,
                 expires_at = excluded.expires_at
               WHERE locks.expires_at <= ?3 OR locks.holder_id = excluded.holder_id"#,
        )
        .bind(lock_key)
        .bind(holder_id)
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| LockError::BackendError(format!("upsert lock: {e}")))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(lock_key = %lock_key, holder_id = %holder_id))]
    async fn release(&self, lock_key: &str, holder_id: &str) -> LockResult<bool> {
        let result = sqlx::query(
            r#"DELETE FROM locks WHERE lock_key = ?1 AND holder_id = ?2"#,
        )
        .bind(lock_key)
        .bind(holder_id)
        .execute(&self.pool)
        .await
        .map_err(|e| LockError::BackendError(format!("delete lock: {e}")))?;

        Ok(result.rows_affected() == 1)
    }

    async fn has_lock(&self, lock_key: &str) -> LockResult<bool> {
        let row = sqlx::query(r#"SELECT expires_at FROM locks WHERE lock_key = ?1"#)
            .bind(lock_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| LockError::BackendError(format!("select lock: {e}")))?;

        match row {
            Some(row) => {
                let expires_at: i64 = row.get("expires_at");
                Ok(expires_at > Self::now_epoch_secs())
            }
            None => Ok(false),
        }
    }

    async fn get_lock(&self, lock_key: &str) -> LockResult<Option<Lock>> {
        let row = sqlx::query(
            r#"SELECT lock_key, holder_id, acquired_at, expires_at
               FROM locks WHERE lock_key = ?1"#,
        )
        .bind(lock_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| LockError::BackendError(format!("select lock: {e}")))?;

        match row {
            Some(row) => Self::lock_from_epochs(
                row.get("lock_key"),
                row.get("holder_id"),
                row.get("acquired_at"),
                row.get("expires_at"),
            )
            .map(Some),
            None => Ok(None),
        }
    }

    #[instrument(skip(self))]
    async fn delete_expired(&self) -> LockResult<u64> {
        let result = sqlx::query(r#"DELETE FROM locks WHERE expires_at <= ?1"#)
            .bind(Self::now_epoch_secs())
            .execute(&self.pool)
            .await
            .map_err(|e| LockError::BackendError(format!("delete expired: {e}")))?;

        Ok(result.rows_affected())
    }
}
