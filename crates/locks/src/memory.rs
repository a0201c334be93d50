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

//! In-memory lock manager implementation (for testing).

use crate::{Lock, LockError, LockManager, LockResult};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory lock manager (for testing).
///
/// ## Purpose
/// Provides a simple in-memory implementation of `LockManager` for testing
/// and single-process scenarios.
///
/// ## Limitations
/// - Not persistent (locks lost on restart)
/// - Not distributed (single process only)
#[derive(Clone)]
pub struct MemoryLockManager {
    locks: Arc<RwLock<HashMap<String, Lock>>>,
}

impl MemoryLockManager {
    /// Create a new in-memory lock manager.
    pub fn new() -> Self {
        Self {
            locks: Arc::new(RwLock::new(HashMap::new())),
        }
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
}

impl Default for MemoryLockManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockManager for MemoryLockManager {
    async fn acquire(&self, lock_key: &str, holder_id: &str, ttl_secs: i64) -> LockResult<bool> {
        Self::validate(lock_key, holder_id, ttl_secs)?;
        // The single write lock makes check-and-insert atomic in-process
        let mut locks = self.locks.write().await;
        let now = Utc::now();

        if let Some(existing) = locks.get(lock_key) {
            if existing.expires_at > now && existing.holder_id != holder_id {
                return Ok(false);
            }
        }

        locks.insert(
            lock_key.to_string(),
            Lock {
                lock_key: lock_key.to_string(),
                holder_id: holder_id.to_string(),
                acquired_at: now,
                expires_at: now + Duration::seconds(ttl_secs),
            },
        );
        Ok(true)
    }

    async fn release(&self, lock_key: &str, holder_id: &str) -> LockResult<bool> {
        let mut locks = self.locks.write().await;
        match locks.get(lock_key) {
            Some(existing) if existing.holder_id == holder_id => {
                locks.remove(lock_key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn has_lock(&self, lock_key: &str) -> LockResult<bool> {
        let locks = self.locks.read().await;
        Ok(locks
            .get(lock_key)
            .map(|l| l.expires_at > Utc::now())
            .unwrap_or(false))
    }

    async fn get_lock(&self, lock_key: &str) -> LockResult<Option<Lock>> {
        let locks = self.locks.read().await;
        Ok(locks.get(lock_key).cloned())
    }

    async fn delete_expired(&self) -> LockResult<u64> {
        let mut locks = self.locks.write().await;
        let now = Utc::now();
        let before = locks.len();
        locks.retain(|_, l| l.expires_at > now);
        Ok((before - locks.len()) as u64)
    }
}
