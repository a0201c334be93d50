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

//! Lock manager trait for distributed lock coordination.

use crate::LockResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A lock row as stored by a backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Lock {
    /// Resource key, e.g. `workflow:<account_id>:execute`
    pub lock_key: String,
    /// Identity of the process that holds the lock
    pub holder_id: String,
    /// When the lock was acquired (or last refreshed)
    pub acquired_at: DateTime<Utc>,
    /// When the lock stops being authoritative
    pub expires_at: DateTime<Utc>,
}

impl Lock {
    /// Whether the lock has passed its TTL.
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// Trait for distributed lock management.
///
/// ## Purpose
/// Provides atomic acquire/release for mutual exclusion across processes.
/// Locks carry a TTL so a crashed holder never blocks a key permanently.
///
/// ## Design
/// - **Acquire**: single atomic conditional write; succeeds when the key is
///   free, expired, or already held by the same holder (which refreshes the
///   TTL). Contention returns `Ok(false)`, never an error.
/// - **Release**: holder-scoped delete; releasing a key held by someone else
///   is a no-op returning `Ok(false)`.
/// - **Expiry**: expired rows are claimable immediately; `delete_expired` is
///   advisory garbage collection only and is never required for correctness.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Try to acquire `lock_key` for `holder_id` with the given TTL.
    ///
    /// ## Behavior
    /// - Key absent: lock is created, returns `Ok(true)`
    /// - Key expired: lock is taken over, returns `Ok(true)`
    /// - Key held by `holder_id`: TTL is refreshed, returns `Ok(true)`
    /// - Key held by another live holder: returns `Ok(false)`
    async fn acquire(&self, lock_key: &str, holder_id: &str, ttl_secs: i64) -> LockResult<bool>;

    /// Release `lock_key` if currently held by `holder_id`.
    ///
    /// Returns `Ok(true)` when a lock row was removed, `Ok(false)` when the
    /// key was absent or held by a different holder.
    async fn release(&self, lock_key: &str, holder_id: &str) -> LockResult<bool>;

    /// Whether `lock_key` is currently held by a live (unexpired) holder.
    async fn has_lock(&self, lock_key: &str) -> LockResult<bool>;

    /// Get current lock state (non-blocking). Expired rows are still
    /// returned; callers can inspect `expires_at`.
    async fn get_lock(&self, lock_key: &str) -> LockResult<Option<Lock>>;

    /// Delete all expired lock rows, returning the number removed.
    async fn delete_expired(&self) -> LockResult<u64>;
}
