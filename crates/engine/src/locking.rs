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

//! Engine-side lock coordination
//!
//! ## Purpose
//! Wraps a [`LockManager`] backend with the engine's key scheme and the
//! scoped-section helper. Lock keys are per account *and* per operation
//! (`workflow:<account_id>:<operation>`), so a pause request never contends
//! with step execution on a different account, and control operations do
//! not deadlock against each other.
//!
//! A failed acquisition is surfaced immediately as `LockUnavailable`; the
//! engine never retries acquisition internally. Callers own that decision.

use crate::error::{EngineError, EngineResult};
use std::future::Future;
use std::sync::Arc;
use stride_locks::LockManager;
use tracing::warn;
use ulid::Ulid;

/// Default TTL for step-execution locks.
pub const EXECUTE_LOCK_TTL_SECS: i64 = 120;

/// Default TTL for control operations (pause/resume/stop).
pub const CONTROL_LOCK_TTL_SECS: i64 = 30;

/// Lock operations the engine takes per account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOperation {
    Execute,
    Pause,
    Resume,
    Stop,
}

impl LockOperation {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Execute => "execute",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Stop => "stop",
        }
    }

    fn ttl_secs(&self) -> i64 {
        match self {
            Self::Execute => EXECUTE_LOCK_TTL_SECS,
            _ => CONTROL_LOCK_TTL_SECS,
        }
    }
}

/// Scoped lock keys and the run-under-lock helper.
pub struct LockService {
    manager: Arc<dyn LockManager>,
    holder_id: String,
}

impl LockService {
    pub fn new(manager: Arc<dyn LockManager>, holder_id: impl Into<String>) -> Self {
        Self {
            manager,
            holder_id: holder_id.into(),
        }
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// The lock key for an account/operation pair.
    pub fn key(account_id: &str, operation: LockOperation) -> String {
        format!("workflow:{}:{}", account_id, operation.as_str())
    }

    /// Run `f` while holding the operation lock for the account.
    ///
    /// Each section acquires under its own holder token (node id plus a
    /// fresh ulid). Backends treat a same-holder acquire as a refresh, so
    /// a shared per-process holder would let two concurrent sections in
    /// one process hold the same key; the per-section token makes the
    /// second section lose instead.
    ///
    /// The lock is released when `f` finishes, on success and on error
    /// alike. A release failure is logged but does not mask the result;
    /// the TTL bounds the damage of an unreleased lock.
    pub async fn with_lock<T, F, Fut>(
        &self,
        account_id: &str,
        operation: LockOperation,
        f: F,
    ) -> EngineResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        let key = Self::key(account_id, operation);
        let holder = format!("{}:{}", self.holder_id, Ulid::new());
        let acquired = self
            .manager
            .acquire(&key, &holder, operation.ttl_secs())
            .await?;
        if !acquired {
            return Err(EngineError::LockUnavailable(key));
        }

        let result = f().await;

        if let Err(e) = self.manager.release(&key, &holder).await {
            warn!(key = %key, error = %e, "failed to release lock");
        }
        result
    }

    /// Advisory GC of expired lock rows.
    pub async fn delete_expired(&self) -> EngineResult<u64> {
        Ok(self.manager.delete_expired().await?)
    }
}
