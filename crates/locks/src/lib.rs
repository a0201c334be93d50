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

//! # Stride Distributed Locks
//!
//! ## Purpose
//! Provides distributed lock coordination for workflow execution. Every lock
//! is a row keyed by `lock_key` with a holder identity and a TTL; acquisition
//! is a single atomic statement so that two processes racing for the same key
//! can never both win, even across process boundaries.
//!
//! ## Architecture Context
//! This crate is used internally by:
//! - **Workflow Executor**: per-account, per-operation mutual exclusion so
//!   that only one holder advances, pauses, resumes, or stops a workflow at
//!   a time
//! - **Cleanup**: garbage collection of expired lock rows
//!
//! ## Design Decisions
//! - **Single-statement acquisition**: no read-then-write window; the insert
//!   and the takeover-of-expired-lock are one conditional upsert
//! - **TTL-based expiration**: an expired lock is claimable by any holder, so
//!   a crashed process can never wedge a key forever
//! - **Holder-scoped release**: release succeeds only for the current holder;
//!   a stale holder releasing after expiry cannot drop someone else's lock
//! - **Contention is not an error**: `acquire` returns `Ok(false)` when the
//!   key is held; callers decide whether to retry or fail fast
//!
//! ## Backend Support
//!
//! - **InMemory**: HashMap-based (always available, for testing)
//! - **SQLite**: Persistent, survives restarts (feature: `sqlite-backend`)
//!
//! ## Examples
//!
//! ### Basic Usage
//! ```rust,no_run
//! use stride_locks::{LockManager, memory::MemoryLockManager};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = MemoryLockManager::new();
//!
//! // Acquire lock for 30 seconds
//! let acquired = manager.acquire("workflow:acct-1:execute", "node-1", 30).await?;
//! assert!(acquired);
//!
//! // Contending holder does not get it
//! let contended = manager.acquire("workflow:acct-1:execute", "node-2", 30).await?;
//! assert!(!contended);
//!
//! // Release (holder-scoped)
//! let released = manager.release("workflow:acct-1:execute", "node-1").await?;
//! assert!(released);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod manager;

#[cfg(feature = "memory-backend")]
pub mod memory;

#[cfg(feature = "sqlite-backend")]
pub mod sql;

pub use error::{LockError, LockResult};
pub use manager::{Lock, LockManager};

#[cfg(feature = "memory-backend")]
pub use memory::MemoryLockManager;

#[cfg(feature = "sqlite-backend")]
pub use sql::SqliteLockManager;
