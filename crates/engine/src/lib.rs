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

//! # Stride Engine
//!
//! Durable workflow execution for externally managed accounts.
//!
//! ## Purpose
//! Runs multi-step lifecycle workflows (profile updates, engagement
//! campaigns, timed waits, loops) against accounts held by an external
//! vendor, surviving crashes and restarts at any point. All state lives in
//! SQLite; workers hold nothing that matters.
//!
//! ## Architecture
//! - [`storage::EngineStorage`] owns every table and the optimistic
//!   version CAS that serializes writers
//! - [`locking::LockService`] puts per-account, per-operation distributed
//!   locks (from `stride-locks`) around every mutation path
//! - [`executor::WorkflowExecutor`] advances workflows one step per
//!   lock-held entry and schedules its own re-entry triggers
//! - [`execution::ExecutionService`] performs the side-effecting vendor
//!   calls with per-action timeouts
//! - [`scheduler`] delivers one-shot triggers back into the executor
//! - [`recovery::RecoveryService`] re-arms workflows whose worker died
//! - [`cleanup::CleanupService`] enforces retention on terminal rows
//! - [`service::AutomationService`] is the facade callers embed
//!
//! ## Design Decisions
//! - One live workflow per account, enforced by a partial unique index
//! - Waits never block a worker; they persist and reschedule
//! - Step failures are classified before retrying: validation and
//!   dead-account failures never burn the retry budget
//!
//! ## Example
//! ```no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use stride_engine::config::ConfigService;
//! use stride_engine::execution::ExecutionService;
//! use stride_engine::executor::WorkflowExecutor;
//! use stride_engine::locking::LockService;
//! use stride_engine::memory::{MemoryAccountStore, MemoryTaskScheduler, MemoryVendorClient};
//! use stride_engine::metrics::MonitoringService;
//! use stride_engine::scheduler::SchedulingService;
//! use stride_engine::service::AutomationService;
//! use stride_engine::storage::EngineStorage;
//! use stride_locks::MemoryLockManager;
//!
//! # async fn run() -> stride_engine::error::EngineResult<()> {
//! let storage = Arc::new(EngineStorage::new_in_memory().await?);
//! let config = Arc::new(ConfigService::new(storage.clone()));
//! let locks = Arc::new(LockService::new(Arc::new(MemoryLockManager::new()), "node-1"));
//! let accounts = Arc::new(MemoryAccountStore::new());
//! let execution = Arc::new(ExecutionService::new(
//!     Arc::new(MemoryVendorClient::new()),
//!     accounts.clone(),
//!     config.clone(),
//! ));
//! let scheduling = Arc::new(SchedulingService::new(Arc::new(MemoryTaskScheduler::new())));
//! let monitoring = Arc::new(MonitoringService::new(storage.clone()));
//! let executor = Arc::new(WorkflowExecutor::new(
//!     storage.clone(), locks, execution, scheduling, monitoring.clone(),
//!     config, accounts,
//! ));
//! let service = AutomationService::new(storage, executor, monitoring);
//! let response = service
//!     .start_workflow("acct-1", "onboarding", json!({"model": "m1"}))
//!     .await;
//! assert!(response.success);
//! # Ok(())
//! # }
//! ```

pub mod cleanup;
pub mod client;
pub mod config;
pub mod error;
pub mod execution;
pub mod executor;
pub mod locking;
pub mod memory;
pub mod metrics;
pub mod recovery;
pub mod scheduler;
pub mod service;
pub mod storage;
pub mod types;

pub use error::{EngineError, EngineResult};
pub use executor::{AdvanceOutcome, WorkflowExecutor};
pub use service::{AutomationService, ServiceResponse};
pub use storage::EngineStorage;
pub use types::{
    InstanceStatus, Step, StepAction, WorkflowDefinition, WorkflowInstance,
};
