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

//! Periodic housekeeping
//!
//! ## Purpose
//! Removes rows no running workflow can ever touch again: terminal
//! instances past their retention, execution log entries past theirs, and
//! expired lock rows. Live and paused instances are never deleted here.
//!
//! Retention windows come from the config table so operators can tune them
//! without a deploy.

use crate::config::ConfigService;
use crate::error::EngineResult;
use crate::storage::EngineStorage;
use std::sync::Arc;
use stride_locks::LockManager;
use tracing::{info, instrument};

/// Default retention for terminal instances, in days.
pub const DEFAULT_INSTANCE_RETENTION_DAYS: i64 = 30;
/// Default retention for execution log entries, in days.
pub const DEFAULT_LOG_RETENTION_DAYS: i64 = 7;

/// Counts of rows removed by one cleanup sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub instances_deleted: u64,
    pub logs_deleted: u64,
    pub locks_deleted: u64,
}

pub struct CleanupService {
    storage: Arc<EngineStorage>,
    locks: Arc<dyn LockManager>,
    config: Arc<ConfigService>,
}

impl CleanupService {
    pub fn new(
        storage: Arc<EngineStorage>,
        locks: Arc<dyn LockManager>,
        config: Arc<ConfigService>,
    ) -> Self {
        Self {
            storage,
            locks,
            config,
        }
    }

    /// One sweep over all three retention targets. Safe to run on a timer.
    #[instrument(skip(self))]
    pub async fn run(&self) -> EngineResult<CleanupReport> {
        let instance_days = self
            .config
            .get_u64_or(
                "cleanup.instance_retention_days",
                DEFAULT_INSTANCE_RETENTION_DAYS as u64,
            )
            .await? as i64;
        let log_days = self
            .config
            .get_u64_or(
                "cleanup.log_retention_days",
                DEFAULT_LOG_RETENTION_DAYS as u64,
            )
            .await? as i64;

        let report = CleanupReport {
            instances_deleted: self.storage.delete_terminal_older_than(instance_days).await?,
            logs_deleted: self.storage.delete_logs_older_than(log_days).await?,
            locks_deleted: self.locks.delete_expired().await.map_err(crate::error::EngineError::from)?,
        };

        if report != CleanupReport::default() {
            info!(
                instances = report.instances_deleted,
                logs = report.logs_deleted,
                locks = report.locks_deleted,
                "cleanup sweep removed rows"
            );
        }
        Ok(report)
    }
}
