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

//! Crash recovery
//!
//! ## Purpose
//! Finds workflows that stopped making progress, validates that they can
//! still run, and schedules them back through the normal advance path. No
//! step logic lives here: recovery only re-arms the trigger that a crashed
//! worker failed to schedule.
//!
//! ## Staleness window
//! An instance is a candidate when it is in a live, non-paused state and
//! its `last_activity_at` is older than `recovery.min_age_secs` but younger
//! than `recovery.max_age_secs`. The lower bound avoids touching workflows
//! that are merely in a long wait; the upper bound leaves ancient rows for
//! cleanup rather than reviving them.

use crate::client::AccountStore;
use crate::config::ConfigService;
use crate::error::{EngineError, EngineResult};
use crate::scheduler::SchedulingService;
use crate::storage::{EngineStorage, InstanceUpdate};
use crate::types::{InstanceStatus, WorkflowInstance};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Default lower bound of the staleness window, in seconds.
pub const DEFAULT_MIN_STALE_SECS: i64 = 600;
/// Default upper bound of the staleness window, in seconds.
pub const DEFAULT_MAX_STALE_SECS: i64 = 86_400;
/// Instances handled per batch before pausing.
const RECOVERY_BATCH_SIZE: usize = 10;
/// Pause between batches so a large backlog does not thundering-herd the
/// scheduler.
const RECOVERY_BATCH_PAUSE: Duration = Duration::from_secs(2);

/// What recovery decided for one stale instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Re-queued through the advance path
    Rescheduled,
    /// Permanently parked as UNRECOVERABLE with the given reason
    Unrecoverable(String),
    /// Retry budget already spent, marked FAILED
    Exhausted,
    /// A live owner updated the row first, left alone
    Skipped,
}

#[derive(Debug, Clone)]
pub struct RecoveryOutcome {
    pub instance_id: String,
    pub account_id: String,
    pub action: RecoveryAction,
}

/// Scans for stale instances and routes them back into execution.
pub struct RecoveryService {
    storage: Arc<EngineStorage>,
    accounts: Arc<dyn AccountStore>,
    scheduling: Arc<SchedulingService>,
    config: Arc<ConfigService>,
}

impl RecoveryService {
    pub fn new(
        storage: Arc<EngineStorage>,
        accounts: Arc<dyn AccountStore>,
        scheduling: Arc<SchedulingService>,
        config: Arc<ConfigService>,
    ) -> Self {
        Self {
            storage,
            accounts,
            scheduling,
            config,
        }
    }

    /// One full recovery sweep. Safe to run on a timer alongside live
    /// traffic: every mutation goes through the version CAS, so a worker
    /// that is actually still running the instance wins.
    #[instrument(skip(self))]
    pub async fn recover_stale(&self) -> EngineResult<Vec<RecoveryOutcome>> {
        let min_age = self
            .config
            .get_u64_or("recovery.min_age_secs", DEFAULT_MIN_STALE_SECS as u64)
            .await? as i64;
        let max_age = self
            .config
            .get_u64_or("recovery.max_age_secs", DEFAULT_MAX_STALE_SECS as u64)
            .await? as i64;

        let stale = self.storage.list_stale_instances(min_age, max_age).await?;
        if stale.is_empty() {
            return Ok(Vec::new());
        }
        info!(count = stale.len(), "recovering stale workflows");

        let mut outcomes = Vec::with_capacity(stale.len());
        for (i, instance) in stale.iter().enumerate() {
            if i > 0 && i % RECOVERY_BATCH_SIZE == 0 {
                tokio::time::sleep(RECOVERY_BATCH_PAUSE).await;
            }
            let action = self.recover_one(instance).await?;
            outcomes.push(RecoveryOutcome {
                instance_id: instance.instance_id.clone(),
                account_id: instance.account_id.clone(),
                action,
            });
        }
        Ok(outcomes)
    }

    async fn recover_one(&self, instance: &WorkflowInstance) -> EngineResult<RecoveryAction> {
        if let Some(reason) = self.validation_failure(instance).await? {
            warn!(
                instance_id = %instance.instance_id,
                reason = %reason,
                "stale workflow cannot be recovered"
            );
            return match self
                .mark_terminal(instance, InstanceStatus::Unrecoverable, reason.clone())
                .await?
            {
                true => Ok(RecoveryAction::Unrecoverable(reason)),
                false => Ok(RecoveryAction::Skipped),
            };
        }

        let policy = self
            .storage
            .get_definition(&instance.workflow_type)
            .await?
            .policy;
        if instance.retry_count >= policy.max_retries {
            let reason = "retry budget exhausted during recovery".to_string();
            return match self
                .mark_terminal(instance, InstanceStatus::Failed, reason)
                .await?
            {
                true => Ok(RecoveryAction::Exhausted),
                false => Ok(RecoveryAction::Skipped),
            };
        }

        // Drop any trigger a half-dead worker may have left, mark the row,
        // then re-enter through the normal path.
        self.scheduling.cancel_advance(&instance.account_id).await?;
        if !self.mark_recovering(instance).await? {
            return Ok(RecoveryAction::Skipped);
        }
        self.scheduling
            .schedule_advance(&instance.account_id, 0, "recovery")
            .await?;
        info!(instance_id = %instance.instance_id, "stale workflow rescheduled");
        Ok(RecoveryAction::Rescheduled)
    }

    /// Reasons an instance can never run again, or `None` if it is viable.
    async fn validation_failure(
        &self,
        instance: &WorkflowInstance,
    ) -> EngineResult<Option<String>> {
        if self.accounts.load(&instance.account_id).await?.is_none() {
            return Ok(Some(format!(
                "account record '{}' no longer exists",
                instance.account_id
            )));
        }
        match self.storage.get_definition(&instance.workflow_type).await {
            Ok(_) => {}
            Err(EngineError::NotFound(_)) => {
                return Ok(Some(format!(
                    "workflow definition '{}' no longer exists",
                    instance.workflow_type
                )));
            }
            Err(e) => return Err(e),
        }
        if instance.context == Value::Null {
            return Ok(Some("execution context is missing".to_string()));
        }
        Ok(None)
    }

    /// Park the instance in a terminal state with the reason recorded.
    async fn mark_terminal(
        &self,
        instance: &WorkflowInstance,
        status: InstanceStatus,
        reason: String,
    ) -> EngineResult<bool> {
        self.cas(
            instance,
            InstanceUpdate {
                status,
                current_step_index: instance.current_step_index,
                retry_count: instance.retry_count,
                last_error: Some(reason),
                context: None,
            },
        )
        .await
    }

    /// Move the instance into RECOVERING and charge one retry against its
    /// budget, keeping whatever error the crashed run left behind.
    async fn mark_recovering(&self, instance: &WorkflowInstance) -> EngineResult<bool> {
        self.cas(
            instance,
            InstanceUpdate {
                status: InstanceStatus::Recovering,
                current_step_index: instance.current_step_index,
                retry_count: instance.retry_count + 1,
                last_error: instance.last_error.clone(),
                context: None,
            },
        )
        .await
    }

    /// Returns `false` when the version moved underneath us, which means a
    /// live owner got there first.
    async fn cas(&self, instance: &WorkflowInstance, update: InstanceUpdate) -> EngineResult<bool> {
        let result = self
            .storage
            .update_instance(&instance.instance_id, instance.version, update)
            .await;
        match result {
            Ok(()) => Ok(true),
            Err(EngineError::ConcurrentUpdate(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
