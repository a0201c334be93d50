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

//! Workflow executor
//!
//! ## Purpose
//! Single re-entry point for advancing workflows. `advance` runs under the
//! account's execute lock, loads the instance fresh from storage, performs
//! exactly the next step, persists the result, and schedules the following
//! trigger before releasing the lock. Nothing is kept in memory between
//! entries, so a crash at any point leaves a resumable row behind.
//!
//! ## Control flow
//! - `wait` and `goto` are handled inline: a wait persists progress and
//!   schedules a delayed trigger; a goto moves the step index (backward
//!   jumps are loop iterations, counted but never capped)
//! - side-effecting actions go through [`ExecutionService`]
//! - every step outcome lands in the execution log before the trigger for
//!   the next entry is scheduled

use crate::client::AccountStore;
use crate::config::{ConfigService, DEFAULT_WAIT_MAX_TIMEOUT_MS};
use crate::error::{EngineError, EngineResult};
use crate::execution::ExecutionService;
use crate::locking::{LockOperation, LockService};
use crate::metrics::MonitoringService;
use crate::scheduler::SchedulingService;
use crate::storage::{EngineStorage, InstanceUpdate};
use crate::types::{
    InstanceStatus, Step, StepAction, StepResult, WorkflowDefinition, WorkflowInstance,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

/// Heartbeat cadence for in-flight steps. Must stay well below the
/// recovery staleness lower bound so a live step is never mistaken for a
/// crashed one.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// What one `advance` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// No live instance, or the instance is not in an advanceable state
    Noop,
    /// A step executed and the next trigger is scheduled
    Advanced,
    /// A wait step scheduled a delayed re-entry
    Waiting { delay_ms: u64 },
    /// A retryable failure consumed budget and scheduled a backoff re-entry
    Retrying { backoff_ms: u64 },
    /// The instance reached COMPLETED
    Completed,
    /// The instance reached FAILED
    Failed,
}

/// Orchestrates workflow lifecycles for accounts.
pub struct WorkflowExecutor {
    storage: Arc<EngineStorage>,
    locks: Arc<LockService>,
    execution: Arc<ExecutionService>,
    scheduling: Arc<SchedulingService>,
    monitoring: Arc<MonitoringService>,
    config: Arc<ConfigService>,
    accounts: Arc<dyn AccountStore>,
}

impl WorkflowExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<EngineStorage>,
        locks: Arc<LockService>,
        execution: Arc<ExecutionService>,
        scheduling: Arc<SchedulingService>,
        monitoring: Arc<MonitoringService>,
        config: Arc<ConfigService>,
        accounts: Arc<dyn AccountStore>,
    ) -> Self {
        Self {
            storage,
            locks,
            execution,
            scheduling,
            monitoring,
            config,
            accounts,
        }
    }

    /// Start a workflow for an account.
    ///
    /// Creates a PENDING instance (the database rejects a second live one)
    /// and schedules the first advance. Runs under the execute lock so a
    /// racing start and advance cannot interleave.
    #[instrument(skip(self, context), fields(account_id = %account_id, workflow_type = %workflow_type))]
    pub async fn start_workflow(
        &self,
        account_id: &str,
        workflow_type: &str,
        context: Value,
    ) -> EngineResult<WorkflowInstance> {
        self.locks
            .with_lock(account_id, LockOperation::Execute, || async {
                // Fail before creating anything if the template is missing
                self.storage.get_definition(workflow_type).await?;

                let instance = self
                    .storage
                    .create_instance(account_id, workflow_type, context)
                    .await?;
                self.monitoring.record_workflow_started().await?;
                self.scheduling
                    .schedule_advance(account_id, 0, "start")
                    .await?;
                info!(instance_id = %instance.instance_id, "workflow started");
                Ok(instance)
            })
            .await
    }

    /// Advance the account's workflow by exactly one step.
    ///
    /// This is the only path that executes steps, whether entered from a
    /// start, a fired trigger, or recovery.
    #[instrument(skip(self), fields(account_id = %account_id))]
    pub async fn advance(&self, account_id: &str) -> EngineResult<AdvanceOutcome> {
        self.locks
            .with_lock(account_id, LockOperation::Execute, || async {
                self.advance_under_lock(account_id).await
            })
            .await
    }

    async fn advance_under_lock(&self, account_id: &str) -> EngineResult<AdvanceOutcome> {
        eprintln!("DBG: advance_under_lock enter");
        let Some(instance) = self.storage.get_live_by_account(account_id).await? else {
            return Ok(AdvanceOutcome::Noop);
        };
        if !instance.status.is_advanceable() {
            // Paused; a stale trigger firing here is a no-op
            return Ok(AdvanceOutcome::Noop);
        }

        eprintln!("DBG: got live instance");
        let definition = match self.storage.get_definition(&instance.workflow_type).await {
            Ok(def) => def,
            Err(EngineError::NotFound(_)) => {
                let message = format!(
                    "workflow definition '{}' no longer exists",
                    instance.workflow_type
                );
                self.fail_instance(&instance, instance.version, &message).await?;
                return Ok(AdvanceOutcome::Failed);
            }
            Err(e) => return Err(e),
        };

        let index = instance.current_step_index;
        if index >= definition.steps.len() {
            return self.complete_instance(&instance, instance.version).await;
        }
        let step = definition.steps[index].clone();

        // Mark the step in flight. The version bump fences out control
        // operations that loaded the instance before this point.
        self.storage
            .update_instance(
                &instance.instance_id,
                instance.version,
                InstanceUpdate {
                    status: InstanceStatus::Running,
                    current_step_index: index,
                    retry_count: instance.retry_count,
                    last_error: instance.last_error.clone(),
                    context: None,
                },
            )
            .await?;
        let running_version = instance.version + 1;
        eprintln!("DBG: marked running");

        match &step.action {
            StepAction::Wait => {
                self.handle_wait(&instance, &definition, &step, running_version)
                    .await
            }
            StepAction::Goto => {
                self.handle_goto(&instance, &definition, &step, running_version)
                    .await
            }
            _ => {
                let heartbeat = self.spawn_heartbeat(&instance.instance_id);
                eprintln!("DBG: heartbeat spawned, executing step");
                let result = self
                    .execution
                    .execute_step(&instance, &step, &definition.policy)
                    .await;
                heartbeat.abort();
                eprintln!("DBG: step landed");
                self.apply_step_result(&instance, &definition, &step, running_version, result)
                    .await
            }
        }
    }

    /// Periodically refresh the instance's activity timestamp while a
    /// vendor call is in flight. Aborted as soon as the step lands.
    fn spawn_heartbeat(&self, instance_id: &str) -> JoinHandle<()> {
        let storage = Arc::clone(&self.storage);
        let instance_id = instance_id.to_string();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(HEARTBEAT_INTERVAL).await;
                eprintln!("DBG: heartbeat tick");
                if let Err(e) = storage.touch_activity(&instance_id).await {
                    eprintln!("DBG: heartbeat touch failed: {e}");
                    warn!(instance_id = %instance_id, error = %e, "heartbeat failed");
                    break;
                }
            }
        })
    }

    async fn handle_wait(
        &self,
        instance: &WorkflowInstance,
        definition: &WorkflowDefinition,
        step: &Step,
        running_version: u64,
    ) -> EngineResult<AdvanceOutcome> {
        let Some(requested) = step.param_u64("duration_ms") else {
            return self
                .apply_step_result(
                    instance,
                    definition,
                    step,
                    running_version,
                    StepResult::fail(EngineError::Validation(format!(
                        "wait step '{}' is missing 'duration_ms'",
                        step.id
                    ))),
                )
                .await;
        };
        let cap = self
            .config
            .get_u64_or("wait.max_timeout_ms", DEFAULT_WAIT_MAX_TIMEOUT_MS)
            .await?;
        let delay_ms = requested.min(cap);

        self.storage
            .append_log(
                &instance.instance_id,
                &step.id,
                &step.action.to_string(),
                true,
                Some(&json!({"duration_ms": delay_ms})),
                None,
                false,
            )
            .await?;
        self.monitoring.record_step(true).await?;

        self.storage
            .update_instance(
                &instance.instance_id,
                running_version,
                InstanceUpdate {
                    status: InstanceStatus::Active,
                    current_step_index: instance.current_step_index + 1,
                    retry_count: instance.retry_count,
                    last_error: instance.last_error.clone(),
                    context: None,
                },
            )
            .await?;

        // The worker is free during the wait; only this trigger brings the
        // workflow back.
        self.scheduling
            .schedule_advance(&instance.account_id, delay_ms, "wait")
            .await?;
        Ok(AdvanceOutcome::Waiting { delay_ms })
    }

    async fn handle_goto(
        &self,
        instance: &WorkflowInstance,
        definition: &WorkflowDefinition,
        step: &Step,
        running_version: u64,
    ) -> EngineResult<AdvanceOutcome> {
        let target = step.param_str("next_step").map(str::to_string);
        let target_index = target
            .as_deref()
            .and_then(|t| definition.step_index(t));
        let Some(target_index) = target_index else {
            return self
                .apply_step_result(
                    instance,
                    definition,
                    step,
                    running_version,
                    StepResult::fail(EngineError::Validation(format!(
                        "goto step '{}' targets unknown step '{}'",
                        step.id,
                        target.as_deref().unwrap_or("<missing>")
                    ))),
                )
                .await;
        };

        // A backward jump is a loop iteration; loops are intentional and
        // unbounded, surfaced only through the counter.
        let loops = target_index <= instance.current_step_index;

        self.storage
            .append_log(
                &instance.instance_id,
                &step.id,
                &step.action.to_string(),
                true,
                Some(&json!({"target": target})),
                None,
                true,
            )
            .await?;
        self.monitoring.record_step(true).await?;
        if loops {
            self.monitoring.record_loop_iteration().await?;
        }

        self.storage
            .update_instance(
                &instance.instance_id,
                running_version,
                InstanceUpdate {
                    status: InstanceStatus::Active,
                    current_step_index: target_index,
                    retry_count: instance.retry_count,
                    last_error: instance.last_error.clone(),
                    context: None,
                },
            )
            .await?;
        self.scheduling
            .schedule_advance(&instance.account_id, 0, "goto")
            .await?;
        Ok(AdvanceOutcome::Advanced)
    }

    async fn apply_step_result(
        &self,
        instance: &WorkflowInstance,
        definition: &WorkflowDefinition,
        step: &Step,
        running_version: u64,
        result: StepResult,
    ) -> EngineResult<AdvanceOutcome> {
        let action = step.action.to_string();
        match result.error {
            None => {
                self.storage
                    .append_log(
                        &instance.instance_id,
                        &step.id,
                        &action,
                        true,
                        result.payload.as_ref(),
                        None,
                        false,
                    )
                    .await?;
                self.monitoring.record_step(true).await?;

                let next = instance.current_step_index + 1;
                if next >= definition.steps.len() {
                    return self.complete_instance(instance, running_version).await;
                }
                self.storage
                    .update_instance(
                        &instance.instance_id,
                        running_version,
                        InstanceUpdate {
                            status: InstanceStatus::Active,
                            current_step_index: next,
                            retry_count: instance.retry_count,
                            last_error: None,
                            context: None,
                        },
                    )
                    .await?;
                self.scheduling
                    .schedule_advance(&instance.account_id, 0, "step-complete")
                    .await?;
                Ok(AdvanceOutcome::Advanced)
            }
            Some(error) => {
                self.storage
                    .append_log(
                        &instance.instance_id,
                        &step.id,
                        &action,
                        false,
                        None,
                        Some(&error.to_string()),
                        false,
                    )
                    .await?;
                self.monitoring.record_step(false).await?;
                self.handle_step_failure(instance, definition, step, running_version, error)
                    .await
            }
        }
    }

    async fn handle_step_failure(
        &self,
        instance: &WorkflowInstance,
        definition: &WorkflowDefinition,
        step: &Step,
        running_version: u64,
        error: EngineError,
    ) -> EngineResult<AdvanceOutcome> {
        let message = error.to_string();

        if matches!(error, EngineError::AccountNotAlive(_)) {
            // Liveness failures never consume the retry budget: retrying
            // cannot revive the account.
            if step.critical {
                self.fail_instance(instance, running_version, &message).await?;
                return Ok(AdvanceOutcome::Failed);
            }
            // Non-critical: skip the step and move on
            warn!(
                instance_id = %instance.instance_id,
                step_id = %step.id,
                "account not alive, skipping non-critical step"
            );
            let next = instance.current_step_index + 1;
            if next >= definition.steps.len() {
                return self.complete_instance(instance, running_version).await;
            }
            self.storage
                .update_instance(
                    &instance.instance_id,
                    running_version,
                    InstanceUpdate {
                        status: InstanceStatus::Active,
                        current_step_index: next,
                        retry_count: instance.retry_count,
                        last_error: Some(message),
                        context: None,
                    },
                )
                .await?;
            self.scheduling
                .schedule_advance(&instance.account_id, 0, "skip-not-alive")
                .await?;
            return Ok(AdvanceOutcome::Advanced);
        }

        if !error.is_retryable() || step.critical {
            self.fail_instance(instance, running_version, &message).await?;
            return Ok(AdvanceOutcome::Failed);
        }

        let attempts = instance.retry_count + 1;
        if attempts > definition.policy.max_retries {
            let message = format!(
                "retry budget exhausted after {} attempts: {message}",
                instance.retry_count
            );
            self.fail_instance(instance, running_version, &message).await?;
            return Ok(AdvanceOutcome::Failed);
        }

        let backoff_ms = definition.policy.backoff_ms(attempts);
        self.storage
            .update_instance(
                &instance.instance_id,
                running_version,
                InstanceUpdate {
                    status: InstanceStatus::Active,
                    current_step_index: instance.current_step_index,
                    retry_count: attempts,
                    last_error: Some(message),
                    context: None,
                },
            )
            .await?;
        self.scheduling
            .schedule_advance(&instance.account_id, backoff_ms, "retry")
            .await?;
        Ok(AdvanceOutcome::Retrying { backoff_ms })
    }

    async fn complete_instance(
        &self,
        instance: &WorkflowInstance,
        expected_version: u64,
    ) -> EngineResult<AdvanceOutcome> {
        self.storage
            .update_instance(
                &instance.instance_id,
                expected_version,
                InstanceUpdate {
                    status: InstanceStatus::Completed,
                    current_step_index: instance.current_step_index,
                    retry_count: instance.retry_count,
                    last_error: None,
                    context: None,
                },
            )
            .await?;
        self.monitoring.record_workflow_completed().await?;
        info!(instance_id = %instance.instance_id, "workflow completed");
        Ok(AdvanceOutcome::Completed)
    }

    async fn fail_instance(
        &self,
        instance: &WorkflowInstance,
        expected_version: u64,
        message: &str,
    ) -> EngineResult<()> {
        self.storage
            .mark_failed(&instance.instance_id, expected_version, message)
            .await?;
        self.scheduling.cancel_advance(&instance.account_id).await?;
        warn!(instance_id = %instance.instance_id, error = %message, "workflow failed");
        Ok(())
    }

    /// Pause the account's live workflow.
    ///
    /// Runs under the pause lock, which is independent of the execute lock:
    /// a step that is mid-flight keeps running, and the pause is rejected
    /// with `ConcurrentUpdate` so the caller can retry after the step
    /// finishes. Pausing an already paused workflow is a no-op.
    #[instrument(skip(self), fields(account_id = %account_id))]
    pub async fn pause(&self, account_id: &str) -> EngineResult<WorkflowInstance> {
        self.locks
            .with_lock(account_id, LockOperation::Pause, || async {
                let instance = self
                    .storage
                    .get_live_by_account(account_id)
                    .await?
                    .ok_or_else(|| {
                        EngineError::NotFound(format!("no live workflow for '{account_id}'"))
                    })?;

                match instance.status {
                    InstanceStatus::Paused => Ok(instance),
                    InstanceStatus::Running => Err(EngineError::ConcurrentUpdate(format!(
                        "a step is in flight for '{account_id}', retry pause shortly"
                    ))),
                    _ => {
                        self.storage
                            .update_status(
                                &instance.instance_id,
                                instance.version,
                                InstanceStatus::Paused,
                                None,
                            )
                            .await?;
                        self.scheduling.cancel_advance(account_id).await?;
                        info!(instance_id = %instance.instance_id, "workflow paused");
                        self.storage.get_instance(&instance.instance_id).await
                    }
                }
            })
            .await
    }

    /// Resume a paused workflow.
    #[instrument(skip(self), fields(account_id = %account_id))]
    pub async fn resume(&self, account_id: &str) -> EngineResult<WorkflowInstance> {
        self.locks
            .with_lock(account_id, LockOperation::Resume, || async {
                let instance = self
                    .storage
                    .get_live_by_account(account_id)
                    .await?
                    .ok_or_else(|| {
                        EngineError::NotFound(format!("no live workflow for '{account_id}'"))
                    })?;

                if instance.status != InstanceStatus::Paused {
                    return Err(EngineError::Validation(format!(
                        "workflow for '{account_id}' is {} and cannot be resumed",
                        instance.status
                    )));
                }

                self.storage
                    .update_status(
                        &instance.instance_id,
                        instance.version,
                        InstanceStatus::Active,
                        None,
                    )
                    .await?;
                self.scheduling
                    .schedule_advance(account_id, 0, "resume")
                    .await?;
                info!(instance_id = %instance.instance_id, "workflow resumed");
                self.storage.get_instance(&instance.instance_id).await
            })
            .await
    }

    /// Stop the account's workflow.
    ///
    /// Idempotent: stopping an account with no workflow, or one already in
    /// a terminal state, succeeds without changes. `delete_data` purges the
    /// engine-held account record after stopping.
    #[instrument(skip(self), fields(account_id = %account_id, delete_data))]
    pub async fn stop(
        &self,
        account_id: &str,
        delete_data: bool,
    ) -> EngineResult<Option<WorkflowInstance>> {
        self.locks
            .with_lock(account_id, LockOperation::Stop, || async {
                let latest = self.storage.get_latest_by_account(account_id).await?;

                let stopped = match latest {
                    None => None,
                    Some(instance) if instance.status.is_terminal() => Some(instance),
                    Some(instance) => {
                        self.scheduling.cancel_advance(account_id).await?;
                        self.storage
                            .update_status(
                                &instance.instance_id,
                                instance.version,
                                InstanceStatus::Stopped,
                                None,
                            )
                            .await?;
                        info!(instance_id = %instance.instance_id, "workflow stopped");
                        Some(self.storage.get_instance(&instance.instance_id).await?)
                    }
                };

                if delete_data {
                    self.accounts.purge(account_id).await?;
                }
                Ok(stopped)
            })
            .await
    }

    /// Latest instance for an account, live or terminal. Lock-free read.
    pub async fn get_status(&self, account_id: &str) -> EngineResult<Option<WorkflowInstance>> {
        self.storage.get_latest_by_account(account_id).await
    }
}
