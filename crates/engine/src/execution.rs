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

//! Side-effecting step execution
//!
//! ## Purpose
//! Executes the vendor-facing actions of a workflow step: liveness check,
//! parameter resolution, the vendor call under a timeout, and post-call
//! bookkeeping (engagement counters). Control-flow actions (wait, goto)
//! never reach this service; the executor handles those itself.
//!
//! ## Parameter precedence
//! Explicit step params win over the instance context, which wins over the
//! persisted account record, which wins over engine defaults.

use crate::client::{AccountRecord, AccountStats, AccountStore, VendorClient};
use crate::config::ConfigService;
use crate::error::{EngineError, EngineResult};
use crate::types::{ExecutionPolicy, Step, StepAction, StepResult, WorkflowInstance};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// Default engagement campaign size when nothing else specifies one.
const DEFAULT_ENGAGEMENT_COUNT: u64 = 50;

/// Executes vendor-facing actions for the workflow executor.
pub struct ExecutionService {
    vendor: Arc<dyn VendorClient>,
    accounts: Arc<dyn AccountStore>,
    config: Arc<ConfigService>,
}

impl ExecutionService {
    pub fn new(
        vendor: Arc<dyn VendorClient>,
        accounts: Arc<dyn AccountStore>,
        config: Arc<ConfigService>,
    ) -> Self {
        Self {
            vendor,
            accounts,
            config,
        }
    }

    /// Execute one side-effecting step for an instance.
    ///
    /// The liveness check runs before anything else; a dead account fails
    /// the step as `AccountNotAlive` without touching the vendor, which the
    /// executor treats as non-retryable.
    #[instrument(skip(self, instance, step, policy), fields(account_id = %instance.account_id, step_id = %step.id, action = %step.action))]
    pub async fn execute_step(
        &self,
        instance: &WorkflowInstance,
        step: &Step,
        policy: &ExecutionPolicy,
    ) -> StepResult {
        match self.run(instance, step, policy).await {
            Ok(payload) => StepResult::ok(payload),
            Err(e) => StepResult::fail(e),
        }
    }

    async fn run(
        &self,
        instance: &WorkflowInstance,
        step: &Step,
        policy: &ExecutionPolicy,
    ) -> EngineResult<Option<Value>> {
        let account_id = instance.account_id.as_str();
        eprintln!("DBG: execute_step run enter");

        match self.vendor.is_alive(account_id).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(EngineError::AccountNotAlive(account_id.to_string()));
            }
            Err(e) => {
                return Err(EngineError::VendorCall(format!("liveness check: {e}")));
            }
        }

        let account = self
            .accounts
            .load(account_id)
            .await?
            .ok_or_else(|| EngineError::Validation(format!("account record missing: {account_id}")))?;

        eprintln!("DBG: liveness+account ok, resolving timeout");
        let timeout = self.config.step_timeout(policy, step).await?;
        eprintln!("DBG: dispatching step, timeout={:?}", timeout);

        match &step.action {
            StepAction::UpdateBio => self.update_bio(account_id, step, timeout).await,
            StepAction::UpdatePrompt => {
                self.update_prompt(account_id, step, instance, &account, timeout).await
            }
            StepAction::RunEngagementCampaign => {
                self.run_engagement(account_id, step, instance, &account, timeout).await
            }
            other => Err(EngineError::Validation(format!(
                "unsupported action '{other}' in step '{}'",
                step.id
            ))),
        }
    }

    async fn update_bio(
        &self,
        account_id: &str,
        step: &Step,
        timeout: Duration,
    ) -> EngineResult<Option<Value>> {
        let text = step.param_str("text");
        let update = Self::bounded(timeout, self.vendor.update_bio(account_id, text)).await??;
        Ok(Some(serde_json::to_value(update)?))
    }

    async fn update_prompt(
        &self,
        account_id: &str,
        step: &Step,
        instance: &WorkflowInstance,
        account: &AccountRecord,
        timeout: Duration,
    ) -> EngineResult<Option<Value>> {
        let model = Self::resolve_str(step, instance, "model", account.model.as_deref())
            .ok_or_else(|| {
                EngineError::Validation(format!("step '{}': model is required", step.id))
            })?;
        let channel = Self::resolve_str(step, instance, "channel", account.channel.as_deref())
            .ok_or_else(|| {
                EngineError::Validation(format!("step '{}': channel is required", step.id))
            })?;

        let update = Self::bounded(
            timeout,
            self.vendor.update_prompt(account_id, &model, &channel),
        )
        .await??;
        Ok(Some(serde_json::to_value(update)?))
    }

    async fn run_engagement(
        &self,
        account_id: &str,
        step: &Step,
        instance: &WorkflowInstance,
        account: &AccountRecord,
        timeout: Duration,
    ) -> EngineResult<Option<Value>> {
        let count = match step.param_u64("count") {
            Some(c) => c,
            None => match instance.context.get("engagement_count").and_then(Value::as_u64) {
                Some(c) => c,
                None => match account.engagement_count {
                    Some(c) => c,
                    None => {
                        self.config
                            .get_u64_or("engagement.default_count", DEFAULT_ENGAGEMENT_COUNT)
                            .await?
                    }
                },
            },
        };

        let outcome = Self::bounded(
            timeout,
            self.vendor.run_engagement_campaign(account_id, count),
        )
        .await??;

        // Campaign results feed the account's cumulative counters
        self.accounts
            .add_stats(
                account_id,
                AccountStats {
                    swipes: outcome.swipes,
                    matches: outcome.matches,
                },
            )
            .await?;

        Ok(Some(json!({
            "task_id": outcome.task_id,
            "swipes": outcome.swipes,
            "matches": outcome.matches,
        })))
    }

    fn resolve_str(
        step: &Step,
        instance: &WorkflowInstance,
        key: &str,
        account_value: Option<&str>,
    ) -> Option<String> {
        step.param_str(key)
            .map(str::to_string)
            .or_else(|| {
                instance
                    .context
                    .get(key)
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .or_else(|| account_value.map(str::to_string))
    }

    async fn bounded<T>(
        timeout: Duration,
        fut: impl std::future::Future<Output = EngineResult<T>>,
    ) -> EngineResult<EngineResult<T>> {
        tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| EngineError::Timeout(timeout.as_millis() as u64))
    }
}
