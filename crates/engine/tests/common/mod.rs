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

//! Shared wiring for integration tests.
//!
//! Uses the in-memory vendor, account store, and a recording task scheduler
//! so tests control re-entry themselves instead of waiting on real timers.

#![allow(dead_code)]

use serde_json::{json, Value};
use std::sync::Arc;
use stride_engine::client::{AccountRecord, AccountStats};
use stride_engine::config::ConfigService;
use stride_engine::error::EngineResult;
use stride_engine::execution::ExecutionService;
use stride_engine::executor::{AdvanceOutcome, WorkflowExecutor};
use stride_engine::locking::LockService;
use stride_engine::memory::{MemoryAccountStore, MemoryTaskScheduler, MemoryVendorClient};
use stride_engine::metrics::MonitoringService;
use stride_engine::scheduler::{advance_key, SchedulingService};
use stride_engine::service::AutomationService;
use stride_engine::storage::EngineStorage;
use stride_engine::types::{ExecutionPolicy, Step, StepAction, WorkflowDefinition};
use stride_locks::MemoryLockManager;

pub struct Harness {
    pub storage: Arc<EngineStorage>,
    pub vendor: Arc<MemoryVendorClient>,
    pub accounts: Arc<MemoryAccountStore>,
    pub tasks: Arc<MemoryTaskScheduler>,
    pub config: Arc<ConfigService>,
    pub monitoring: Arc<MonitoringService>,
    pub scheduling: Arc<SchedulingService>,
    pub executor: Arc<WorkflowExecutor>,
    pub service: AutomationService,
}

impl Harness {
    pub async fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let storage = Arc::new(
            EngineStorage::new_in_memory()
                .await
                .unwrap_or_else(|e| panic!("storage init failed: {e}")),
        );
        let config = Arc::new(ConfigService::new(storage.clone()));
        let vendor = Arc::new(MemoryVendorClient::new());
        let accounts = Arc::new(MemoryAccountStore::new());
        let tasks = Arc::new(MemoryTaskScheduler::new());
        let locks = Arc::new(LockService::new(
            Arc::new(MemoryLockManager::new()),
            "test-node",
        ));
        let execution = Arc::new(ExecutionService::new(
            vendor.clone(),
            accounts.clone(),
            config.clone(),
        ));
        let scheduling = Arc::new(SchedulingService::new(tasks.clone()));
        let monitoring = Arc::new(MonitoringService::new(storage.clone()));
        let executor = Arc::new(WorkflowExecutor::new(
            storage.clone(),
            locks,
            execution,
            scheduling.clone(),
            monitoring.clone(),
            config.clone(),
            accounts.clone(),
        ));
        let service = AutomationService::new(storage.clone(), executor.clone(), monitoring.clone());

        Self {
            storage,
            vendor,
            accounts,
            tasks,
            config,
            monitoring,
            scheduling,
            executor,
            service,
        }
    }

    pub async fn seed_account(&self, account_id: &str) {
        self.accounts
            .insert(AccountRecord {
                account_id: account_id.to_string(),
                model: Some("m1".to_string()),
                channel: Some("c1".to_string()),
                engagement_count: Some(10),
                stats: AccountStats::default(),
            })
            .await;
    }

    /// Pump pending re-entry triggers for an account until none remain.
    ///
    /// Delays are ignored; this drains the workflow as fast as the store
    /// allows. Bounded so a looping definition cannot hang a test.
    pub async fn drive(&self, account_id: &str) -> EngineResult<Vec<AdvanceOutcome>> {
        let mut outcomes = Vec::new();
        for _ in 0..64 {
            if self.tasks.take(&advance_key(account_id)).await.is_none() {
                break;
            }
            outcomes.push(self.executor.advance(account_id).await?);
        }
        Ok(outcomes)
    }

    /// Fire at most `n` pending triggers for an account.
    pub async fn drive_n(&self, account_id: &str, n: usize) -> EngineResult<Vec<AdvanceOutcome>> {
        let mut outcomes = Vec::new();
        for _ in 0..n {
            if self.tasks.take(&advance_key(account_id)).await.is_none() {
                break;
            }
            outcomes.push(self.executor.advance(account_id).await?);
        }
        Ok(outcomes)
    }
}

pub fn step(id: &str, action: StepAction, params: Value) -> Step {
    Step {
        id: id.to_string(),
        action,
        params,
        critical: false,
    }
}

pub fn critical_step(id: &str, action: StepAction, params: Value) -> Step {
    Step {
        id: id.to_string(),
        action,
        params,
        critical: true,
    }
}

pub fn definition(workflow_type: &str, steps: Vec<Step>) -> WorkflowDefinition {
    WorkflowDefinition {
        workflow_type: workflow_type.to_string(),
        name: workflow_type.to_string(),
        description: None,
        steps,
        policy: ExecutionPolicy::default(),
    }
}

/// A three-step onboarding flow: bio, prompt, engagement.
pub fn onboarding_definition() -> WorkflowDefinition {
    definition(
        "onboarding",
        vec![
            step("set-bio", StepAction::UpdateBio, json!({"text": "hello"})),
            step("set-prompt", StepAction::UpdatePrompt, json!({})),
            step(
                "first-campaign",
                StepAction::RunEngagementCampaign,
                json!({"count": 5}),
            ),
        ],
    )
}
