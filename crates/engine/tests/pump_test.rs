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

//! Real-time end-to-end test: workflows driven entirely by the tokio
//! scheduler and the advance pump, no manual trigger pumping.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use stride_engine::client::{AccountRecord, AccountStats};
use stride_engine::config::ConfigService;
use stride_engine::execution::ExecutionService;
use stride_engine::executor::WorkflowExecutor;
use stride_engine::locking::LockService;
use stride_engine::memory::{MemoryAccountStore, MemoryVendorClient};
use stride_engine::metrics::MonitoringService;
use stride_engine::scheduler::{spawn_advance_pump, SchedulingService, TokioTaskScheduler};
use stride_engine::storage::EngineStorage;
use stride_engine::types::{
    ExecutionPolicy, InstanceStatus, Step, StepAction, WorkflowDefinition,
};
use stride_locks::MemoryLockManager;
use tokio::sync::Notify;

async fn wait_for_status(
    storage: &EngineStorage,
    instance_id: &str,
    status: InstanceStatus,
) -> bool {
    for _ in 0..100 {
        if let Ok(instance) = storage.get_instance(instance_id).await {
            if instance.status == status {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_pump_drives_workflow_with_wait_to_completion() {
    let storage = Arc::new(EngineStorage::new_in_memory().await.unwrap());
    let config = Arc::new(ConfigService::new(storage.clone()));
    let vendor = Arc::new(MemoryVendorClient::new());
    let accounts = Arc::new(MemoryAccountStore::new());
    accounts
        .insert(AccountRecord {
            account_id: "acct-1".to_string(),
            model: Some("m1".to_string()),
            channel: Some("c1".to_string()),
            engagement_count: Some(2),
            stats: AccountStats::default(),
        })
        .await;

    let (scheduler, rx) = TokioTaskScheduler::new();
    let scheduler = Arc::new(scheduler);
    let scheduling = Arc::new(SchedulingService::new(scheduler.clone()));
    let monitoring = Arc::new(MonitoringService::new(storage.clone()));
    let executor = Arc::new(WorkflowExecutor::new(
        storage.clone(),
        Arc::new(LockService::new(
            Arc::new(MemoryLockManager::new()),
            "pump-node",
        )),
        Arc::new(ExecutionService::new(
            vendor.clone(),
            accounts.clone(),
            config.clone(),
        )),
        scheduling,
        monitoring,
        config,
        accounts,
    ));

    let shutdown = Arc::new(Notify::new());
    let pump = spawn_advance_pump(executor.clone(), rx, shutdown.clone());

    let definition = WorkflowDefinition {
        workflow_type: "timed".to_string(),
        name: "timed".to_string(),
        description: None,
        steps: vec![
            Step {
                id: "set-bio".to_string(),
                action: StepAction::UpdateBio,
                params: json!({"text": "hi"}),
                critical: false,
            },
            Step {
                id: "short-wait".to_string(),
                action: StepAction::Wait,
                params: json!({"duration_ms": 200}),
                critical: false,
            },
            Step {
                id: "campaign".to_string(),
                action: StepAction::RunEngagementCampaign,
                params: json!({}),
                critical: false,
            },
        ],
        policy: ExecutionPolicy::default(),
    };
    storage.save_definition(&definition).await.unwrap();

    let instance = executor
        .start_workflow("acct-1", "timed", json!({}))
        .await
        .unwrap();

    // Shortly after start the workflow should be parked behind the wait,
    // not completed: the wait defers real time
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mid = storage.get_instance(&instance.instance_id).await.unwrap();
    assert_ne!(mid.status, InstanceStatus::Completed);
    assert_eq!(vendor.calls_for("run-engagement-campaign").await, 0);

    assert!(wait_for_status(&storage, &instance.instance_id, InstanceStatus::Completed).await);
    assert_eq!(vendor.calls_for("update-bio").await, 1);
    assert_eq!(vendor.calls_for("run-engagement-campaign").await, 1);

    shutdown.notify_one();
    scheduler.abort_all().await;
    let _ = tokio::time::timeout(Duration::from_secs(1), pump).await;
}
