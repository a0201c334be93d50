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

//! End-to-end workflow lifecycle tests: start, step execution, retries,
//! failure classification, pause/resume, and stop.

mod common;

use common::{critical_step, definition, onboarding_definition, step, Harness};
use serde_json::json;
use stride_engine::error::EngineError;
use stride_engine::executor::AdvanceOutcome;
use stride_engine::types::{InstanceStatus, StepAction};

#[tokio::test]
async fn test_workflow_runs_to_completion() {
    let h = Harness::new().await;
    h.seed_account("acct-1").await;
    h.storage
        .save_definition(&onboarding_definition())
        .await
        .unwrap();

    let instance = h
        .executor
        .start_workflow("acct-1", "onboarding", json!({}))
        .await
        .unwrap();
    assert_eq!(instance.status, InstanceStatus::Pending);

    let outcomes = h.drive("acct-1").await.unwrap();
    assert_eq!(outcomes.last(), Some(&AdvanceOutcome::Completed));

    let done = h.storage.get_instance(&instance.instance_id).await.unwrap();
    assert_eq!(done.status, InstanceStatus::Completed);
    assert!(done.completed_at.is_some());
    assert!(done.last_error.is_none());

    let logs = h.storage.list_logs(&instance.instance_id).await.unwrap();
    assert_eq!(logs.len(), 3);
    assert!(logs.iter().all(|l| l.success));
    assert_eq!(logs[0].step_id, "set-bio");
    assert_eq!(logs[2].step_id, "first-campaign");

    // The campaign outcome fed back into the account record
    let record = h.accounts.get("acct-1").await.unwrap();
    assert_eq!(record.stats.swipes, 5);

    let stats = h.monitoring.stats().await.unwrap();
    assert_eq!(stats.workflows_started, 1);
    assert_eq!(stats.workflows_completed, 1);
    assert_eq!(stats.steps_executed, 3);
    assert_eq!(stats.steps_failed, 0);
}

#[tokio::test]
async fn test_second_live_workflow_rejected() {
    let h = Harness::new().await;
    h.seed_account("acct-1").await;
    h.storage
        .save_definition(&onboarding_definition())
        .await
        .unwrap();

    h.executor
        .start_workflow("acct-1", "onboarding", json!({}))
        .await
        .unwrap();

    let err = h
        .executor
        .start_workflow("acct-1", "onboarding", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    // Other accounts are unaffected
    h.seed_account("acct-2").await;
    h.executor
        .start_workflow("acct-2", "onboarding", json!({}))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_start_requires_known_definition() {
    let h = Harness::new().await;
    h.seed_account("acct-1").await;

    let err = h
        .executor
        .start_workflow("acct-1", "nonexistent", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
    assert!(h.storage.get_live_by_account("acct-1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_critical_step_failure_fails_workflow() {
    let h = Harness::new().await;
    h.seed_account("acct-1").await;
    h.vendor.fail_action("update-bio", true).await;

    let def = definition(
        "bio-only",
        vec![critical_step(
            "set-bio",
            StepAction::UpdateBio,
            json!({"text": "x"}),
        )],
    );
    h.storage.save_definition(&def).await.unwrap();

    let instance = h
        .executor
        .start_workflow("acct-1", "bio-only", json!({}))
        .await
        .unwrap();
    let outcomes = h.drive("acct-1").await.unwrap();
    assert_eq!(outcomes.last(), Some(&AdvanceOutcome::Failed));

    let failed = h.storage.get_instance(&instance.instance_id).await.unwrap();
    assert_eq!(failed.status, InstanceStatus::Failed);
    assert!(failed.last_error.as_deref().unwrap().contains("scripted failure"));
    assert_eq!(failed.retry_count, 0);

    let logs = h.storage.list_logs(&instance.instance_id).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert!(!logs[0].success);
}

#[tokio::test]
async fn test_dead_account_skips_non_critical_steps() {
    let h = Harness::new().await;
    h.seed_account("acct-1").await;
    h.vendor.set_alive("acct-1", false).await;
    h.storage
        .save_definition(&onboarding_definition())
        .await
        .unwrap();

    let instance = h
        .executor
        .start_workflow("acct-1", "onboarding", json!({}))
        .await
        .unwrap();
    let outcomes = h.drive("acct-1").await.unwrap();
    assert_eq!(outcomes.last(), Some(&AdvanceOutcome::Completed));

    // No vendor action ever ran and no retry budget was spent
    assert_eq!(h.vendor.calls_for("update-bio").await, 0);
    assert_eq!(h.vendor.calls_for("run-engagement-campaign").await, 0);
    let done = h.storage.get_instance(&instance.instance_id).await.unwrap();
    assert_eq!(done.retry_count, 0);
}

#[tokio::test]
async fn test_dead_account_fails_critical_step() {
    let h = Harness::new().await;
    h.seed_account("acct-1").await;
    h.vendor.set_alive("acct-1", false).await;

    let def = definition(
        "bio-only",
        vec![critical_step(
            "set-bio",
            StepAction::UpdateBio,
            json!({"text": "x"}),
        )],
    );
    h.storage.save_definition(&def).await.unwrap();

    h.executor
        .start_workflow("acct-1", "bio-only", json!({}))
        .await
        .unwrap();
    let outcomes = h.drive("acct-1").await.unwrap();
    assert_eq!(outcomes.last(), Some(&AdvanceOutcome::Failed));
}

#[tokio::test]
async fn test_retry_budget_exhaustion_fails_workflow() {
    let h = Harness::new().await;
    h.seed_account("acct-1").await;
    h.vendor.fail_action("update-prompt", true).await;

    let mut def = definition(
        "prompt-only",
        vec![step("set-prompt", StepAction::UpdatePrompt, json!({}))],
    );
    def.policy.max_retries = 2;
    h.storage.save_definition(&def).await.unwrap();

    let instance = h
        .executor
        .start_workflow("acct-1", "prompt-only", json!({}))
        .await
        .unwrap();
    let outcomes = h.drive("acct-1").await.unwrap();
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| matches!(o, AdvanceOutcome::Retrying { .. }))
            .count(),
        2
    );
    assert_eq!(outcomes.last(), Some(&AdvanceOutcome::Failed));

    let failed = h.storage.get_instance(&instance.instance_id).await.unwrap();
    assert_eq!(failed.status, InstanceStatus::Failed);
    assert_eq!(failed.retry_count, 2);
    assert!(failed
        .last_error
        .as_deref()
        .unwrap()
        .contains("retry budget exhausted"));

    // Initial attempt plus two retries plus the final failing attempt
    assert_eq!(h.vendor.calls_for("update-prompt").await, 3);
}

#[tokio::test]
async fn test_retry_backoff_grows() {
    let h = Harness::new().await;
    h.seed_account("acct-1").await;
    h.vendor.fail_action("update-bio", true).await;

    let mut def = definition(
        "bio-only",
        vec![step("set-bio", StepAction::UpdateBio, json!({"text": "x"}))],
    );
    def.policy.max_retries = 3;
    def.policy.retry_backoff_ms = 1_000;
    def.policy.backoff_multiplier = 2.0;
    h.storage.save_definition(&def).await.unwrap();

    h.executor
        .start_workflow("acct-1", "bio-only", json!({}))
        .await
        .unwrap();
    let outcomes = h.drive("acct-1").await.unwrap();

    let backoffs: Vec<u64> = outcomes
        .iter()
        .filter_map(|o| match o {
            AdvanceOutcome::Retrying { backoff_ms } => Some(*backoff_ms),
            _ => None,
        })
        .collect();
    assert_eq!(backoffs, vec![1_000, 2_000, 4_000]);
}

#[tokio::test]
async fn test_validation_failure_is_not_retried() {
    let h = Harness::new().await;
    // Account record present but with no model/channel defaults
    h.accounts
        .insert(stride_engine::client::AccountRecord {
            account_id: "acct-1".to_string(),
            model: None,
            channel: None,
            engagement_count: None,
            stats: Default::default(),
        })
        .await;

    let def = definition(
        "prompt-only",
        vec![step("set-prompt", StepAction::UpdatePrompt, json!({}))],
    );
    h.storage.save_definition(&def).await.unwrap();

    let instance = h
        .executor
        .start_workflow("acct-1", "prompt-only", json!({}))
        .await
        .unwrap();
    let outcomes = h.drive("acct-1").await.unwrap();
    assert_eq!(outcomes, vec![AdvanceOutcome::Failed]);

    let failed = h.storage.get_instance(&instance.instance_id).await.unwrap();
    assert_eq!(failed.retry_count, 0);
    assert!(failed.last_error.as_deref().unwrap().contains("model"));
}

#[tokio::test]
async fn test_pause_and_resume() {
    let h = Harness::new().await;
    h.seed_account("acct-1").await;
    h.storage
        .save_definition(&onboarding_definition())
        .await
        .unwrap();

    let instance = h
        .executor
        .start_workflow("acct-1", "onboarding", json!({}))
        .await
        .unwrap();
    // Run only the first step, then pause while a trigger is pending
    h.drive_n("acct-1", 1).await.unwrap();

    let paused = h.executor.pause("acct-1").await.unwrap();
    assert_eq!(paused.status, InstanceStatus::Paused);
    assert!(h
        .tasks
        .pending_for(&stride_engine::scheduler::advance_key("acct-1"))
        .await
        .is_none());

    // A stale trigger firing after the pause is a no-op
    let outcome = h.executor.advance("acct-1").await.unwrap();
    assert_eq!(outcome, AdvanceOutcome::Noop);

    // Pausing again is idempotent
    let again = h.executor.pause("acct-1").await.unwrap();
    assert_eq!(again.status, InstanceStatus::Paused);

    let resumed = h.executor.resume("acct-1").await.unwrap();
    assert_eq!(resumed.status, InstanceStatus::Active);
    let outcomes = h.drive("acct-1").await.unwrap();
    assert_eq!(outcomes.last(), Some(&AdvanceOutcome::Completed));

    let done = h.storage.get_instance(&instance.instance_id).await.unwrap();
    assert_eq!(done.status, InstanceStatus::Completed);
}

#[tokio::test]
async fn test_resume_requires_paused_state() {
    let h = Harness::new().await;
    h.seed_account("acct-1").await;
    h.storage
        .save_definition(&onboarding_definition())
        .await
        .unwrap();

    h.executor
        .start_workflow("acct-1", "onboarding", json!({}))
        .await
        .unwrap();

    let err = h.executor.resume("acct-1").await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn test_pause_without_live_workflow_is_not_found() {
    let h = Harness::new().await;
    let err = h.executor.pause("acct-na").await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let h = Harness::new().await;
    h.seed_account("acct-1").await;
    h.storage
        .save_definition(&onboarding_definition())
        .await
        .unwrap();

    h.executor
        .start_workflow("acct-1", "onboarding", json!({}))
        .await
        .unwrap();

    let stopped = h.executor.stop("acct-1", false).await.unwrap().unwrap();
    assert_eq!(stopped.status, InstanceStatus::Stopped);

    // Stopping again changes nothing
    let again = h.executor.stop("acct-1", false).await.unwrap().unwrap();
    assert_eq!(again.status, InstanceStatus::Stopped);
    assert_eq!(again.version, stopped.version);

    // Stopping an account with no workflow at all is a quiet no-op
    assert!(h.executor.stop("acct-none", false).await.unwrap().is_none());

    // Account data survives without delete_data
    assert!(h.accounts.get("acct-1").await.is_some());

    // A new workflow can start after the stop
    h.executor
        .start_workflow("acct-1", "onboarding", json!({}))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_stop_with_delete_data_purges_account() {
    let h = Harness::new().await;
    h.seed_account("acct-1").await;
    h.storage
        .save_definition(&onboarding_definition())
        .await
        .unwrap();

    h.executor
        .start_workflow("acct-1", "onboarding", json!({}))
        .await
        .unwrap();
    h.executor.stop("acct-1", true).await.unwrap();

    assert!(h.accounts.get("acct-1").await.is_none());
}

#[tokio::test]
async fn test_step_params_override_account_defaults() {
    let h = Harness::new().await;
    h.seed_account("acct-1").await;

    let def = definition(
        "campaign",
        vec![step(
            "big-campaign",
            StepAction::RunEngagementCampaign,
            json!({"count": 200}),
        )],
    );
    h.storage.save_definition(&def).await.unwrap();

    h.executor
        .start_workflow("acct-1", "campaign", json!({}))
        .await
        .unwrap();
    h.drive("acct-1").await.unwrap();

    // Step param (200) wins over the account default (10)
    let record = h.accounts.get("acct-1").await.unwrap();
    assert_eq!(record.stats.swipes, 200);
    assert_eq!(record.stats.matches, 20);
}
