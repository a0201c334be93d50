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

//! Workflow type definitions
//!
//! ## Purpose
//! Core domain types: workflow definitions (templates), instances (runtime
//! state), the status state machine, and execution log entries.
//!
//! ## Design
//! The database row is the source of truth for instance state; these types
//! are plain data carriers with no in-memory lifecycle of their own. An
//! instance loaded fresh from storage must be fully self-describing.

use crate::error::{EngineError, EngineResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Step action kinds.
///
/// Serialized as kebab-case strings in definition JSON. Strings that do not
/// match a known action deserialize to `Unknown` rather than failing the
/// whole definition, so a single bad step fails at dispatch with a precise
/// error instead of making the definition unreadable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StepAction {
    /// Update the account's bio text (vendor generates one if absent)
    UpdateBio,

    /// Update the account's conversation prompt for a model/channel pair
    UpdatePrompt,

    /// Run an engagement campaign (swipes/likes batch)
    RunEngagementCampaign,

    /// Suspend advancement for a duration, without holding any lock
    Wait,

    /// Jump to another step in the same definition (intentional loops)
    Goto,

    /// Unrecognized action string, fails at dispatch
    Unknown(String),
}

impl From<String> for StepAction {
    fn from(s: String) -> Self {
        match s.as_str() {
            "update-bio" => Self::UpdateBio,
            "update-prompt" => Self::UpdatePrompt,
            "run-engagement-campaign" => Self::RunEngagementCampaign,
            "wait" => Self::Wait,
            "goto" => Self::Goto,
            _ => Self::Unknown(s),
        }
    }
}

impl From<StepAction> for String {
    fn from(action: StepAction) -> Self {
        action.to_string()
    }
}

impl fmt::Display for StepAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::UpdateBio => "update-bio",
            Self::UpdatePrompt => "update-prompt",
            Self::RunEngagementCampaign => "run-engagement-campaign",
            Self::Wait => "wait",
            Self::Goto => "goto",
            Self::Unknown(s) => s.as_str(),
        };
        write!(f, "{}", s)
    }
}

/// Individual workflow step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Step ID (unique within a definition; goto targets reference it)
    pub id: String,

    /// Action to perform
    pub action: StepAction,

    /// Action parameters (JSON object; shape depends on action)
    #[serde(default)]
    pub params: Value,

    /// Whether a failure of this step fails the whole workflow immediately
    #[serde(default)]
    pub critical: bool,
}

impl Step {
    /// Fetch a required u64 parameter.
    pub fn param_u64(&self, key: &str) -> Option<u64> {
        self.params.get(key).and_then(Value::as_u64)
    }

    /// Fetch an optional string parameter.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }
}

/// Retry policy for workflow steps
///
/// ## Design
/// Exponential backoff capped at `max_backoff_ms`. The retry budget is
/// instance-wide, not per-step: `retry_count` on the instance counts every
/// retryable failure across the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPolicy {
    /// Maximum number of retryable failures before the instance fails
    #[serde(default = "ExecutionPolicy::default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff before re-entry after a retryable failure
    #[serde(default = "ExecutionPolicy::default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Backoff multiplier (e.g., 2.0 for exponential)
    #[serde(default = "ExecutionPolicy::default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Cap for exponential backoff growth
    #[serde(default = "ExecutionPolicy::default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Per-action timeout overrides in milliseconds, keyed by action string
    #[serde(default)]
    pub step_timeout_overrides_ms: HashMap<String, u64>,
}

impl ExecutionPolicy {
    fn default_max_retries() -> u32 {
        3
    }
    fn default_retry_backoff_ms() -> u64 {
        60_000
    }
    fn default_backoff_multiplier() -> f64 {
        2.0
    }
    fn default_max_backoff_ms() -> u64 {
        3_600_000
    }

    /// Backoff delay for the given attempt (1 = first retry).
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let exp = attempt.saturating_sub(1).min(16);
        let raw = self.retry_backoff_ms as f64 * self.backoff_multiplier.powi(exp as i32);
        (raw as u64).min(self.max_backoff_ms)
    }
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            max_retries: Self::default_max_retries(),
            retry_backoff_ms: Self::default_retry_backoff_ms(),
            backoff_multiplier: Self::default_backoff_multiplier(),
            max_backoff_ms: Self::default_max_backoff_ms(),
            step_timeout_overrides_ms: HashMap::new(),
        }
    }
}

/// Workflow definition - template for workflow instances
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow type (unique identifier, e.g. "onboarding")
    pub workflow_type: String,

    /// Workflow name (human-readable)
    pub name: String,

    /// Optional description
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Workflow steps (ordered)
    pub steps: Vec<Step>,

    /// Retry/timeout policy
    #[serde(default)]
    pub policy: ExecutionPolicy,
}

impl WorkflowDefinition {
    /// Validate structural invariants of a definition.
    ///
    /// ## Checks
    /// - non-empty type and step list
    /// - step IDs unique within the definition
    /// - every goto `next_step` references an existing step ID
    /// - wait steps carry a `duration_ms` parameter
    ///
    /// Goto targets may point backward; intentional loops are legal and
    /// observable through the loop-iteration counter at runtime.
    pub fn validate(&self) -> EngineResult<()> {
        if self.workflow_type.is_empty() {
            return Err(EngineError::Validation(
                "workflow_type must not be empty".to_string(),
            ));
        }
        if self.steps.is_empty() {
            return Err(EngineError::Validation(format!(
                "workflow '{}' has no steps",
                self.workflow_type
            )));
        }

        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if step.id.is_empty() {
                return Err(EngineError::Validation(format!(
                    "workflow '{}' has a step with an empty id",
                    self.workflow_type
                )));
            }
            if !seen.insert(step.id.as_str()) {
                return Err(EngineError::Validation(format!(
                    "duplicate step id '{}' in workflow '{}'",
                    step.id, self.workflow_type
                )));
            }
        }

        for step in &self.steps {
            match &step.action {
                StepAction::Goto => {
                    let target = step.param_str("next_step").ok_or_else(|| {
                        EngineError::Validation(format!(
                            "goto step '{}' is missing 'next_step'",
                            step.id
                        ))
                    })?;
                    if !self.steps.iter().any(|s| s.id == target) {
                        return Err(EngineError::Validation(format!(
                            "goto step '{}' targets unknown step '{}'",
                            step.id, target
                        )));
                    }
                }
                StepAction::Wait => {
                    if step.param_u64("duration_ms").is_none() {
                        return Err(EngineError::Validation(format!(
                            "wait step '{}' is missing 'duration_ms'",
                            step.id
                        )));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Position of a step by ID, if present.
    pub fn step_index(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == step_id)
    }
}

/// Instance status states
///
/// ## Design
/// State machine for the workflow instance lifecycle. Persisted as uppercase
/// strings; the database row is authoritative and every transition is a
/// compare-and-swap on the instance version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStatus {
    /// Instance created but not yet dispatched
    Pending,

    /// Instance live, between steps
    Active,

    /// A step is executing right now
    Running,

    /// Suspended by operator request; resumable
    Paused,

    /// All steps finished successfully
    Completed,

    /// Failed terminally (critical step, retry budget, or validation)
    Failed,

    /// Stopped by operator request
    Stopped,

    /// Reclaimed by crash recovery, awaiting re-entry
    Recovering,

    /// Recovery validation failed; requires manual intervention
    Unrecoverable,
}

impl InstanceStatus {
    /// Parse status from string (for SQL storage)
    pub fn from_string(s: &str) -> EngineResult<Self> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "ACTIVE" => Ok(Self::Active),
            "RUNNING" => Ok(Self::Running),
            "PAUSED" => Ok(Self::Paused),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "STOPPED" => Ok(Self::Stopped),
            "RECOVERING" => Ok(Self::Recovering),
            "UNRECOVERABLE" => Ok(Self::Unrecoverable),
            _ => Err(EngineError::Validation(format!("Unknown status: {}", s))),
        }
    }

    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Stopped | Self::Unrecoverable
        )
    }

    /// Statuses that count toward the one-live-workflow-per-account rule.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Active | Self::Running | Self::Paused | Self::Recovering
        )
    }

    /// Statuses from which the executor may advance to the next step.
    pub fn is_advanceable(&self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Active | Self::Running | Self::Recovering
        )
    }

    /// All live status strings, for SQL IN clauses.
    pub fn live_statuses() -> [&'static str; 5] {
        ["PENDING", "ACTIVE", "RUNNING", "PAUSED", "RECOVERING"]
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Active => "ACTIVE",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Stopped => "STOPPED",
            Self::Recovering => "RECOVERING",
            Self::Unrecoverable => "UNRECOVERABLE",
        };
        write!(f, "{}", s)
    }
}

/// Workflow instance - runtime state of one workflow for one account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    /// Instance ID (ULID for sortability)
    pub instance_id: String,

    /// Account this workflow operates on
    pub account_id: String,

    /// Definition type this instance runs
    pub workflow_type: String,

    /// Current lifecycle status
    pub status: InstanceStatus,

    /// Index of the next step to execute
    pub current_step_index: usize,

    /// Retryable failures consumed so far (instance-wide budget)
    pub retry_count: u32,

    /// Last failure message, if any
    pub last_error: Option<String>,

    /// Per-run variables (e.g. model/channel overrides)
    pub context: Value,

    /// Version for optimistic locking
    pub version: u64,

    /// When the first step was dispatched
    pub started_at: Option<DateTime<Utc>>,

    /// When a terminal status was reached
    pub completed_at: Option<DateTime<Utc>>,

    /// Last time the engine made progress on this instance
    pub last_activity_at: DateTime<Utc>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

/// One entry in the append-only execution log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    /// Log entry ID (ULID)
    pub log_id: String,

    /// Instance this entry belongs to
    pub instance_id: String,

    /// Step ID from the definition
    pub step_id: String,

    /// Action string, as stored
    pub action: String,

    /// Whether the step succeeded
    pub success: bool,

    /// Step output payload (if any)
    pub payload: Option<Value>,

    /// Error message (if failed)
    pub error: Option<String>,

    /// Set when this entry is a goto jump that created a loop iteration
    pub loop_created: bool,

    /// When the entry was written
    pub created_at: DateTime<Utc>,
}

/// Outcome of executing a single step.
#[derive(Debug)]
pub struct StepResult {
    /// Step output payload on success
    pub payload: Option<Value>,

    /// Failure, classified for the executor's retry decision
    pub error: Option<EngineError>,
}

impl StepResult {
    pub fn ok(payload: Option<Value>) -> Self {
        Self {
            payload,
            error: None,
        }
    }

    pub fn fail(error: EngineError) -> Self {
        Self {
            payload: None,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Aggregate engine statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineStats {
    /// Instance counts keyed by status string
    pub instances_by_status: HashMap<String, i64>,

    /// Total steps executed (success + failure)
    pub steps_executed: i64,

    /// Steps that failed
    pub steps_failed: i64,

    /// Workflows started
    pub workflows_started: i64,

    /// Workflows that reached COMPLETED
    pub workflows_completed: i64,

    /// Goto jumps taken (loop iterations)
    pub loop_iterations: i64,
}
