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

//! Outbound dependency traits
//!
//! ## Purpose
//! The engine drives externally managed accounts through a vendor API and
//! reads/writes account records owned by another system. Both are behind
//! traits so execution logic is testable without the real integrations, and
//! so deployments can swap transports without touching the executor.

use crate::error::EngineResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Result of a bio update at the vendor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BioUpdate {
    /// Vendor-side task identifier
    pub task_id: String,
    /// The bio text that was applied (vendor-generated when none was given)
    pub bio: String,
}

/// Result of a prompt update at the vendor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptUpdate {
    pub task_id: String,
    pub model: String,
    pub channel: String,
}

/// Result of an engagement campaign run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngagementOutcome {
    pub task_id: String,
    /// Swipes performed in this campaign
    pub swipes: u64,
    /// Matches produced in this campaign
    pub matches: u64,
}

/// Vendor API client for account actions.
///
/// Liveness is checked before every side-effecting step; an account the
/// vendor reports as dead must not receive actions.
#[async_trait]
pub trait VendorClient: Send + Sync {
    /// Whether the account is reachable and operable at the vendor.
    async fn is_alive(&self, account_id: &str) -> EngineResult<bool>;

    /// Update the account bio. `text: None` asks the vendor to generate one.
    async fn update_bio(&self, account_id: &str, text: Option<&str>) -> EngineResult<BioUpdate>;

    /// Update the conversation prompt for a model/channel pair.
    async fn update_prompt(
        &self,
        account_id: &str,
        model: &str,
        channel: &str,
    ) -> EngineResult<PromptUpdate>;

    /// Run an engagement campaign of `count` swipes.
    async fn run_engagement_campaign(
        &self,
        account_id: &str,
        count: u64,
    ) -> EngineResult<EngagementOutcome>;
}

/// Cumulative engagement statistics on an account record.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccountStats {
    pub swipes: u64,
    pub matches: u64,
}

/// Externally owned account record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountRecord {
    pub account_id: String,
    /// Default model for prompt updates
    pub model: Option<String>,
    /// Default channel for prompt updates
    pub channel: Option<String>,
    /// Default engagement campaign size
    pub engagement_count: Option<u64>,
    /// Cumulative engagement counters
    pub stats: AccountStats,
}

/// Store of account records owned by the surrounding system.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Load an account record, `None` when unknown.
    async fn load(&self, account_id: &str) -> EngineResult<Option<AccountRecord>>;

    /// Add the given deltas to the account's cumulative counters.
    async fn add_stats(&self, account_id: &str, delta: AccountStats) -> EngineResult<()>;

    /// Remove all engine-held data for an account (stop with data deletion).
    async fn purge(&self, account_id: &str) -> EngineResult<()>;
}

/// Deferred one-shot task scheduler.
///
/// `schedule` with an existing key replaces the pending task; workflow
/// re-entry is keyed per account so at most one trigger is outstanding.
#[async_trait]
pub trait TaskScheduler: Send + Sync {
    /// Fire `payload` under `key` after `delay_ms` milliseconds.
    async fn schedule(&self, key: &str, delay_ms: u64, payload: Value) -> EngineResult<()>;

    /// Cancel a pending task; absent keys are a no-op.
    async fn cancel(&self, key: &str) -> EngineResult<()>;
}
