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

//! In-memory implementations of the outbound dependency traits (for testing
//! and single-process scenarios).

use crate::client::{
    AccountRecord, AccountStats, AccountStore, BioUpdate, EngagementOutcome, PromptUpdate,
    TaskScheduler, VendorClient,
};
use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use ulid::Ulid;

/// Scripted vendor client.
///
/// Accounts are alive unless marked dead; individual actions can be scripted
/// to fail. Every call is recorded for assertions.
#[derive(Clone, Default)]
pub struct MemoryVendorClient {
    dead_accounts: Arc<RwLock<HashSet<String>>>,
    failing_actions: Arc<RwLock<HashSet<String>>>,
    calls: Arc<RwLock<Vec<(String, String)>>>,
}

impl MemoryVendorClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_alive(&self, account_id: &str, alive: bool) {
        let mut dead = self.dead_accounts.write().await;
        if alive {
            dead.remove(account_id);
        } else {
            dead.insert(account_id.to_string());
        }
    }

    /// Make the named action fail with a vendor error until cleared.
    pub async fn fail_action(&self, action: &str, failing: bool) {
        let mut failures = self.failing_actions.write().await;
        if failing {
            failures.insert(action.to_string());
        } else {
            failures.remove(action);
        }
    }

    /// All `(account_id, action)` calls recorded so far.
    pub async fn calls(&self) -> Vec<(String, String)> {
        self.calls.read().await.clone()
    }

    pub async fn calls_for(&self, action: &str) -> usize {
        self.calls
            .read()
            .await
            .iter()
            .filter(|(_, a)| a == action)
            .count()
    }

    async fn record(&self, account_id: &str, action: &str) -> EngineResult<()> {
        self.calls
            .write()
            .await
            .push((account_id.to_string(), action.to_string()));
        if self.failing_actions.read().await.contains(action) {
            return Err(EngineError::VendorCall(format!("scripted failure: {action}")));
        }
        Ok(())
    }
}

#[async_trait]
impl VendorClient for MemoryVendorClient {
    async fn is_alive(&self, account_id: &str) -> EngineResult<bool> {
        Ok(!self.dead_accounts.read().await.contains(account_id))
    }

    async fn update_bio(&self, account_id: &str, text: Option<&str>) -> EngineResult<BioUpdate> {
        self.record(account_id, "update-bio").await?;
        Ok(BioUpdate {
            task_id: Ulid::new().to_string(),
            bio: text.unwrap_or("generated bio").to_string(),
        })
    }

    async fn update_prompt(
        &self,
        account_id: &str,
        model: &str,
        channel: &str,
    ) -> EngineResult<PromptUpdate> {
        self.record(account_id, "update-prompt").await?;
        Ok(PromptUpdate {
            task_id: Ulid::new().to_string(),
            model: model.to_string(),
            channel: channel.to_string(),
        })
    }

    async fn run_engagement_campaign(
        &self,
        account_id: &str,
        count: u64,
    ) -> EngineResult<EngagementOutcome> {
        self.record(account_id, "run-engagement-campaign").await?;
        Ok(EngagementOutcome {
            task_id: Ulid::new().to_string(),
            swipes: count,
            matches: count / 10,
        })
    }
}

/// HashMap-backed account store.
#[derive(Clone, Default)]
pub struct MemoryAccountStore {
    records: Arc<RwLock<HashMap<String, AccountRecord>>>,
}

impl MemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, record: AccountRecord) {
        self.records
            .write()
            .await
            .insert(record.account_id.clone(), record);
    }

    pub async fn get(&self, account_id: &str) -> Option<AccountRecord> {
        self.records.read().await.get(account_id).cloned()
    }
}

#[async_trait]
impl AccountStore for MemoryAccountStore {
    async fn load(&self, account_id: &str) -> EngineResult<Option<AccountRecord>> {
        Ok(self.records.read().await.get(account_id).cloned())
    }

    async fn add_stats(&self, account_id: &str, delta: AccountStats) -> EngineResult<()> {
        let mut records = self.records.write().await;
        let record = records.get_mut(account_id).ok_or_else(|| {
            EngineError::NotFound(format!("account '{account_id}'"))
        })?;
        record.stats.swipes += delta.swipes;
        record.stats.matches += delta.matches;
        Ok(())
    }

    async fn purge(&self, account_id: &str) -> EngineResult<()> {
        self.records.write().await.remove(account_id);
        Ok(())
    }
}

/// Recording task scheduler that never fires.
///
/// Tests inspect what was scheduled and drive re-entry themselves, which
/// keeps timing out of most tests.
#[derive(Clone, Default)]
pub struct MemoryTaskScheduler {
    pending: Arc<RwLock<HashMap<String, (u64, Value)>>>,
    cancelled: Arc<RwLock<Vec<String>>>,
}

impl MemoryTaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn pending_for(&self, key: &str) -> Option<(u64, Value)> {
        self.pending.read().await.get(key).cloned()
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }

    pub async fn cancelled_keys(&self) -> Vec<String> {
        self.cancelled.read().await.clone()
    }

    /// Remove and return a pending task, as a fired trigger would.
    pub async fn take(&self, key: &str) -> Option<(u64, Value)> {
        self.pending.write().await.remove(key)
    }
}

#[async_trait]
impl TaskScheduler for MemoryTaskScheduler {
    async fn schedule(&self, key: &str, delay_ms: u64, payload: Value) -> EngineResult<()> {
        // Replaces any pending task under the same key
        self.pending
            .write()
            .await
            .insert(key.to_string(), (delay_ms, payload));
        Ok(())
    }

    async fn cancel(&self, key: &str) -> EngineResult<()> {
        self.pending.write().await.remove(key);
        self.cancelled.write().await.push(key.to_string());
        Ok(())
    }
}
