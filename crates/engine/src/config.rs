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

//! Engine configuration with a read-through cache
//!
//! ## Purpose
//! Operator-tunable settings (timeouts, buffers, retention windows) live in
//! the `engine_config` table. Reads go through a per-process cache with a
//! TTL so hot paths do not hit the database for every step; writes go to the
//! database first and then invalidate the cached entry.
//!
//! ## Keys
//! - `timeout.default` - per-step timeout in ms (default 120000)
//! - `timeout.<action>` - per-action timeout override in ms
//! - `wait.timeout_buffer_ms` - slack added on top of a wait duration
//! - `wait.max_timeout_ms` - hard cap for wait timeouts (default 24h)

use crate::error::EngineResult;
use crate::storage::EngineStorage;
use crate::types::{ExecutionPolicy, Step, StepAction};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::warn;

/// Default cache TTL for config reads.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Default per-step timeout in milliseconds.
pub const DEFAULT_STEP_TIMEOUT_MS: u64 = 120_000;

/// Default slack added to a wait duration before the wait is abandoned.
pub const DEFAULT_WAIT_BUFFER_MS: u64 = 60_000;

/// Default hard cap for wait timeouts (24 hours).
pub const DEFAULT_WAIT_MAX_TIMEOUT_MS: u64 = 86_400_000;

struct CacheEntry {
    /// Negative lookups are cached too
    value: Option<String>,
    fetched_at: Instant,
}

/// Read-through cached view over `engine_config`.
pub struct ConfigService {
    storage: Arc<EngineStorage>,
    ttl: Duration,
    cache: RwLock<HashMap<String, CacheEntry>>,
}

impl ConfigService {
    pub fn new(storage: Arc<EngineStorage>) -> Self {
        Self::with_ttl(storage, DEFAULT_CACHE_TTL)
    }

    pub fn with_ttl(storage: Arc<EngineStorage>, ttl: Duration) -> Self {
        Self {
            storage,
            ttl,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Read a config value, going to storage only on a cache miss or an
    /// expired entry.
    pub async fn get(&self, key: &str) -> EngineResult<Option<String>> {
        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(key) {
                if entry.fetched_at.elapsed() < self.ttl {
                    return Ok(entry.value.clone());
                }
            }
        }

        let value = self.storage.config_get(key).await?;
        self.cache.write().await.insert(
            key.to_string(),
            CacheEntry {
                value: value.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(value)
    }

    /// Read a value, falling back to `default` when unset.
    pub async fn get_or(&self, key: &str, default: &str) -> EngineResult<String> {
        Ok(self.get(key).await?.unwrap_or_else(|| default.to_string()))
    }

    /// Read a numeric value; unparseable values degrade to the default.
    pub async fn get_u64_or(&self, key: &str, default: u64) -> EngineResult<u64> {
        match self.get(key).await? {
            Some(raw) => match raw.parse::<u64>() {
                Ok(v) => Ok(v),
                Err(_) => {
                    warn!(key, value = %raw, "config value is not a number, using default");
                    Ok(default)
                }
            },
            None => Ok(default),
        }
    }

    /// Write a value and drop the cached entry so the next read sees it.
    pub async fn set(&self, key: &str, value: &str) -> EngineResult<()> {
        self.storage.config_set(key, value).await?;
        self.cache.write().await.remove(key);
        Ok(())
    }

    /// Timeout for executing one step.
    ///
    /// Precedence for side-effecting actions: the definition's per-action
    /// override, then `timeout.<action>`, then `timeout.default`. Wait
    /// steps get their requested duration plus a buffer, capped at
    /// `wait.max_timeout_ms`.
    pub async fn step_timeout(
        &self,
        policy: &ExecutionPolicy,
        step: &Step,
    ) -> EngineResult<Duration> {
        let action_str = step.action.to_string();

        if step.action == StepAction::Wait {
            let requested = step.param_u64("duration_ms").unwrap_or(0);
            return Ok(Duration::from_millis(self.wait_timeout_ms(requested).await?));
        }

        if let Some(ms) = policy.step_timeout_overrides_ms.get(&action_str) {
            return Ok(Duration::from_millis(*ms));
        }
        if let Some(raw) = self.get(&format!("timeout.{action_str}")).await? {
            if let Ok(ms) = raw.parse::<u64>() {
                return Ok(Duration::from_millis(ms));
            }
            warn!(action = %action_str, value = %raw, "per-action timeout is not a number");
        }
        let ms = self
            .get_u64_or("timeout.default", DEFAULT_STEP_TIMEOUT_MS)
            .await?;
        Ok(Duration::from_millis(ms))
    }

    /// Timeout for a wait of `requested_ms`: duration plus buffer, capped.
    pub async fn wait_timeout_ms(&self, requested_ms: u64) -> EngineResult<u64> {
        let buffer = self
            .get_u64_or("wait.timeout_buffer_ms", DEFAULT_WAIT_BUFFER_MS)
            .await?;
        let cap = self
            .get_u64_or("wait.max_timeout_ms", DEFAULT_WAIT_MAX_TIMEOUT_MS)
            .await?;
        Ok(requested_ms.saturating_add(buffer).min(cap))
    }
}
