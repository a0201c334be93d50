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

//! Deferred re-entry scheduling
//!
//! ## Purpose
//! Waits and retries never block a worker: the executor persists its state,
//! releases its lock, and schedules a one-shot trigger that re-enters the
//! workflow later. This module provides the per-account trigger keys, the
//! Tokio-backed [`TaskScheduler`] implementation, and the pump that turns
//! fired triggers back into `advance` calls.
//!
//! A trigger that fires against an instance that is no longer advanceable
//! (paused, stopped, finished) is a no-op inside the executor.

use crate::client::TaskScheduler;
use crate::error::{EngineError, EngineResult};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info, warn};

/// A scheduled trigger that has come due.
#[derive(Debug)]
pub struct ScheduledFire {
    pub key: String,
    pub payload: Value,
}

/// Trigger key for workflow re-entry on an account.
pub fn advance_key(account_id: &str) -> String {
    format!("workflow:advance:{account_id}")
}

/// Schedules workflow re-entry triggers through a [`TaskScheduler`].
pub struct SchedulingService {
    tasks: Arc<dyn TaskScheduler>,
}

impl SchedulingService {
    pub fn new(tasks: Arc<dyn TaskScheduler>) -> Self {
        Self { tasks }
    }

    /// Schedule (or replace) the re-entry trigger for an account.
    pub async fn schedule_advance(
        &self,
        account_id: &str,
        delay_ms: u64,
        reason: &str,
    ) -> EngineResult<()> {
        debug!(account_id, delay_ms, reason, "scheduling re-entry");
        self.tasks
            .schedule(
                &advance_key(account_id),
                delay_ms,
                json!({"account_id": account_id, "reason": reason}),
            )
            .await
    }

    /// Cancel any pending re-entry trigger for an account.
    pub async fn cancel_advance(&self, account_id: &str) -> EngineResult<()> {
        self.tasks.cancel(&advance_key(account_id)).await
    }
}

/// Tokio-backed one-shot task scheduler.
///
/// Each scheduled key holds one sleeping task; re-scheduling a key aborts
/// the previous sleeper. Fired triggers are delivered on an unbounded
/// channel so the consumer controls execution, not the timer task.
pub struct TokioTaskScheduler {
    handles: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
    tx: mpsc::UnboundedSender<ScheduledFire>,
}

impl TokioTaskScheduler {
    /// Create a scheduler and the receiving end for fired triggers.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ScheduledFire>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                handles: Arc::new(Mutex::new(HashMap::new())),
                tx,
            },
            rx,
        )
    }

    /// Abort every pending sleeper (shutdown path).
    pub async fn abort_all(&self) {
        let mut handles = self.handles.lock().await;
        for (_, handle) in handles.drain() {
            handle.abort();
        }
    }

    /// Number of pending triggers.
    pub async fn pending_count(&self) -> usize {
        self.handles.lock().await.len()
    }
}

#[async_trait::async_trait]
impl TaskScheduler for TokioTaskScheduler {
    async fn schedule(&self, key: &str, delay_ms: u64, payload: Value) -> EngineResult<()> {
        let mut handles = self.handles.lock().await;
        if let Some(previous) = handles.remove(key) {
            previous.abort();
        }

        let tx = self.tx.clone();
        let handles_ref = Arc::clone(&self.handles);
        let fire_key = key.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            handles_ref.lock().await.remove(&fire_key);
            if tx
                .send(ScheduledFire {
                    key: fire_key.clone(),
                    payload,
                })
                .is_err()
            {
                debug!(key = %fire_key, "trigger receiver dropped");
            }
        });
        handles.insert(key.to_string(), handle);
        Ok(())
    }

    async fn cancel(&self, key: &str) -> EngineResult<()> {
        let mut handles = self.handles.lock().await;
        if let Some(handle) = handles.remove(key) {
            handle.abort();
        }
        Ok(())
    }
}

/// Drive fired triggers back into the executor until shutdown.
///
/// Lock contention on re-entry is expected (another process may already be
/// advancing the account) and is logged at debug; other errors are warned
/// and dropped. The instance's own persisted state plus recovery make a
/// missed trigger safe.
pub fn spawn_advance_pump(
    executor: Arc<crate::executor::WorkflowExecutor>,
    mut rx: mpsc::UnboundedReceiver<ScheduledFire>,
    shutdown: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    info!("advance pump shutting down");
                    break;
                }
                fire = rx.recv() => {
                    let Some(fire) = fire else { break };
                    let Some(account_id) = fire
                        .payload
                        .get("account_id")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                    else {
                        warn!(key = %fire.key, "trigger payload missing account_id");
                        continue;
                    };

                    match executor.advance(&account_id).await {
                        Ok(outcome) => {
                            debug!(account_id, ?outcome, "re-entry advanced");
                        }
                        Err(EngineError::LockUnavailable(key)) => {
                            debug!(account_id, key, "re-entry lost the execute lock");
                        }
                        Err(e) => {
                            warn!(account_id, error = %e, "re-entry failed");
                        }
                    }
                }
            }
        }
    })
}
