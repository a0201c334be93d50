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

//! Engine counters and aggregate statistics
//!
//! Counters persist in the `workflow_metrics` table so they survive
//! restarts alongside the state they describe. Loop iterations get their
//! own counter: goto loops are legal and unbounded by design, so the
//! counter is how an operator notices a runaway loop.

use crate::error::EngineResult;
use crate::storage::EngineStorage;
use crate::types::EngineStats;
use std::sync::Arc;

const STARTED: &str = "workflows_started";
const COMPLETED: &str = "workflows_completed";
const STEPS_EXECUTED: &str = "steps_executed";
const STEPS_FAILED: &str = "steps_failed";
const LOOP_ITERATIONS: &str = "loop_iterations";

/// Records engine counters and assembles aggregate stats.
pub struct MonitoringService {
    storage: Arc<EngineStorage>,
}

impl MonitoringService {
    pub fn new(storage: Arc<EngineStorage>) -> Self {
        Self { storage }
    }

    pub async fn record_workflow_started(&self) -> EngineResult<()> {
        self.storage.metric_increment(STARTED, 1).await
    }

    pub async fn record_workflow_completed(&self) -> EngineResult<()> {
        self.storage.metric_increment(COMPLETED, 1).await
    }

    /// Record one executed step, success or failure.
    pub async fn record_step(&self, success: bool) -> EngineResult<()> {
        self.storage.metric_increment(STEPS_EXECUTED, 1).await?;
        if !success {
            self.storage.metric_increment(STEPS_FAILED, 1).await?;
        }
        Ok(())
    }

    /// Record one goto jump (loop iteration).
    pub async fn record_loop_iteration(&self) -> EngineResult<()> {
        self.storage.metric_increment(LOOP_ITERATIONS, 1).await
    }

    /// Aggregate counters plus instance counts per status.
    pub async fn stats(&self) -> EngineResult<EngineStats> {
        Ok(EngineStats {
            instances_by_status: self.storage.status_counts().await?,
            steps_executed: self.storage.metric_get(STEPS_EXECUTED).await?,
            steps_failed: self.storage.metric_get(STEPS_FAILED).await?,
            workflows_started: self.storage.metric_get(STARTED).await?,
            workflows_completed: self.storage.metric_get(COMPLETED).await?,
            loop_iterations: self.storage.metric_get(LOOP_ITERATIONS).await?,
        })
    }
}
