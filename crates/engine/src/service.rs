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

//! Service facade
//!
//! ## Purpose
//! The boundary callers talk to. Every method returns a
//! [`ServiceResponse`] instead of a raw `Result`, so internal error types
//! never cross the boundary: callers get a stable `kind` string they can
//! branch on and a human-readable message, nothing more.

use crate::error::{EngineError, EngineResult};
use crate::executor::WorkflowExecutor;
use crate::metrics::MonitoringService;
use crate::storage::EngineStorage;
use crate::types::{
    EngineStats, ExecutionLogEntry, InstanceStatus, WorkflowDefinition, WorkflowInstance,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::error;

/// Stable error shape for the service boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceError {
    /// Machine-readable category, one of the [`EngineError::kind`] strings
    pub kind: String,
    pub message: String,
}

/// Uniform envelope for every facade method.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<ServiceError>,
}

impl<T> ServiceResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn from_result(result: EngineResult<T>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => {
                error!(kind = e.kind(), error = %e, "service call failed");
                Self {
                    success: false,
                    data: None,
                    error: Some(ServiceError {
                        kind: e.kind().to_string(),
                        message: e.to_string(),
                    }),
                }
            }
        }
    }
}

/// Entry point for embedding the engine.
pub struct AutomationService {
    storage: Arc<EngineStorage>,
    executor: Arc<WorkflowExecutor>,
    monitoring: Arc<MonitoringService>,
}

impl AutomationService {
    pub fn new(
        storage: Arc<EngineStorage>,
        executor: Arc<WorkflowExecutor>,
        monitoring: Arc<MonitoringService>,
    ) -> Self {
        Self {
            storage,
            executor,
            monitoring,
        }
    }

    pub fn executor(&self) -> Arc<WorkflowExecutor> {
        self.executor.clone()
    }

    // ---- definitions ----

    pub async fn register_definition(
        &self,
        definition: WorkflowDefinition,
    ) -> ServiceResponse<()> {
        ServiceResponse::from_result(self.storage.save_definition(&definition).await)
    }

    pub async fn get_definition(&self, workflow_type: &str) -> ServiceResponse<WorkflowDefinition> {
        ServiceResponse::from_result(self.storage.get_definition(workflow_type).await)
    }

    pub async fn list_definitions(&self) -> ServiceResponse<Vec<WorkflowDefinition>> {
        ServiceResponse::from_result(self.storage.list_definitions().await)
    }

    // ---- lifecycle ----

    pub async fn start_workflow(
        &self,
        account_id: &str,
        workflow_type: &str,
        context: Value,
    ) -> ServiceResponse<WorkflowInstance> {
        ServiceResponse::from_result(
            self.executor
                .start_workflow(account_id, workflow_type, context)
                .await,
        )
    }

    pub async fn pause_workflow(&self, account_id: &str) -> ServiceResponse<WorkflowInstance> {
        ServiceResponse::from_result(self.executor.pause(account_id).await)
    }

    pub async fn resume_workflow(&self, account_id: &str) -> ServiceResponse<WorkflowInstance> {
        ServiceResponse::from_result(self.executor.resume(account_id).await)
    }

    pub async fn stop_workflow(
        &self,
        account_id: &str,
        delete_data: bool,
    ) -> ServiceResponse<Option<WorkflowInstance>> {
        ServiceResponse::from_result(self.executor.stop(account_id, delete_data).await)
    }

    // ---- inspection ----

    pub async fn workflow_status(
        &self,
        account_id: &str,
    ) -> ServiceResponse<Option<WorkflowInstance>> {
        ServiceResponse::from_result(self.executor.get_status(account_id).await)
    }

    pub async fn list_instances(
        &self,
        status: Option<InstanceStatus>,
    ) -> ServiceResponse<Vec<WorkflowInstance>> {
        ServiceResponse::from_result(self.storage.list_instances(status).await)
    }

    pub async fn execution_history(
        &self,
        account_id: &str,
    ) -> ServiceResponse<Vec<ExecutionLogEntry>> {
        ServiceResponse::from_result(self.history(account_id).await)
    }

    async fn history(&self, account_id: &str) -> EngineResult<Vec<ExecutionLogEntry>> {
        match self.storage.get_latest_by_account(account_id).await? {
            Some(instance) => self.storage.list_logs(&instance.instance_id).await,
            None => Err(EngineError::NotFound(format!(
                "no workflow for '{account_id}'"
            ))),
        }
    }

    pub async fn stats(&self) -> ServiceResponse<EngineStats> {
        ServiceResponse::from_result(self.monitoring.stats().await)
    }
}
