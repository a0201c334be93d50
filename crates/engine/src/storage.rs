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

//! SQL persistence for workflow definitions, instances, and the execution log
//!
//! ## Purpose
//! The database is the single source of truth for workflow state. No engine
//! component keeps authoritative in-memory state; everything a resumed or
//! recovered process needs is in these tables.
//!
//! ## Design
//! - SQLite via sqlx with migrations via `sqlx::migrate!`
//! - Every instance mutation is a compare-and-swap on the `version` column;
//!   zero affected rows surfaces as `ConcurrentUpdate`
//! - The partial unique index on `workflow_instances(account_id)` enforces
//!   one live workflow per account even under races
//! - `last_activity_at` drives the recovery staleness scan (julianday math)

use crate::error::{EngineError, EngineResult};
use crate::types::{
    ExecutionLogEntry, InstanceStatus, WorkflowDefinition, WorkflowInstance,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use tracing::instrument;
use ulid::Ulid;

/// Fields the executor may change on an instance in one CAS write.
#[derive(Debug, Clone)]
pub struct InstanceUpdate {
    pub status: InstanceStatus,
    pub current_step_index: usize,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// When `Some`, replaces the stored context
    pub context: Option<Value>,
}

/// Engine storage over SQLite.
#[derive(Clone)]
pub struct EngineStorage {
    pool: SqlitePool,
}

impl EngineStorage {
    /// Create in-memory storage for testing
    pub async fn new_in_memory() -> EngineResult<Self> {
        Self::new_sqlite("sqlite::memory:").await
    }

    /// Create SQLite storage (file-based or in-memory)
    ///
    /// ## Arguments
    /// * `connection_string` - SQLite connection string, e.g.
    ///   "sqlite://engine.db" or "sqlite::memory:"
    pub async fn new_sqlite(connection_string: &str) -> EngineResult<Self> {
        // An in-memory database is per-connection; cap the pool at one
        // connection so every caller sees the same database, and keep the
        // reaper from ever closing it (closing the last connection to a
        // ":memory:" database destroys the database).
        let in_memory = connection_string.contains(":memory:");
        let mut options = SqlitePoolOptions::new();
        if in_memory {
            options = options
                .max_connections(1)
                .max_lifetime(None)
                .idle_timeout(None);
        } else {
            options = options.max_connections(5);
        }
        let pool = options
            .connect(connection_string)
            .await
            .map_err(|e| {
                EngineError::Storage(format!(
                    "failed to connect to SQLite ({connection_string}): {e}"
                ))
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| EngineError::Storage(format!("migration failed: {e}")))?;

        Ok(Self { pool })
    }

    /// The underlying pool, for sharing with the SQLite lock backend.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // Definitions
    // ------------------------------------------------------------------

    /// Save (insert or replace) a workflow definition.
    ///
    /// The definition is validated before it is written; invalid templates
    /// never reach the database.
    #[instrument(skip(self, def), fields(workflow_type = %def.workflow_type))]
    pub async fn save_definition(&self, def: &WorkflowDefinition) -> EngineResult<()> {
        def.validate()?;
        let definition_json = serde_json::to_string(def)?;

        sqlx::query(
            r#"
            INSERT INTO workflow_definitions (workflow_type, name, description, definition_json)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(workflow_type) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                definition_json = excluded.definition_json,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&def.workflow_type)
        .bind(&def.name)
        .bind(&def.description)
        .bind(&definition_json)
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::Storage(format!("save definition: {e}")))?;

        Ok(())
    }

    /// Load a definition by type.
    pub async fn get_definition(&self, workflow_type: &str) -> EngineResult<WorkflowDefinition> {
        let row = sqlx::query(
            r#"SELECT definition_json FROM workflow_definitions WHERE workflow_type = ?1"#,
        )
        .bind(workflow_type)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| EngineError::Storage(format!("get definition: {e}")))?;

        match row {
            Some(row) => {
                let json: String = row.get("definition_json");
                Ok(serde_json::from_str(&json)?)
            }
            None => Err(EngineError::NotFound(format!(
                "workflow definition '{workflow_type}'"
            ))),
        }
    }

    /// List all definitions.
    pub async fn list_definitions(&self) -> EngineResult<Vec<WorkflowDefinition>> {
        let rows = sqlx::query(
            r#"SELECT definition_json FROM workflow_definitions ORDER BY workflow_type"#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EngineError::Storage(format!("list definitions: {e}")))?;

        rows.into_iter()
            .map(|row| {
                let json: String = row.get("definition_json");
                serde_json::from_str(&json).map_err(EngineError::from)
            })
            .collect()
    }

    /// Delete a definition. Running instances keep working from their own
    /// copy only if already loaded; new dispatches will fail validation.
    pub async fn delete_definition(&self, workflow_type: &str) -> EngineResult<bool> {
        let result =
            sqlx::query(r#"DELETE FROM workflow_definitions WHERE workflow_type = ?1"#)
                .bind(workflow_type)
                .execute(&self.pool)
                .await
                .map_err(|e| EngineError::Storage(format!("delete definition: {e}")))?;
        Ok(result.rows_affected() > 0)
    }

    // ------------------------------------------------------------------
    // Instances
    // ------------------------------------------------------------------

    /// Create a new PENDING instance for an account.
    ///
    /// The partial unique index rejects a second live instance for the same
    /// account; that surfaces as a `Validation` error.
    #[instrument(skip(self, context), fields(account_id = %account_id, workflow_type = %workflow_type))]
    pub async fn create_instance(
        &self,
        account_id: &str,
        workflow_type: &str,
        context: Value,
    ) -> EngineResult<WorkflowInstance> {
        let instance_id = Ulid::new().to_string();
        let context_json = serde_json::to_string(&context)?;

        let result = sqlx::query(
            r#"
            INSERT INTO workflow_instances
                (instance_id, account_id, workflow_type, status, context_json)
            VALUES (?1, ?2, ?3, 'PENDING', ?4)
            "#,
        )
        .bind(&instance_id)
        .bind(account_id)
        .bind(workflow_type)
        .bind(&context_json)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            let message = e.to_string();
            if message.contains("UNIQUE") {
                return Err(EngineError::Validation(format!(
                    "account '{account_id}' already has a live workflow"
                )));
            }
            return Err(EngineError::Storage(format!("create instance: {message}")));
        }

        self.get_instance(&instance_id).await
    }

    /// Load an instance by ID.
    pub async fn get_instance(&self, instance_id: &str) -> EngineResult<WorkflowInstance> {
        let row = sqlx::query(Self::INSTANCE_SELECT)
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| EngineError::Storage(format!("get instance: {e}")))?;

        match row {
            Some(row) => Self::instance_from_row(&row),
            None => Err(EngineError::NotFound(format!("instance '{instance_id}'"))),
        }
    }

    const INSTANCE_SELECT: &'static str = r#"
        SELECT instance_id, account_id, workflow_type, status, current_step_index,
               retry_count, last_error, context_json, version,
               started_at, completed_at, last_activity_at, created_at
        FROM workflow_instances WHERE instance_id = ?1
    "#;

    const INSTANCE_COLUMNS: &'static str = r#"
        instance_id, account_id, workflow_type, status, current_step_index,
        retry_count, last_error, context_json, version,
        started_at, completed_at, last_activity_at, created_at
    "#;

    /// The live (non-terminal) instance for an account, if any.
    pub async fn get_live_by_account(
        &self,
        account_id: &str,
    ) -> EngineResult<Option<WorkflowInstance>> {
        let sql = format!(
            "SELECT {} FROM workflow_instances
             WHERE account_id = ?1
               AND status IN ('PENDING', 'ACTIVE', 'RUNNING', 'PAUSED', 'RECOVERING')",
            Self::INSTANCE_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| EngineError::Storage(format!("get live instance: {e}")))?;

        row.as_ref().map(Self::instance_from_row).transpose()
    }

    /// The most recent instance for an account, live or terminal.
    pub async fn get_latest_by_account(
        &self,
        account_id: &str,
    ) -> EngineResult<Option<WorkflowInstance>> {
        let sql = format!(
            "SELECT {} FROM workflow_instances
             WHERE account_id = ?1
             ORDER BY instance_id DESC LIMIT 1",
            Self::INSTANCE_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| EngineError::Storage(format!("get latest instance: {e}")))?;

        row.as_ref().map(Self::instance_from_row).transpose()
    }

    /// List instances, optionally filtered by status.
    pub async fn list_instances(
        &self,
        status: Option<InstanceStatus>,
    ) -> EngineResult<Vec<WorkflowInstance>> {
        let rows = match status {
            Some(status) => {
                let sql = format!(
                    "SELECT {} FROM workflow_instances WHERE status = ?1 ORDER BY created_at",
                    Self::INSTANCE_COLUMNS
                );
                sqlx::query(&sql)
                    .bind(status.to_string())
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                let sql = format!(
                    "SELECT {} FROM workflow_instances ORDER BY created_at",
                    Self::INSTANCE_COLUMNS
                );
                sqlx::query(&sql).fetch_all(&self.pool).await
            }
        }
        .map_err(|e| EngineError::Storage(format!("list instances: {e}")))?;

        rows.iter().map(Self::instance_from_row).collect()
    }

    /// Update instance state with version check (optimistic locking)
    ///
    /// Applies all executor-visible mutations in one statement: status,
    /// step index, retry count, error, and optionally context. Bumps
    /// `version`, refreshes `last_activity_at`, and maintains `started_at`
    /// / `completed_at` from the status transition.
    ///
    /// ## Returns
    /// `ConcurrentUpdate` if the expected version no longer matches.
    #[instrument(skip(self, update), fields(instance_id = %instance_id, status = %update.status))]
    pub async fn update_instance(
        &self,
        instance_id: &str,
        expected_version: u64,
        update: InstanceUpdate,
    ) -> EngineResult<()> {
        let status_str = update.status.to_string();
        let context_json = match &update.context {
            Some(ctx) => Some(serde_json::to_string(ctx)?),
            None => None,
        };

        let result = sqlx::query(
            r#"
            UPDATE workflow_instances
            SET status = ?1,
                current_step_index = ?2,
                retry_count = ?3,
                last_error = ?4,
                context_json = COALESCE(?5, context_json),
                version = version + 1,
                last_activity_at = CURRENT_TIMESTAMP,
                updated_at = CURRENT_TIMESTAMP,
                started_at = CASE
                    WHEN started_at IS NULL AND ?1 IN ('ACTIVE', 'RUNNING')
                    THEN CURRENT_TIMESTAMP ELSE started_at END,
                completed_at = CASE
                    WHEN ?1 IN ('COMPLETED', 'FAILED', 'STOPPED', 'UNRECOVERABLE')
                    THEN CURRENT_TIMESTAMP ELSE completed_at END
            WHERE instance_id = ?6 AND version = ?7
            "#,
        )
        .bind(&status_str)
        .bind(update.current_step_index as i64)
        .bind(update.retry_count as i64)
        .bind(&update.last_error)
        .bind(&context_json)
        .bind(instance_id)
        .bind(expected_version as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::Storage(format!("update instance: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(EngineError::ConcurrentUpdate(format!(
                "instance '{instance_id}' version {expected_version} is stale"
            )));
        }
        Ok(())
    }

    /// Status-only CAS, keeping index/retry/context untouched.
    pub async fn update_status(
        &self,
        instance_id: &str,
        expected_version: u64,
        status: InstanceStatus,
        last_error: Option<String>,
    ) -> EngineResult<()> {
        let instance = self.get_instance(instance_id).await?;
        self.update_instance(
            instance_id,
            expected_version,
            InstanceUpdate {
                status,
                current_step_index: instance.current_step_index,
                retry_count: instance.retry_count,
                last_error: last_error.or(instance.last_error),
                context: None,
            },
        )
        .await
    }

    /// CAS the instance to FAILED with the error recorded.
    pub async fn mark_failed(
        &self,
        instance_id: &str,
        expected_version: u64,
        error: &str,
    ) -> EngineResult<()> {
        self.update_status(
            instance_id,
            expected_version,
            InstanceStatus::Failed,
            Some(error.to_string()),
        )
        .await
    }

    /// Refresh `last_activity_at` without bumping the version.
    ///
    /// Heartbeat for an in-flight step: keeps the row out of the recovery
    /// staleness window while its owner is still working, without fencing
    /// out the owner's own CAS write when the step lands.
    pub async fn touch_activity(&self, instance_id: &str) -> EngineResult<()> {
        sqlx::query(
            r#"
            UPDATE workflow_instances
            SET last_activity_at = CURRENT_TIMESTAMP
            WHERE instance_id = ?1
            "#,
        )
        .bind(instance_id)
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::Storage(format!("touch activity: {e}")))?;
        Ok(())
    }

    /// Instances whose last activity timestamp falls inside the staleness
    /// window and whose status suggests in-flight work with no live owner.
    #[instrument(skip(self))]
    pub async fn list_stale_instances(
        &self,
        min_age_secs: i64,
        max_age_secs: i64,
    ) -> EngineResult<Vec<WorkflowInstance>> {
        let sql = format!(
            "SELECT {} FROM workflow_instances
             WHERE status IN ('ACTIVE', 'RUNNING', 'RECOVERING')
               AND (julianday('now') - julianday(last_activity_at)) * 86400 >= ?1
               AND (julianday('now') - julianday(last_activity_at)) * 86400 <= ?2
             ORDER BY last_activity_at",
            Self::INSTANCE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(min_age_secs)
            .bind(max_age_secs)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| EngineError::Storage(format!("list stale instances: {e}")))?;

        rows.iter().map(Self::instance_from_row).collect()
    }

    /// Delete terminal instances older than the retention window.
    /// Non-terminal instances are never deleted here.
    #[instrument(skip(self))]
    pub async fn delete_terminal_older_than(&self, days: i64) -> EngineResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM workflow_instances
            WHERE status IN ('COMPLETED', 'FAILED', 'STOPPED', 'UNRECOVERABLE')
              AND (julianday('now') - julianday(COALESCE(completed_at, updated_at))) > ?1
            "#,
        )
        .bind(days)
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::Storage(format!("delete terminal instances: {e}")))?;
        Ok(result.rows_affected())
    }

    /// Backdate an instance's activity timestamp. Used by recovery tests
    /// and operational tooling to simulate/repair staleness.
    pub async fn backdate_activity(
        &self,
        instance_id: &str,
        age_secs: i64,
    ) -> EngineResult<()> {
        sqlx::query(
            r#"
            UPDATE workflow_instances
            SET last_activity_at = datetime('now', '-' || ?1 || ' seconds')
            WHERE instance_id = ?2
            "#,
        )
        .bind(age_secs)
        .bind(instance_id)
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::Storage(format!("backdate activity: {e}")))?;
        Ok(())
    }

    fn instance_from_row(row: &SqliteRow) -> EngineResult<WorkflowInstance> {
        let status_str: String = row.get("status");
        let context_json: Option<String> = row.get("context_json");
        let context = match context_json {
            Some(json) if !json.is_empty() => serde_json::from_str(&json)?,
            _ => Value::Null,
        };
        let current_step_index: i64 = row.get("current_step_index");
        let retry_count: i64 = row.get("retry_count");
        let version: i64 = row.get("version");

        Ok(WorkflowInstance {
            instance_id: row.get("instance_id"),
            account_id: row.get("account_id"),
            workflow_type: row.get("workflow_type"),
            status: InstanceStatus::from_string(&status_str)?,
            current_step_index: current_step_index as usize,
            retry_count: retry_count as u32,
            last_error: row.get("last_error"),
            context,
            version: version as u64,
            started_at: row.get::<Option<DateTime<Utc>>, _>("started_at"),
            completed_at: row.get::<Option<DateTime<Utc>>, _>("completed_at"),
            last_activity_at: row.get::<DateTime<Utc>, _>("last_activity_at"),
            created_at: row.get::<DateTime<Utc>, _>("created_at"),
        })
    }

    // ------------------------------------------------------------------
    // Execution log
    // ------------------------------------------------------------------

    /// Append one entry to the execution log.
    pub async fn append_log(
        &self,
        instance_id: &str,
        step_id: &str,
        action: &str,
        success: bool,
        payload: Option<&Value>,
        error: Option<&str>,
        loop_created: bool,
    ) -> EngineResult<String> {
        let log_id = Ulid::new().to_string();
        let payload_json = match payload {
            Some(p) => Some(serde_json::to_string(p)?),
            None => None,
        };

        sqlx::query(
            r#"
            INSERT INTO execution_log
                (log_id, instance_id, step_id, action, success, payload_json, error, loop_created)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(&log_id)
        .bind(instance_id)
        .bind(step_id)
        .bind(action)
        .bind(success)
        .bind(&payload_json)
        .bind(error)
        .bind(loop_created)
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::Storage(format!("append log: {e}")))?;

        Ok(log_id)
    }

    /// All log entries for an instance in execution order.
    ///
    /// Ordered by rowid, not log_id: ulids generated within the same
    /// millisecond carry random low bits and do not sort by insertion.
    pub async fn list_logs(&self, instance_id: &str) -> EngineResult<Vec<ExecutionLogEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT log_id, instance_id, step_id, action, success, payload_json,
                   error, loop_created, created_at
            FROM execution_log
            WHERE instance_id = ?1
            ORDER BY rowid
            "#,
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EngineError::Storage(format!("list logs: {e}")))?;

        rows.iter()
            .map(|row| {
                let payload_json: Option<String> = row.get("payload_json");
                let payload = match payload_json {
                    Some(json) if !json.is_empty() => Some(serde_json::from_str(&json)?),
                    _ => None,
                };
                Ok(ExecutionLogEntry {
                    log_id: row.get("log_id"),
                    instance_id: row.get("instance_id"),
                    step_id: row.get("step_id"),
                    action: row.get("action"),
                    success: row.get("success"),
                    payload,
                    error: row.get("error"),
                    loop_created: row.get("loop_created"),
                    created_at: row.get::<DateTime<Utc>, _>("created_at"),
                })
            })
            .collect()
    }

    /// Delete log entries older than the retention window.
    #[instrument(skip(self))]
    pub async fn delete_logs_older_than(&self, days: i64) -> EngineResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM execution_log
            WHERE (julianday('now') - julianday(created_at)) > ?1
            "#,
        )
        .bind(days)
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::Storage(format!("delete old logs: {e}")))?;
        Ok(result.rows_affected())
    }

    // ------------------------------------------------------------------
    // Config and metrics
    // ------------------------------------------------------------------

    /// Read one config value.
    pub async fn config_get(&self, key: &str) -> EngineResult<Option<String>> {
        let row = sqlx::query(r#"SELECT config_value FROM engine_config WHERE config_key = ?1"#)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| EngineError::Storage(format!("config get: {e}")))?;
        Ok(row.map(|r| r.get("config_value")))
    }

    /// Write one config value (upsert).
    pub async fn config_set(&self, key: &str, value: &str) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO engine_config (config_key, config_value)
            VALUES (?1, ?2)
            ON CONFLICT(config_key) DO UPDATE SET
                config_value = excluded.config_value,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::Storage(format!("config set: {e}")))?;
        Ok(())
    }

    /// Increment a counter metric.
    pub async fn metric_increment(&self, key: &str, by: i64) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_metrics (metric_key, metric_value)
            VALUES (?1, ?2)
            ON CONFLICT(metric_key) DO UPDATE SET
                metric_value = metric_value + excluded.metric_value,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(key)
        .bind(by)
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::Storage(format!("metric increment: {e}")))?;
        Ok(())
    }

    /// Read a counter metric (0 when absent).
    pub async fn metric_get(&self, key: &str) -> EngineResult<i64> {
        let row =
            sqlx::query(r#"SELECT metric_value FROM workflow_metrics WHERE metric_key = ?1"#)
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| EngineError::Storage(format!("metric get: {e}")))?;
        Ok(row.map(|r| r.get("metric_value")).unwrap_or(0))
    }

    /// Instance counts grouped by status.
    pub async fn status_counts(&self) -> EngineResult<HashMap<String, i64>> {
        let rows = sqlx::query(
            r#"SELECT status, COUNT(*) AS count FROM workflow_instances GROUP BY status"#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EngineError::Storage(format!("status counts: {e}")))?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get("status"), row.get("count")))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExecutionPolicy, Step, StepAction};
    use serde_json::json;

    fn sample_definition() -> WorkflowDefinition {
        WorkflowDefinition {
            workflow_type: "onboarding".to_string(),
            name: "Onboarding".to_string(),
            description: Some("initial setup".to_string()),
            steps: vec![Step {
                id: "bio".to_string(),
                action: StepAction::UpdateBio,
                params: json!({}),
                critical: false,
            }],
            policy: ExecutionPolicy::default(),
        }
    }

    #[tokio::test]
    async fn test_definition_round_trip() {
        let storage = EngineStorage::new_in_memory().await.unwrap();
        storage.save_definition(&sample_definition()).await.unwrap();

        let loaded = storage.get_definition("onboarding").await.unwrap();
        assert_eq!(loaded.name, "Onboarding");
        assert_eq!(loaded.steps.len(), 1);

        assert!(matches!(
            storage.get_definition("missing").await,
            Err(EngineError::NotFound(_))
        ));

        assert!(storage.delete_definition("onboarding").await.unwrap());
        assert!(!storage.delete_definition("onboarding").await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_definition_rejected() {
        let storage = EngineStorage::new_in_memory().await.unwrap();
        let mut def = sample_definition();
        def.steps.clear();
        assert!(matches!(
            storage.save_definition(&def).await,
            Err(EngineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_one_live_instance_per_account() {
        let storage = EngineStorage::new_in_memory().await.unwrap();

        let first = storage
            .create_instance("acct-1", "onboarding", json!({}))
            .await
            .unwrap();
        assert_eq!(first.status, InstanceStatus::Pending);
        assert_eq!(first.version, 1);

        // Second live instance for the same account is rejected by the DB
        let second = storage.create_instance("acct-1", "onboarding", json!({})).await;
        assert!(matches!(second, Err(EngineError::Validation(_))));

        // Other accounts are unaffected
        storage
            .create_instance("acct-2", "onboarding", json!({}))
            .await
            .unwrap();

        // After the first reaches a terminal status, a new one is allowed
        storage
            .update_status(&first.instance_id, 1, InstanceStatus::Stopped, None)
            .await
            .unwrap();
        storage
            .create_instance("acct-1", "onboarding", json!({}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cas_rejects_stale_version() {
        let storage = EngineStorage::new_in_memory().await.unwrap();
        let instance = storage
            .create_instance("acct-1", "onboarding", json!({}))
            .await
            .unwrap();

        storage
            .update_status(&instance.instance_id, 1, InstanceStatus::Active, None)
            .await
            .unwrap();

        // Version already moved to 2; a writer holding version 1 loses
        let stale = storage
            .update_status(&instance.instance_id, 1, InstanceStatus::Paused, None)
            .await;
        assert!(matches!(stale, Err(EngineError::ConcurrentUpdate(_))));

        let loaded = storage.get_instance(&instance.instance_id).await.unwrap();
        assert_eq!(loaded.status, InstanceStatus::Active);
        assert_eq!(loaded.version, 2);
        assert!(loaded.started_at.is_some());
    }

    #[tokio::test]
    async fn test_update_instance_fields() {
        let storage = EngineStorage::new_in_memory().await.unwrap();
        let instance = storage
            .create_instance("acct-1", "onboarding", json!({"model": "m1"}))
            .await
            .unwrap();

        storage
            .update_instance(
                &instance.instance_id,
                1,
                InstanceUpdate {
                    status: InstanceStatus::Active,
                    current_step_index: 3,
                    retry_count: 2,
                    last_error: Some("transient".to_string()),
                    context: Some(json!({"model": "m2"})),
                },
            )
            .await
            .unwrap();

        let loaded = storage.get_instance(&instance.instance_id).await.unwrap();
        assert_eq!(loaded.current_step_index, 3);
        assert_eq!(loaded.retry_count, 2);
        assert_eq!(loaded.last_error.as_deref(), Some("transient"));
        assert_eq!(loaded.context, json!({"model": "m2"}));
        assert_eq!(loaded.version, 2);
    }

    #[tokio::test]
    async fn test_stale_instance_listing_window() {
        let storage = EngineStorage::new_in_memory().await.unwrap();
        let stale = storage
            .create_instance("acct-1", "onboarding", json!({}))
            .await
            .unwrap();
        storage
            .update_status(&stale.instance_id, 1, InstanceStatus::Active, None)
            .await
            .unwrap();
        storage
            .backdate_activity(&stale.instance_id, 7200)
            .await
            .unwrap();

        // Fresh active instance stays out of the window
        let fresh = storage
            .create_instance("acct-2", "onboarding", json!({}))
            .await
            .unwrap();
        storage
            .update_status(&fresh.instance_id, 1, InstanceStatus::Active, None)
            .await
            .unwrap();

        // Paused instances are never candidates
        let paused = storage
            .create_instance("acct-3", "onboarding", json!({}))
            .await
            .unwrap();
        storage
            .update_status(&paused.instance_id, 1, InstanceStatus::Paused, None)
            .await
            .unwrap();
        storage
            .backdate_activity(&paused.instance_id, 7200)
            .await
            .unwrap();

        let found = storage.list_stale_instances(600, 86400).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].instance_id, stale.instance_id);

        // Too old falls outside the window
        storage
            .backdate_activity(&stale.instance_id, 200_000)
            .await
            .unwrap();
        let found = storage.list_stale_instances(600, 86400).await.unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_touch_activity_clears_staleness() {
        let storage = EngineStorage::new_in_memory().await.unwrap();
        let instance = storage
            .create_instance("acct-1", "onboarding", json!({}))
            .await
            .unwrap();
        storage
            .update_status(&instance.instance_id, 1, InstanceStatus::Running, None)
            .await
            .unwrap();
        storage
            .backdate_activity(&instance.instance_id, 700)
            .await
            .unwrap();
        assert_eq!(storage.list_stale_instances(600, 86400).await.unwrap().len(), 1);

        // A heartbeat touch pulls it back out of the window without
        // bumping the version
        storage.touch_activity(&instance.instance_id).await.unwrap();
        assert!(storage.list_stale_instances(600, 86400).await.unwrap().is_empty());
        let touched = storage.get_instance(&instance.instance_id).await.unwrap();
        assert_eq!(touched.version, 2);
        assert_eq!(touched.status, InstanceStatus::Running);
    }

    #[tokio::test]
    async fn test_mark_failed_records_error_and_fences() {
        let storage = EngineStorage::new_in_memory().await.unwrap();
        let instance = storage
            .create_instance("acct-1", "onboarding", json!({}))
            .await
            .unwrap();

        // Stale version loses
        let err = storage
            .mark_failed(&instance.instance_id, 99, "boom")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ConcurrentUpdate(_)));

        storage
            .mark_failed(&instance.instance_id, instance.version, "vendor exploded")
            .await
            .unwrap();
        let failed = storage.get_instance(&instance.instance_id).await.unwrap();
        assert_eq!(failed.status, InstanceStatus::Failed);
        assert_eq!(failed.last_error.as_deref(), Some("vendor exploded"));
        assert!(failed.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_execution_log_round_trip() {
        let storage = EngineStorage::new_in_memory().await.unwrap();
        let instance = storage
            .create_instance("acct-1", "onboarding", json!({}))
            .await
            .unwrap();

        storage
            .append_log(
                &instance.instance_id,
                "bio",
                "update-bio",
                true,
                Some(&json!({"task_id": "t1"})),
                None,
                false,
            )
            .await
            .unwrap();
        storage
            .append_log(
                &instance.instance_id,
                "loop",
                "goto",
                true,
                None,
                None,
                true,
            )
            .await
            .unwrap();

        let logs = storage.list_logs(&instance.instance_id).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].step_id, "bio");
        assert!(logs[0].success);
        assert_eq!(logs[0].payload, Some(json!({"task_id": "t1"})));
        assert!(!logs[0].loop_created);
        assert!(logs[1].loop_created);
    }

    #[tokio::test]
    async fn test_log_order_stable_within_one_millisecond() {
        let storage = EngineStorage::new_in_memory().await.unwrap();
        let instance = storage
            .create_instance("acct-1", "onboarding", json!({}))
            .await
            .unwrap();

        // A tight burst lands many entries in the same millisecond; the
        // returned order must still be the append order
        for i in 0..50 {
            storage
                .append_log(
                    &instance.instance_id,
                    &format!("step-{i}"),
                    "update-bio",
                    true,
                    None,
                    None,
                    false,
                )
                .await
                .unwrap();
        }

        let logs = storage.list_logs(&instance.instance_id).await.unwrap();
        assert_eq!(logs.len(), 50);
        for (i, entry) in logs.iter().enumerate() {
            assert_eq!(entry.step_id, format!("step-{i}"));
        }
    }

    #[tokio::test]
    async fn test_config_and_metrics() {
        let storage = EngineStorage::new_in_memory().await.unwrap();

        assert_eq!(storage.config_get("timeout.default").await.unwrap(), None);
        storage.config_set("timeout.default", "120000").await.unwrap();
        assert_eq!(
            storage.config_get("timeout.default").await.unwrap(),
            Some("120000".to_string())
        );
        storage.config_set("timeout.default", "90000").await.unwrap();
        assert_eq!(
            storage.config_get("timeout.default").await.unwrap(),
            Some("90000".to_string())
        );

        assert_eq!(storage.metric_get("steps_executed").await.unwrap(), 0);
        storage.metric_increment("steps_executed", 1).await.unwrap();
        storage.metric_increment("steps_executed", 2).await.unwrap();
        assert_eq!(storage.metric_get("steps_executed").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_status_counts() {
        let storage = EngineStorage::new_in_memory().await.unwrap();
        let a = storage
            .create_instance("acct-1", "onboarding", json!({}))
            .await
            .unwrap();
        storage
            .create_instance("acct-2", "onboarding", json!({}))
            .await
            .unwrap();
        storage
            .update_status(&a.instance_id, 1, InstanceStatus::Completed, None)
            .await
            .unwrap();

        let counts = storage.status_counts().await.unwrap();
        assert_eq!(counts.get("PENDING"), Some(&1));
        assert_eq!(counts.get("COMPLETED"), Some(&1));
    }
}
