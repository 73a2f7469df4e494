// Repository layer for the execution store
//
// One method set on Database, grouped by table. All timestamps are UTC.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::database::Database;
use crate::models::*;

impl Database {
    // ============================================
    // Executions
    // ============================================

    pub async fn create_execution(&self, input: CreateExecution) -> Result<ExecutionRow> {
        let inputs_json = serde_json::to_string(&input.inputs)?;
        let row = sqlx::query_as::<_, ExecutionRow>(
            r#"
            INSERT INTO executions (id, workflow_name, workflow_path, status, trigger_type, inputs, started_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING id, workflow_name, workflow_path, status, trigger_type, inputs, started_at, finished_at, duration_ms, error
            "#,
        )
        .bind(input.id.to_string())
        .bind(&input.workflow_name)
        .bind(&input.workflow_path)
        .bind(input.status.as_str())
        .bind(&input.trigger_type)
        .bind(&inputs_json)
        .bind(Utc::now())
        .fetch_one(self.pool())
        .await?;

        Ok(row)
    }

    pub async fn update_execution_status(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        finished_at: Option<DateTime<Utc>>,
        duration_ms: Option<i64>,
        error: Option<&str>,
    ) -> Result<Option<ExecutionRow>> {
        let row = sqlx::query_as::<_, ExecutionRow>(
            r#"
            UPDATE executions
            SET status = ?,
                finished_at = COALESCE(?, finished_at),
                duration_ms = COALESCE(?, duration_ms),
                error = COALESCE(?, error)
            WHERE id = ?
            RETURNING id, workflow_name, workflow_path, status, trigger_type, inputs, started_at, finished_at, duration_ms, error
            "#,
        )
        .bind(status.as_str())
        .bind(finished_at)
        .bind(duration_ms)
        .bind(error)
        .bind(id.to_string())
        .fetch_optional(self.pool())
        .await?;

        Ok(row)
    }

    pub async fn get_execution(&self, id: Uuid) -> Result<Option<ExecutionRow>> {
        let row = sqlx::query_as::<_, ExecutionRow>(
            r#"
            SELECT id, workflow_name, workflow_path, status, trigger_type, inputs, started_at, finished_at, duration_ms, error
            FROM executions
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(self.pool())
        .await?;

        Ok(row)
    }

    /// List executions newest-first with optional workflow/status filters.
    pub async fn list_executions(
        &self,
        workflow: Option<&str>,
        status: Option<ExecutionStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ExecutionRow>> {
        let rows = sqlx::query_as::<_, ExecutionRow>(
            r#"
            SELECT id, workflow_name, workflow_path, status, trigger_type, inputs, started_at, finished_at, duration_ms, error
            FROM executions
            WHERE (? IS NULL OR workflow_name = ?)
              AND (? IS NULL OR status = ?)
            ORDER BY started_at DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(workflow)
        .bind(workflow)
        .bind(status.map(|s| s.as_str()))
        .bind(status.map(|s| s.as_str()))
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool())
        .await?;

        Ok(rows)
    }

    /// Aggregate statistics, optionally restricted to one workflow.
    pub async fn execution_stats(&self, workflow: Option<&str>) -> Result<ExecutionStats> {
        let rows = sqlx::query_as::<_, ExecutionRow>(
            r#"
            SELECT id, workflow_name, workflow_path, status, trigger_type, inputs, started_at, finished_at, duration_ms, error
            FROM executions
            WHERE (? IS NULL OR workflow_name = ?)
            "#,
        )
        .bind(workflow)
        .bind(workflow)
        .fetch_all(self.pool())
        .await?;

        let total = rows.len() as i64;
        let count = |status: ExecutionStatus| {
            rows.iter().filter(|r| r.status() == status).count() as i64
        };
        let success_count = count(ExecutionStatus::Success);
        let failed_count = count(ExecutionStatus::Failed);
        let cancelled_count = count(ExecutionStatus::Cancelled);
        let running_count = count(ExecutionStatus::Running);
        let pending_count = count(ExecutionStatus::Pending);

        let completed = success_count + failed_count + cancelled_count;
        let success_rate = if completed > 0 {
            success_count as f64 / completed as f64
        } else {
            0.0
        };

        let durations: Vec<i64> = rows.iter().filter_map(|r| r.duration_ms).collect();
        let avg_duration_ms = if durations.is_empty() {
            None
        } else {
            Some(durations.iter().sum::<i64>() as f64 / durations.len() as f64)
        };

        let mut executions_by_workflow = std::collections::HashMap::new();
        for row in &rows {
            *executions_by_workflow
                .entry(row.workflow_name.clone())
                .or_insert(0) += 1;
        }

        Ok(ExecutionStats {
            total_executions: total,
            success_count,
            failed_count,
            cancelled_count,
            running_count,
            pending_count,
            success_rate,
            avg_duration_ms,
            executions_by_workflow,
        })
    }

    /// Delete one execution (cascades to its node rows).
    pub async fn delete_execution(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM executions WHERE id = ?")
            .bind(id.to_string())
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete executions whose started_at is older than `days` days.
    /// Returns the number of executions removed.
    pub async fn cleanup_old_executions(&self, days: i64) -> Result<u64> {
        let cutoff = Utc::now() - Duration::days(days);
        let result = sqlx::query("DELETE FROM executions WHERE started_at < ?")
            .bind(cutoff)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }

    // ============================================
    // Node executions
    // ============================================

    pub async fn create_node_execution(
        &self,
        input: CreateNodeExecution,
    ) -> Result<NodeExecutionRow> {
        let row = sqlx::query_as::<_, NodeExecutionRow>(
            r#"
            INSERT INTO node_executions (execution_id, node_id, node_type, status, started_at, finished_at, duration_ms, stdout, stderr, output, error)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id, execution_id, node_id, node_type, status, started_at, finished_at, duration_ms, stdout, stderr, output, error
            "#,
        )
        .bind(input.execution_id.to_string())
        .bind(&input.node_id)
        .bind(&input.node_type)
        .bind(&input.status)
        .bind(input.started_at)
        .bind(input.finished_at)
        .bind(input.duration_ms)
        .bind(&input.stdout)
        .bind(&input.stderr)
        .bind(&input.output)
        .bind(&input.error)
        .fetch_one(self.pool())
        .await?;

        Ok(row)
    }

    /// All node rows for an execution, in insertion order.
    pub async fn list_node_executions(&self, execution_id: Uuid) -> Result<Vec<NodeExecutionRow>> {
        let rows = sqlx::query_as::<_, NodeExecutionRow>(
            r#"
            SELECT id, execution_id, node_id, node_type, status, started_at, finished_at, duration_ms, stdout, stderr, output, error
            FROM node_executions
            WHERE execution_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(execution_id.to_string())
        .fetch_all(self.pool())
        .await?;

        Ok(rows)
    }

    // ============================================
    // Schedules
    // ============================================

    pub async fn upsert_schedule(&self, input: UpsertSchedule) -> Result<ScheduleRow> {
        let trigger_config = input
            .trigger_config
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let now = Utc::now();

        let row = sqlx::query_as::<_, ScheduleRow>(
            r#"
            INSERT INTO schedules (workflow_name, workflow_path, enabled, trigger_config, next_run, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (workflow_name) DO UPDATE SET
                workflow_path = excluded.workflow_path,
                enabled = excluded.enabled,
                trigger_config = excluded.trigger_config,
                next_run = excluded.next_run,
                updated_at = excluded.updated_at
            RETURNING id, workflow_name, workflow_path, enabled, trigger_config, next_run, last_run, last_status, created_at, updated_at
            "#,
        )
        .bind(&input.workflow_name)
        .bind(&input.workflow_path)
        .bind(input.enabled as i64)
        .bind(&trigger_config)
        .bind(input.next_run)
        .bind(now)
        .bind(now)
        .fetch_one(self.pool())
        .await?;

        Ok(row)
    }

    pub async fn get_schedule(&self, workflow_name: &str) -> Result<Option<ScheduleRow>> {
        let row = sqlx::query_as::<_, ScheduleRow>(
            r#"
            SELECT id, workflow_name, workflow_path, enabled, trigger_config, next_run, last_run, last_status, created_at, updated_at
            FROM schedules
            WHERE workflow_name = ?
            "#,
        )
        .bind(workflow_name)
        .fetch_optional(self.pool())
        .await?;

        Ok(row)
    }

    pub async fn list_schedules(&self) -> Result<Vec<ScheduleRow>> {
        let rows = sqlx::query_as::<_, ScheduleRow>(
            r#"
            SELECT id, workflow_name, workflow_path, enabled, trigger_config, next_run, last_run, last_status, created_at, updated_at
            FROM schedules
            ORDER BY workflow_name
            "#,
        )
        .fetch_all(self.pool())
        .await?;

        Ok(rows)
    }

    pub async fn set_schedule_enabled(&self, workflow_name: &str, enabled: bool) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE schedules SET enabled = ?, next_run = CASE WHEN ? THEN next_run ELSE NULL END, updated_at = ? WHERE workflow_name = ?",
        )
        .bind(enabled as i64)
        .bind(enabled as i64)
        .bind(Utc::now())
        .bind(workflow_name)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record the outcome of a scheduled firing.
    pub async fn update_schedule_run(
        &self,
        workflow_name: &str,
        last_status: &str,
        last_run: DateTime<Utc>,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE schedules SET last_run = ?, last_status = ?, next_run = ?, updated_at = ? WHERE workflow_name = ?",
        )
        .bind(last_run)
        .bind(last_status)
        .bind(next_run)
        .bind(Utc::now())
        .bind(workflow_name)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_schedule(&self, workflow_name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM schedules WHERE workflow_name = ?")
            .bind(workflow_name)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
