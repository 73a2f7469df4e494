// Persistent timer-job store
//
// Lives in its own SQLite file, separate from the application store, so the
// executions database can be dropped and rebuilt without losing schedules.

use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;

use flowpilot_core::Trigger;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS scheduler_jobs (
    id            TEXT PRIMARY KEY,
    workflow_name TEXT NOT NULL UNIQUE,
    workflow_path TEXT NOT NULL,
    trigger_json  TEXT NOT NULL,
    next_run      TEXT,
    paused        INTEGER NOT NULL DEFAULT 0
)
"#;

/// One persisted timer job (key: `workflow:{name}`).
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct JobRow {
    pub id: String,
    pub workflow_name: String,
    pub workflow_path: String,
    pub trigger_json: String,
    pub next_run: Option<DateTime<Utc>>,
    pub paused: i64,
}

impl JobRow {
    pub fn trigger(&self) -> Option<Trigger> {
        serde_json::from_str(&self.trigger_json).ok()
    }

    pub fn is_paused(&self) -> bool {
        self.paused != 0
    }
}

pub fn job_id(workflow_name: &str) -> String {
    format!("workflow:{workflow_name}")
}

/// SQLite-backed job persistence.
#[derive(Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(3)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open job store at {}", path.display()))?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn upsert(
        &self,
        workflow_name: &str,
        workflow_path: &str,
        trigger: &Trigger,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<JobRow> {
        let trigger_json = serde_json::to_string(trigger)?;
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            INSERT INTO scheduler_jobs (id, workflow_name, workflow_path, trigger_json, next_run, paused)
            VALUES (?, ?, ?, ?, ?, 0)
            ON CONFLICT (workflow_name) DO UPDATE SET
                workflow_path = excluded.workflow_path,
                trigger_json = excluded.trigger_json,
                next_run = excluded.next_run,
                paused = 0
            RETURNING id, workflow_name, workflow_path, trigger_json, next_run, paused
            "#,
        )
        .bind(job_id(workflow_name))
        .bind(workflow_name)
        .bind(workflow_path)
        .bind(&trigger_json)
        .bind(next_run)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get(&self, workflow_name: &str) -> Result<Option<JobRow>> {
        let row = sqlx::query_as::<_, JobRow>(
            "SELECT id, workflow_name, workflow_path, trigger_json, next_run, paused FROM scheduler_jobs WHERE workflow_name = ?",
        )
        .bind(workflow_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list(&self) -> Result<Vec<JobRow>> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT id, workflow_name, workflow_path, trigger_json, next_run, paused FROM scheduler_jobs ORDER BY workflow_name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn set_next_run(
        &self,
        workflow_name: &str,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query("UPDATE scheduler_jobs SET next_run = ? WHERE workflow_name = ?")
            .bind(next_run)
            .bind(workflow_name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_paused(&self, workflow_name: &str, paused: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE scheduler_jobs SET paused = ? WHERE workflow_name = ?")
            .bind(paused as i64)
            .bind(workflow_name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn remove(&self, workflow_name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM scheduler_jobs WHERE workflow_name = ?")
            .bind(workflow_name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cron_trigger() -> Trigger {
        serde_json::from_value(serde_json::json!({
            "type": "cron", "schedule": "0 2 * * *",
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_upsert_and_roundtrip() {
        let store = JobStore::in_memory().await.unwrap();
        let row = store
            .upsert("nightly", "/tmp/nightly.yaml", &cron_trigger(), Some(Utc::now()))
            .await
            .unwrap();
        assert_eq!(row.id, "workflow:nightly");
        assert!(!row.is_paused());
        assert_eq!(row.trigger().unwrap().kind(), "cron");

        // upsert replaces rather than duplicating
        store
            .upsert("nightly", "/tmp/nightly.yaml", &cron_trigger(), None)
            .await
            .unwrap();
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_pause_and_remove() {
        let store = JobStore::in_memory().await.unwrap();
        store
            .upsert("nightly", "/tmp/nightly.yaml", &cron_trigger(), None)
            .await
            .unwrap();

        assert!(store.set_paused("nightly", true).await.unwrap());
        assert!(store.get("nightly").await.unwrap().unwrap().is_paused());

        // pausing an unknown job reports false
        assert!(!store.set_paused("ghost", true).await.unwrap());

        assert!(store.remove("nightly").await.unwrap());
        assert!(store.get("nightly").await.unwrap().is_none());
    }
}
