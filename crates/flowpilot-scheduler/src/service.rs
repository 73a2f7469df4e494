// Cron/interval scheduler service
//
// One tokio timer task per scheduled workflow. The task sleeps to the next
// occurrence and runs the workflow inline, so at most one instance per
// workflow is ever running and missed fires within the misfire grace window
// collapse into a single firing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Map;
use tokio::task::JoinHandle;

use flowpilot_core::Trigger;
use flowpilot_engine::WorkflowRunner;
use flowpilot_storage::Database;

use crate::jobs::{job_id, JobStore};
use crate::triggers::TriggerSchedule;

const MISFIRE_GRACE_SECONDS: i64 = 60;

struct JobHandle {
    task: JoinHandle<()>,
    description: String,
}

/// Info about one scheduled workflow.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleInfo {
    pub id: String,
    pub name: String,
    pub next_run: Option<DateTime<Utc>>,
    pub trigger: String,
    pub paused: bool,
}

/// Timer-driven scheduler with persistent jobs.
pub struct SchedulerService {
    store: JobStore,
    db: Database,
    runner: Arc<WorkflowRunner>,
    jobs: Mutex<HashMap<String, JobHandle>>,
    running: AtomicBool,
}

impl SchedulerService {
    pub fn new(store: JobStore, db: Database, runner: Arc<WorkflowRunner>) -> Self {
        Self {
            store,
            db,
            runner,
            jobs: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the scheduler, resuming every persisted non-paused job.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        for job in self.store.list().await? {
            if job.is_paused() {
                continue;
            }
            let Some(trigger) = job.trigger() else {
                tracing::warn!(workflow = %job.workflow_name, "persisted job has unreadable trigger, skipping");
                continue;
            };
            match TriggerSchedule::parse(&trigger) {
                Ok(schedule) => {
                    self.spawn_job(&job.workflow_name, &job.workflow_path, schedule);
                }
                Err(e) => {
                    tracing::warn!(workflow = %job.workflow_name, "persisted job trigger invalid: {e}");
                }
            }
        }

        tracing::info!("scheduler started");
        Ok(())
    }

    /// Stop all timer tasks. Persisted jobs resume on the next start.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        for (_, job) in self.jobs.lock().drain() {
            job.task.abort();
        }
        tracing::info!("scheduler stopped");
    }

    /// Schedule (or reschedule) a workflow with a cron/interval trigger.
    pub async fn schedule_workflow(
        self: &Arc<Self>,
        workflow_name: &str,
        workflow_path: &str,
        trigger: &Trigger,
    ) -> Result<String> {
        let schedule = TriggerSchedule::parse(trigger)?;
        let next_run = schedule.next_fire(Utc::now());
        self.store
            .upsert(workflow_name, workflow_path, trigger, next_run)
            .await?;
        self.spawn_job(workflow_name, workflow_path, schedule);
        tracing::info!(workflow = workflow_name, "scheduled workflow");
        Ok(job_id(workflow_name))
    }

    fn spawn_job(self: &Arc<Self>, workflow_name: &str, workflow_path: &str, schedule: TriggerSchedule) {
        let mut jobs = self.jobs.lock();
        if let Some(previous) = jobs.remove(workflow_name) {
            previous.task.abort();
        }

        let description = schedule.describe();
        let service = self.clone();
        let name = workflow_name.to_string();
        let path = workflow_path.to_string();

        let task = tokio::spawn(async move {
            service.job_loop(name, path, schedule).await;
        });

        jobs.insert(
            workflow_name.to_string(),
            JobHandle { task, description },
        );
    }

    async fn job_loop(self: Arc<Self>, workflow_name: String, workflow_path: String, schedule: TriggerSchedule) {
        loop {
            let now = Utc::now();
            let Some(next) = schedule.next_fire(now) else {
                tracing::warn!(workflow = %workflow_name, "schedule has no future occurrence, stopping job");
                break;
            };

            if let Err(e) = self.store.set_next_run(&workflow_name, Some(next)).await {
                tracing::error!(workflow = %workflow_name, "failed to persist next_run: {e}");
            }

            let wait = (next - now).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;

            // coalesce: a fire observed too late is skipped, not replayed
            let lateness = Utc::now() - next;
            if lateness > Duration::seconds(MISFIRE_GRACE_SECONDS) {
                tracing::warn!(
                    workflow = %workflow_name,
                    late_seconds = lateness.num_seconds(),
                    "missed fire beyond grace window, skipping"
                );
                continue;
            }

            self.fire(&workflow_name, &workflow_path, &schedule).await;
        }
    }

    /// Run the workflow once and record the outcome on its schedule row.
    async fn fire(&self, workflow_name: &str, workflow_path: &str, schedule: &TriggerSchedule) {
        tracing::info!(workflow = workflow_name, "executing scheduled workflow");
        let fired_at = Utc::now();

        let status = match self
            .runner
            .run_file(workflow_path, Map::new(), None, "scheduled")
            .await
        {
            Ok(ctx) => ctx.state.to_string(),
            Err(e) => {
                tracing::error!(workflow = workflow_name, "scheduled run failed: {e}");
                "failed".to_string()
            }
        };

        let next_run = schedule.next_fire(Utc::now());
        if let Err(e) = self
            .db
            .update_schedule_run(workflow_name, &status, fired_at, next_run)
            .await
        {
            tracing::error!(workflow = workflow_name, "failed to update schedule row: {e}");
        }
        if let Err(e) = self.store.set_next_run(workflow_name, next_run).await {
            tracing::error!(workflow = workflow_name, "failed to persist next_run: {e}");
        }
    }

    /// Remove a workflow's schedule entirely.
    pub async fn remove_schedule(&self, workflow_name: &str) -> Result<bool> {
        if let Some(job) = self.jobs.lock().remove(workflow_name) {
            job.task.abort();
        }
        let removed = self.store.remove(workflow_name).await?;
        if removed {
            tracing::info!(workflow = workflow_name, "removed schedule");
        }
        Ok(removed)
    }

    /// Pause the timer without removing the persisted job.
    pub async fn pause_schedule(&self, workflow_name: &str) -> Result<bool> {
        let paused = {
            let mut jobs = self.jobs.lock();
            match jobs.remove(workflow_name) {
                Some(job) => {
                    job.task.abort();
                    true
                }
                None => false,
            }
        };
        if paused {
            self.store.set_paused(workflow_name, true).await?;
            self.store.set_next_run(workflow_name, None).await?;
            tracing::info!(workflow = workflow_name, "paused schedule");
        }
        Ok(paused)
    }

    /// Resume a paused schedule.
    pub async fn resume_schedule(self: &Arc<Self>, workflow_name: &str) -> Result<bool> {
        let Some(job) = self.store.get(workflow_name).await? else {
            return Ok(false);
        };
        let Some(trigger) = job.trigger() else {
            return Ok(false);
        };
        let schedule = TriggerSchedule::parse(&trigger)?;
        self.store.set_paused(workflow_name, false).await?;
        self.spawn_job(workflow_name, &job.workflow_path, schedule);
        tracing::info!(workflow = workflow_name, "resumed schedule");
        Ok(true)
    }

    pub async fn get_schedule(&self, workflow_name: &str) -> Result<Option<ScheduleInfo>> {
        let Some(row) = self.store.get(workflow_name).await? else {
            return Ok(None);
        };
        let description = self
            .jobs
            .lock()
            .get(workflow_name)
            .map(|job| job.description.clone());
        Ok(Some(ScheduleInfo {
            id: row.id.clone(),
            name: row.workflow_name.clone(),
            next_run: if row.is_paused() { None } else { row.next_run },
            trigger: description.unwrap_or_else(|| row.trigger_json.clone()),
            paused: row.is_paused(),
        }))
    }

    pub async fn get_schedules(&self) -> Result<Vec<ScheduleInfo>> {
        let mut infos = Vec::new();
        for row in self.store.list().await? {
            if let Some(info) = self.get_schedule(&row.workflow_name).await? {
                infos.push(info);
            }
        }
        Ok(infos)
    }

    pub async fn next_run(&self, workflow_name: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .get_schedule(workflow_name)
            .await?
            .and_then(|info| info.next_run))
    }
}
