// Schedule manager
//
// Reconciles a workflow's declared triggers with the three trigger services
// (cron/interval scheduler, file watcher, webhook registry) and the
// schedules table.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use flowpilot_core::{Trigger, Workflow, WorkflowParser};
use flowpilot_storage::{Database, UpsertSchedule};

use crate::service::SchedulerService;
use crate::watcher::FileWatchService;
use crate::webhooks::WebhookRegistry;

#[derive(Debug, Error)]
pub enum ScheduleManagerError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("failed to load workflow '{name}': {reason}")]
    InvalidWorkflow { name: String, reason: String },

    #[error("workflow '{0}' has no schedulable triggers (cron, interval, file-watch, or webhook)")]
    NoTriggers(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// What `enable` set up for a workflow.
#[derive(Debug, Clone, Serialize)]
pub struct EnableReport {
    pub workflow_name: String,
    pub scheduled: Vec<Value>,
    pub file_watches: Vec<Value>,
    pub webhooks: Vec<Value>,
}

/// What `disable` tore down.
#[derive(Debug, Clone, Serialize)]
pub struct DisableReport {
    pub workflow_name: String,
    pub schedule_removed: bool,
    pub file_watch_removed: bool,
    pub webhook_removed: bool,
}

/// Combined live + stored view of one workflow's schedule.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleStatus {
    pub name: String,
    pub enabled: bool,
    pub next_run: Option<chrono::DateTime<chrono::Utc>>,
    pub trigger: Option<String>,
    pub file_watch: Option<Value>,
    pub webhook: Option<Value>,
    pub last_run: Option<chrono::DateTime<chrono::Utc>>,
    pub last_status: Option<String>,
}

pub struct ScheduleManager {
    scheduler: Arc<SchedulerService>,
    file_watcher: Arc<FileWatchService>,
    webhooks: Arc<WebhookRegistry>,
    db: Database,
    workflows_dir: PathBuf,
    parser: WorkflowParser,
}

impl ScheduleManager {
    pub fn new(
        scheduler: Arc<SchedulerService>,
        file_watcher: Arc<FileWatchService>,
        webhooks: Arc<WebhookRegistry>,
        db: Database,
        workflows_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            scheduler,
            file_watcher,
            webhooks,
            db,
            workflows_dir: workflows_dir.into(),
            parser: WorkflowParser::new(),
        }
    }

    fn find_workflow_path(&self, workflow_name: &str) -> Result<PathBuf, ScheduleManagerError> {
        for extension in ["yaml", "yml"] {
            let path = self.workflows_dir.join(format!("{workflow_name}.{extension}"));
            if path.exists() {
                return Ok(path);
            }
        }
        Err(ScheduleManagerError::WorkflowNotFound(
            workflow_name.to_string(),
        ))
    }

    fn load_workflow(
        &self,
        workflow_name: &str,
    ) -> Result<(Workflow, PathBuf), ScheduleManagerError> {
        let path = self.find_workflow_path(workflow_name)?;
        let workflow =
            self.parser
                .parse_file(&path)
                .map_err(|e| ScheduleManagerError::InvalidWorkflow {
                    name: workflow_name.to_string(),
                    reason: e.to_string(),
                })?;
        Ok((workflow, path))
    }

    /// Enable every trigger a workflow declares and persist the schedule row.
    pub async fn enable(&self, workflow_name: &str) -> Result<EnableReport, ScheduleManagerError> {
        let (workflow, path) = self.load_workflow(workflow_name)?;
        let path_str = path.display().to_string();

        let schedulable: Vec<&Trigger> = workflow
            .triggers
            .iter()
            .filter(|t| t.is_schedulable())
            .collect();
        let file_watches: Vec<&Trigger> = workflow
            .triggers
            .iter()
            .filter(|t| matches!(t, Trigger::FileWatch { .. }))
            .collect();
        let webhooks: Vec<&Trigger> = workflow
            .triggers
            .iter()
            .filter(|t| matches!(t, Trigger::Webhook { .. }))
            .collect();

        if schedulable.is_empty() && file_watches.is_empty() && webhooks.is_empty() {
            return Err(ScheduleManagerError::NoTriggers(workflow_name.to_string()));
        }

        let mut report = EnableReport {
            workflow_name: workflow_name.to_string(),
            scheduled: Vec::new(),
            file_watches: Vec::new(),
            webhooks: Vec::new(),
        };

        // only the first cron/interval trigger drives the timer job
        let mut next_run = None;
        if let Some(trigger) = schedulable.first() {
            let job_id = self
                .scheduler
                .schedule_workflow(workflow_name, &path_str, trigger)
                .await
                .map_err(ScheduleManagerError::Internal)?;
            next_run = self
                .scheduler
                .next_run(workflow_name)
                .await
                .map_err(ScheduleManagerError::Internal)?;
            report.scheduled.push(json!({
                "type": trigger.kind(),
                "job_id": job_id,
                "next_run": next_run,
            }));
        }

        for trigger in &file_watches {
            if let Trigger::FileWatch {
                path: watch_path,
                events,
                pattern,
            } = trigger
            {
                let watch_id = self
                    .file_watcher
                    .add_watch(
                        workflow_name,
                        Path::new(watch_path),
                        events.clone(),
                        pattern.clone(),
                        &path_str,
                    )
                    .map_err(ScheduleManagerError::Internal)?;
                report.file_watches.push(json!({
                    "watch_id": watch_id,
                    "path": watch_path,
                    "events": events,
                    "pattern": pattern,
                }));
            }
        }

        for trigger in &webhooks {
            if let Trigger::Webhook {
                path: hook_path,
                secret,
            } = trigger
            {
                let webhook_id =
                    self.webhooks
                        .register(hook_path, workflow_name, &path_str, secret.as_deref());
                report.webhooks.push(json!({
                    "webhook_id": webhook_id,
                    "path": hook_path,
                    "has_secret": secret.is_some(),
                }));
            }
        }

        // persist the merged trigger config
        let mut config = serde_json::Map::new();
        if let Some(trigger) = schedulable.first() {
            config.insert("schedule".into(), json!(trigger));
        }
        if !file_watches.is_empty() {
            config.insert("file_watches".into(), json!(file_watches));
        }
        if !webhooks.is_empty() {
            config.insert("webhooks".into(), json!(webhooks));
        }

        self.db
            .upsert_schedule(UpsertSchedule {
                workflow_name: workflow_name.to_string(),
                workflow_path: path_str,
                enabled: true,
                trigger_config: Some(Value::Object(config)),
                next_run,
            })
            .await
            .map_err(ScheduleManagerError::Internal)?;

        tracing::info!(workflow = workflow_name, "enabled schedule");
        Ok(report)
    }

    /// Tear down every trigger for a workflow and mark its schedule disabled.
    pub async fn disable(
        &self,
        workflow_name: &str,
    ) -> Result<DisableReport, ScheduleManagerError> {
        let report = DisableReport {
            workflow_name: workflow_name.to_string(),
            schedule_removed: self
                .scheduler
                .remove_schedule(workflow_name)
                .await
                .map_err(ScheduleManagerError::Internal)?,
            file_watch_removed: self.file_watcher.remove_watch(workflow_name),
            webhook_removed: self.webhooks.unregister(workflow_name),
        };

        self.db
            .set_schedule_enabled(workflow_name, false)
            .await
            .map_err(ScheduleManagerError::Internal)?;

        if report.schedule_removed || report.file_watch_removed || report.webhook_removed {
            tracing::info!(workflow = workflow_name, "disabled schedule");
        }
        Ok(report)
    }

    /// Pause only the cron/interval job (watches and webhooks stay live).
    pub async fn pause(&self, workflow_name: &str) -> Result<bool, ScheduleManagerError> {
        let paused = self
            .scheduler
            .pause_schedule(workflow_name)
            .await
            .map_err(ScheduleManagerError::Internal)?;
        Ok(paused)
    }

    /// Resume a paused cron/interval job.
    pub async fn resume(&self, workflow_name: &str) -> Result<bool, ScheduleManagerError> {
        let resumed = self
            .scheduler
            .resume_schedule(workflow_name)
            .await
            .map_err(ScheduleManagerError::Internal)?;
        Ok(resumed)
    }

    /// Union of what the three services report plus the stored rows.
    pub async fn status(
        &self,
        workflow_name: Option<&str>,
    ) -> Result<Vec<ScheduleStatus>, ScheduleManagerError> {
        let live_schedules = self
            .scheduler
            .get_schedules()
            .await
            .map_err(ScheduleManagerError::Internal)?;
        let watches = self.file_watcher.get_watches();
        let webhooks = self.webhooks.list();
        let stored = self
            .db
            .list_schedules()
            .await
            .map_err(ScheduleManagerError::Internal)?;

        let mut names: Vec<String> = Vec::new();
        let mut push_name = |name: &str, names: &mut Vec<String>| {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        };
        for schedule in &live_schedules {
            push_name(&schedule.name, &mut names);
        }
        for watch in &watches {
            push_name(&watch.workflow, &mut names);
        }
        for hook in &webhooks {
            push_name(&hook.workflow_name, &mut names);
        }
        for row in &stored {
            push_name(&row.workflow_name, &mut names);
        }

        if let Some(filter) = workflow_name {
            names.retain(|name| name == filter);
        }

        let mut statuses = Vec::with_capacity(names.len());
        for name in names {
            let live = live_schedules.iter().find(|s| s.name == name);
            let watch = watches.iter().find(|w| w.workflow == name);
            let hook = webhooks.iter().find(|h| h.workflow_name == name);
            let row = stored.iter().find(|r| r.workflow_name == name);

            let has_live_trigger = live.is_some() || watch.is_some() || hook.is_some();
            statuses.push(ScheduleStatus {
                enabled: if has_live_trigger {
                    live.map(|s| !s.paused).unwrap_or(true)
                } else {
                    row.map(|r| r.is_enabled()).unwrap_or(false)
                },
                next_run: live.and_then(|s| s.next_run),
                trigger: live
                    .map(|s| s.trigger.clone())
                    .or_else(|| row.and_then(|r| r.trigger_config.clone())),
                file_watch: watch.map(|w| json!(w)),
                webhook: hook.map(|h| json!(h)),
                last_run: row.and_then(|r| r.last_run),
                last_status: row.and_then(|r| r.last_status.clone()),
                name,
            });
        }

        Ok(statuses)
    }
}
