// File-watch service
//
// One native watcher per workflow feeding a tokio channel. Raw events are
// filtered by kind and filename pattern, then debounced per path: rapid
// events on the same path collapse into one firing carrying the final event.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use flowpilot_core::trigger::FileEventKind;
use flowpilot_engine::WorkflowRunner;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(1);

/// Info about one active watch.
#[derive(Debug, Clone, Serialize)]
pub struct WatchInfo {
    pub workflow: String,
    pub path: String,
    pub recursive: bool,
}

struct WatchEntry {
    // keeps the native watcher alive for the lifetime of the watch
    _watcher: RecommendedWatcher,
    pump: JoinHandle<()>,
    timers: Arc<Mutex<HashMap<PathBuf, JoinHandle<()>>>>,
    info: WatchInfo,
}

/// Manages per-workflow filesystem watches.
pub struct FileWatchService {
    runner: Arc<WorkflowRunner>,
    watches: Mutex<HashMap<String, WatchEntry>>,
    debounce: Duration,
}

impl FileWatchService {
    pub fn new(runner: Arc<WorkflowRunner>) -> Self {
        Self::with_debounce(runner, DEFAULT_DEBOUNCE)
    }

    pub fn with_debounce(runner: Arc<WorkflowRunner>, debounce: Duration) -> Self {
        Self {
            runner,
            watches: Mutex::new(HashMap::new()),
            debounce,
        }
    }

    /// Add (or replace) the watch for a workflow.
    pub fn add_watch(
        &self,
        workflow_name: &str,
        watch_path: &Path,
        events: Vec<FileEventKind>,
        pattern: Option<String>,
        workflow_path: &str,
    ) -> Result<String> {
        self.remove_watch(workflow_name);

        let (watch_dir, recursive) = if watch_path.is_dir() {
            (watch_path.to_path_buf(), true)
        } else {
            (
                watch_path
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from(".")),
                false,
            )
        };

        let (tx, rx) = mpsc::unbounded_channel::<Event>();
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            if let Ok(event) = result {
                let _ = tx.send(event);
            }
        })
        .context("failed to create filesystem watcher")?;

        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher
            .watch(&watch_dir, mode)
            .with_context(|| format!("failed to watch {}", watch_dir.display()))?;

        let timers: Arc<Mutex<HashMap<PathBuf, JoinHandle<()>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let pump = tokio::spawn(Self::pump_events(
            rx,
            self.runner.clone(),
            workflow_name.to_string(),
            workflow_path.to_string(),
            events,
            pattern,
            self.debounce,
            timers.clone(),
        ));

        let info = WatchInfo {
            workflow: workflow_name.to_string(),
            path: watch_dir.display().to_string(),
            recursive,
        };
        tracing::info!(
            workflow = workflow_name,
            path = %info.path,
            recursive,
            "added file watch"
        );

        self.watches.lock().insert(
            workflow_name.to_string(),
            WatchEntry {
                _watcher: watcher,
                pump,
                timers,
                info,
            },
        );

        Ok(format!("file-watch:{workflow_name}"))
    }

    #[allow(clippy::too_many_arguments)]
    async fn pump_events(
        mut rx: mpsc::UnboundedReceiver<Event>,
        runner: Arc<WorkflowRunner>,
        workflow_name: String,
        workflow_path: String,
        events: Vec<FileEventKind>,
        pattern: Option<String>,
        debounce: Duration,
        timers: Arc<Mutex<HashMap<PathBuf, JoinHandle<()>>>>,
    ) {
        let matcher = pattern
            .as_deref()
            .and_then(|pattern| glob::Pattern::new(pattern).ok());

        while let Some(event) = rx.recv().await {
            let Some(kind) = map_event_kind(&event.kind) else {
                continue;
            };
            if !events.contains(&kind) {
                continue;
            }

            for path in &event.paths {
                if path.is_dir() {
                    continue;
                }
                if let Some(matcher) = &matcher {
                    let name = path
                        .file_name()
                        .map(|name| name.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    if !matcher.matches(&name) {
                        continue;
                    }
                }

                tracing::debug!(workflow = %workflow_name, kind = %kind, path = %path.display(), "file event");

                // cancel any pending timer for this path and schedule a new
                // one carrying this (the latest) event
                let mut pending = timers.lock();
                if let Some(previous) = pending.remove(path) {
                    previous.abort();
                }

                let timer = tokio::spawn(fire_after_debounce(
                    debounce,
                    runner.clone(),
                    workflow_name.clone(),
                    workflow_path.clone(),
                    kind,
                    path.clone(),
                    timers.clone(),
                ));
                pending.insert(path.clone(), timer);
            }
        }
    }

    /// Remove a workflow's watch, cancelling pending debounce timers.
    pub fn remove_watch(&self, workflow_name: &str) -> bool {
        let Some(entry) = self.watches.lock().remove(workflow_name) else {
            return false;
        };
        entry.pump.abort();
        for (_, timer) in entry.timers.lock().drain() {
            timer.abort();
        }
        tracing::info!(workflow = workflow_name, "removed file watch");
        true
    }

    pub fn get_watch(&self, workflow_name: &str) -> Option<WatchInfo> {
        self.watches
            .lock()
            .get(workflow_name)
            .map(|entry| entry.info.clone())
    }

    pub fn get_watches(&self) -> Vec<WatchInfo> {
        self.watches
            .lock()
            .values()
            .map(|entry| entry.info.clone())
            .collect()
    }

    /// Stop every watch.
    pub fn stop(&self) {
        let names: Vec<String> = self.watches.lock().keys().cloned().collect();
        for name in names {
            self.remove_watch(&name);
        }
    }
}

fn map_event_kind(kind: &EventKind) -> Option<FileEventKind> {
    match kind {
        EventKind::Create(_) => Some(FileEventKind::Created),
        EventKind::Modify(_) => Some(FileEventKind::Modified),
        EventKind::Remove(_) => Some(FileEventKind::Deleted),
        _ => None,
    }
}

async fn fire_after_debounce(
    debounce: Duration,
    runner: Arc<WorkflowRunner>,
    workflow_name: String,
    workflow_path: String,
    kind: FileEventKind,
    event_path: PathBuf,
    timers: Arc<Mutex<HashMap<PathBuf, JoinHandle<()>>>>,
) {
    tokio::time::sleep(debounce).await;
    timers.lock().remove(&event_path);

    let mut inputs: Map<String, Value> = Map::new();
    inputs.insert(
        "_file_event".into(),
        json!({
            "type": kind.to_string(),
            "path": event_path.display().to_string(),
            "is_directory": event_path.is_dir(),
            "timestamp": Utc::now(),
        }),
    );

    tracing::info!(
        workflow = %workflow_name,
        event = %kind,
        path = %event_path.display(),
        "file watch firing"
    );

    if let Err(e) = runner
        .run_file(&workflow_path, inputs, None, "file-watch")
        .await
    {
        tracing::error!(workflow = %workflow_name, "file-watch run failed: {e}");
    }
}
