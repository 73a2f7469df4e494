// FlowPilot server

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use flowpilot_api::{create_app, AppConfig, AppContext};
use flowpilot_engine::{ExecutorRegistry, LogBroadcaster, WorkflowRunner};
use flowpilot_scheduler::{
    FileWatchService, JobStore, ScheduleManager, SchedulerService, WebhookRegistry,
};
use flowpilot_storage::Database;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flowpilot=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("flowpilot-server starting...");

    let config = AppConfig::from_env()?;
    config.ensure_layout()?;
    tracing::info!(base_dir = %config.base_dir.display(), "base directory ready");

    // executions database (fatal if unopenable)
    let db = Database::open(config.database_path())
        .await
        .context("failed to open executions database")?;
    tracing::info!(path = %config.database_path().display(), "executions database ready");

    // engine wiring
    let broadcaster = Arc::new(LogBroadcaster::new());
    let registry = Arc::new(ExecutorRegistry::builtin());
    let runner = Arc::new(WorkflowRunner::new(
        registry,
        broadcaster.clone(),
        Some(db.clone()),
    ));

    // trigger services; the job store lives in its own database file
    let job_store = JobStore::open(config.scheduler_db_path())
        .await
        .context("failed to open scheduler job store")?;
    let scheduler = Arc::new(SchedulerService::new(job_store, db.clone(), runner.clone()));
    let file_watcher = Arc::new(FileWatchService::new(runner.clone()));
    let webhooks = Arc::new(WebhookRegistry::new());
    let manager = Arc::new(ScheduleManager::new(
        scheduler.clone(),
        file_watcher.clone(),
        webhooks.clone(),
        db.clone(),
        config.workflows_dir(),
    ));

    // resume timer jobs persisted from previous runs
    scheduler.start().await?;

    // re-register file watches and webhooks for enabled schedules
    for schedule in db.list_schedules().await? {
        if !schedule.is_enabled() {
            continue;
        }
        match manager.enable(&schedule.workflow_name).await {
            Ok(_) => {
                tracing::info!(workflow = %schedule.workflow_name, "re-enabled schedule")
            }
            Err(e) => {
                tracing::warn!(workflow = %schedule.workflow_name, "could not re-enable schedule: {e}")
            }
        }
    }

    std::fs::write(config.pid_file(), std::process::id().to_string())
        .context("failed to write pid file")?;

    let app = create_app(AppContext {
        db,
        runner,
        manager,
        webhooks,
        workflows_dir: config.workflows_dir(),
    })
    .into_make_service_with_connect_info::<std::net::SocketAddr>();

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!("listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    scheduler.shutdown();
    file_watcher.stop();
    let _ = std::fs::remove_file(config.pid_file());
    tracing::info!("flowpilot-server stopped");

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
