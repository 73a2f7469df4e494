// FlowPilot control API: router assembly shared by the server binary and
// the integration tests.

pub mod config;
pub mod executions;
pub mod health;
pub mod hooks;
pub mod workflows;

use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use flowpilot_engine::WorkflowRunner;
use flowpilot_scheduler::{ScheduleManager, WebhookRegistry};
use flowpilot_storage::Database;

pub use config::AppConfig;

/// Everything the router needs.
#[derive(Clone)]
pub struct AppContext {
    pub db: Database,
    pub runner: Arc<WorkflowRunner>,
    pub manager: Arc<ScheduleManager>,
    pub webhooks: Arc<WebhookRegistry>,
    pub workflows_dir: PathBuf,
}

/// Build the application router with every resource mounted under /api.
pub fn create_app(ctx: AppContext) -> Router {
    let workflows_state = workflows::AppState {
        workflows_dir: ctx.workflows_dir.clone(),
        runner: ctx.runner.clone(),
        manager: ctx.manager.clone(),
        db: ctx.db.clone(),
    };
    let executions_state = executions::AppState {
        db: ctx.db.clone(),
        runner: ctx.runner.clone(),
    };
    let hooks_state = hooks::AppState {
        registry: ctx.webhooks.clone(),
        runner: ctx.runner.clone(),
    };

    let api = Router::new()
        .merge(health::routes())
        .merge(workflows::routes(workflows_state))
        .merge(executions::routes(executions_state))
        .merge(hooks::routes(hooks_state));

    Router::new()
        .nest("/api", api)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
