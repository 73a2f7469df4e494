// Workflow CRUD and run HTTP routes

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use utoipa::ToSchema;
use uuid::Uuid;

use flowpilot_core::{WorkflowParser, Workflow};
use flowpilot_engine::WorkflowRunner;
use flowpilot_scheduler::ScheduleManager;
use flowpilot_storage::Database;

/// App state for workflow routes
#[derive(Clone)]
pub struct AppState {
    pub workflows_dir: PathBuf,
    pub runner: Arc<WorkflowRunner>,
    pub manager: Arc<ScheduleManager>,
    pub db: Database,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ListWorkflowsParams {
    pub search: Option<String>,
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_page() -> usize {
    1
}

fn default_page_size() -> usize {
    50
}

#[derive(Debug, Serialize, ToSchema)]
pub struct WorkflowListItem {
    pub name: String,
    pub description: String,
    pub version: u32,
    pub path: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct WorkflowDetail {
    pub name: String,
    pub description: String,
    pub version: u32,
    pub path: String,
    pub content: String,
    #[schema(value_type = Vec<Object>)]
    pub triggers: Vec<Value>,
    #[schema(value_type = Object)]
    pub inputs: Value,
    pub node_count: usize,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateWorkflowRequest {
    pub name: String,
    pub content: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateWorkflowRequest {
    pub content: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct WorkflowValidation {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Deserialize, Default, ToSchema)]
pub struct RunWorkflowRequest {
    #[serde(default)]
    #[schema(value_type = Object)]
    pub inputs: Map<String, Value>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RunWorkflowResponse {
    pub execution_id: Uuid,
    pub workflow: String,
    pub status: &'static str,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ApiError {
    pub detail: String,
}

fn error_response(status: StatusCode, detail: impl Into<String>) -> (StatusCode, Json<ApiError>) {
    (
        status,
        Json(ApiError {
            detail: detail.into(),
        }),
    )
}

/// Create workflow routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/workflows", get(list_workflows).post(create_workflow))
        .route(
            "/workflows/:name",
            get(get_workflow).put(update_workflow).delete(delete_workflow),
        )
        .route("/workflows/:name/validate", get(validate_workflow))
        .route("/workflows/:name/run", axum::routing::post(run_workflow))
        .with_state(state)
}

fn workflow_path(state: &AppState, name: &str) -> PathBuf {
    state.workflows_dir.join(format!("{name}.yaml"))
}

fn file_timestamps(path: &PathBuf) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
    let Ok(meta) = std::fs::metadata(path) else {
        return (None, None);
    };
    let created = meta.created().ok().map(DateTime::<Utc>::from);
    let modified = meta.modified().ok().map(DateTime::<Utc>::from);
    (created, modified)
}

fn detail_from(workflow: &Workflow, path: &PathBuf, content: String) -> WorkflowDetail {
    let (created_at, updated_at) = file_timestamps(path);
    WorkflowDetail {
        name: workflow.name.clone(),
        description: workflow.description.clone(),
        version: workflow.version,
        path: path.display().to_string(),
        content,
        triggers: workflow
            .triggers
            .iter()
            .map(|t| serde_json::to_value(t).unwrap_or(Value::Null))
            .collect(),
        inputs: serde_json::to_value(&workflow.inputs).unwrap_or(Value::Null),
        node_count: workflow.nodes.len(),
        created_at,
        updated_at,
    }
}

/// GET /api/workflows - list workflow documents
#[utoipa::path(
    get,
    path = "/api/workflows",
    params(
        ("search" = Option<String>, Query, description = "Filter by name substring"),
        ("page" = Option<usize>, Query, description = "Page number (default 1)"),
        ("page_size" = Option<usize>, Query, description = "Items per page (default 50)")
    ),
    responses(
        (status = 200, description = "List of workflows", body = Vec<WorkflowListItem>)
    ),
    tag = "workflows"
)]
pub async fn list_workflows(
    State(state): State<AppState>,
    Query(params): Query<ListWorkflowsParams>,
) -> Json<Vec<WorkflowListItem>> {
    let parser = WorkflowParser::new();
    let mut items = Vec::new();

    let mut entries: Vec<PathBuf> = std::fs::read_dir(&state.workflows_dir)
        .map(|dir| {
            dir.filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| {
                    matches!(
                        path.extension().and_then(|e| e.to_str()),
                        Some("yaml") | Some("yml")
                    )
                })
                .collect()
        })
        .unwrap_or_default();
    entries.sort();

    for path in entries {
        let workflow = match parser.parse_file(&path) {
            Ok(workflow) => workflow,
            Err(e) => {
                tracing::warn!(path = %path.display(), "skipping invalid workflow file: {e}");
                continue;
            }
        };

        if let Some(search) = &params.search {
            if !workflow.name.to_lowercase().contains(&search.to_lowercase()) {
                continue;
            }
        }

        let (created_at, updated_at) = file_timestamps(&path);
        items.push(WorkflowListItem {
            name: workflow.name.clone(),
            description: workflow.description.clone(),
            version: workflow.version,
            path: path.display().to_string(),
            created_at,
            updated_at,
        });
    }

    let page = params.page.max(1);
    let start = (page - 1) * params.page_size;
    let paged = items
        .into_iter()
        .skip(start)
        .take(params.page_size)
        .collect();
    Json(paged)
}

/// POST /api/workflows - create a workflow document
#[utoipa::path(
    post,
    path = "/api/workflows",
    request_body = CreateWorkflowRequest,
    responses(
        (status = 201, description = "Workflow created", body = WorkflowDetail),
        (status = 400, description = "Invalid YAML or name mismatch", body = ApiError),
        (status = 409, description = "Workflow already exists", body = ApiError)
    ),
    tag = "workflows"
)]
pub async fn create_workflow(
    State(state): State<AppState>,
    Json(request): Json<CreateWorkflowRequest>,
) -> Result<(StatusCode, Json<WorkflowDetail>), (StatusCode, Json<ApiError>)> {
    let path = workflow_path(&state, &request.name);
    if path.exists() {
        return Err(error_response(
            StatusCode::CONFLICT,
            format!("Workflow '{}' already exists", request.name),
        ));
    }

    let workflow = WorkflowParser::new()
        .parse_str(&request.content)
        .map_err(|e| {
            error_response(StatusCode::BAD_REQUEST, format!("Invalid workflow YAML: {e}"))
        })?;

    if workflow.name != request.name {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            format!(
                "Workflow name in YAML ('{}') does not match requested name ('{}')",
                workflow.name, request.name
            ),
        ));
    }

    std::fs::write(&path, &request.content).map_err(|e| {
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to write workflow file: {e}"),
        )
    })?;

    Ok((
        StatusCode::CREATED,
        Json(detail_from(&workflow, &path, request.content)),
    ))
}

/// GET /api/workflows/:name
#[utoipa::path(
    get,
    path = "/api/workflows/{name}",
    params(("name" = String, Path, description = "Workflow name")),
    responses(
        (status = 200, description = "Workflow detail", body = WorkflowDetail),
        (status = 404, description = "Workflow not found", body = ApiError)
    ),
    tag = "workflows"
)]
pub async fn get_workflow(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<WorkflowDetail>, (StatusCode, Json<ApiError>)> {
    let path = workflow_path(&state, &name);
    if !path.exists() {
        return Err(error_response(
            StatusCode::NOT_FOUND,
            format!("Workflow '{name}' not found"),
        ));
    }

    let content = std::fs::read_to_string(&path).map_err(|e| {
        error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;
    let workflow = WorkflowParser::new().parse_str(&content).map_err(|e| {
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Error parsing workflow: {e}"),
        )
    })?;

    Ok(Json(detail_from(&workflow, &path, content)))
}

/// PUT /api/workflows/:name
#[utoipa::path(
    put,
    path = "/api/workflows/{name}",
    params(("name" = String, Path, description = "Workflow name")),
    request_body = UpdateWorkflowRequest,
    responses(
        (status = 200, description = "Workflow updated", body = WorkflowDetail),
        (status = 400, description = "Invalid YAML or name mismatch", body = ApiError),
        (status = 404, description = "Workflow not found", body = ApiError)
    ),
    tag = "workflows"
)]
pub async fn update_workflow(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<UpdateWorkflowRequest>,
) -> Result<Json<WorkflowDetail>, (StatusCode, Json<ApiError>)> {
    let path = workflow_path(&state, &name);
    if !path.exists() {
        return Err(error_response(
            StatusCode::NOT_FOUND,
            format!("Workflow '{name}' not found"),
        ));
    }

    let workflow = WorkflowParser::new()
        .parse_str(&request.content)
        .map_err(|e| {
            error_response(StatusCode::BAD_REQUEST, format!("Invalid workflow YAML: {e}"))
        })?;

    if workflow.name != name {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            format!(
                "Workflow name in YAML ('{}') does not match URL name ('{name}')",
                workflow.name
            ),
        ));
    }

    std::fs::write(&path, &request.content).map_err(|e| {
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to write workflow file: {e}"),
        )
    })?;

    Ok(Json(detail_from(&workflow, &path, request.content)))
}

/// DELETE /api/workflows/:name
#[utoipa::path(
    delete,
    path = "/api/workflows/{name}",
    params(("name" = String, Path, description = "Workflow name")),
    responses(
        (status = 204, description = "Workflow deleted"),
        (status = 404, description = "Workflow not found", body = ApiError)
    ),
    tag = "workflows"
)]
pub async fn delete_workflow(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    let path = workflow_path(&state, &name);
    if !path.exists() {
        return Err(error_response(
            StatusCode::NOT_FOUND,
            format!("Workflow '{name}' not found"),
        ));
    }

    // tear down triggers and the schedule row along with the document
    if let Err(e) = state.manager.disable(&name).await {
        tracing::warn!(workflow = %name, "failed to disable schedule on delete: {e}");
    }
    if let Err(e) = state.db.delete_schedule(&name).await {
        tracing::warn!(workflow = %name, "failed to delete schedule row: {e}");
    }

    std::fs::remove_file(&path).map_err(|e| {
        error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;

    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/workflows/:name/validate
#[utoipa::path(
    get,
    path = "/api/workflows/{name}/validate",
    params(("name" = String, Path, description = "Workflow name")),
    responses(
        (status = 200, description = "Validation result", body = WorkflowValidation),
        (status = 404, description = "Workflow not found", body = ApiError)
    ),
    tag = "workflows"
)]
pub async fn validate_workflow(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<WorkflowValidation>, (StatusCode, Json<ApiError>)> {
    let path = workflow_path(&state, &name);
    if !path.exists() {
        return Err(error_response(
            StatusCode::NOT_FOUND,
            format!("Workflow '{name}' not found"),
        ));
    }

    let parser = WorkflowParser::new();
    match parser.parse_file(&path) {
        Ok(workflow) => Ok(Json(WorkflowValidation {
            valid: true,
            errors: Vec::new(),
            warnings: parser.lint(&workflow),
        })),
        Err(e) => {
            let errors = if e.validation_errors().is_empty() {
                vec![e.to_string()]
            } else {
                e.validation_errors().to_vec()
            };
            Ok(Json(WorkflowValidation {
                valid: false,
                errors,
                warnings: Vec::new(),
            }))
        }
    }
}

/// POST /api/workflows/:name/run - enqueue an execution
#[utoipa::path(
    post,
    path = "/api/workflows/{name}/run",
    params(("name" = String, Path, description = "Workflow name")),
    request_body = RunWorkflowRequest,
    responses(
        (status = 200, description = "Run accepted", body = RunWorkflowResponse),
        (status = 400, description = "Workflow invalid", body = ApiError),
        (status = 404, description = "Workflow not found", body = ApiError)
    ),
    tag = "workflows"
)]
pub async fn run_workflow(
    State(state): State<AppState>,
    Path(name): Path<String>,
    request: Option<Json<RunWorkflowRequest>>,
) -> Result<Json<RunWorkflowResponse>, (StatusCode, Json<ApiError>)> {
    let path = workflow_path(&state, &name);
    if !path.exists() {
        return Err(error_response(
            StatusCode::NOT_FOUND,
            format!("Workflow '{name}' not found"),
        ));
    }

    let workflow = WorkflowParser::new().parse_file(&path).map_err(|e| {
        error_response(StatusCode::BAD_REQUEST, format!("Error parsing workflow: {e}"))
    })?;

    let inputs = request.map(|Json(r)| r.inputs).unwrap_or_default();
    let execution_id = state.runner.spawn_run(
        workflow,
        inputs,
        path.display().to_string(),
        "api".to_string(),
    );

    tracing::info!(workflow = %name, execution_id = %execution_id, "workflow run accepted");

    Ok(Json(RunWorkflowResponse {
        execution_id,
        workflow: name,
        status: "accepted",
    }))
}
