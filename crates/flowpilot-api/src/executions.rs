// Execution query, cancel, log, and live WebSocket routes

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::Response,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use utoipa::ToSchema;
use uuid::Uuid;

use flowpilot_engine::{StreamFrame, WorkflowRunner};
use flowpilot_storage::{Database, ExecutionRow, ExecutionStats, ExecutionStatus, NodeExecutionRow};

/// App state for execution routes
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub runner: Arc<WorkflowRunner>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ListExecutionsParams {
    pub workflow: Option<String>,
    pub status: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct StatsParams {
    pub workflow: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct LogsParams {
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
pub struct ExecutionListItem {
    pub id: String,
    pub workflow_name: String,
    pub status: String,
    pub trigger_type: Option<String>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ExecutionDetail {
    pub id: String,
    pub workflow_name: String,
    pub workflow_path: String,
    pub status: String,
    pub trigger_type: Option<String>,
    #[schema(value_type = Object)]
    pub inputs: Value,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
    pub duration_ms: Option<i64>,
    pub error: Option<String>,
    #[schema(value_type = Vec<Object>)]
    pub node_executions: Vec<NodeExecutionRow>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ExecutionLogsResponse {
    pub execution_id: String,
    #[schema(value_type = Vec<Object>)]
    pub logs: Vec<NodeExecutionRow>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CancelResponse {
    pub id: String,
    pub status: String,
    pub message: String,
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

fn list_item(row: &ExecutionRow) -> ExecutionListItem {
    ExecutionListItem {
        id: row.id.clone(),
        workflow_name: row.workflow_name.clone(),
        status: row.status.clone(),
        trigger_type: row.trigger_type.clone(),
        started_at: row.started_at,
        finished_at: row.finished_at,
        duration_ms: row.duration_ms,
    }
}

/// Create execution routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/executions", get(list_executions))
        .route("/executions/stats", get(execution_stats))
        .route(
            "/executions/:id",
            get(get_execution).delete(cancel_execution),
        )
        .route("/executions/:id/logs", get(execution_logs))
        .route("/executions/:id/ws", get(execution_ws))
        .with_state(state)
}

/// GET /api/executions - list execution summaries
#[utoipa::path(
    get,
    path = "/api/executions",
    params(
        ("workflow" = Option<String>, Query, description = "Filter by workflow name"),
        ("status" = Option<String>, Query, description = "Filter by status"),
        ("limit" = Option<i64>, Query, description = "Max results (default 50)"),
        ("offset" = Option<i64>, Query, description = "Pagination offset")
    ),
    responses(
        (status = 200, description = "Execution summaries", body = Vec<ExecutionListItem>),
        (status = 400, description = "Invalid status filter", body = ApiError)
    ),
    tag = "executions"
)]
pub async fn list_executions(
    State(state): State<AppState>,
    Query(params): Query<ListExecutionsParams>,
) -> Result<Json<Vec<ExecutionListItem>>, (StatusCode, Json<ApiError>)> {
    let status = match params.status.as_deref() {
        Some(raw) => Some(raw.parse::<ExecutionStatus>().map_err(|e| {
            error_response(StatusCode::BAD_REQUEST, e)
        })?),
        None => None,
    };

    let rows = state
        .db
        .list_executions(
            params.workflow.as_deref(),
            status,
            params.limit.clamp(1, 200),
            params.offset.max(0),
        )
        .await
        .map_err(|e| {
            tracing::error!("failed to list executions: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "database error")
        })?;

    Ok(Json(rows.iter().map(list_item).collect()))
}

/// GET /api/executions/stats - aggregate statistics
#[utoipa::path(
    get,
    path = "/api/executions/stats",
    params(("workflow" = Option<String>, Query, description = "Filter by workflow name")),
    responses((status = 200, description = "Aggregate stats", body = Object)),
    tag = "executions"
)]
pub async fn execution_stats(
    State(state): State<AppState>,
    Query(params): Query<StatsParams>,
) -> Result<Json<ExecutionStats>, (StatusCode, Json<ApiError>)> {
    let stats = state
        .db
        .execution_stats(params.workflow.as_deref())
        .await
        .map_err(|e| {
            tracing::error!("failed to compute stats: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "database error")
        })?;
    Ok(Json(stats))
}

/// GET /api/executions/:id - execution detail with child node rows
#[utoipa::path(
    get,
    path = "/api/executions/{id}",
    params(("id" = Uuid, Path, description = "Execution id")),
    responses(
        (status = 200, description = "Execution detail", body = ExecutionDetail),
        (status = 404, description = "Execution not found", body = ApiError)
    ),
    tag = "executions"
)]
pub async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ExecutionDetail>, (StatusCode, Json<ApiError>)> {
    let row = state
        .db
        .get_execution(id)
        .await
        .map_err(|e| {
            tracing::error!("failed to get execution: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "database error")
        })?
        .ok_or_else(|| {
            error_response(StatusCode::NOT_FOUND, format!("Execution not found: {id}"))
        })?;

    let nodes = state.db.list_node_executions(id).await.map_err(|e| {
        tracing::error!("failed to list node executions: {e}");
        error_response(StatusCode::INTERNAL_SERVER_ERROR, "database error")
    })?;

    Ok(Json(ExecutionDetail {
        id: row.id.clone(),
        workflow_name: row.workflow_name.clone(),
        workflow_path: row.workflow_path.clone(),
        status: row.status.clone(),
        trigger_type: row.trigger_type.clone(),
        inputs: Value::Object(row.inputs_value()),
        started_at: row.started_at,
        finished_at: row.finished_at,
        duration_ms: row.duration_ms,
        error: row.error.clone(),
        node_executions: nodes,
    }))
}

/// DELETE /api/executions/:id - cancel a pending/running execution
#[utoipa::path(
    delete,
    path = "/api/executions/{id}",
    params(("id" = Uuid, Path, description = "Execution id")),
    responses(
        (status = 200, description = "Execution cancelled", body = CancelResponse),
        (status = 400, description = "Execution is not cancellable", body = ApiError),
        (status = 404, description = "Execution not found", body = ApiError)
    ),
    tag = "executions"
)]
pub async fn cancel_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<CancelResponse>, (StatusCode, Json<ApiError>)> {
    let row = state
        .db
        .get_execution(id)
        .await
        .map_err(|e| {
            tracing::error!("failed to get execution: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "database error")
        })?
        .ok_or_else(|| {
            error_response(StatusCode::NOT_FOUND, format!("Execution not found: {id}"))
        })?;

    let status = row.status();
    if !matches!(status, ExecutionStatus::Pending | ExecutionStatus::Running) {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            format!("Cannot cancel execution with status: {status}"),
        ));
    }

    // signal the live run; the runner persists the cancelled state. A stale
    // running row with no live execution is finalized directly.
    if !state.runner.cancel(id) {
        state
            .db
            .update_execution_status(
                id,
                ExecutionStatus::Cancelled,
                Some(chrono::Utc::now()),
                None,
                None,
            )
            .await
            .map_err(|e| {
                tracing::error!("failed to mark execution cancelled: {e}");
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "database error")
            })?;
    }

    tracing::info!(execution_id = %id, "execution cancelled");

    Ok(Json(CancelResponse {
        id: id.to_string(),
        status: "cancelled".into(),
        message: "Execution cancelled successfully".into(),
    }))
}

/// GET /api/executions/:id/logs - paginated node execution rows
#[utoipa::path(
    get,
    path = "/api/executions/{id}/logs",
    params(
        ("id" = Uuid, Path, description = "Execution id"),
        ("page" = Option<usize>, Query, description = "Page number (default 1)"),
        ("page_size" = Option<usize>, Query, description = "Items per page (default 50)")
    ),
    responses(
        (status = 200, description = "Paginated node rows", body = ExecutionLogsResponse),
        (status = 404, description = "Execution not found", body = ApiError)
    ),
    tag = "executions"
)]
pub async fn execution_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<LogsParams>,
) -> Result<Json<ExecutionLogsResponse>, (StatusCode, Json<ApiError>)> {
    if state
        .db
        .get_execution(id)
        .await
        .map_err(|e| {
            tracing::error!("failed to get execution: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "database error")
        })?
        .is_none()
    {
        return Err(error_response(
            StatusCode::NOT_FOUND,
            format!("Execution not found: {id}"),
        ));
    }

    let all = state.db.list_node_executions(id).await.map_err(|e| {
        tracing::error!("failed to list node executions: {e}");
        error_response(StatusCode::INTERNAL_SERVER_ERROR, "database error")
    })?;

    let total = all.len();
    let page = params.page.max(1);
    let page_size = params.page_size.clamp(1, 200);
    let logs = all
        .into_iter()
        .skip((page - 1) * page_size)
        .take(page_size)
        .collect();

    Ok(Json(ExecutionLogsResponse {
        execution_id: id.to_string(),
        logs,
        total,
        page,
        page_size,
    }))
}

/// GET /api/executions/:id/ws - live frames over WebSocket
pub async fn execution_ws(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| stream_execution(socket, state, id))
}

async fn stream_execution(mut socket: WebSocket, state: AppState, id: Uuid) {
    // a finished execution gets the connected frame, a final status frame
    // built from the row, and a close
    let row = match state.db.get_execution(id).await {
        Ok(Some(row)) => row,
        Ok(None) => {
            let _ = socket
                .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                    code: 4004,
                    reason: "Execution not found".into(),
                })))
                .await;
            return;
        }
        Err(e) => {
            tracing::error!("failed to load execution for ws: {e}");
            return;
        }
    };

    let mut rx = state.runner.broadcaster().subscribe(id);

    if row.status().is_terminal() {
        // drain the connected frame, then synthesize the final status
        if let Some(frame) = rx.recv().await {
            let _ = send_frame(&mut socket, &frame).await;
        }
        let final_frame = StreamFrame::status(
            id,
            json!({
                "status": row.status,
                "finished_at": row.finished_at,
                "duration_ms": row.duration_ms,
                "error": row.error,
            }),
        );
        let _ = send_frame(&mut socket, &final_frame).await;
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    tracing::info!(execution_id = %id, "websocket subscriber connected");

    let mut heartbeat = tokio::time::interval(std::time::Duration::from_secs(15));
    heartbeat.tick().await; // the first tick fires immediately

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                let frame = StreamFrame::heartbeat(id);
                if send_frame(&mut socket, &frame).await.is_err() {
                    break;
                }
            }
            frame = rx.recv() => {
                let Some(frame) = frame else {
                    // broadcaster closed the stream (execution finished)
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                };
                let is_final = frame.is_final_status();
                if send_frame(&mut socket, &frame).await.is_err() {
                    break;
                }
                if is_final {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) if text == "ping" => {
                        if socket.send(Message::Text("pong".into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    tracing::info!(execution_id = %id, "websocket subscriber disconnected");
}

async fn send_frame(socket: &mut WebSocket, frame: &StreamFrame) -> Result<(), axum::Error> {
    let payload = serde_json::to_string(frame).unwrap_or_else(|_| "{}".to_string());
    socket.send(Message::Text(payload)).await
}
