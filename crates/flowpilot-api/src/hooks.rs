// Webhook ingress routes

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Map, Value};
use utoipa::ToSchema;
use uuid::Uuid;

use flowpilot_core::WorkflowParser;
use flowpilot_engine::WorkflowRunner;
use flowpilot_scheduler::{WebhookAuthError, WebhookRegistry};

/// App state for webhook ingress
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<WebhookRegistry>,
    pub runner: Arc<WorkflowRunner>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct WebhookAccepted {
    pub status: &'static str,
    pub execution_id: Uuid,
    pub workflow: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ApiError {
    pub detail: String,
}

/// Create webhook ingress routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/hooks/*path", post(handle_webhook))
        .with_state(state)
}

/// POST /api/hooks/{path} - authenticated webhook ingress
#[utoipa::path(
    post,
    path = "/api/hooks/{path}",
    params(("path" = String, Path, description = "Registered webhook path")),
    request_body(content = String, description = "Raw webhook payload", content_type = "application/octet-stream"),
    responses(
        (status = 200, description = "Workflow run accepted", body = WebhookAccepted),
        (status = 401, description = "Authentication failed", body = ApiError),
        (status = 404, description = "Webhook not found", body = ApiError)
    ),
    tag = "webhooks"
)]
pub async fn handle_webhook(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    body: axum::body::Bytes,
) -> Result<Json<WebhookAccepted>, (StatusCode, Json<ApiError>)> {
    let secret_header = headers
        .get("x-webhook-secret")
        .and_then(|value| value.to_str().ok());
    let signature_header = headers
        .get("x-hub-signature-256")
        .and_then(|value| value.to_str().ok());

    let entry = state
        .registry
        .authorize(&path, secret_header, signature_header, &body)
        .map_err(|e| {
            let status = match e {
                WebhookAuthError::NotFound => StatusCode::NOT_FOUND,
                _ => StatusCode::UNAUTHORIZED,
            };
            (
                status,
                Json(ApiError {
                    detail: e.to_string(),
                }),
            )
        })?;

    let body_json: Value = serde_json::from_slice(&body).unwrap_or_else(|_| json!({}));

    let header_map: Map<String, Value> = headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                Value::String(String::from_utf8_lossy(value.as_bytes()).into_owned()),
            )
        })
        .collect();
    let client_ip = connect_info
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let mut inputs: Map<String, Value> = Map::new();
    inputs.insert(
        "_webhook".into(),
        json!({
            "path": flowpilot_core::trigger::normalize_webhook_path(&path),
            "method": "POST",
            "headers": header_map,
            "query": query,
            "body": body_json,
            "client_ip": client_ip,
            "timestamp": Utc::now(),
        }),
    );

    let workflow = WorkflowParser::new()
        .parse_file(&entry.workflow_path)
        .map_err(|e| {
            tracing::error!(workflow = %entry.workflow_name, "webhook target failed to parse: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError {
                    detail: format!("failed to load workflow: {e}"),
                }),
            )
        })?;

    let execution_id = state.runner.spawn_run(
        workflow,
        inputs,
        entry.workflow_path.clone(),
        "webhook".to_string(),
    );

    tracing::info!(
        workflow = %entry.workflow_name,
        execution_id = %execution_id,
        "webhook triggered workflow"
    );

    Ok(Json(WebhookAccepted {
        status: "accepted",
        execution_id,
        workflow: entry.workflow_name,
    }))
}
