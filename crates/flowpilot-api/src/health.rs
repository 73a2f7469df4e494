// Health check routes

use axum::{routing::get, Json, Router};
use chrono::Utc;
use serde_json::{json, Value};

/// Create health routes
pub fn routes() -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/ready", get(ready))
        .route("/health/live", get(live))
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now(),
        "service": "flowpilot",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn ready() -> Json<Value> {
    Json(json!({"status": "ready", "timestamp": Utc::now()}))
}

async fn live() -> Json<Value> {
    Json(json!({"status": "alive", "timestamp": Utc::now()}))
}
