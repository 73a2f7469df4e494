// Integration tests for the control API
// Run with: cargo test --test api_test

use std::path::Path;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use hmac::{Hmac, Mac};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use sha2::Sha256;
use tower::ServiceExt;

use flowpilot_api::{create_app, AppContext};
use flowpilot_engine::{ExecutorRegistry, LogBroadcaster, WorkflowRunner};
use flowpilot_scheduler::{
    FileWatchService, JobStore, ScheduleManager, SchedulerService, WebhookRegistry,
};
use flowpilot_storage::Database;

struct TestApp {
    router: Router,
    db: Database,
    webhooks: Arc<WebhookRegistry>,
    _dir: tempfile::TempDir,
    workflows_dir: std::path::PathBuf,
}

async fn test_app() -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let workflows_dir = dir.path().join("workflows");
    std::fs::create_dir_all(&workflows_dir).unwrap();

    let db = Database::in_memory().await.unwrap();
    let runner = Arc::new(WorkflowRunner::new(
        Arc::new(ExecutorRegistry::builtin()),
        Arc::new(LogBroadcaster::new()),
        Some(db.clone()),
    ));
    let scheduler = Arc::new(SchedulerService::new(
        JobStore::in_memory().await.unwrap(),
        db.clone(),
        runner.clone(),
    ));
    let file_watcher = Arc::new(FileWatchService::new(runner.clone()));
    let webhooks = Arc::new(WebhookRegistry::new());
    let manager = Arc::new(ScheduleManager::new(
        scheduler,
        file_watcher,
        webhooks.clone(),
        db.clone(),
        &workflows_dir,
    ));

    let router = create_app(AppContext {
        db: db.clone(),
        runner,
        manager,
        webhooks: webhooks.clone(),
        workflows_dir: workflows_dir.clone(),
    });

    TestApp {
        router,
        db,
        webhooks,
        _dir: dir,
        workflows_dir,
    }
}

fn echo_workflow(name: &str) -> String {
    format!(
        r#"name: {name}
description: test fixture
nodes:
  - id: speak
    type: shell
    command: "echo hi"
"#
    )
}

fn write_workflow(dir: &Path, name: &str) -> std::path::PathBuf {
    let path = dir.join(format!("{name}.yaml"));
    std::fs::write(&path, echo_workflow(name)).unwrap();
    path
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health_endpoints() {
    let app = test_app().await;
    for uri in ["/api/health", "/api/health/ready", "/api/health/live"] {
        let (status, body) = send(&app.router, get(uri)).await;
        assert_eq!(status, StatusCode::OK, "{uri}");
        assert!(body["status"].is_string());
    }
}

#[tokio::test]
async fn test_workflow_crud_lifecycle() {
    let app = test_app().await;

    // create
    let (status, body) = send(
        &app.router,
        post_json(
            "/api/workflows",
            json!({"name": "greeter", "content": echo_workflow("greeter")}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["name"], json!("greeter"));
    assert_eq!(body["node_count"], json!(1));

    // duplicate create conflicts
    let (status, _) = send(
        &app.router,
        post_json(
            "/api/workflows",
            json!({"name": "greeter", "content": echo_workflow("greeter")}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // name mismatch rejected
    let (status, body) = send(
        &app.router,
        post_json(
            "/api/workflows",
            json!({"name": "other", "content": echo_workflow("not-other")}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["detail"].as_str().unwrap().contains("does not match"));

    // list
    let (status, body) = send(&app.router, get("/api/workflows")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    // search filter
    let (_, body) = send(&app.router, get("/api/workflows?search=nope")).await;
    assert!(body.as_array().unwrap().is_empty());

    // get
    let (status, body) = send(&app.router, get("/api/workflows/greeter")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["content"].as_str().unwrap().contains("echo hi"));

    // validate
    let (status, body) = send(&app.router, get("/api/workflows/greeter/validate")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid"], json!(true));

    // delete
    let request = Request::builder()
        .method("DELETE")
        .uri("/api/workflows/greeter")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(&app.router, get("/api/workflows/greeter")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_invalid_yaml_rejected_on_create() {
    let app = test_app().await;
    let (status, body) = send(
        &app.router,
        post_json(
            "/api/workflows",
            json!({"name": "broken", "content": "nodes: ["}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["detail"].as_str().unwrap().contains("Invalid workflow YAML"));
}

#[tokio::test]
async fn test_run_workflow_creates_execution() {
    let app = test_app().await;
    write_workflow(&app.workflows_dir, "runnable");

    let (status, body) = send(
        &app.router,
        post_json("/api/workflows/runnable/run", json!({"inputs": {}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("accepted"));
    let execution_id: uuid::Uuid = body["execution_id"].as_str().unwrap().parse().unwrap();

    // the run happens in the background; wait for the row to settle
    let mut row = None;
    for _ in 0..50 {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        if let Some(found) = app.db.get_execution(execution_id).await.unwrap() {
            if found.status().is_terminal() {
                row = Some(found);
                break;
            }
        }
    }
    let row = row.expect("execution did not finish");
    assert_eq!(row.status().as_str(), "success");
    assert_eq!(row.trigger_type.as_deref(), Some("api"));

    // detail endpoint shows the node rows
    let (status, body) = send(&app.router, get(&format!("/api/executions/{execution_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["node_executions"].as_array().unwrap().len(), 1);
    assert_eq!(body["node_executions"][0]["node_id"], json!("speak"));

    // logs endpoint paginates
    let (status, body) = send(
        &app.router,
        get(&format!("/api/executions/{execution_id}/logs?page=1&page_size=10")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], json!(1));

    // stats count it
    let (_, body) = send(&app.router, get("/api/executions/stats")).await;
    assert_eq!(body["total_executions"], json!(1));
    assert_eq!(body["success_count"], json!(1));
}

#[tokio::test]
async fn test_cancel_rejected_for_finished_execution() {
    let app = test_app().await;
    write_workflow(&app.workflows_dir, "quick");

    let (_, body) = send(
        &app.router,
        post_json("/api/workflows/quick/run", json!({})),
    )
    .await;
    let execution_id = body["execution_id"].as_str().unwrap().to_string();

    // wait for completion
    for _ in 0..50 {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let (_, detail) = send(&app.router, get(&format!("/api/executions/{execution_id}"))).await;
        if detail["status"] == json!("success") {
            break;
        }
    }

    let request = Request::builder()
        .method("DELETE")
        .uri(format!("/api/executions/{execution_id}"))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["detail"].as_str().unwrap().contains("Cannot cancel"));
}

#[tokio::test]
async fn test_list_executions_rejects_bad_status() {
    let app = test_app().await;
    let (status, _) = send(&app.router, get("/api/executions?status=sideways")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_webhook_hmac_flow() {
    let app = test_app().await;
    let path = write_workflow(&app.workflows_dir, "hooked");
    app.webhooks
        .register("/gh", "hooked", &path.display().to_string(), Some("s"));

    let body = br#"{"ref": "refs/heads/main", "count": 3}"#;
    let mut mac = Hmac::<Sha256>::new_from_slice(b"s").unwrap();
    mac.update(body);
    let signature = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));

    let request = Request::builder()
        .method("POST")
        .uri("/api/hooks/gh")
        .header("x-hub-signature-256", &signature)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_vec()))
        .unwrap();
    let (status, response) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["status"], json!("accepted"));
    assert_eq!(response["workflow"], json!("hooked"));
    let execution_id: uuid::Uuid = response["execution_id"].as_str().unwrap().parse().unwrap();

    // exactly one execution, tagged webhook, carrying the parsed body
    let mut row = None;
    for _ in 0..50 {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        if let Some(found) = app.db.get_execution(execution_id).await.unwrap() {
            row = Some(found);
            break;
        }
    }
    let row = row.expect("webhook execution missing");
    assert_eq!(row.trigger_type.as_deref(), Some("webhook"));
    let inputs = row.inputs_value();
    assert_eq!(inputs["_webhook"]["body"]["count"], json!(3));
    assert_eq!(inputs["_webhook"]["path"], json!("/gh"));

    let all = app.db.list_executions(None, None, 50, 0).await.unwrap();
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn test_webhook_wrong_secret_never_dispatches() {
    let app = test_app().await;
    let path = write_workflow(&app.workflows_dir, "locked");
    app.webhooks
        .register("/locked", "locked", &path.display().to_string(), Some("right"));

    let request = Request::builder()
        .method("POST")
        .uri("/api/hooks/locked")
        .header("x-webhook-secret", "wrong")
        .body(Body::from("{}"))
        .unwrap();
    let (status, _) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let all = app.db.list_executions(None, None, 50, 0).await.unwrap();
    assert!(all.is_empty(), "no execution may be created on bad auth");
}

#[tokio::test]
async fn test_webhook_unknown_path_is_404() {
    let app = test_app().await;
    let request = Request::builder()
        .method("POST")
        .uri("/api/hooks/nowhere")
        .body(Body::from("{}"))
        .unwrap();
    let (status, _) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
