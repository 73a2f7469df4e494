// End-to-end runner tests over parsed workflow documents

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use flowpilot_core::{ExecutionState, NodeStatus, WorkflowParser};
use flowpilot_engine::{ExecutorRegistry, LogBroadcaster, WorkflowRunner};
use flowpilot_storage::Database;

fn inputs(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

async fn runner_with_db() -> (Arc<WorkflowRunner>, Database) {
    let db = Database::in_memory().await.unwrap();
    let runner = Arc::new(WorkflowRunner::new(
        Arc::new(ExecutorRegistry::builtin()),
        Arc::new(LogBroadcaster::new()),
        Some(db.clone()),
    ));
    (runner, db)
}

fn parse(yaml: &str) -> flowpilot_core::Workflow {
    WorkflowParser::new().parse_str(yaml).unwrap()
}

#[tokio::test]
async fn test_linear_shell_chain() {
    let workflow = parse(
        r#"
name: chain
nodes:
  - id: a
    type: shell
    command: "echo 1"
  - id: b
    type: shell
    command: "echo {{ nodes.a.output }}"
    depends_on: [a]
"#,
    );

    let (runner, db) = runner_with_db().await;
    let ctx = runner
        .run(&workflow, Map::new(), None, "/tmp/chain.yaml", "manual")
        .await
        .unwrap();

    assert_eq!(ctx.state, ExecutionState::Success);
    let a = ctx.get_node_result("a").unwrap();
    let b = ctx.get_node_result("b").unwrap();
    assert_eq!(b.output, json!("1"));
    assert!(a.finished_at.unwrap() <= b.started_at.unwrap());

    // both node rows persisted under the execution
    let row = db.get_execution(ctx.execution_id).await.unwrap().unwrap();
    assert_eq!(row.status().as_str(), "success");
    assert!(row.duration_ms.is_some());
    let nodes = db.list_node_executions(ctx.execution_id).await.unwrap();
    assert_eq!(nodes.len(), 2);
    assert_eq!(nodes[0].node_id, "a");
    assert_eq!(nodes[1].node_id, "b");
}

#[tokio::test]
async fn test_branching_condition() {
    let workflow = parse(
        r#"
name: branchy
inputs:
  x:
    type: number
    required: true
nodes:
  - id: c
    type: condition
    if: "inputs.x > 10"
    then: t
    else: f
  - id: t
    type: shell
    command: "echo hit"
  - id: f
    type: shell
    command: "echo miss"
"#,
    );

    let (runner, _db) = runner_with_db().await;
    let ctx = runner
        .run(&workflow, inputs(json!({"x": 20})), None, "/tmp/b.yaml", "manual")
        .await
        .unwrap();

    assert_eq!(ctx.state, ExecutionState::Success);
    assert_eq!(
        ctx.get_node_result("c").unwrap().data["next_node"],
        json!("t")
    );
    assert_eq!(ctx.get_node_result("t").unwrap().status, NodeStatus::Success);
    assert_eq!(ctx.get_node_result("t").unwrap().output, json!("hit"));
    assert_eq!(ctx.get_node_result("f").unwrap().status, NodeStatus::Skipped);
}

#[tokio::test]
async fn test_condition_skip_propagates_to_dependents() {
    let workflow = parse(
        r#"
name: branchy-deps
nodes:
  - id: c
    type: condition
    if: "1 > 10"
    then: t
    else: f
  - id: t
    type: shell
    command: "echo hit"
  - id: f
    type: shell
    command: "echo miss"
  - id: after-t
    type: shell
    command: "echo downstream"
    depends_on: [t]
"#,
    );

    let (runner, _db) = runner_with_db().await;
    let ctx = runner
        .run(&workflow, Map::new(), None, "/tmp/bd.yaml", "manual")
        .await
        .unwrap();

    assert_eq!(ctx.get_node_result("f").unwrap().status, NodeStatus::Success);
    assert_eq!(ctx.get_node_result("t").unwrap().status, NodeStatus::Skipped);
    // the node depending on the unchosen branch is skipped too
    assert_eq!(
        ctx.get_node_result("after-t").unwrap().status,
        NodeStatus::Skipped
    );
}

#[tokio::test]
async fn test_parallel_fail_fast() {
    let workflow = parse(
        r#"
name: par
nodes:
  - id: fan
    type: parallel
    nodes: [p1, p2, p3]
    fail_fast: true
  - id: p1
    type: shell
    command: "sleep 5 && echo one"
  - id: p2
    type: shell
    command: "exit 7"
  - id: p3
    type: shell
    command: "sleep 5 && echo three"
"#,
    );

    let (runner, _db) = runner_with_db().await;
    let started = std::time::Instant::now();
    let ctx = runner
        .run(&workflow, Map::new(), None, "/tmp/p.yaml", "manual")
        .await
        .unwrap();

    assert_eq!(ctx.state, ExecutionState::Failed);
    assert_eq!(ctx.get_node_result("p2").unwrap().status, NodeStatus::Error);
    for sibling in ["p1", "p3"] {
        let status = ctx.get_node_result(sibling).unwrap().status;
        assert!(
            matches!(status, NodeStatus::Success | NodeStatus::Skipped),
            "{sibling} was {status}"
        );
    }
    // fail-fast cancelled the sleeping siblings instead of waiting them out
    assert!(started.elapsed() < std::time::Duration::from_secs(4));
}

#[tokio::test]
async fn test_parallel_without_fail_fast_awaits_all() {
    let workflow = parse(
        r#"
name: par-all
settings:
  on_error: continue
nodes:
  - id: fan
    type: parallel
    nodes: [p1, p2]
    fail_fast: false
  - id: p1
    type: shell
    command: "exit 1"
  - id: p2
    type: shell
    command: "echo two"
"#,
    );

    let (runner, _db) = runner_with_db().await;
    let ctx = runner
        .run(&workflow, Map::new(), None, "/tmp/pa.yaml", "manual")
        .await
        .unwrap();

    assert_eq!(ctx.get_node_result("p1").unwrap().status, NodeStatus::Error);
    assert_eq!(ctx.get_node_result("p2").unwrap().status, NodeStatus::Success);
    assert_eq!(ctx.state, ExecutionState::Failed);
}

#[tokio::test]
async fn test_loop_iterates_and_respects_max() {
    let workflow = parse(
        r#"
name: loopy
inputs:
  names:
    type: array
    default: ["ada", "grace", "edsger", "barbara"]
nodes:
  - id: each
    type: loop
    for_each: "inputs.names"
    as_var: name
    max_iterations: 3
    do: greet
  - id: greet
    type: shell
    command: "echo hello {{ name }} {{ index }}"
"#,
    );

    let (runner, db) = runner_with_db().await;
    let ctx = runner
        .run(&workflow, Map::new(), None, "/tmp/l.yaml", "manual")
        .await
        .unwrap();

    assert_eq!(ctx.state, ExecutionState::Success);
    // the context holds the last iteration's result
    assert_eq!(
        ctx.get_node_result("greet").unwrap().output,
        json!("hello edsger 2")
    );

    // one loop row plus exactly max_iterations body rows
    let nodes = db.list_node_executions(ctx.execution_id).await.unwrap();
    let greet_rows = nodes.iter().filter(|n| n.node_id == "greet").count();
    assert_eq!(greet_rows, 3);
}

#[tokio::test]
async fn test_loop_empty_sequence_runs_zero_iterations() {
    let workflow = parse(
        r#"
name: loopy-empty
inputs:
  names:
    type: array
    default: []
nodes:
  - id: each
    type: loop
    for_each: "inputs.names"
    do: greet
  - id: greet
    type: shell
    command: "echo never"
"#,
    );

    let (runner, _db) = runner_with_db().await;
    let ctx = runner
        .run(&workflow, Map::new(), None, "/tmp/le.yaml", "manual")
        .await
        .unwrap();

    assert_eq!(ctx.state, ExecutionState::Success);
    assert!(ctx.get_node_result("greet").is_none());
}

#[tokio::test]
async fn test_loop_break_if_stops_early() {
    let workflow = parse(
        r#"
name: loopy-break
inputs:
  nums:
    type: array
    default: [1, 2, 3, 4, 5]
nodes:
  - id: each
    type: loop
    for_each: "inputs.nums"
    as_var: n
    break_if: "n > 2"
    do: speak
  - id: speak
    type: shell
    command: "echo {{ n }}"
"#,
    );

    let (runner, db) = runner_with_db().await;
    let ctx = runner
        .run(&workflow, Map::new(), None, "/tmp/lb.yaml", "manual")
        .await
        .unwrap();

    assert_eq!(ctx.state, ExecutionState::Success);
    let nodes = db.list_node_executions(ctx.execution_id).await.unwrap();
    let spoken = nodes.iter().filter(|n| n.node_id == "speak").count();
    assert_eq!(spoken, 2);
}

#[tokio::test]
async fn test_retry_recovers_from_503() {
    // first request gets 503, the retry gets 200
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let responses = [
            "HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
            "HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok",
        ];
        for response in responses {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let mut buf = [0u8; 2048];
            let _ = socket.read(&mut buf).await;
            let _ = socket.write_all(response.as_bytes()).await;
        }
    });

    let yaml = format!(
        r#"
name: flaky-fetch
nodes:
  - id: fetch
    type: http
    url: "http://{addr}/"
    retry:
      max_attempts: 3
      initial_delay: 0.01
      jitter: false
"#
    );
    let workflow = parse(&yaml);

    let (runner, _db) = runner_with_db().await;
    let ctx = runner
        .run(&workflow, Map::new(), None, "/tmp/r.yaml", "manual")
        .await
        .unwrap();

    assert_eq!(ctx.state, ExecutionState::Success);
    let fetch = ctx.get_node_result("fetch").unwrap();
    assert_eq!(fetch.status, NodeStatus::Success);
    assert_eq!(fetch.data["total_attempts"], json!(2));
    assert_eq!(fetch.data["retried"], json!(true));
}

#[tokio::test]
async fn test_required_input_missing_rejects_before_rows() {
    let workflow = parse(
        r#"
name: needy
inputs:
  target:
    type: string
    required: true
nodes:
  - id: a
    type: shell
    command: "echo {{ inputs.target }}"
"#,
    );

    let (runner, db) = runner_with_db().await;
    let err = runner
        .run(&workflow, Map::new(), None, "/tmp/n.yaml", "manual")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("required input 'target'"));

    // no execution row was created
    let rows = db.list_executions(None, None, 10, 0).await.unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn test_on_error_stop_skips_downstream() {
    let workflow = parse(
        r#"
name: stopper
nodes:
  - id: bad
    type: shell
    command: "exit 2"
  - id: never
    type: shell
    command: "echo unreachable"
    depends_on: [bad]
"#,
    );

    let (runner, db) = runner_with_db().await;
    let ctx = runner
        .run(&workflow, Map::new(), None, "/tmp/s.yaml", "manual")
        .await
        .unwrap();

    assert_eq!(ctx.state, ExecutionState::Failed);
    assert!(ctx.get_node_result("never").is_none());

    let row = db.get_execution(ctx.execution_id).await.unwrap().unwrap();
    assert_eq!(row.status().as_str(), "failed");
    assert!(row.error.unwrap().contains("bad"));
}

#[tokio::test]
async fn test_on_error_continue_runs_independent_nodes() {
    let workflow = parse(
        r#"
name: continuer
settings:
  on_error: continue
nodes:
  - id: bad
    type: shell
    command: "exit 2"
  - id: dependent
    type: shell
    command: "echo no"
    depends_on: [bad]
  - id: independent
    type: shell
    command: "echo yes"
"#,
    );

    let (runner, _db) = runner_with_db().await;
    let ctx = runner
        .run(&workflow, Map::new(), None, "/tmp/c.yaml", "manual")
        .await
        .unwrap();

    // dependents of the failure are skipped, independent work proceeds
    assert_eq!(
        ctx.get_node_result("dependent").unwrap().status,
        NodeStatus::Skipped
    );
    assert_eq!(
        ctx.get_node_result("independent").unwrap().status,
        NodeStatus::Success
    );
    assert_eq!(ctx.state, ExecutionState::Failed);
}

#[tokio::test]
async fn test_unknown_node_type_fails_at_dispatch() {
    let workflow = parse(
        r#"
name: futuristic
nodes:
  - id: solve
    type: quantum-solve
    qubits: 4
"#,
    );

    let (runner, _db) = runner_with_db().await;
    let ctx = runner
        .run(&workflow, Map::new(), None, "/tmp/q.yaml", "manual")
        .await
        .unwrap();

    assert_eq!(ctx.state, ExecutionState::Failed);
    let result = ctx.get_node_result("solve").unwrap();
    assert!(result
        .error_message
        .as_deref()
        .unwrap()
        .contains("No executor registered for node type: quantum-solve"));
}

#[tokio::test]
async fn test_cancellation_marks_execution_cancelled() {
    let workflow = parse(
        r#"
name: sleepy
nodes:
  - id: nap
    type: delay
    duration: "30s"
  - id: after
    type: shell
    command: "echo awake"
    depends_on: [nap]
"#,
    );

    let (runner, db) = runner_with_db().await;
    let execution_id = uuid::Uuid::new_v4();

    let handle = {
        let runner = runner.clone();
        let workflow = workflow.clone();
        tokio::spawn(async move {
            runner
                .run(&workflow, Map::new(), Some(execution_id), "/tmp/z.yaml", "manual")
                .await
        })
    };

    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
    assert!(runner.cancel(execution_id));

    let ctx = handle.await.unwrap().unwrap();
    assert_eq!(ctx.state, ExecutionState::Cancelled);
    assert_eq!(ctx.get_node_result("nap").unwrap().status, NodeStatus::Skipped);
    assert!(ctx.get_node_result("after").is_none());

    let row = db.get_execution(execution_id).await.unwrap().unwrap();
    assert_eq!(row.status().as_str(), "cancelled");
}

#[tokio::test]
async fn test_broadcaster_emits_log_and_final_frames() {
    let workflow = parse(
        r#"
name: noisy
nodes:
  - id: a
    type: shell
    command: "echo frame"
"#,
    );

    let (runner, _db) = runner_with_db().await;
    let execution_id = uuid::Uuid::new_v4();
    let mut rx = runner.broadcaster().subscribe(execution_id);

    runner
        .run(&workflow, Map::new(), Some(execution_id), "/tmp/f.yaml", "manual")
        .await
        .unwrap();

    let mut kinds = Vec::new();
    while let Some(frame) = rx.recv().await {
        kinds.push((frame.kind, frame.data.clone()));
    }

    // connected status, running status, one log frame, final status
    assert!(kinds.len() >= 4);
    assert_eq!(kinds[0].1["status"], json!("connected"));
    let last = kinds.last().unwrap();
    assert_eq!(last.1["status"], json!("success"));
}

#[tokio::test]
async fn test_template_error_is_node_error() {
    let workflow = parse(
        r#"
name: templated
nodes:
  - id: a
    type: shell
    command: "echo {{ nodes.missing.output }}"
"#,
    );

    let (runner, _db) = runner_with_db().await;
    let ctx = runner
        .run(&workflow, Map::new(), None, "/tmp/t.yaml", "manual")
        .await
        .unwrap();

    assert_eq!(ctx.state, ExecutionState::Failed);
    assert!(ctx
        .get_node_result("a")
        .unwrap()
        .error_message
        .as_deref()
        .unwrap()
        .contains("template error"));
}
