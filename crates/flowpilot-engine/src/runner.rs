// Workflow runner
//
// Turns a parsed workflow plus an input mapping into a sequence of dispatched
// nodes: stable topological order over depends_on edges, template rendering
// per node, breaker+retry-wrapped execution, condition/loop/parallel
// expansion, persistence and live broadcast of every state change, and
// cooperative cancellation.

use std::collections::HashSet;
use std::ops::ControlFlow;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{json, Map, Value};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use flowpilot_core::node::{ConditionParams, ParallelParams};
use flowpilot_core::workflow::{InputDefinition, OnError, WorkflowSettings};
use flowpilot_core::{
    expr, BreakerRegistry, EngineError, ErrorReporter, ExecutionContext, ExecutionState, Node,
    NodeResult, NodeStatus, RetryConfig, TemplateEngine, Workflow, WorkflowParser,
};
use flowpilot_storage::{CreateExecution, CreateNodeExecution, Database, ExecutionStatus};

use crate::broadcast::{LogBroadcaster, StreamFrame};
use crate::executor::{node_timeout, ExecutorRegistry};
use crate::retry::RetryRunner;

/// Per-run immutable state threaded through node dispatch.
struct RunState<'a> {
    workflow: &'a Workflow,
    retry: RetryRunner,
    /// Nodes driven by a controller (condition branch, loop body, parallel
    /// member) rather than by the main topological sweep
    controlled: HashSet<String>,
}

/// Executes workflows and owns the per-execution cancellation registry.
pub struct WorkflowRunner {
    registry: Arc<ExecutorRegistry>,
    templates: TemplateEngine,
    breakers: Arc<BreakerRegistry>,
    reporter: Arc<ErrorReporter>,
    broadcaster: Arc<LogBroadcaster>,
    db: Option<Database>,
    cancellations: DashMap<Uuid, CancellationToken>,
}

impl WorkflowRunner {
    pub fn new(
        registry: Arc<ExecutorRegistry>,
        broadcaster: Arc<LogBroadcaster>,
        db: Option<Database>,
    ) -> Self {
        Self {
            registry,
            templates: TemplateEngine::new(),
            breakers: Arc::new(BreakerRegistry::new()),
            reporter: Arc::new(ErrorReporter::new()),
            broadcaster,
            db,
            cancellations: DashMap::new(),
        }
    }

    pub fn reporter(&self) -> &Arc<ErrorReporter> {
        &self.reporter
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn broadcaster(&self) -> &Arc<LogBroadcaster> {
        &self.broadcaster
    }

    /// Signal cancellation for a running execution. Returns false when the
    /// execution is not currently running in this process.
    pub fn cancel(&self, execution_id: Uuid) -> bool {
        match self.cancellations.get(&execution_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Parse a workflow file and run it.
    pub async fn run_file(
        self: &Arc<Self>,
        path: &str,
        inputs: Map<String, Value>,
        execution_id: Option<Uuid>,
        trigger_type: &str,
    ) -> Result<ExecutionContext, EngineError> {
        let workflow = WorkflowParser::new()
            .parse_file(path)
            .map_err(|e| EngineError::Execution(e.to_string()))?;
        self.run(&workflow, inputs, execution_id, path, trigger_type)
            .await
    }

    /// Start a run in the background, returning its execution id immediately.
    pub fn spawn_run(
        self: &Arc<Self>,
        workflow: Workflow,
        inputs: Map<String, Value>,
        workflow_path: String,
        trigger_type: String,
    ) -> Uuid {
        let execution_id = Uuid::new_v4();
        let runner = self.clone();
        tokio::spawn(async move {
            if let Err(e) = runner
                .run(&workflow, inputs, Some(execution_id), &workflow_path, &trigger_type)
                .await
            {
                tracing::error!(
                    execution_id = %execution_id,
                    workflow = %workflow.name,
                    "workflow run failed: {e}"
                );
            }
        });
        execution_id
    }

    /// Execute a workflow to completion and return the final context.
    pub async fn run(
        &self,
        workflow: &Workflow,
        inputs: Map<String, Value>,
        execution_id: Option<Uuid>,
        workflow_path: &str,
        trigger_type: &str,
    ) -> Result<ExecutionContext, EngineError> {
        // input errors reject the run before any row is written
        let merged = merge_inputs(&workflow.inputs, inputs)?;

        let order = workflow
            .topological_order()
            .map_err(EngineError::CircularDependency)?;

        let execution_id = execution_id.unwrap_or_else(Uuid::new_v4);
        let mut ctx = ExecutionContext::new(&workflow.name, execution_id, merged);
        self.cancellations
            .insert(execution_id, ctx.cancellation.clone());

        if let Some(db) = &self.db {
            db.create_execution(CreateExecution {
                id: execution_id,
                workflow_name: workflow.name.clone(),
                workflow_path: workflow_path.to_string(),
                status: ExecutionStatus::Running,
                trigger_type: Some(trigger_type.to_string()),
                inputs: ctx.inputs.clone(),
            })
            .await
            .map_err(EngineError::Internal)?;
        }

        self.reporter
            .create_report(execution_id, &workflow.name, workflow.nodes.len());
        self.broadcaster.publish(StreamFrame::status(
            execution_id,
            json!({"status": "running", "workflow": workflow.name}),
        ));

        let state = RunState {
            workflow,
            retry: RetryRunner::new(workflow_retry_config(&workflow.settings)),
            controlled: workflow
                .nodes
                .iter()
                .flat_map(Node::control_targets)
                .collect(),
        };

        tracing::info!(
            execution_id = %execution_id,
            workflow = %workflow.name,
            trigger = trigger_type,
            nodes = workflow.nodes.len(),
            "workflow execution started"
        );

        for node_id in &order {
            if ctx.is_cancelled() {
                break;
            }
            if state.controlled.contains(node_id) {
                continue;
            }
            if let ControlFlow::Break(()) = self.run_node(&state, node_id, &mut ctx, false).await {
                break;
            }
        }

        let final_state = if ctx.is_cancelled() {
            ExecutionState::Cancelled
        } else if ctx.has_errors() {
            ExecutionState::Failed
        } else {
            ExecutionState::Success
        };
        ctx.mark_finished(final_state);

        let error_summary = error_summary(&ctx);
        if let Some(db) = &self.db {
            db.update_execution_status(
                execution_id,
                final_state.into(),
                ctx.finished_at,
                Some(ctx.duration_ms()),
                error_summary.as_deref(),
            )
            .await
            .map_err(EngineError::Internal)?;
        }

        self.reporter.finish_report(execution_id);
        self.broadcaster.finish(StreamFrame::status(
            execution_id,
            json!({
                "status": final_state.to_string(),
                "finished_at": ctx.finished_at,
                "duration_ms": ctx.duration_ms(),
                "error": error_summary,
            }),
        ));
        self.cancellations.remove(&execution_id);

        tracing::info!(
            execution_id = %execution_id,
            workflow = %workflow.name,
            status = %final_state,
            duration_ms = ctx.duration_ms(),
            "workflow execution finished"
        );

        Ok(ctx)
    }

    /// Dispatch one node: skip-check, render, execute, persist, broadcast,
    /// then expand control flow. Returns Break when the execution must stop
    /// (error under on_error=stop, or cancellation).
    fn run_node<'a>(
        &'a self,
        state: &'a RunState<'a>,
        node_id: &'a str,
        ctx: &'a mut ExecutionContext,
        force: bool,
    ) -> BoxFuture<'a, ControlFlow<()>> {
        Box::pin(async move {
            if ctx.is_cancelled() {
                return ControlFlow::Break(());
            }

            let Some(node) = state.workflow.get_node(node_id) else {
                return ControlFlow::Continue(());
            };

            if !force && ctx.get_node_result(node_id).is_some() {
                return ControlFlow::Continue(());
            }

            // a failed or skipped dependency skips this node
            let blocked = node.depends_on.iter().any(|dep| {
                !matches!(
                    ctx.get_node_result(dep).map(|r| r.status),
                    Some(NodeStatus::Success)
                )
            });
            if blocked {
                let result = NodeResult::skipped("Condition not met");
                self.finalize_node(state, ctx, node, result).await;
                return ControlFlow::Continue(());
            }

            let result = self.execute_node(state, node, ctx).await;
            let errored = result.is_error();
            self.finalize_node(state, ctx, node, result).await;

            if errored && state.workflow.settings.on_error == OnError::Stop {
                return ControlFlow::Break(());
            }

            let result = ctx
                .get_node_result(node_id)
                .cloned()
                .expect("result stored by finalize_node");
            if !errored {
                if let ControlFlow::Break(()) =
                    self.expand_control_flow(state, node, &result, ctx).await
                {
                    return ControlFlow::Break(());
                }
            }

            ControlFlow::Continue(())
        })
    }

    /// Render templates and run the executor under breaker, retry, and
    /// timeout. Never touches the context's result map.
    async fn execute_node(
        &self,
        state: &RunState<'_>,
        node: &Node,
        ctx: &ExecutionContext,
    ) -> NodeResult {
        let Some(executor) = self.registry.get(&node.kind) else {
            return NodeResult::error(
                format!("No executor registered for node type: {}", node.kind),
                Some(Utc::now()),
            );
        };

        let rendered_params = match self
            .templates
            .render_map(&node.params, &ctx.template_context())
        {
            Ok(rendered) => rendered,
            Err(e) => return NodeResult::error(e.to_string(), Some(Utc::now())),
        };
        let rendered = Node {
            id: node.id.clone(),
            kind: node.kind.clone(),
            depends_on: node.depends_on.clone(),
            retry: node.retry.clone(),
            params: rendered_params,
        };

        let timeout = node_timeout(&rendered);
        let breaker = executor.breaker_name().map(|name| self.breakers.get(name));

        state
            .retry
            .execute_with_retry(&executor, breaker.as_ref(), &rendered, ctx, timeout)
            .await
    }

    /// Store a result in the context, persist the node row, publish a log
    /// frame, and feed the error reporter.
    async fn finalize_node(
        &self,
        state: &RunState<'_>,
        ctx: &mut ExecutionContext,
        node: &Node,
        result: NodeResult,
    ) {
        if let Some(db) = &self.db {
            let output = match &result.output {
                Value::Null => String::new(),
                other => serde_json::to_string(other).unwrap_or_default(),
            };
            let stored = db
                .create_node_execution(CreateNodeExecution {
                    execution_id: ctx.execution_id,
                    node_id: node.id.clone(),
                    node_type: node.kind.clone(),
                    status: result.status.to_string(),
                    started_at: result.started_at,
                    finished_at: result.finished_at,
                    duration_ms: Some(result.duration_ms),
                    stdout: result.stdout.clone(),
                    stderr: result.stderr.clone(),
                    output,
                    error: result.error_message.clone(),
                })
                .await;
            if let Err(e) = stored {
                tracing::error!(
                    execution_id = %ctx.execution_id,
                    node_id = %node.id,
                    "failed to persist node execution: {e}"
                );
            }
        }

        self.broadcaster.publish(StreamFrame::log(
            ctx.execution_id,
            json!({
                "node_id": node.id,
                "node_type": node.kind,
                "status": result.status.to_string(),
                "stdout": result.stdout,
                "stderr": result.stderr,
                "error": result.error_message,
                "duration_ms": result.duration_ms,
            }),
        ));

        match result.status {
            NodeStatus::Success => self.reporter.record_execution(ctx.execution_id, true),
            NodeStatus::Error => {
                self.reporter.record_execution(ctx.execution_id, false);
                if state.workflow.settings.on_error == OnError::Notify {
                    self.broadcaster.publish(StreamFrame::error(
                        ctx.execution_id,
                        result.error_message.as_deref().unwrap_or("node failed"),
                    ));
                }
                let category = result
                    .data
                    .get("final_error_category")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                let attempts = result
                    .data
                    .get("total_attempts")
                    .and_then(Value::as_u64)
                    .unwrap_or(1) as u32;
                self.reporter.add_error(
                    ctx.execution_id,
                    &node.id,
                    result.error_message.as_deref().unwrap_or("unknown error"),
                    category,
                    attempts,
                    state.workflow.settings.on_error != OnError::Stop,
                );
            }
            _ => {}
        }

        ctx.set_node_result(&node.id, result);
    }

    /// Expand a successful control-flow result: dispatch the chosen condition
    /// branch, iterate loop bodies, or run parallel members.
    fn expand_control_flow<'a>(
        &'a self,
        state: &'a RunState<'a>,
        node: &'a Node,
        result: &'a NodeResult,
        ctx: &'a mut ExecutionContext,
    ) -> BoxFuture<'a, ControlFlow<()>> {
        Box::pin(async move {
            match node.kind.as_str() {
                "condition" => self.expand_condition(state, node, result, ctx).await,
                "loop" => self.expand_loop(state, result, ctx).await,
                "parallel" => self.expand_parallel(state, node, result, ctx).await,
                _ => ControlFlow::Continue(()),
            }
        })
    }

    async fn expand_condition(
        &self,
        state: &RunState<'_>,
        node: &Node,
        result: &NodeResult,
        ctx: &mut ExecutionContext,
    ) -> ControlFlow<()> {
        let Ok(params) = node.typed_params::<ConditionParams>() else {
            return ControlFlow::Continue(());
        };
        let chosen = result
            .data
            .get("next_node")
            .and_then(Value::as_str)
            .map(str::to_string);

        // the branch that was not chosen is explicitly skipped so its
        // dependents observe a skipped dependency
        for target in [Some(params.then.clone()), params.otherwise.clone()]
            .into_iter()
            .flatten()
        {
            if Some(&target) != chosen.as_ref() && ctx.get_node_result(&target).is_none() {
                if let Some(target_node) = state.workflow.get_node(&target) {
                    self.finalize_node(state, ctx, target_node, NodeResult::skipped("Condition not met"))
                        .await;
                }
            }
        }

        match chosen {
            Some(target) => self.run_node(state, &target, ctx, false).await,
            None => ControlFlow::Continue(()),
        }
    }

    async fn expand_loop(
        &self,
        state: &RunState<'_>,
        result: &NodeResult,
        ctx: &mut ExecutionContext,
    ) -> ControlFlow<()> {
        let items = result
            .data
            .get("loop_items")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if items.is_empty() {
            return ControlFlow::Continue(());
        }

        let as_var = result
            .data
            .get("as_var")
            .and_then(Value::as_str)
            .unwrap_or("item")
            .to_string();
        let index_var = result
            .data
            .get("index_var")
            .and_then(Value::as_str)
            .unwrap_or("index")
            .to_string();
        let children: Vec<String> = result
            .data
            .get("child_nodes")
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let break_if = result
            .data
            .get("break_if")
            .and_then(Value::as_str)
            .map(str::to_string);

        ctx.push_loop_variable(&as_var, Value::Null);
        ctx.push_loop_variable(&index_var, Value::Null);

        let mut flow = ControlFlow::Continue(());
        'iterations: for (index, item) in items.into_iter().enumerate() {
            if ctx.is_cancelled() {
                flow = ControlFlow::Break(());
                break;
            }

            ctx.set_loop_variable(&as_var, item);
            ctx.set_loop_variable(&index_var, json!(index));

            if let Some(break_expr) = &break_if {
                match expr::evaluate_bool(break_expr, &ctx.template_context()) {
                    Ok(true) => break 'iterations,
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!("break_if evaluation failed, continuing loop: {e}");
                    }
                }
            }

            for child in &children {
                if let ControlFlow::Break(()) = self.run_node(state, child, ctx, true).await {
                    flow = ControlFlow::Break(());
                    break 'iterations;
                }
            }
        }

        ctx.pop_loop_variable(&index_var);
        ctx.pop_loop_variable(&as_var);
        flow
    }

    async fn expand_parallel(
        &self,
        state: &RunState<'_>,
        node: &Node,
        _result: &NodeResult,
        ctx: &mut ExecutionContext,
    ) -> ControlFlow<()> {
        let Ok(params) = node.typed_params::<ParallelParams>() else {
            return ControlFlow::Continue(());
        };
        if params.nodes.is_empty() {
            return ControlFlow::Continue(());
        }

        let snapshot = Arc::new(ctx.clone());
        let semaphore = params
            .max_concurrency
            .map(|limit| Arc::new(Semaphore::new(limit.max(1))));

        let mut pending: FuturesUnordered<_> = params
            .nodes
            .iter()
            .map(|member_id| {
                let member_id = member_id.clone();
                let snapshot = snapshot.clone();
                let semaphore = semaphore.clone();
                async move {
                    let _permit = match &semaphore {
                        Some(semaphore) => Some(semaphore.acquire().await),
                        None => None,
                    };
                    let result = self.execute_member(state, &member_id, &snapshot).await;
                    (member_id, result)
                }
            })
            .collect();

        let deadline = params
            .timeout
            .map(|seconds| tokio::time::Instant::now() + std::time::Duration::from_secs(seconds));

        let mut saw_error = false;
        let mut timed_out = false;
        let mut aborted = false;
        let mut control_flow_members: Vec<(String, NodeResult)> = Vec::new();

        loop {
            let next = if let Some(deadline) = deadline {
                match tokio::time::timeout_at(deadline, pending.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        timed_out = true;
                        None
                    }
                }
            } else {
                pending.next().await
            };

            let Some((member_id, result)) = next else {
                break;
            };

            let errored = result.is_error();
            if let Some(member) = state.workflow.get_node(&member_id) {
                let is_control_flow =
                    matches!(member.kind.as_str(), "condition" | "loop" | "parallel");
                if is_control_flow && !errored {
                    control_flow_members.push((member_id.clone(), result.clone()));
                }
                self.finalize_node(state, ctx, member, result).await;
            }

            if errored {
                saw_error = true;
                if params.fail_fast {
                    aborted = true;
                    break;
                }
            }
        }

        // dropping the stream cancels any members still in flight
        drop(pending);

        if timed_out || aborted {
            saw_error |= timed_out;
            for member_id in &params.nodes {
                if ctx.get_node_result(member_id).is_none() {
                    if let Some(member) = state.workflow.get_node(member_id) {
                        let result = if timed_out {
                            NodeResult::error(
                                format!(
                                    "Parallel group timed out after {}s",
                                    params.timeout.unwrap_or_default()
                                ),
                                None,
                            )
                        } else {
                            NodeResult::skipped("Cancelled by fail-fast")
                        };
                        self.finalize_node(state, ctx, member, result).await;
                    }
                }
            }
        }

        // nested control flow runs sequentially once the group has settled
        for (member_id, result) in control_flow_members {
            if let Some(member) = state.workflow.get_node(&member_id) {
                if let ControlFlow::Break(()) = self
                    .expand_control_flow(state, member, &result, ctx)
                    .await
                {
                    return ControlFlow::Break(());
                }
            }
        }

        if saw_error && state.workflow.settings.on_error == OnError::Stop {
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }

    /// Execute one parallel member against a context snapshot. Persistence
    /// and context mutation happen on the collection side.
    async fn execute_member(
        &self,
        state: &RunState<'_>,
        member_id: &str,
        snapshot: &ExecutionContext,
    ) -> NodeResult {
        let Some(node) = state.workflow.get_node(member_id) else {
            return NodeResult::error(format!("unknown parallel member '{member_id}'"), None);
        };

        let blocked = node.depends_on.iter().any(|dep| {
            !matches!(
                snapshot.get_node_result(dep).map(|r| r.status),
                Some(NodeStatus::Success)
            )
        });
        if blocked {
            return NodeResult::skipped("Condition not met");
        }

        self.execute_node(state, node, snapshot).await
    }
}

/// Merge caller inputs with declared defaults; missing required inputs fail
/// the run, undeclared caller keys pass through.
fn merge_inputs(
    definitions: &std::collections::BTreeMap<String, InputDefinition>,
    provided: Map<String, Value>,
) -> Result<Map<String, Value>, EngineError> {
    let mut merged = Map::new();

    for (name, definition) in definitions {
        if let Some(value) = provided.get(name) {
            merged.insert(name.clone(), value.clone());
        } else if let Some(default) = &definition.default {
            merged.insert(name.clone(), default.clone());
        } else if definition.required {
            return Err(EngineError::MissingInput(name.clone()));
        }
    }

    for (name, value) in provided {
        merged.entry(name).or_insert(value);
    }

    Ok(merged)
}

/// Workflow-level retry default: settings.retry = N means N retries on top
/// of the initial attempt; zero means a single attempt. Per-node retry
/// blocks override this entirely.
fn workflow_retry_config(settings: &WorkflowSettings) -> RetryConfig {
    if settings.retry == 0 {
        RetryConfig::no_retry()
    } else {
        RetryConfig::default()
            .with_max_attempts(settings.retry + 1)
            .with_initial_delay(settings.retry_delay as f64)
    }
}

fn error_summary(ctx: &ExecutionContext) -> Option<String> {
    let mut failures: Vec<String> = ctx
        .nodes
        .iter()
        .filter(|(_, result)| result.is_error())
        .map(|(node_id, result)| {
            format!(
                "{node_id}: {}",
                result.error_message.as_deref().unwrap_or("error")
            )
        })
        .collect();
    if failures.is_empty() {
        return None;
    }
    failures.sort();
    Some(failures.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_inputs_defaults_and_required() {
        let mut definitions = std::collections::BTreeMap::new();
        definitions.insert(
            "region".to_string(),
            InputDefinition {
                default: Some(json!("us-east-1")),
                ..Default::default()
            },
        );
        definitions.insert(
            "target".to_string(),
            InputDefinition {
                required: true,
                ..Default::default()
            },
        );

        let provided: Map<String, Value> = json!({"target": "prod", "extra": 1})
            .as_object()
            .unwrap()
            .clone();
        let merged = merge_inputs(&definitions, provided).unwrap();
        assert_eq!(merged["region"], json!("us-east-1"));
        assert_eq!(merged["target"], json!("prod"));
        assert_eq!(merged["extra"], json!(1));

        let err = merge_inputs(&definitions, Map::new()).unwrap_err();
        assert!(matches!(err, EngineError::MissingInput(name) if name == "target"));
    }

    #[test]
    fn test_workflow_retry_config_mapping() {
        let mut settings = WorkflowSettings::default();
        assert_eq!(workflow_retry_config(&settings).max_attempts, 1);

        settings.retry = 2;
        settings.retry_delay = 7;
        let config = workflow_retry_config(&settings);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.initial_delay, 7.0);
    }
}
