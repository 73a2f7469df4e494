// Execution context and node results
//
// The runner owns one ExecutionContext per run. Executors receive it by
// reference and must not retain it after their call returns.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Status of a single node execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Running,
    Success,
    Error,
    Skipped,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Error => write!(f, "error"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Result of executing a single node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeResult {
    pub status: NodeStatus,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    /// Human-readable primary payload
    #[serde(default)]
    pub output: Value,
    /// Structured supplementary data
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub duration_ms: i64,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

fn elapsed_ms(started_at: Option<DateTime<Utc>>, finished_at: DateTime<Utc>) -> i64 {
    started_at
        .map(|s| (finished_at - s).num_milliseconds())
        .unwrap_or(0)
}

impl NodeResult {
    pub fn pending() -> Self {
        Self {
            status: NodeStatus::Pending,
            stdout: String::new(),
            stderr: String::new(),
            output: Value::Null,
            data: Map::new(),
            duration_ms: 0,
            error_message: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn success(output: Value, started_at: Option<DateTime<Utc>>) -> Self {
        let finished = Utc::now();
        Self {
            status: NodeStatus::Success,
            output,
            duration_ms: elapsed_ms(started_at, finished),
            started_at,
            finished_at: Some(finished),
            ..Self::pending()
        }
    }

    pub fn error(message: impl Into<String>, started_at: Option<DateTime<Utc>>) -> Self {
        let finished = Utc::now();
        Self {
            status: NodeStatus::Error,
            error_message: Some(message.into()),
            duration_ms: elapsed_ms(started_at, finished),
            started_at,
            finished_at: Some(finished),
            ..Self::pending()
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            status: NodeStatus::Skipped,
            error_message: (!reason.is_empty()).then_some(reason),
            ..Self::pending()
        }
    }

    pub fn with_stdout(mut self, stdout: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self
    }

    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = stderr.into();
        self
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = output;
        self
    }

    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = data;
        self
    }

    pub fn with_data_entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    pub fn is_error(&self) -> bool {
        self.status == NodeStatus::Error
    }
}

/// Final state of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    Running,
    Success,
    Failed,
    Cancelled,
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Context for one workflow execution: inputs, per-node results, and the
/// loop-variable stack made visible to templates and expressions.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub workflow_name: String,
    pub execution_id: Uuid,
    pub inputs: Map<String, Value>,
    pub nodes: HashMap<String, NodeResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub state: ExecutionState,
    /// Loop variables as a stack so nested loops shadow without clobbering
    loop_variables: Vec<(String, Value)>,
    /// Cooperative cancellation signal for this execution
    pub cancellation: CancellationToken,
}

impl ExecutionContext {
    pub fn new(workflow_name: impl Into<String>, execution_id: Uuid, inputs: Map<String, Value>) -> Self {
        Self {
            workflow_name: workflow_name.into(),
            execution_id,
            inputs,
            nodes: HashMap::new(),
            started_at: Utc::now(),
            finished_at: None,
            state: ExecutionState::Running,
            loop_variables: Vec::new(),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn set_node_result(&mut self, node_id: impl Into<String>, result: NodeResult) {
        self.nodes.insert(node_id.into(), result);
    }

    pub fn get_node_result(&self, node_id: &str) -> Option<&NodeResult> {
        self.nodes.get(node_id)
    }

    pub fn mark_finished(&mut self, state: ExecutionState) {
        self.finished_at = Some(Utc::now());
        self.state = state;
    }

    pub fn duration_ms(&self) -> i64 {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds()
    }

    pub fn has_errors(&self) -> bool {
        self.nodes.values().any(NodeResult::is_error)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Push a loop variable; outer values with the same name are shadowed
    /// until the matching pop.
    pub fn push_loop_variable(&mut self, name: impl Into<String>, value: Value) {
        self.loop_variables.push((name.into(), value));
    }

    /// Pop the most recent binding for a loop variable name.
    pub fn pop_loop_variable(&mut self, name: &str) {
        if let Some(pos) = self.loop_variables.iter().rposition(|(n, _)| n == name) {
            self.loop_variables.remove(pos);
        }
    }

    /// Replace the innermost binding of a loop variable, or push one.
    pub fn set_loop_variable(&mut self, name: &str, value: Value) {
        match self.loop_variables.iter_mut().rev().find(|(n, _)| n == name) {
            Some((_, slot)) => *slot = value,
            None => self.push_loop_variable(name, value),
        }
    }

    /// Build the mapping exposed to templates and safe expressions:
    /// `inputs`, `nodes` (dashes rewritten to underscores), `env`,
    /// `execution_id`, `workflow_name`, plus any live loop variables.
    pub fn template_context(&self) -> Map<String, Value> {
        let mut ctx = Map::new();

        ctx.insert("inputs".into(), Value::Object(self.inputs.clone()));

        let mut nodes = Map::new();
        for (node_id, result) in &self.nodes {
            let mut entry = Map::new();
            entry.insert("stdout".into(), Value::String(result.stdout.clone()));
            entry.insert("stderr".into(), Value::String(result.stderr.clone()));
            entry.insert("output".into(), result.output.clone());
            entry.insert("data".into(), Value::Object(result.data.clone()));
            entry.insert("status".into(), Value::String(result.status.to_string()));
            nodes.insert(node_id.replace('-', "_"), Value::Object(entry));
        }
        ctx.insert("nodes".into(), Value::Object(nodes));

        let env: Map<String, Value> = std::env::vars()
            .map(|(k, v)| (k, Value::String(v)))
            .collect();
        ctx.insert("env".into(), Value::Object(env));

        ctx.insert(
            "execution_id".into(),
            Value::String(self.execution_id.to_string()),
        );
        ctx.insert(
            "workflow_name".into(),
            Value::String(self.workflow_name.clone()),
        );

        for (name, value) in &self.loop_variables {
            ctx.insert(name.clone(), value.clone());
        }

        ctx
    }
}
