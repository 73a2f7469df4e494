// Row types and create/update inputs for the execution store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::FromRow;
use uuid::Uuid;

use flowpilot_core::ExecutionState;

/// Persisted status of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown execution status '{other}'")),
        }
    }
}

impl From<ExecutionState> for ExecutionStatus {
    fn from(state: ExecutionState) -> Self {
        match state {
            ExecutionState::Running => Self::Running,
            ExecutionState::Success => Self::Success,
            ExecutionState::Failed => Self::Failed,
            ExecutionState::Cancelled => Self::Cancelled,
        }
    }
}

/// Record of a workflow execution. Ids are stored as canonical UUID text.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ExecutionRow {
    pub id: String,
    pub workflow_name: String,
    pub workflow_path: String,
    pub status: String,
    pub trigger_type: Option<String>,
    /// JSON-encoded input mapping
    pub inputs: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error: Option<String>,
}

impl ExecutionRow {
    pub fn status(&self) -> ExecutionStatus {
        self.status.parse().unwrap_or(ExecutionStatus::Pending)
    }

    pub fn uuid(&self) -> Option<Uuid> {
        Uuid::parse_str(&self.id).ok()
    }

    pub fn inputs_value(&self) -> Map<String, Value> {
        serde_json::from_str(&self.inputs).unwrap_or_default()
    }
}

/// Input for creating an execution row.
#[derive(Debug, Clone)]
pub struct CreateExecution {
    pub id: Uuid,
    pub workflow_name: String,
    pub workflow_path: String,
    pub status: ExecutionStatus,
    pub trigger_type: Option<String>,
    pub inputs: Map<String, Value>,
}

/// Record of a single node execution within a workflow execution.
/// Cascade-deleted with its parent execution.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct NodeExecutionRow {
    pub id: i64,
    pub execution_id: String,
    pub node_id: String,
    pub node_type: String,
    pub status: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub stdout: String,
    pub stderr: String,
    /// Structured output serialized as a JSON string
    pub output: String,
    pub error: Option<String>,
}

/// Input for creating a node execution row.
#[derive(Debug, Clone)]
pub struct CreateNodeExecution {
    pub execution_id: Uuid,
    pub node_id: String,
    pub node_type: String,
    pub status: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub stdout: String,
    pub stderr: String,
    pub output: String,
    pub error: Option<String>,
}

/// Persistent schedule record, unique per workflow.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ScheduleRow {
    pub id: i64,
    pub workflow_name: String,
    pub workflow_path: String,
    pub enabled: i64,
    /// JSON blob mirroring the active trigger declarations
    pub trigger_config: Option<String>,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_status: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduleRow {
    pub fn is_enabled(&self) -> bool {
        self.enabled != 0
    }

    pub fn trigger_config_value(&self) -> Option<Value> {
        self.trigger_config
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }
}

/// Input for creating or updating a schedule row.
#[derive(Debug, Clone)]
pub struct UpsertSchedule {
    pub workflow_name: String,
    pub workflow_path: String,
    pub enabled: bool,
    pub trigger_config: Option<Value>,
    pub next_run: Option<DateTime<Utc>>,
}

/// Aggregate execution statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionStats {
    pub total_executions: i64,
    pub success_count: i64,
    pub failed_count: i64,
    pub cancelled_count: i64,
    pub running_count: i64,
    pub pending_count: i64,
    pub success_rate: f64,
    pub avg_duration_ms: Option<f64>,
    pub executions_by_workflow: std::collections::HashMap<String, i64>,
}
