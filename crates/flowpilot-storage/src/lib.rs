// FlowPilot storage: SQLite-backed executions, node logs, and schedules.

pub mod database;
pub mod models;
pub mod repositories;

pub use database::Database;
pub use models::{
    CreateExecution, CreateNodeExecution, ExecutionRow, ExecutionStats, ExecutionStatus,
    NodeExecutionRow, ScheduleRow, UpsertSchedule,
};
