// FlowPilot engine: node executors, registry, retry wrapper, broadcaster,
// and the DAG runner.

pub mod broadcast;
pub mod executor;
pub mod nodes;
pub mod retry;
pub mod runner;

pub use broadcast::{FrameKind, FrameReceiver, LogBroadcaster, StreamFrame};
pub use executor::{execute_with_timeout, node_timeout, ExecutorRegistry, NodeExecutor};
pub use retry::RetryRunner;
pub use runner::WorkflowRunner;
