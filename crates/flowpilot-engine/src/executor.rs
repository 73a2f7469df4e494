// Node executor trait, registry, and per-kind timeouts
//
// The registry maps node-type tags to executor instances. Looking up an
// unregistered type is a per-node dispatch error, not a parse error, so
// documents may carry node types this build does not know yet.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use flowpilot_core::{ExecutionContext, Node, NodeResult};

use crate::nodes;

/// A pluggable executor for one node kind.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// Execute a fully template-rendered node against the shared context.
    /// Failures are reported through the result, not through panics.
    async fn execute(&self, node: &Node, context: &ExecutionContext) -> NodeResult;

    /// Name of the circuit breaker guarding this executor's remote resource,
    /// if it has one.
    fn breaker_name(&self) -> Option<&'static str> {
        None
    }
}

/// Registry of node executors, keyed by node-type tag.
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn NodeExecutor>>,
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Registry with every built-in executor installed.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("shell", Arc::new(nodes::shell::ShellExecutor::new()));
        registry.register("http", Arc::new(nodes::http::HttpExecutor::new()));
        registry.register("file-read", Arc::new(nodes::file_read::FileReadExecutor));
        registry.register("file-write", Arc::new(nodes::file_write::FileWriteExecutor));
        registry.register("condition", Arc::new(nodes::condition::ConditionExecutor));
        registry.register("loop", Arc::new(nodes::loop_node::LoopExecutor));
        registry.register("delay", Arc::new(nodes::delay::DelayExecutor));
        registry.register("parallel", Arc::new(nodes::parallel::ParallelExecutor));
        registry.register("chat-cli", Arc::new(nodes::chat_cli::ChatCliExecutor::new()));
        registry.register("chat-api", Arc::new(nodes::chat_api::ChatApiExecutor::new()));
        registry
    }

    pub fn register(&mut self, node_type: impl Into<String>, executor: Arc<dyn NodeExecutor>) {
        self.executors.insert(node_type.into(), executor);
    }

    pub fn get(&self, node_type: &str) -> Option<Arc<dyn NodeExecutor>> {
        self.executors.get(node_type).cloned()
    }

    pub fn has_executor(&self, node_type: &str) -> bool {
        self.executors.contains_key(node_type)
    }
}

/// Per-kind timeout: the node-declared value wins, otherwise the kind
/// default. Control-flow nodes get five minutes; delay gets an hour so the
/// outer guard never truncates a legitimate wait.
pub fn node_timeout(node: &Node) -> Duration {
    if let Some(declared) = node.declared_timeout() {
        return Duration::from_secs(declared);
    }
    let seconds = match node.kind.as_str() {
        "shell" => 60,
        "http" => 30,
        "chat-cli" => 300,
        "chat-api" => 120,
        "file-read" | "file-write" => 30,
        "delay" => 3600,
        "condition" | "loop" | "parallel" => 300,
        _ => 60,
    };
    Duration::from_secs(seconds)
}

/// Race an executor against its timeout. On expiry the node fails with a
/// timeout error; the executor's own drop/kill handling cleans up any
/// in-flight subprocess.
pub async fn execute_with_timeout(
    executor: &Arc<dyn NodeExecutor>,
    node: &Node,
    context: &ExecutionContext,
    timeout: Duration,
) -> NodeResult {
    match tokio::time::timeout(timeout, executor.execute(node, context)).await {
        Ok(result) => result,
        Err(_) => NodeResult::error(
            format!("Node execution timed out after {}s", timeout.as_secs()),
            None,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    struct SleepyExecutor;

    #[async_trait]
    impl NodeExecutor for SleepyExecutor {
        async fn execute(&self, _node: &Node, _context: &ExecutionContext) -> NodeResult {
            tokio::time::sleep(Duration::from_secs(60)).await;
            NodeResult::success(json!("done"), None)
        }
    }

    fn node(kind: &str, extra: serde_json::Value) -> Node {
        let mut value = json!({"id": "n", "type": kind});
        value
            .as_object_mut()
            .unwrap()
            .extend(extra.as_object().unwrap().clone());
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_builtin_registry_covers_all_kinds() {
        let registry = ExecutorRegistry::builtin();
        for kind in flowpilot_core::node::BUILTIN_NODE_TYPES {
            assert!(registry.has_executor(kind), "missing executor for {kind}");
        }
        assert!(!registry.has_executor("quantum-solve"));
    }

    #[test]
    fn test_timeout_defaults() {
        assert_eq!(
            node_timeout(&node("shell", json!({}))),
            Duration::from_secs(60)
        );
        assert_eq!(
            node_timeout(&node("http", json!({}))),
            Duration::from_secs(30)
        );
        assert_eq!(
            node_timeout(&node("condition", json!({}))),
            Duration::from_secs(300)
        );
        assert_eq!(
            node_timeout(&node("delay", json!({}))),
            Duration::from_secs(3600)
        );
        assert_eq!(
            node_timeout(&node("shell", json!({"timeout": 7}))),
            Duration::from_secs(7)
        );
    }

    #[tokio::test]
    async fn test_timeout_wrapper_produces_error_result() {
        let executor: Arc<dyn NodeExecutor> = Arc::new(SleepyExecutor);
        let context = ExecutionContext::new("t", Uuid::new_v4(), Default::default());
        let result = execute_with_timeout(
            &executor,
            &node("shell", json!({"command": "x"})),
            &context,
            Duration::from_millis(20),
        )
        .await;
        assert!(result.is_error());
        assert!(result.error_message.unwrap().contains("timed out"));
    }
}
