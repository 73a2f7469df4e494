// Parallel node executor
//
// Validates the configuration and returns the concurrency plan; the runner
// performs the actual concurrent dispatch of member nodes.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use flowpilot_core::node::ParallelParams;
use flowpilot_core::{ExecutionContext, Node, NodeResult};

use crate::executor::NodeExecutor;

pub struct ParallelExecutor;

#[async_trait]
impl NodeExecutor for ParallelExecutor {
    async fn execute(&self, node: &Node, _context: &ExecutionContext) -> NodeResult {
        let started_at = Utc::now();

        let params: ParallelParams = match node.typed_params() {
            Ok(params) => params,
            Err(e) => {
                return NodeResult::error(format!("invalid parallel node: {e}"), Some(started_at))
            }
        };

        if params.nodes.is_empty() {
            return NodeResult::success(json!({"completed": 0}), Some(started_at))
                .with_data_entry("parallel_nodes", json!([]))
                .with_data_entry("fail_fast", json!(params.fail_fast))
                .with_data_entry("empty_parallel", json!(true));
        }

        tracing::debug!(
            node_id = %node.id,
            members = params.nodes.len(),
            max_concurrency = ?params.max_concurrency,
            fail_fast = params.fail_fast,
            "parallel plan resolved"
        );

        NodeResult::success(
            json!({
                "parallel_nodes": params.nodes,
                "max_concurrency": params.max_concurrency,
            }),
            Some(started_at),
        )
        .with_data_entry("parallel_nodes", json!(params.nodes))
        .with_data_entry("max_concurrency", json!(params.max_concurrency))
        .with_data_entry("fail_fast", json!(params.fail_fast))
        .with_data_entry("timeout", json!(params.timeout))
        .with_data_entry("node_count", json!(params.nodes.len()))
    }
}
