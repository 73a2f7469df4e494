// Loop node executor
//
// Resolves `for_each` and returns the iteration plan; the runner performs
// the actual iteration so child nodes run through the normal dispatch path.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use flowpilot_core::node::LoopParams;
use flowpilot_core::{expr, ExecutionContext, Node, NodeResult};

use crate::executor::NodeExecutor;

pub struct LoopExecutor;

#[async_trait]
impl NodeExecutor for LoopExecutor {
    async fn execute(&self, node: &Node, context: &ExecutionContext) -> NodeResult {
        let started_at = Utc::now();

        let params: LoopParams = match node.typed_params() {
            Ok(params) => params,
            Err(e) => return NodeResult::error(format!("invalid loop node: {e}"), Some(started_at)),
        };

        let template_ctx = context.template_context();
        let items = match expr::evaluate(&params.for_each, &template_ctx) {
            Ok(items) => items,
            Err(e) => {
                return NodeResult::error(
                    format!("Loop expression evaluation failed: {e}"),
                    Some(started_at),
                )
            }
        };

        let items = match items {
            Value::Array(items) => items,
            Value::Null => {
                return NodeResult::error(
                    format!("for_each expression '{}' resolved to None", params.for_each),
                    Some(started_at),
                )
            }
            other => {
                return NodeResult::error(
                    format!(
                        "for_each must resolve to a sequence, got {}",
                        match other {
                            Value::String(_) => "str",
                            Value::Number(_) => "number",
                            Value::Bool(_) => "bool",
                            Value::Object(_) => "dict",
                            _ => "unknown",
                        }
                    ),
                    Some(started_at),
                )
            }
        };

        let total_items = items.len();

        if items.is_empty() {
            return NodeResult::success(
                json!({"iterations": 0, "total_items": 0}),
                Some(started_at),
            )
            .with_data_entry("loop_items", json!([]))
            .with_data_entry("iterations_planned", json!(0))
            .with_data_entry("total_items", json!(0))
            .with_data_entry("child_nodes", json!(params.body));
        }

        let planned: Vec<Value> = match params.max_iterations {
            Some(max) => items.into_iter().take(max).collect(),
            None => items,
        };

        tracing::debug!(
            node_id = %node.id,
            planned = planned.len(),
            total = total_items,
            "loop plan resolved"
        );

        NodeResult::success(
            json!({"iterations": planned.len(), "total_items": total_items}),
            Some(started_at),
        )
        .with_data_entry("loop_items", Value::Array(planned.clone()))
        .with_data_entry("as_var", json!(params.as_var))
        .with_data_entry("index_var", json!(params.index_var))
        .with_data_entry("child_nodes", json!(params.body))
        .with_data_entry("break_if", json!(params.break_if))
        .with_data_entry("max_iterations", json!(params.max_iterations))
        .with_data_entry("iterations_planned", json!(planned.len()))
        .with_data_entry("total_items", json!(total_items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn context_with_inputs(inputs: serde_json::Value) -> ExecutionContext {
        ExecutionContext::new("test", Uuid::new_v4(), inputs.as_object().unwrap().clone())
    }

    fn loop_node(extra: serde_json::Value) -> Node {
        let mut value = json!({"id": "l", "type": "loop", "do": "work"});
        value
            .as_object_mut()
            .unwrap()
            .extend(extra.as_object().unwrap().clone());
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_plan_carries_items_and_vars() {
        let ctx = context_with_inputs(json!({"files": ["a", "b", "c"]}));
        let result = LoopExecutor
            .execute(&loop_node(json!({"for_each": "inputs.files"})), &ctx)
            .await;
        assert!(!result.is_error());
        assert_eq!(result.data["loop_items"], json!(["a", "b", "c"]));
        assert_eq!(result.data["as_var"], json!("item"));
        assert_eq!(result.data["index_var"], json!("index"));
        assert_eq!(result.data["child_nodes"], json!(["work"]));
    }

    #[tokio::test]
    async fn test_empty_sequence_is_success_with_zero_iterations() {
        let ctx = context_with_inputs(json!({"files": []}));
        let result = LoopExecutor
            .execute(&loop_node(json!({"for_each": "inputs.files"})), &ctx)
            .await;
        assert!(!result.is_error());
        assert_eq!(result.data["iterations_planned"], json!(0));
        assert_eq!(result.output["iterations"], json!(0));
    }

    #[tokio::test]
    async fn test_max_iterations_truncates() {
        let ctx = context_with_inputs(json!({"files": [1, 2, 3, 4, 5]}));
        let result = LoopExecutor
            .execute(
                &loop_node(json!({"for_each": "inputs.files", "max_iterations": 2})),
                &ctx,
            )
            .await;
        assert_eq!(result.data["loop_items"], json!([1, 2]));
        assert_eq!(result.data["iterations_planned"], json!(2));
        assert_eq!(result.data["total_items"], json!(5));
    }

    #[tokio::test]
    async fn test_non_sequence_is_error() {
        let ctx = context_with_inputs(json!({"files": "not-a-list"}));
        let result = LoopExecutor
            .execute(&loop_node(json!({"for_each": "inputs.files"})), &ctx)
            .await;
        assert!(result.is_error());
        assert!(result
            .error_message
            .unwrap()
            .contains("must resolve to a sequence"));
    }

    #[tokio::test]
    async fn test_null_sequence_is_error() {
        let ctx = context_with_inputs(json!({"files": null}));
        let result = LoopExecutor
            .execute(&loop_node(json!({"for_each": "inputs.files"})), &ctx)
            .await;
        assert!(result.is_error());
        assert!(result.error_message.unwrap().contains("resolved to None"));
    }
}
