// Condition node executor

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use flowpilot_core::node::ConditionParams;
use flowpilot_core::{expr, ExecutionContext, Node, NodeResult};

use crate::executor::NodeExecutor;

/// Evaluates the `if` expression and reports the chosen branch in
/// `data.next_node`. The runner drives branch dispatch from that value.
pub struct ConditionExecutor;

#[async_trait]
impl NodeExecutor for ConditionExecutor {
    async fn execute(&self, node: &Node, context: &ExecutionContext) -> NodeResult {
        let started_at = Utc::now();

        let params: ConditionParams = match node.typed_params() {
            Ok(params) => params,
            Err(e) => {
                return NodeResult::error(format!("invalid condition node: {e}"), Some(started_at))
            }
        };

        let template_ctx = context.template_context();
        let outcome = match expr::evaluate_bool(&params.condition, &template_ctx) {
            Ok(outcome) => outcome,
            Err(e) => {
                return NodeResult::error(
                    format!("Condition evaluation failed: {e}"),
                    Some(started_at),
                )
            }
        };

        let next_node = if outcome {
            Some(params.then.clone())
        } else {
            params.otherwise.clone()
        };

        NodeResult::success(Value::String(outcome.to_string()), Some(started_at))
            .with_data_entry("condition", json!(params.condition))
            .with_data_entry("result", json!(outcome))
            .with_data_entry("next_node", json!(next_node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn context_with_inputs(inputs: serde_json::Value) -> ExecutionContext {
        ExecutionContext::new(
            "test",
            Uuid::new_v4(),
            inputs.as_object().unwrap().clone(),
        )
    }

    fn condition_node(expr: &str, then: &str, otherwise: Option<&str>) -> Node {
        let mut value = json!({"id": "c", "type": "condition", "if": expr, "then": then});
        if let Some(otherwise) = otherwise {
            value.as_object_mut().unwrap().insert("else".into(), json!(otherwise));
        }
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_truthy_chooses_then() {
        let ctx = context_with_inputs(json!({"x": 20}));
        let result = ConditionExecutor
            .execute(&condition_node("inputs.x > 10", "t", Some("f")), &ctx)
            .await;
        assert!(!result.is_error());
        assert_eq!(result.output, json!("true"));
        assert_eq!(result.data["result"], json!(true));
        assert_eq!(result.data["next_node"], json!("t"));
    }

    #[tokio::test]
    async fn test_falsy_chooses_else() {
        let ctx = context_with_inputs(json!({"x": 5}));
        let result = ConditionExecutor
            .execute(&condition_node("inputs.x > 10", "t", Some("f")), &ctx)
            .await;
        assert_eq!(result.data["result"], json!(false));
        assert_eq!(result.data["next_node"], json!("f"));
    }

    #[tokio::test]
    async fn test_falsy_without_else_is_null() {
        let ctx = context_with_inputs(json!({"x": 5}));
        let result = ConditionExecutor
            .execute(&condition_node("inputs.x > 10", "t", None), &ctx)
            .await;
        assert_eq!(result.data["next_node"], json!(null));
    }

    #[tokio::test]
    async fn test_disallowed_name_is_error() {
        let ctx = context_with_inputs(json!({}));
        let result = ConditionExecutor
            .execute(&condition_node("sneaky_var > 1", "t", None), &ctx)
            .await;
        assert!(result.is_error());
        assert!(result
            .error_message
            .unwrap()
            .contains("'sneaky_var' is not allowed"));
    }
}
