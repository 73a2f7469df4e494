// Retry wrapper around executor dispatch
//
// Each attempt goes through the node's circuit breaker (when it has one),
// then the timeout wrapper. Error results carry a structured
// `data.error_category` when the executor could classify the failure itself
// (HTTP status, CLI exit code); otherwise the message text is classified.
// Retryable categories honor the per-node or workflow retry policy, with a
// server-specified retry_after overriding the computed backoff. Cancellation
// aborts backoff waits immediately.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};

use flowpilot_core::{
    classify_error_message, CircuitBreaker, Classification, ErrorCategory, ExecutionContext, Node,
    NodeResult, RetryConfig,
};

use crate::executor::{execute_with_timeout, NodeExecutor};

/// Classification the executor attached to the result, if any. Retryability
/// follows the category; the delay override comes from `data.retry_after`
/// separately.
fn structured_classification(result: &NodeResult) -> Option<Classification> {
    let category: ErrorCategory = result
        .data
        .get("error_category")?
        .as_str()?
        .parse()
        .ok()?;
    Some(Classification::new(
        category,
        category != ErrorCategory::Permanent,
        None,
    ))
}

/// Drives retry attempts for one node dispatch.
pub struct RetryRunner {
    default_config: RetryConfig,
}

impl RetryRunner {
    pub fn new(default_config: RetryConfig) -> Self {
        Self { default_config }
    }

    pub async fn execute_with_retry(
        &self,
        executor: &Arc<dyn NodeExecutor>,
        breaker: Option<&Arc<CircuitBreaker>>,
        node: &Node,
        context: &ExecutionContext,
        timeout: Duration,
    ) -> NodeResult {
        let config = node.retry.clone().unwrap_or_else(|| self.default_config.clone());
        let mut attempts: Vec<Value> = Vec::new();
        let mut attempt: u32 = 0;

        loop {
            if context.is_cancelled() {
                return NodeResult::error("Execution cancelled", None);
            }

            let attempt_started = Utc::now();
            let result = self
                .single_attempt(executor, breaker, node, context, timeout)
                .await;

            if !result.is_error() {
                let mut result = result;
                if attempt > 0 {
                    result
                        .data
                        .insert("retried".into(), json!(true));
                    result
                        .data
                        .insert("total_attempts".into(), json!(attempt + 1));
                    result.data.insert("attempts".into(), json!(attempts));
                }
                return result;
            }

            let message = result
                .error_message
                .clone()
                .unwrap_or_else(|| "unknown error".to_string());
            let classification = structured_classification(&result)
                .unwrap_or_else(|| classify_error_message(&message));
            // only a server-specified retry_after overrides the computed
            // backoff; the classifier's delay hint does not
            let retry_after = result.data.get("retry_after").and_then(Value::as_u64);

            attempts.push(json!({
                "timestamp": attempt_started,
                "error": message,
                "duration_ms": (Utc::now() - attempt_started).num_milliseconds(),
            }));
            attempt += 1;

            let category_allows_retry = match classification.category {
                ErrorCategory::Transient => config.retry_on_transient,
                ErrorCategory::Resource => config.retry_on_resource,
                ErrorCategory::Permanent => false,
                // unknown failures get exactly one retry
                ErrorCategory::Unknown => attempt < 2,
            };

            if !classification.retryable
                || !category_allows_retry
                || !config.has_attempts_remaining(attempt)
            {
                let mut result = result;
                if attempt > 1 {
                    result.error_message = Some(format!(
                        "All {attempt} attempts failed. Last error: {message}"
                    ));
                }
                result.data.insert("attempts".into(), json!(attempts));
                result
                    .data
                    .insert("total_attempts".into(), json!(attempt));
                result.data.insert(
                    "final_error_category".into(),
                    json!(classification.category.to_string()),
                );
                return result;
            }

            let delay = config.backoff(attempt - 1, retry_after);
            tracing::debug!(
                node_id = %node.id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                category = %classification.category,
                "retrying node after backoff"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = context.cancellation.cancelled() => {
                    let mut result = result;
                    result.error_message = Some("Retry aborted by cancellation".into());
                    result.data.insert("attempts".into(), json!(attempts));
                    result.data.insert("total_attempts".into(), json!(attempt));
                    return result;
                }
            }
        }
    }

    async fn single_attempt(
        &self,
        executor: &Arc<dyn NodeExecutor>,
        breaker: Option<&Arc<CircuitBreaker>>,
        node: &Node,
        context: &ExecutionContext,
        timeout: Duration,
    ) -> NodeResult {
        if let Some(breaker) = breaker {
            if let Err(e) = breaker.acquire() {
                // surfaces as a resource-category error; retry_after lines up
                // with the breaker's recovery window
                let retry_in = match &e {
                    flowpilot_core::EngineError::CircuitOpen { retry_in, .. } => *retry_in,
                    _ => 0,
                };
                return NodeResult::error(e.to_string(), None)
                    .with_data_entry("circuit_open", json!(true))
                    .with_data_entry("retry_after", json!(retry_in.max(1)));
            }

            let result = execute_with_timeout(executor, node, context, timeout).await;
            if result.is_error() {
                breaker.on_failure();
            } else {
                breaker.on_success();
            }
            result
        } else {
            execute_with_timeout(executor, node, context, timeout).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    /// Fails `failures` times, then succeeds.
    struct FlakyExecutor {
        calls: AtomicU32,
        failures: u32,
        error: &'static str,
    }

    impl FlakyExecutor {
        fn new(failures: u32, error: &'static str) -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures,
                error,
            }
        }
    }

    #[async_trait]
    impl NodeExecutor for FlakyExecutor {
        async fn execute(&self, _node: &Node, _context: &ExecutionContext) -> NodeResult {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                NodeResult::error(self.error, None)
            } else {
                NodeResult::success(json!("recovered"), None)
            }
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig::default()
            .with_max_attempts(max_attempts)
            .with_initial_delay(0.005)
            .with_jitter(false)
    }

    fn node_with_retry(config: Option<RetryConfig>) -> Node {
        let mut value = json!({"id": "n", "type": "shell", "command": "x"});
        if let Some(config) = config {
            value
                .as_object_mut()
                .unwrap()
                .insert("retry".into(), serde_json::to_value(config).unwrap());
        }
        serde_json::from_value(value).unwrap()
    }

    fn context() -> ExecutionContext {
        ExecutionContext::new("t", Uuid::new_v4(), Default::default())
    }

    #[tokio::test]
    async fn test_transient_failure_recovers() {
        let executor: Arc<dyn NodeExecutor> =
            Arc::new(FlakyExecutor::new(1, "connection refused by peer"));
        let runner = RetryRunner::new(fast_retry(3));

        let result = runner
            .execute_with_retry(
                &executor,
                None,
                &node_with_retry(None),
                &context(),
                Duration::from_secs(5),
            )
            .await;

        assert!(!result.is_error());
        assert_eq!(result.data["total_attempts"], json!(2));
        assert_eq!(result.data["retried"], json!(true));
        assert_eq!(result.data["attempts"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_attempts() {
        let executor: Arc<dyn NodeExecutor> =
            Arc::new(FlakyExecutor::new(10, "request timed out"));
        let runner = RetryRunner::new(fast_retry(3));

        let result = runner
            .execute_with_retry(
                &executor,
                None,
                &node_with_retry(None),
                &context(),
                Duration::from_secs(5),
            )
            .await;

        assert!(result.is_error());
        assert_eq!(result.data["total_attempts"], json!(3));
        assert_eq!(result.data["attempts"].as_array().unwrap().len(), 3);
        assert_eq!(result.data["final_error_category"], json!("transient"));
        assert!(result.error_message.unwrap().contains("All 3 attempts failed"));
    }

    #[tokio::test]
    async fn test_permanent_failure_short_circuits() {
        let executor: Arc<dyn NodeExecutor> =
            Arc::new(FlakyExecutor::new(10, "401 Unauthorized: invalid key"));
        let runner = RetryRunner::new(fast_retry(5));

        let result = runner
            .execute_with_retry(
                &executor,
                None,
                &node_with_retry(None),
                &context(),
                Duration::from_secs(5),
            )
            .await;

        assert!(result.is_error());
        assert_eq!(result.data["total_attempts"], json!(1));
        assert_eq!(result.data["final_error_category"], json!("permanent"));
    }

    #[tokio::test]
    async fn test_node_retry_overrides_default() {
        let executor: Arc<dyn NodeExecutor> =
            Arc::new(FlakyExecutor::new(10, "connection reset"));
        // workflow default would retry 5 times; the node says 2
        let runner = RetryRunner::new(fast_retry(5));

        let result = runner
            .execute_with_retry(
                &executor,
                None,
                &node_with_retry(Some(fast_retry(2))),
                &context(),
                Duration::from_secs(5),
            )
            .await;

        assert_eq!(result.data["total_attempts"], json!(2));
    }

    /// Always errors with a structured category attached, regardless of what
    /// the message text would classify as.
    struct ClassifiedExecutor {
        calls: AtomicU32,
        category: &'static str,
        message: &'static str,
    }

    #[async_trait]
    impl NodeExecutor for ClassifiedExecutor {
        async fn execute(&self, _node: &Node, _context: &ExecutionContext) -> NodeResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            NodeResult::error(self.message, None)
                .with_data_entry("error_category", json!(self.category))
        }
    }

    #[tokio::test]
    async fn test_structured_category_beats_message_text() {
        // the message alone would classify as transient (retryable); the
        // executor knows better and tagged it permanent
        let classified = Arc::new(ClassifiedExecutor {
            calls: AtomicU32::new(0),
            category: "permanent",
            message: "connection refused by peer",
        });
        let executor: Arc<dyn NodeExecutor> = classified.clone();
        let runner = RetryRunner::new(fast_retry(5));

        let result = runner
            .execute_with_retry(
                &executor,
                None,
                &node_with_retry(None),
                &context(),
                Duration::from_secs(5),
            )
            .await;

        assert!(result.is_error());
        assert_eq!(classified.calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.data["final_error_category"], json!("permanent"));
    }

    #[tokio::test]
    async fn test_retry_disabled_by_category_switch() {
        let executor: Arc<dyn NodeExecutor> =
            Arc::new(FlakyExecutor::new(10, "connection reset"));
        let mut config = fast_retry(5);
        config.retry_on_transient = false;
        let runner = RetryRunner::new(config);

        let result = runner
            .execute_with_retry(
                &executor,
                None,
                &node_with_retry(None),
                &context(),
                Duration::from_secs(5),
            )
            .await;

        assert_eq!(result.data["total_attempts"], json!(1));
    }

    #[tokio::test]
    async fn test_breaker_records_outcomes() {
        use flowpilot_core::{CircuitBreakerConfig, CircuitState};

        let executor: Arc<dyn NodeExecutor> = Arc::new(FlakyExecutor::new(10, "boom failure"));
        let breaker = Arc::new(CircuitBreaker::new(
            "test-svc",
            CircuitBreakerConfig {
                failure_threshold: 2,
                recovery_timeout: 60,
                half_open_requests: 1,
            },
        ));
        let runner = RetryRunner::new(fast_retry(2));

        let result = runner
            .execute_with_retry(
                &executor,
                Some(&breaker),
                &node_with_retry(None),
                &context(),
                Duration::from_secs(5),
            )
            .await;

        assert!(result.is_error());
        // two failed attempts tripped the breaker
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_open_breaker_rejects_without_calling_executor() {
        use flowpilot_core::{CircuitBreakerConfig, CircuitState};

        let flaky = Arc::new(FlakyExecutor::new(0, ""));
        let executor: Arc<dyn NodeExecutor> = flaky.clone();
        let breaker = Arc::new(CircuitBreaker::new(
            "test-svc",
            CircuitBreakerConfig {
                failure_threshold: 1,
                recovery_timeout: 3600,
                half_open_requests: 1,
            },
        ));
        breaker.acquire().unwrap();
        breaker.on_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        let runner = RetryRunner::new(RetryConfig::no_retry());
        let result = runner
            .execute_with_retry(
                &executor,
                Some(&breaker),
                &node_with_retry(None),
                &context(),
                Duration::from_secs(5),
            )
            .await;

        assert!(result.is_error());
        assert_eq!(result.data["circuit_open"], json!(true));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 0);
    }
}
