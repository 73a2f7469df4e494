// Chat API node executor
//
// Submits a messages-style request to the chat completion service. The
// service is opaque to the engine: one POST, text blocks back, token usage
// in the response. Error messages are kept in the canonical shapes the
// retry classifier matches on.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use flowpilot_core::node::{ApiOutputFormat, ChatApiParams};
use flowpilot_core::{classify_http_status, ExecutionContext, Node, NodeResult};

use crate::executor::NodeExecutor;

const DEFAULT_API_URL: &str = "https://api.chatsvc.example/v1/messages";
const API_KEY_VAR: &str = "CHAT_API_KEY";
const API_URL_VAR: &str = "CHAT_API_URL";

/// Per-model pricing in USD per million tokens, matched by id prefix.
const MODEL_PRICING: &[(&str, f64, f64)] = &[
    ("opus", 15.00, 75.00),
    ("sonnet", 3.00, 15.00),
    ("haiku", 0.80, 4.00),
];
const DEFAULT_PRICING: (f64, f64) = (3.00, 15.00);

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<Map<String, Value>>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize, Default)]
struct Usage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// Cost in USD for a call, using prefix-matched per-model rates.
fn calculate_cost(model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
    let (input_rate, output_rate) = MODEL_PRICING
        .iter()
        .find(|(prefix, _, _)| model.starts_with(prefix) || model.contains(prefix))
        .map(|(_, input, output)| (*input, *output))
        .unwrap_or(DEFAULT_PRICING);

    let cost = (input_tokens as f64 / 1_000_000.0) * input_rate
        + (output_tokens as f64 / 1_000_000.0) * output_rate;
    (cost * 1_000_000.0).round() / 1_000_000.0
}

pub struct ChatApiExecutor {
    client: Client,
}

impl ChatApiExecutor {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    fn api_url() -> String {
        std::env::var(API_URL_VAR).unwrap_or_else(|_| DEFAULT_API_URL.to_string())
    }

    fn api_key() -> Result<String, String> {
        std::env::var(API_KEY_VAR).map_err(|_| {
            format!("Chat API key not configured: set the {API_KEY_VAR} environment variable")
        })
    }

    /// System prompt with the JSON-only instruction appended when the node
    /// requests JSON output.
    fn effective_system(params: &ChatApiParams) -> Option<String> {
        if params.output_format != ApiOutputFormat::Json {
            return params.system.clone();
        }

        let mut instruction = "Respond with valid JSON only.".to_string();
        if let Some(schema) = &params.json_schema {
            instruction.push_str(&format!(
                " Use this schema: {}",
                serde_json::to_string(schema).unwrap_or_default()
            ));
        }

        Some(match &params.system {
            Some(system) => format!("{system}\n\n{instruction}"),
            None => instruction,
        })
    }
}

impl Default for ChatApiExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeExecutor for ChatApiExecutor {
    async fn execute(&self, node: &Node, context: &ExecutionContext) -> NodeResult {
        let started_at = Utc::now();

        let params: ChatApiParams = match node.typed_params() {
            Ok(params) => params,
            Err(e) => {
                return NodeResult::error(format!("invalid chat-api node: {e}"), Some(started_at))
            }
        };

        let api_key = match Self::api_key() {
            Ok(key) => key,
            Err(e) => return NodeResult::error(e, Some(started_at)),
        };

        let request = ChatRequest {
            model: params.model.clone(),
            max_tokens: params.max_tokens,
            messages: vec![ChatMessage {
                role: "user",
                content: params.prompt.clone(),
            }],
            system: Self::effective_system(&params),
            temperature: params.temperature,
            top_p: params.top_p,
            top_k: params.top_k,
            stop_sequences: params.stop_sequences.clone(),
            metadata: params.metadata.clone(),
        };

        let send = self
            .client
            .post(Self::api_url())
            .header("x-api-key", &api_key)
            .header("content-type", "application/json")
            .timeout(std::time::Duration::from_secs(params.timeout))
            .json(&request)
            .send();

        let response = tokio::select! {
            result = send => result,
            _ = context.cancellation.cancelled() => {
                return NodeResult::error("Chat API request cancelled", Some(started_at));
            }
        };

        let response = match response {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return NodeResult::error(
                    format!("API request timed out after {}s", params.timeout),
                    Some(started_at),
                )
            }
            Err(e) => {
                return NodeResult::error(format!("API connection error: {e}"), Some(started_at))
            }
        };

        let status = response.status().as_u16();
        if status == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse::<u64>().ok())
                .unwrap_or(60);
            return NodeResult::error(
                "Rate limit exceeded. Retry after delay.",
                Some(started_at),
            )
            .with_data_entry("error_category", json!("resource"))
            .with_data_entry("retry_after", json!(retry_after));
        }
        if status >= 400 {
            let classification = classify_http_status(status, None);
            let body = response.text().await.unwrap_or_default();
            return NodeResult::error(
                format!("API error ({status}): {body}"),
                Some(started_at),
            )
            .with_data_entry(
                "error_category",
                json!(classification.category.to_string()),
            );
        }

        let parsed: ChatResponse = match response.json().await {
            Ok(parsed) => parsed,
            Err(e) => {
                return NodeResult::error(
                    format!("failed to decode API response: {e}"),
                    Some(started_at),
                )
            }
        };

        let output_text: String = parsed
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .map(|block| block.text.as_str())
            .collect();

        let parsed_json: Option<Value> = match params.output_format {
            ApiOutputFormat::Json => Some(match serde_json::from_str(&output_text) {
                Ok(value) => value,
                Err(e) => json!({"parse_error": e.to_string(), "raw": output_text}),
            }),
            ApiOutputFormat::Text => None,
        };

        let model = parsed.model.unwrap_or(params.model);
        let cost = calculate_cost(&model, parsed.usage.input_tokens, parsed.usage.output_tokens);

        NodeResult::success(Value::String(output_text), Some(started_at))
            .with_data_entry("model", json!(model))
            .with_data_entry("input_tokens", json!(parsed.usage.input_tokens))
            .with_data_entry("output_tokens", json!(parsed.usage.output_tokens))
            .with_data_entry(
                "total_tokens",
                json!(parsed.usage.input_tokens + parsed.usage.output_tokens),
            )
            .with_data_entry("cost_usd", json!(cost))
            .with_data_entry("stop_reason", json!(parsed.stop_reason))
            .with_data_entry("parsed", parsed_json.unwrap_or(Value::Null))
    }

    fn breaker_name(&self) -> Option<&'static str> {
        Some("chat-api")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(extra: Value) -> ChatApiParams {
        let mut value = json!({"prompt": "hi"});
        value
            .as_object_mut()
            .unwrap()
            .extend(extra.as_object().unwrap().clone());
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_cost_uses_prefix_rates() {
        // 1M input + 1M output at sonnet rates
        assert_eq!(calculate_cost("sonnet-4", 1_000_000, 1_000_000), 18.0);
        assert_eq!(calculate_cost("opus-4", 1_000_000, 0), 15.0);
        // unknown models fall back to default pricing
        assert_eq!(calculate_cost("mystery-9", 1_000_000, 0), 3.0);
        assert_eq!(calculate_cost("haiku-3", 0, 500_000), 2.0);
    }

    #[test]
    fn test_json_mode_appends_instruction() {
        let system = ChatApiExecutor::effective_system(&params(json!({
            "output_format": "json",
            "system": "You are terse.",
        })))
        .unwrap();
        assert!(system.starts_with("You are terse."));
        assert!(system.contains("valid JSON only"));

        let bare = ChatApiExecutor::effective_system(&params(json!({
            "output_format": "json",
        })))
        .unwrap();
        assert_eq!(bare, "Respond with valid JSON only.");
    }

    #[test]
    fn test_json_mode_includes_schema() {
        let system = ChatApiExecutor::effective_system(&params(json!({
            "output_format": "json",
            "json_schema": {"type": "object"},
        })))
        .unwrap();
        assert!(system.contains(r#"{"type":"object"}"#));
    }

    #[test]
    fn test_text_mode_keeps_system_untouched() {
        let system = ChatApiExecutor::effective_system(&params(json!({
            "system": "You are terse.",
        })));
        assert_eq!(system.as_deref(), Some("You are terse."));
        assert_eq!(ChatApiExecutor::effective_system(&params(json!({}))), None);
    }

    #[test]
    fn test_breaker_name() {
        assert_eq!(ChatApiExecutor::new().breaker_name(), Some("chat-api"));
    }
}
