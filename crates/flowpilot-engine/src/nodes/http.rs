// HTTP node executor

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde_json::{json, Map, Value};

use flowpilot_core::node::HttpParams;
use flowpilot_core::{classify_http_status, ErrorCategory, ExecutionContext, Node, NodeResult};

use crate::executor::NodeExecutor;

/// Issues a single HTTP request. Success is `200 <= status < 400`; 4xx/5xx
/// produce error results with the decoded body and status code preserved.
pub struct HttpExecutor {
    client: Client,
}

impl HttpExecutor {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

impl Default for HttpExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeExecutor for HttpExecutor {
    async fn execute(&self, node: &Node, context: &ExecutionContext) -> NodeResult {
        let started_at = Utc::now();

        let params: HttpParams = match node.typed_params() {
            Ok(params) => params,
            Err(e) => return NodeResult::error(format!("invalid http node: {e}"), Some(started_at)),
        };

        let method = match reqwest::Method::from_bytes(params.method.as_str().as_bytes()) {
            Ok(method) => method,
            Err(_) => {
                return NodeResult::error(
                    format!("unsupported HTTP method: {}", params.method.as_str()),
                    Some(started_at),
                )
            }
        };

        let mut request = self
            .client
            .request(method, &params.url)
            .timeout(std::time::Duration::from_secs(params.timeout));

        for (name, value) in &params.headers {
            request = request.header(name, value);
        }

        match &params.body {
            Some(Value::Object(_)) | Some(Value::Array(_)) => {
                request = request.json(params.body.as_ref().unwrap());
            }
            Some(Value::String(raw)) => {
                request = request.body(raw.clone());
            }
            Some(other) => {
                request = request.body(other.to_string());
            }
            None => {}
        }

        let send = request.send();
        let response = tokio::select! {
            result = send => result,
            _ = context.cancellation.cancelled() => {
                return NodeResult::error("Request cancelled", Some(started_at));
            }
        };

        let response = match response {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return NodeResult::error(
                    format!("Request timed out after {}s", params.timeout),
                    Some(started_at),
                )
            }
            Err(e) if e.is_connect() => {
                return NodeResult::error(format!("Connection failed: {e}"), Some(started_at))
            }
            Err(e) => return NodeResult::error(e.to_string(), Some(started_at)),
        };

        let status = response.status().as_u16();
        let reason = response
            .status()
            .canonical_reason()
            .unwrap_or("")
            .to_string();
        let retry_after_header = response
            .headers()
            .get("retry-after")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok());
        let headers: Map<String, Value> = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    Value::String(String::from_utf8_lossy(value.as_bytes()).into_owned()),
                )
            })
            .collect();

        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => {
                return NodeResult::error(format!("failed to read response body: {e}"), Some(started_at))
            }
        };

        let body: Value = serde_json::from_str(&text).unwrap_or_else(|_| json!({"text": text}));

        let mut data = Map::new();
        data.insert("status_code".into(), json!(status));
        data.insert("headers".into(), Value::Object(headers));
        data.insert("body".into(), body);

        if (200..400).contains(&status) {
            NodeResult::success(Value::String(text), Some(started_at)).with_data(data)
        } else {
            let classification = classify_http_status(status, retry_after_header);
            let mut result = NodeResult::error(format!("HTTP {status}: {reason}"), Some(started_at))
                .with_output(Value::String(text))
                .with_data(data)
                .with_data_entry("error_category", json!(classification.category.to_string()));
            // rate limits carry the server's Retry-After (or the 60s default)
            // so the retry wrapper can honor it
            if classification.category == ErrorCategory::Resource {
                if let Some(retry_after) = classification.retry_after {
                    result = result.with_data_entry("retry_after", json!(retry_after));
                }
            }
            result
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use uuid::Uuid;

    fn context() -> ExecutionContext {
        ExecutionContext::new("test", Uuid::new_v4(), Default::default())
    }

    fn http_node(extra: serde_json::Value) -> Node {
        let mut value = json!({"id": "req", "type": "http"});
        value
            .as_object_mut()
            .unwrap()
            .extend(extra.as_object().unwrap().clone());
        serde_json::from_value(value).unwrap()
    }

    /// Tiny fixed-response HTTP server; each connection gets the next canned
    /// response from the list (the last one repeats).
    async fn serve_responses(responses: Vec<String>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let responses = Arc::new(responses);
        tokio::spawn(async move {
            let mut served = 0usize;
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let response = responses[served.min(responses.len() - 1)].clone();
                served += 1;
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let _ = socket.read(&mut buf).await;
                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
        });
        format!("http://{addr}")
    }

    fn ok_json(body: &str) -> String {
        format!(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            body.len(),
            body
        )
    }

    #[tokio::test]
    async fn test_get_json_success() {
        let base = serve_responses(vec![ok_json(r#"{"ok": true}"#)]).await;
        let result = HttpExecutor::new()
            .execute(&http_node(json!({"url": base})), &context())
            .await;
        assert!(!result.is_error());
        assert_eq!(result.data["status_code"], json!(200));
        assert_eq!(result.data["body"], json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_non_json_body_wrapped_as_text() {
        let base = serve_responses(vec![
            "HTTP/1.1 200 OK\r\ncontent-length: 5\r\nconnection: close\r\n\r\nhello".to_string(),
        ])
        .await;
        let result = HttpExecutor::new()
            .execute(&http_node(json!({"url": base})), &context())
            .await;
        assert_eq!(result.data["body"], json!({"text": "hello"}));
    }

    #[tokio::test]
    async fn test_server_error_keeps_body_and_status() {
        let base = serve_responses(vec![
            "HTTP/1.1 503 Service Unavailable\r\ncontent-length: 9\r\nconnection: close\r\n\r\nnot ready"
                .to_string(),
        ])
        .await;
        let result = HttpExecutor::new()
            .execute(&http_node(json!({"url": base})), &context())
            .await;
        assert!(result.is_error());
        assert!(result.error_message.as_deref().unwrap().starts_with("HTTP 503"));
        assert_eq!(result.data["status_code"], json!(503));
        assert_eq!(result.data["body"], json!({"text": "not ready"}));
        assert_eq!(result.data["error_category"], json!("transient"));
        // the 30s classifier hint is not a server-specified override
        assert!(!result.data.contains_key("retry_after"));
    }

    #[tokio::test]
    async fn test_rate_limit_surfaces_retry_after_header() {
        let base = serve_responses(vec![
            "HTTP/1.1 429 Too Many Requests\r\nretry-after: 17\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                .to_string(),
        ])
        .await;
        let result = HttpExecutor::new()
            .execute(&http_node(json!({"url": base})), &context())
            .await;
        assert!(result.is_error());
        assert_eq!(result.data["error_category"], json!("resource"));
        assert_eq!(result.data["retry_after"], json!(17));
    }

    #[tokio::test]
    async fn test_client_error_is_permanent() {
        let base = serve_responses(vec![
            "HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n".to_string(),
        ])
        .await;
        let result = HttpExecutor::new()
            .execute(&http_node(json!({"url": base})), &context())
            .await;
        assert!(result.is_error());
        assert_eq!(result.data["error_category"], json!("permanent"));
    }

    #[tokio::test]
    async fn test_connection_failure() {
        // nothing listens on this port
        let result = HttpExecutor::new()
            .execute(
                &http_node(json!({"url": "http://127.0.0.1:9", "timeout": 2})),
                &context(),
            )
            .await;
        assert!(result.is_error());
    }

    #[tokio::test]
    async fn test_redirect_status_counts_as_success() {
        // reqwest follows redirects by default; an unfollowable 304 stays
        let base = serve_responses(vec![
            "HTTP/1.1 304 Not Modified\r\ncontent-length: 0\r\nconnection: close\r\n\r\n".to_string(),
        ])
        .await;
        let result = HttpExecutor::new()
            .execute(&http_node(json!({"url": base})), &context())
            .await;
        assert!(!result.is_error());
        assert_eq!(result.data["status_code"], json!(304));
    }
}
