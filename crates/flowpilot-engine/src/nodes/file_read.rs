// File read node executor

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use flowpilot_core::node::FileReadParams;
use flowpilot_core::{ExecutionContext, Node, NodeResult};

use super::expand_path;
use crate::executor::NodeExecutor;

/// Reads a whole file as UTF-8, reporting size and line count.
pub struct FileReadExecutor;

#[async_trait]
impl NodeExecutor for FileReadExecutor {
    async fn execute(&self, node: &Node, _context: &ExecutionContext) -> NodeResult {
        let started_at = Utc::now();

        let params: FileReadParams = match node.typed_params() {
            Ok(params) => params,
            Err(e) => {
                return NodeResult::error(format!("invalid file-read node: {e}"), Some(started_at))
            }
        };

        if !params.encoding.eq_ignore_ascii_case("utf-8") {
            return NodeResult::error(
                format!("Unsupported encoding '{}': only utf-8 is available", params.encoding),
                Some(started_at),
            );
        }

        let path = expand_path(&params.path);

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return NodeResult::error(
                    format!("File not found: {}", path.display()),
                    Some(started_at),
                )
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return NodeResult::error(
                    format!("Permission denied: {}", path.display()),
                    Some(started_at),
                )
            }
            Err(e) => return NodeResult::error(e.to_string(), Some(started_at)),
        };

        let size = bytes.len();
        let content = match String::from_utf8(bytes) {
            Ok(content) => content,
            Err(e) => {
                return NodeResult::error(
                    format!("Encoding error ({}): {e}", params.encoding),
                    Some(started_at),
                )
            }
        };

        let lines = content.lines().count();
        NodeResult::success(Value::String(content), Some(started_at))
            .with_data_entry("path", json!(path.display().to_string()))
            .with_data_entry("size", json!(size))
            .with_data_entry("lines", json!(lines))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn context() -> ExecutionContext {
        ExecutionContext::new("test", Uuid::new_v4(), Default::default())
    }

    fn read_node(path: &str) -> Node {
        serde_json::from_value(json!({"id": "r", "type": "file-read", "path": path})).unwrap()
    }

    #[tokio::test]
    async fn test_read_reports_size_and_lines() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("notes.txt");
        std::fs::write(&file, "one\ntwo\nthree\n").unwrap();

        let result = FileReadExecutor
            .execute(&read_node(file.to_str().unwrap()), &context())
            .await;
        assert!(!result.is_error());
        assert_eq!(result.output, json!("one\ntwo\nthree\n"));
        assert_eq!(result.data["size"], json!(14));
        assert_eq!(result.data["lines"], json!(3));
    }

    #[tokio::test]
    async fn test_missing_file() {
        let result = FileReadExecutor
            .execute(&read_node("/no/such/file.txt"), &context())
            .await;
        assert!(result.is_error());
        assert!(result.error_message.unwrap().starts_with("File not found"));
    }

    #[tokio::test]
    async fn test_invalid_utf8() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("blob.bin");
        std::fs::write(&file, [0xff, 0xfe, 0x00]).unwrap();

        let result = FileReadExecutor
            .execute(&read_node(file.to_str().unwrap()), &context())
            .await;
        assert!(result.is_error());
        assert!(result.error_message.unwrap().starts_with("Encoding error"));
    }

    #[tokio::test]
    async fn test_unsupported_encoding() {
        let node: Node = serde_json::from_value(json!({
            "id": "r", "type": "file-read", "path": "/tmp/x", "encoding": "latin-1",
        }))
        .unwrap();
        let result = FileReadExecutor.execute(&node, &context()).await;
        assert!(result.is_error());
        assert!(result.error_message.unwrap().contains("Unsupported encoding"));
    }
}
