// File write node executor

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;

use flowpilot_core::node::{FileWriteParams, WriteMode};
use flowpilot_core::{ExecutionContext, Node, NodeResult};

use super::expand_path;
use crate::executor::NodeExecutor;

/// Writes or appends file content, creating parent directories as needed.
pub struct FileWriteExecutor;

#[async_trait]
impl NodeExecutor for FileWriteExecutor {
    async fn execute(&self, node: &Node, _context: &ExecutionContext) -> NodeResult {
        let started_at = Utc::now();

        let params: FileWriteParams = match node.typed_params() {
            Ok(params) => params,
            Err(e) => {
                return NodeResult::error(format!("invalid file-write node: {e}"), Some(started_at))
            }
        };

        if !params.encoding.eq_ignore_ascii_case("utf-8") {
            return NodeResult::error(
                format!("Unsupported encoding '{}': only utf-8 is available", params.encoding),
                Some(started_at),
            );
        }

        let path = expand_path(&params.path);

        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return NodeResult::error(
                    format!("failed to create {}: {e}", parent.display()),
                    Some(started_at),
                );
            }
        }

        let write_result = match params.mode {
            WriteMode::Write => tokio::fs::write(&path, params.content.as_bytes()).await,
            WriteMode::Append => {
                match tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .await
                {
                    Ok(mut file) => file.write_all(params.content.as_bytes()).await,
                    Err(e) => Err(e),
                }
            }
        };

        if let Err(e) = write_result {
            return match e.kind() {
                std::io::ErrorKind::PermissionDenied => NodeResult::error(
                    format!("Permission denied: {}", path.display()),
                    Some(started_at),
                ),
                _ => NodeResult::error(
                    format!("failed to write {}: {e}", path.display()),
                    Some(started_at),
                ),
            };
        }

        let size = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(_) => params.content.len() as u64,
        };

        let mode = match params.mode {
            WriteMode::Write => "write",
            WriteMode::Append => "append",
        };

        NodeResult::success(
            Value::String(path.display().to_string()),
            Some(started_at),
        )
        .with_data_entry("path", json!(path.display().to_string()))
        .with_data_entry("size", json!(size))
        .with_data_entry("mode", json!(mode))
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

    fn write_node(extra: serde_json::Value) -> Node {
        let mut value = json!({"id": "w", "type": "file-write"});
        value
            .as_object_mut()
            .unwrap()
            .extend(extra.as_object().unwrap().clone());
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_write_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("deep/nested/out.txt");

        let result = FileWriteExecutor
            .execute(
                &write_node(json!({"path": target.to_str().unwrap(), "content": "hi"})),
                &context(),
            )
            .await;
        assert!(!result.is_error());
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "hi");
        assert_eq!(result.data["size"], json!(2));
        assert_eq!(result.data["mode"], json!("write"));
    }

    #[tokio::test]
    async fn test_write_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.txt");
        std::fs::write(&target, "old content").unwrap();

        FileWriteExecutor
            .execute(
                &write_node(json!({"path": target.to_str().unwrap(), "content": "new"})),
                &context(),
            )
            .await;
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "new");
    }

    #[tokio::test]
    async fn test_append_mode() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("log.txt");
        std::fs::write(&target, "a").unwrap();

        let result = FileWriteExecutor
            .execute(
                &write_node(json!({
                    "path": target.to_str().unwrap(),
                    "content": "b",
                    "mode": "append",
                })),
                &context(),
            )
            .await;
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "ab");
        assert_eq!(result.data["size"], json!(2));
        assert_eq!(result.data["mode"], json!("append"));
    }
}
