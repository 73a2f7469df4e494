// Shell node executor

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::task::JoinHandle;

use flowpilot_core::node::ShellParams;
use flowpilot_core::{ExecutionContext, Node, NodeResult};

use super::{expand_path, terminate_child};
use crate::executor::NodeExecutor;

/// Drain a captured pipe to completion off to the side so the child never
/// blocks on a full pipe while we wait on its exit status.
pub(crate) fn drain_pipe<R>(pipe: Option<R>) -> JoinHandle<Vec<u8>>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    })
}

/// Runs commands under the platform shell, capturing stdout/stderr as UTF-8
/// with replacement on invalid bytes.
pub struct ShellExecutor;

impl ShellExecutor {
    pub fn new() -> Self {
        Self
    }

    fn shell_command(command: &str) -> Command {
        #[cfg(windows)]
        {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(command);
            cmd
        }
        #[cfg(not(windows))]
        {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(command);
            cmd
        }
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeExecutor for ShellExecutor {
    async fn execute(&self, node: &Node, context: &ExecutionContext) -> NodeResult {
        let started_at = Utc::now();

        let params: ShellParams = match node.typed_params() {
            Ok(params) => params,
            Err(e) => return NodeResult::error(format!("invalid shell node: {e}"), Some(started_at)),
        };

        let mut command = Self::shell_command(&params.command);
        command
            .envs(std::env::vars())
            .envs(&params.env)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &params.working_dir {
            let dir = expand_path(dir);
            if !dir.is_dir() {
                return NodeResult::error(
                    format!("Working directory not found: {}", dir.display()),
                    Some(started_at),
                );
            }
            command.current_dir(dir);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return NodeResult::error(format!("failed to spawn shell: {e}"), Some(started_at))
            }
        };
        let stdout_task = drain_pipe(child.stdout.take());
        let stderr_task = drain_pipe(child.stderr.take());

        let timeout = std::time::Duration::from_secs(params.timeout);
        let status = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => status,
                Err(e) => {
                    return NodeResult::error(
                        format!("failed to collect command output: {e}"),
                        Some(started_at),
                    )
                }
            },
            _ = tokio::time::sleep(timeout) => {
                terminate_child(&mut child).await;
                return NodeResult::error(
                    format!("Command timed out after {}s", params.timeout),
                    Some(started_at),
                );
            }
            _ = context.cancellation.cancelled() => {
                terminate_child(&mut child).await;
                return NodeResult::error("Command cancelled", Some(started_at));
            }
        };

        let stdout = String::from_utf8_lossy(&stdout_task.await.unwrap_or_default()).into_owned();
        let stderr = String::from_utf8_lossy(&stderr_task.await.unwrap_or_default()).into_owned();
        let exit_code = status.code().unwrap_or(-1);

        if status.success() {
            NodeResult::success(Value::String(stdout.trim().to_string()), Some(started_at))
                .with_stdout(stdout)
                .with_stderr(stderr)
                .with_data_entry("exit_code", json!(exit_code))
        } else {
            NodeResult::error(
                format!("Command exited with code {exit_code}"),
                Some(started_at),
            )
            .with_output(Value::String(stdout.trim().to_string()))
            .with_stdout(stdout)
            .with_stderr(stderr)
            .with_data_entry("exit_code", json!(exit_code))
        }
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

    fn shell_node(extra: serde_json::Value) -> Node {
        let mut value = json!({"id": "sh", "type": "shell"});
        value
            .as_object_mut()
            .unwrap()
            .extend(extra.as_object().unwrap().clone());
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_successful_command() {
        let result = ShellExecutor::new()
            .execute(&shell_node(json!({"command": "echo hello"})), &context())
            .await;
        assert!(!result.is_error());
        assert_eq!(result.output, json!("hello"));
        assert_eq!(result.data["exit_code"], json!(0));
        assert_eq!(result.stdout, "hello\n");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_error() {
        let result = ShellExecutor::new()
            .execute(
                &shell_node(json!({"command": "echo oops >&2; exit 3"})),
                &context(),
            )
            .await;
        assert!(result.is_error());
        assert_eq!(
            result.error_message.as_deref(),
            Some("Command exited with code 3")
        );
        assert_eq!(result.data["exit_code"], json!(3));
        assert!(result.stderr.contains("oops"));
    }

    #[tokio::test]
    async fn test_node_env_overlays_process_env() {
        let result = ShellExecutor::new()
            .execute(
                &shell_node(json!({
                    "command": "echo $FLOWPILOT_GREETING",
                    "env": {"FLOWPILOT_GREETING": "salut"},
                })),
                &context(),
            )
            .await;
        assert_eq!(result.output, json!("salut"));
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let started = std::time::Instant::now();
        let result = ShellExecutor::new()
            .execute(
                &shell_node(json!({"command": "sleep 30", "timeout": 1})),
                &context(),
            )
            .await;
        assert!(result.is_error());
        assert!(result.error_message.unwrap().contains("timed out after 1s"));
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_timeout_terminates_gracefully_first() {
        // the child dies on the graceful terminate alone, so teardown never
        // has to wait out the full kill grace
        let started = std::time::Instant::now();
        let result = ShellExecutor::new()
            .execute(
                &shell_node(json!({
                    "command": "exec sleep 30",
                    "timeout": 1,
                })),
                &context(),
            )
            .await;
        assert!(result.is_error());
        assert!(result.error_message.unwrap().contains("timed out"));
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_missing_working_dir() {
        let result = ShellExecutor::new()
            .execute(
                &shell_node(json!({
                    "command": "true",
                    "working_dir": "/definitely/not/here",
                })),
                &context(),
            )
            .await;
        assert!(result.is_error());
        assert!(result
            .error_message
            .unwrap()
            .contains("Working directory not found"));
    }
}
