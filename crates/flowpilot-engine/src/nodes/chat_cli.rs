// Chat CLI node executor
//
// Runs prompts through the installed `chat` binary. The discovered binary
// path is cached across invocations. Children get FLOWPILOT_EXECUTION_ID and
// FLOWPILOT_WORKFLOW in their environment.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use regex::Regex;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::OnceLock;
use tokio::process::Command;

use flowpilot_core::node::{ChatCliParams, CliOutputFormat};
use flowpilot_core::{classify_cli_exit, ExecutionContext, Node, NodeResult};

use super::shell::drain_pipe;
use super::{expand_path, terminate_child};
use crate::executor::NodeExecutor;

const BINARY_NAME: &str = "chat";

fn session_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)Session ID: ([a-zA-Z0-9-]+)").expect("static regex"))
}

pub struct ChatCliExecutor {
    cached_path: Mutex<Option<PathBuf>>,
}

impl ChatCliExecutor {
    pub fn new() -> Self {
        Self {
            cached_path: Mutex::new(None),
        }
    }

    /// Locate the chat binary in PATH or well-known install locations.
    fn find_binary(&self) -> Option<PathBuf> {
        if let Some(path) = self.cached_path.lock().clone() {
            return Some(path);
        }

        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Ok(path_var) = std::env::var("PATH") {
            candidates.extend(
                std::env::split_paths(&path_var).map(|entry| entry.join(BINARY_NAME)),
            );
        }
        candidates.push(PathBuf::from("/usr/local/bin").join(BINARY_NAME));
        candidates.push(expand_path(&format!("~/.{BINARY_NAME}/bin/{BINARY_NAME}")));
        candidates.push(expand_path(&format!("~/bin/{BINARY_NAME}")));
        candidates.push(PathBuf::from("/opt/homebrew/bin").join(BINARY_NAME));

        let found = candidates.into_iter().find(|candidate| candidate.is_file())?;
        *self.cached_path.lock() = Some(found.clone());
        Some(found)
    }

    /// Parse stdout per the requested output format into (output, data).
    fn parse_output(stdout: &str, format: CliOutputFormat) -> (Value, Map<String, Value>) {
        match format {
            CliOutputFormat::Text => (Value::String(stdout.trim().to_string()), Map::new()),
            CliOutputFormat::Json => match serde_json::from_str::<Value>(stdout) {
                Ok(parsed) => {
                    let output = parsed
                        .pointer("/result/text")
                        .and_then(Value::as_str)
                        .map(|text| Value::String(text.to_string()))
                        .unwrap_or_else(|| Value::String(stdout.to_string()));
                    let data = match parsed {
                        Value::Object(map) => map,
                        other => {
                            let mut map = Map::new();
                            map.insert("value".into(), other);
                            map
                        }
                    };
                    (output, data)
                }
                Err(_) => {
                    let mut data = Map::new();
                    data.insert("raw".into(), Value::String(stdout.to_string()));
                    (Value::String(stdout.trim().to_string()), data)
                }
            },
            CliOutputFormat::StreamJson => {
                let mut text_parts: Vec<String> = Vec::new();
                let mut events: Vec<Value> = Vec::new();
                for line in stdout.lines().filter(|line| !line.is_empty()) {
                    match serde_json::from_str::<Value>(line) {
                        Ok(event) => {
                            if event.get("type").and_then(Value::as_str) == Some("text") {
                                if let Some(text) = event.get("text").and_then(Value::as_str) {
                                    text_parts.push(text.to_string());
                                }
                            }
                            events.push(event);
                        }
                        Err(_) => text_parts.push(line.to_string()),
                    }
                }
                let mut data = Map::new();
                data.insert("events".into(), Value::Array(events));
                (Value::String(text_parts.concat()), data)
            }
        }
    }

    fn extract_session_id(stderr: &str) -> Option<String> {
        session_id_pattern()
            .captures(stderr)
            .map(|captures| captures[1].to_string())
    }
}

impl Default for ChatCliExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeExecutor for ChatCliExecutor {
    async fn execute(&self, node: &Node, context: &ExecutionContext) -> NodeResult {
        let started_at = Utc::now();

        let params: ChatCliParams = match node.typed_params() {
            Ok(params) => params,
            Err(e) => {
                return NodeResult::error(format!("invalid chat-cli node: {e}"), Some(started_at))
            }
        };

        let Some(binary) = self.find_binary() else {
            return NodeResult::error(
                "Chat CLI not found in PATH or standard install locations",
                Some(started_at),
            );
        };

        let mut command = Command::new(&binary);
        command.arg("--print").arg(&params.prompt);

        if let Some(model) = &params.model {
            command.arg("--model").arg(model);
        }
        match params.output_format {
            CliOutputFormat::Json => {
                command.arg("--output-format=json");
            }
            CliOutputFormat::StreamJson => {
                command.arg("--output-format=stream-json");
            }
            CliOutputFormat::Text => {}
        }
        if let Some(max_tokens) = params.max_tokens {
            command.arg("--max-tokens").arg(max_tokens.to_string());
        }
        if let Some(system_prompt) = &params.system_prompt {
            command.arg("--system-prompt").arg(system_prompt);
        }
        if params.no_tools {
            command.arg("--no-tools");
        } else if let Some(tools) = &params.allowed_tools {
            command.arg("--allowedTools").arg(tools.join(","));
        }
        if let Some(session_id) = &params.session_id {
            command.arg("--resume").arg(session_id);
        }

        if let Some(dir) = &params.working_dir {
            command.current_dir(expand_path(dir));
        }

        command
            .env("FLOWPILOT_EXECUTION_ID", context.execution_id.to_string())
            .env("FLOWPILOT_WORKFLOW", &context.workflow_name)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return NodeResult::error(
                    format!("Chat CLI not found at {}: {e}", binary.display()),
                    Some(started_at),
                )
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
                        format!("failed to collect chat CLI output: {e}"),
                        Some(started_at),
                    )
                }
            },
            _ = tokio::time::sleep(timeout) => {
                terminate_child(&mut child).await;
                return NodeResult::error(
                    format!("Chat CLI timed out after {}s", params.timeout),
                    Some(started_at),
                );
            }
            _ = context.cancellation.cancelled() => {
                terminate_child(&mut child).await;
                return NodeResult::error("Chat CLI cancelled", Some(started_at));
            }
        };

        let stdout = String::from_utf8_lossy(&stdout_task.await.unwrap_or_default()).into_owned();
        let stderr = String::from_utf8_lossy(&stderr_task.await.unwrap_or_default()).into_owned();
        let exit_code = status.code().unwrap_or(-1);

        let (parsed_output, mut data) = Self::parse_output(&stdout, params.output_format);

        if params.save_session {
            if let Some(session_id) = Self::extract_session_id(&stderr) {
                data.insert("session_id".into(), Value::String(session_id));
            }
        }

        if status.success() {
            NodeResult::success(parsed_output, Some(started_at))
                .with_stdout(stdout)
                .with_stderr(stderr)
                .with_data(data)
        } else {
            let classification = classify_cli_exit(exit_code, &stderr);
            NodeResult::error(
                format!("Chat CLI exited with code {exit_code}"),
                Some(started_at),
            )
            .with_output(parsed_output)
            .with_stdout(stdout)
            .with_stderr(stderr)
            .with_data(data)
            .with_data_entry(
                "error_category",
                Value::String(classification.category.to_string()),
            )
        }
    }

    fn breaker_name(&self) -> Option<&'static str> {
        Some("chat-cli")
    }
}
