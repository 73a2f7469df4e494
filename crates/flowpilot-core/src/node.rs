// Workflow node model
//
// A node is a `type`-tagged unit of work. The tag and the common fields
// (`id`, `depends_on`, `retry`) are typed; everything else stays in a raw
// parameter map so documents with unknown node types parse cleanly and only
// fail when they are dispatched (forward-compatible documents).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::retry::RetryConfig;

/// Node types with built-in executors.
pub const BUILTIN_NODE_TYPES: &[&str] = &[
    "shell",
    "http",
    "file-read",
    "file-write",
    "condition",
    "loop",
    "delay",
    "parallel",
    "chat-cli",
    "chat-api",
];

/// A single unit of work in a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    /// Unique node identifier (lowercase, alphanumeric, hyphens)
    pub id: String,

    /// Node type tag, dispatched through the executor registry
    #[serde(rename = "type")]
    pub kind: String,

    /// Node IDs this node depends on
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    /// Per-node retry policy overriding the workflow default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,

    /// Kind-specific parameters, templated before dispatch
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl Node {
    /// Deserialize the kind-specific parameters into a typed struct.
    pub fn typed_params<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.params.clone()))
    }

    /// Node-declared timeout in seconds, if present and numeric.
    pub fn declared_timeout(&self) -> Option<u64> {
        self.params.get("timeout").and_then(Value::as_u64)
    }

    /// Node ids referenced by control flow (condition branches, loop body,
    /// parallel members). These are execution targets, not dependencies.
    pub fn control_targets(&self) -> Vec<String> {
        let mut targets = Vec::new();
        match self.kind.as_str() {
            "condition" => {
                if let Some(then) = self.params.get("then").and_then(Value::as_str) {
                    targets.push(then.to_string());
                }
                if let Some(other) = self.params.get("else").and_then(Value::as_str) {
                    targets.push(other.to_string());
                }
            }
            "loop" => {
                if let Some(val) = self.params.get("do") {
                    targets.extend(string_or_list(val));
                }
            }
            "parallel" => {
                if let Some(val) = self.params.get("nodes") {
                    targets.extend(string_or_list(val));
                }
            }
            _ => {}
        }
        targets
    }
}

fn string_or_list(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

/// Accepts either a single node id or a list of ids.
fn deserialize_id_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(id) => vec![id],
        OneOrMany::Many(ids) => ids,
    })
}

// ---------------------------------------------------------------------------
// Typed parameter structs, deserialized from the rendered parameter map by
// the executor that owns each kind.
// ---------------------------------------------------------------------------

fn default_shell_timeout() -> u64 {
    60
}

/// `shell` node: run a command under the platform shell.
#[derive(Debug, Clone, Deserialize)]
pub struct ShellParams {
    pub command: String,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: std::collections::HashMap<String, String>,
    #[serde(default = "default_shell_timeout")]
    pub timeout: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpMethod {
    #[serde(rename = "GET")]
    Get,
    #[serde(rename = "POST")]
    Post,
    #[serde(rename = "PUT")]
    Put,
    #[serde(rename = "DELETE")]
    Delete,
    #[serde(rename = "PATCH")]
    Patch,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Patch => "PATCH",
        }
    }
}

fn default_http_method() -> HttpMethod {
    HttpMethod::Get
}

fn default_http_timeout() -> u64 {
    30
}

/// `http` node: issue a single HTTP request.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpParams {
    pub url: String,
    #[serde(default = "default_http_method")]
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: std::collections::HashMap<String, String>,
    /// String body is sent raw; a mapping is sent as JSON
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default = "default_http_timeout")]
    pub timeout: u64,
}

fn default_encoding() -> String {
    "utf-8".to_string()
}

/// `file-read` node.
#[derive(Debug, Clone, Deserialize)]
pub struct FileReadParams {
    pub path: String,
    #[serde(default = "default_encoding")]
    pub encoding: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    Write,
    Append,
}

fn default_write_mode() -> WriteMode {
    WriteMode::Write
}

/// `file-write` node.
#[derive(Debug, Clone, Deserialize)]
pub struct FileWriteParams {
    pub path: String,
    pub content: String,
    #[serde(default = "default_write_mode")]
    pub mode: WriteMode,
    #[serde(default = "default_encoding")]
    pub encoding: String,
}

/// `condition` node: branch on a sandboxed boolean expression.
#[derive(Debug, Clone, Deserialize)]
pub struct ConditionParams {
    #[serde(rename = "if")]
    pub condition: String,
    pub then: String,
    #[serde(default, rename = "else")]
    pub otherwise: Option<String>,
}

fn default_as_var() -> String {
    "item".to_string()
}

fn default_index_var() -> String {
    "index".to_string()
}

/// `loop` node: iterate a sequence, executing the `do` nodes per item.
#[derive(Debug, Clone, Deserialize)]
pub struct LoopParams {
    #[serde(alias = "for")]
    pub for_each: String,
    #[serde(default = "default_as_var", alias = "as")]
    pub as_var: String,
    #[serde(default = "default_index_var")]
    pub index_var: String,
    #[serde(rename = "do", deserialize_with = "deserialize_id_list")]
    pub body: Vec<String>,
    #[serde(default)]
    pub max_iterations: Option<usize>,
    #[serde(default)]
    pub break_if: Option<String>,
}

/// `delay` node: wait for a duration or until a point in time.
#[derive(Debug, Clone, Deserialize)]
pub struct DelayParams {
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub until: Option<String>,
}

fn default_fail_fast() -> bool {
    true
}

/// `parallel` node: run member nodes concurrently.
#[derive(Debug, Clone, Deserialize)]
pub struct ParallelParams {
    pub nodes: Vec<String>,
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    #[serde(default = "default_fail_fast")]
    pub fail_fast: bool,
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CliOutputFormat {
    #[default]
    #[serde(rename = "text")]
    Text,
    #[serde(rename = "json")]
    Json,
    #[serde(rename = "stream-json")]
    StreamJson,
}

fn default_cli_timeout() -> u64 {
    300
}

/// `chat-cli` node: run a prompt through the installed chat binary.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCliParams {
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub output_format: CliOutputFormat,
    #[serde(default)]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default)]
    pub no_tools: bool,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub save_session: bool,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default = "default_cli_timeout")]
    pub timeout: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ApiOutputFormat {
    #[default]
    Text,
    Json,
}

fn default_api_model() -> String {
    "sonnet-4".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_api_timeout() -> u64 {
    120
}

/// `chat-api` node: call the chat completion service directly.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatApiParams {
    pub prompt: String,
    #[serde(default = "default_api_model")]
    pub model: String,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub top_k: Option<u32>,
    #[serde(default)]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(default)]
    pub output_format: ApiOutputFormat,
    #[serde(default)]
    pub json_schema: Option<Value>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
    #[serde(default = "default_api_timeout")]
    pub timeout: u64,
}
