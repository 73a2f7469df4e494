// Error taxonomy and classification
//
// Every internal failure carries an ErrorCategory that drives retry and
// circuit-breaker decisions. Classification works over error message text,
// HTTP status codes, and CLI exit codes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of errors for handling decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// Retry: network blips, timeouts
    Transient,
    /// Don't retry: auth, validation, not found
    Permanent,
    /// Retry with backoff: rate limits, quota
    Resource,
    /// Retry once, then fail
    Unknown,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Permanent => write!(f, "permanent"),
            Self::Resource => write!(f, "resource"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

impl std::str::FromStr for ErrorCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transient" => Ok(Self::Transient),
            "permanent" => Ok(Self::Permanent),
            "resource" => Ok(Self::Resource),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown error category '{other}'")),
        }
    }
}

/// Outcome of classifying a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub category: ErrorCategory,
    pub retryable: bool,
    /// Server-suggested delay before the next attempt, in seconds
    pub retry_after: Option<u64>,
}

impl Classification {
    pub const fn new(category: ErrorCategory, retryable: bool, retry_after: Option<u64>) -> Self {
        Self {
            category,
            retryable,
            retry_after,
        }
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Classify a failure from its error message text.
pub fn classify_error_message(message: &str) -> Classification {
    let lower = message.to_lowercase();

    if contains_any(&lower, &["rate limit", "429", "too many requests", "quota"]) {
        return Classification::new(ErrorCategory::Resource, true, Some(60));
    }
    if contains_any(&lower, &["timeout", "timed out", "deadline exceeded"]) {
        return Classification::new(ErrorCategory::Transient, true, Some(5));
    }
    if contains_any(
        &lower,
        &["connection", "network", "dns", "unreachable", "refused"],
    ) {
        return Classification::new(ErrorCategory::Transient, true, Some(5));
    }
    if contains_any(
        &lower,
        &[
            "unauthorized",
            "authentication",
            "forbidden",
            "invalid key",
            "api key",
        ],
    ) {
        return Classification::new(ErrorCategory::Permanent, false, None);
    }
    if contains_any(&lower, &["validation", "invalid", "malformed", "bad request"]) {
        return Classification::new(ErrorCategory::Permanent, false, None);
    }
    if contains_any(&lower, &["not found", "does not exist", "404"]) {
        return Classification::new(ErrorCategory::Permanent, false, None);
    }
    if contains_any(
        &lower,
        &["server error", "internal error", "500", "502", "503", "504"],
    ) {
        return Classification::new(ErrorCategory::Transient, true, Some(30));
    }

    Classification::new(ErrorCategory::Unknown, true, Some(5))
}

/// Classify an HTTP response status, honoring a parsed Retry-After value.
pub fn classify_http_status(status: u16, retry_after: Option<u64>) -> Classification {
    match status {
        429 => Classification::new(ErrorCategory::Resource, true, Some(retry_after.unwrap_or(60))),
        500..=599 => Classification::new(ErrorCategory::Transient, true, Some(30)),
        408 => Classification::new(ErrorCategory::Transient, true, Some(5)),
        400 | 401 | 403 | 404 => Classification::new(ErrorCategory::Permanent, false, None),
        400..=499 => Classification::new(ErrorCategory::Permanent, false, None),
        _ => Classification::new(ErrorCategory::Unknown, true, Some(5)),
    }
}

/// Classify a chat CLI failure from its exit code and stderr.
pub fn classify_cli_exit(exit_code: i32, stderr: &str) -> Classification {
    let lower = stderr.to_lowercase();

    if contains_any(&lower, &["rate limit", "too many requests"]) {
        return Classification::new(ErrorCategory::Resource, true, Some(60));
    }
    if contains_any(&lower, &["unauthorized", "authentication"]) {
        return Classification::new(ErrorCategory::Permanent, false, None);
    }
    if exit_code == 124 || lower.contains("timeout") {
        return Classification::new(ErrorCategory::Transient, true, Some(5));
    }
    if contains_any(&lower, &["connection", "network"]) {
        return Classification::new(ErrorCategory::Transient, true, Some(5));
    }
    if exit_code != 0 {
        return Classification::new(ErrorCategory::Unknown, true, Some(5));
    }

    Classification::new(ErrorCategory::Permanent, false, None)
}

/// Errors surfaced by the core engine primitives.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Template rendering failed (undefined name, bad syntax)
    #[error("template error: {0}")]
    Template(String),

    /// Sandboxed expression rejected or failed to evaluate
    #[error("expression error: {0}")]
    Expression(String),

    /// A named circuit breaker is rejecting calls
    #[error("circuit '{name}' is open, retry after {retry_in}s")]
    CircuitOpen { name: String, retry_in: u64 },

    /// Required workflow input was not provided
    #[error("required input '{0}' not provided")]
    MissingInput(String),

    /// Dependency cycle found at run time
    #[error("circular dependency detected involving node '{0}'")]
    CircularDependency(String),

    /// Catch-all for runner-level failures
    #[error("workflow execution failed: {0}")]
    Execution(String),

    /// Internal error
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
