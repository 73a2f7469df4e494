// Delay node executor

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, Timelike, Utc};
use regex::Regex;
use serde_json::{json, Value};
use std::sync::OnceLock;

use flowpilot_core::node::DelayParams;
use flowpilot_core::{ExecutionContext, Node, NodeResult, TemplateEngine};

use crate::executor::NodeExecutor;

fn duration_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)^(\d+(?:\.\d+)?)\s*(s|sec|second|seconds|m|min|minute|minutes|h|hr|hour|hours|d|day|days)$",
        )
        .expect("static regex")
    })
}

fn time_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(\d{1,2}):(\d{2})(?::(\d{2}))?$").expect("static regex"))
}

/// Parse a duration like "30s", "1.5m", "2 hours" into seconds.
pub fn parse_duration_seconds(duration: &str) -> Result<f64, String> {
    let captures = duration_pattern().captures(duration.trim()).ok_or_else(|| {
        format!("Invalid duration format: '{duration}'. Use formats like '30s', '5m', '2h', '1d'")
    })?;

    let value: f64 = captures[1].parse().map_err(|_| "bad number".to_string())?;
    let multiplier = match captures[2].to_lowercase().chars().next() {
        Some('s') => 1.0,
        Some('m') => 60.0,
        Some('h') => 3600.0,
        Some('d') => 86400.0,
        _ => unreachable!("pattern restricts units"),
    };
    Ok(value * multiplier)
}

/// Seconds until the `until` target. Naive ISO datetimes and bare `HH:MM[:SS]`
/// times are interpreted in UTC; a bare time already past today rolls to
/// tomorrow. Negative results mean the target has passed.
pub fn parse_until_seconds(until: &str, now: DateTime<Utc>) -> Result<f64, String> {
    let resolved = until.trim();

    // ISO datetime, aware or naive
    if let Ok(aware) = DateTime::parse_from_rfc3339(&resolved.replace('Z', "+00:00")) {
        return Ok((aware.with_timezone(&Utc) - now).num_milliseconds() as f64 / 1000.0);
    }
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(resolved, "%Y-%m-%dT%H:%M:%S") {
        let target = naive.and_utc();
        return Ok((target - now).num_milliseconds() as f64 / 1000.0);
    }

    // bare time of day
    if let Some(captures) = time_pattern().captures(resolved) {
        let hour: u32 = captures[1].parse().map_err(|_| "bad hour".to_string())?;
        let minute: u32 = captures[2].parse().map_err(|_| "bad minute".to_string())?;
        let second: u32 = captures
            .get(3)
            .map(|m| m.as_str().parse().unwrap_or(0))
            .unwrap_or(0);

        let time = NaiveTime::from_hms_opt(hour, minute, second)
            .ok_or_else(|| format!("invalid time of day: '{resolved}'"))?;
        let mut target = now.date_naive().and_time(time).and_utc();
        if target <= now.with_nanosecond(0).unwrap_or(now) {
            target += ChronoDuration::days(1);
        }
        return Ok((target - now).num_milliseconds() as f64 / 1000.0);
    }

    Err(format!(
        "Cannot parse 'until' value: '{resolved}'. Use an ISO datetime (e.g. '2024-01-15T10:30:00') or a time (e.g. '14:30')"
    ))
}

/// Cooperative sleep until a duration elapses or a target time arrives.
/// Cancellation yields a skipped result carrying the elapsed seconds.
pub struct DelayExecutor;

#[async_trait]
impl NodeExecutor for DelayExecutor {
    async fn execute(&self, node: &Node, context: &ExecutionContext) -> NodeResult {
        let started_at = Utc::now();

        let params: DelayParams = match node.typed_params() {
            Ok(params) => params,
            Err(e) => return NodeResult::error(format!("invalid delay node: {e}"), Some(started_at)),
        };

        let (seconds, wait_type) = match (&params.duration, &params.until) {
            (Some(duration), None) => match parse_duration_seconds(duration) {
                Ok(seconds) => (seconds, "duration"),
                Err(e) => {
                    return NodeResult::error(
                        format!("Delay configuration error: {e}"),
                        Some(started_at),
                    )
                }
            },
            (None, Some(until)) => {
                let resolved = if TemplateEngine::has_template(until) {
                    let engine = TemplateEngine::new();
                    match engine.render(until, &context.template_context()) {
                        Ok(resolved) => resolved,
                        Err(e) => {
                            return NodeResult::error(
                                format!("Delay configuration error: {e}"),
                                Some(started_at),
                            )
                        }
                    }
                } else {
                    until.clone()
                };
                match parse_until_seconds(&resolved, started_at) {
                    Ok(seconds) => (seconds, "until"),
                    Err(e) => {
                        return NodeResult::error(
                            format!("Delay configuration error: {e}"),
                            Some(started_at),
                        )
                    }
                }
            }
            _ => {
                return NodeResult::error(
                    "Exactly one of 'duration' or 'until' must be specified",
                    Some(started_at),
                )
            }
        };

        if seconds < 0.0 {
            return NodeResult::success(
                Value::String("Target time already passed, no wait needed".into()),
                Some(started_at),
            )
            .with_data_entry("requested_seconds", json!(seconds))
            .with_data_entry("actual_seconds", json!(0.0))
            .with_data_entry("wait_type", json!(wait_type))
            .with_data_entry("skipped", json!(true));
        }

        tracing::debug!(node_id = %node.id, seconds, wait_type, "delay starting");

        let sleep = tokio::time::sleep(std::time::Duration::from_secs_f64(seconds));
        tokio::pin!(sleep);

        let cancelled = tokio::select! {
            _ = &mut sleep => false,
            _ = context.cancellation.cancelled() => true,
        };

        let actual = (Utc::now() - started_at).num_milliseconds() as f64 / 1000.0;

        if cancelled {
            let mut result = NodeResult::skipped("Delay was cancelled");
            result.output = Value::String(format!("Delay cancelled after {actual:.2} seconds"));
            result.started_at = Some(started_at);
            result.finished_at = Some(Utc::now());
            result.duration_ms = (actual * 1000.0) as i64;
            return result
                .with_data_entry("requested_seconds", json!(seconds))
                .with_data_entry("actual_seconds", json!(actual))
                .with_data_entry("wait_type", json!(wait_type))
                .with_data_entry("cancelled", json!(true));
        }

        NodeResult::success(
            Value::String(format!("Waited {actual:.2} seconds")),
            Some(started_at),
        )
        .with_data_entry("requested_seconds", json!(seconds))
        .with_data_entry("actual_seconds", json!(actual))
        .with_data_entry("wait_type", json!(wait_type))
    }
}
