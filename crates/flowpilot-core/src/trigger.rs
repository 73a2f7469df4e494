// Workflow trigger model

use serde::{Deserialize, Serialize};

/// File events a file-watch trigger can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileEventKind {
    Created,
    Modified,
    Deleted,
}

impl std::fmt::Display for FileEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Modified => write!(f, "modified"),
            Self::Deleted => write!(f, "deleted"),
        }
    }
}

fn default_timezone() -> String {
    "local".to_string()
}

fn default_watch_events() -> Vec<FileEventKind> {
    vec![FileEventKind::Created]
}

/// A declared cause for running a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Trigger {
    /// Run only when explicitly requested
    Manual,

    /// Run on a cron schedule (5 fields, or 6 with a leading seconds field)
    Cron {
        schedule: String,
        #[serde(default = "default_timezone")]
        timezone: String,
    },

    /// Run at a fixed interval like "30s", "5m", "2h", "1d"
    Interval { every: String },

    /// Run when matching file events occur under a path
    FileWatch {
        path: String,
        #[serde(default = "default_watch_events")]
        events: Vec<FileEventKind>,
        #[serde(default)]
        pattern: Option<String>,
    },

    /// Run when an authenticated POST hits the webhook path
    Webhook {
        path: String,
        #[serde(default)]
        secret: Option<String>,
    },
}

impl Trigger {
    /// Tag string matching the wire format.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Cron { .. } => "cron",
            Self::Interval { .. } => "interval",
            Self::FileWatch { .. } => "file-watch",
            Self::Webhook { .. } => "webhook",
        }
    }

    /// Whether this trigger is driven by the cron/interval scheduler.
    pub fn is_schedulable(&self) -> bool {
        matches!(self, Self::Cron { .. } | Self::Interval { .. })
    }

    /// Validate trigger-specific invariants, returning error messages.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        match self {
            Self::Cron { schedule, .. } => {
                let fields = schedule.split_whitespace().count();
                if fields != 5 && fields != 6 {
                    errors.push(format!(
                        "cron expression must have 5 or 6 fields, got {fields}: '{schedule}'"
                    ));
                }
            }
            Self::Interval { every } => {
                if parse_interval_seconds(every).is_none() {
                    errors.push(format!(
                        "invalid interval '{every}': use a format like '30s', '5m', '2h', '1d'"
                    ));
                }
            }
            Self::FileWatch { events, .. } => {
                if events.is_empty() {
                    errors.push("file-watch trigger must subscribe to at least one event".into());
                }
            }
            _ => {}
        }
        errors
    }
}

/// Parse an interval string like "30s" / "5m" / "2h" / "1d" into seconds.
pub fn parse_interval_seconds(every: &str) -> Option<u64> {
    let every = every.trim();
    let unit = every.chars().last()?;
    let value: u64 = every[..every.len() - 1].parse().ok()?;
    let multiplier = match unit {
        's' => 1,
        'm' => 60,
        'h' => 3600,
        'd' => 86400,
        _ => return None,
    };
    Some(value * multiplier)
}

/// Normalize a webhook path so it always starts with a slash.
pub fn normalize_webhook_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_trigger_tags() {
        let trigger: Trigger = serde_json::from_value(json!({"type": "manual"})).unwrap();
        assert_eq!(trigger.kind(), "manual");

        let trigger: Trigger =
            serde_json::from_value(json!({"type": "cron", "schedule": "*/5 * * * *"})).unwrap();
        assert_eq!(trigger.kind(), "cron");
        assert!(trigger.is_schedulable());

        let trigger: Trigger = serde_json::from_value(json!({
            "type": "file-watch",
            "path": "/tmp/in",
        }))
        .unwrap();
        assert_eq!(trigger.kind(), "file-watch");
        assert!(!trigger.is_schedulable());
        match trigger {
            Trigger::FileWatch { events, .. } => assert_eq!(events, vec![FileEventKind::Created]),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_cron_field_count_validation() {
        let five: Trigger =
            serde_json::from_value(json!({"type": "cron", "schedule": "0 9 * * 1-5"})).unwrap();
        assert!(five.validate().is_empty());

        let six: Trigger =
            serde_json::from_value(json!({"type": "cron", "schedule": "30 0 9 * * 1-5"})).unwrap();
        assert!(six.validate().is_empty());

        let bad: Trigger =
            serde_json::from_value(json!({"type": "cron", "schedule": "* * *"})).unwrap();
        assert_eq!(bad.validate().len(), 1);
    }

    #[test]
    fn test_parse_interval_seconds() {
        assert_eq!(parse_interval_seconds("30s"), Some(30));
        assert_eq!(parse_interval_seconds("5m"), Some(300));
        assert_eq!(parse_interval_seconds("2h"), Some(7200));
        assert_eq!(parse_interval_seconds("1d"), Some(86400));
        assert_eq!(parse_interval_seconds("10x"), None);
        assert_eq!(parse_interval_seconds("fast"), None);
    }

    #[test]
    fn test_normalize_webhook_path() {
        assert_eq!(normalize_webhook_path("gh"), "/gh");
        assert_eq!(normalize_webhook_path("/gh"), "/gh");
    }
}
