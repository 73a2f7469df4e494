// Per-execution failure aggregation
//
// The reporter collects node error records per execution and renders a
// summary as structured data or Markdown. Reports are keyed by execution id
// and cleared on request.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

/// One recorded node failure.
#[derive(Debug, Clone, Serialize)]
pub struct NodeError {
    pub node_id: String,
    pub error: String,
    pub category: String,
    pub attempts: u32,
    pub continued: bool,
    pub timestamp: DateTime<Utc>,
}

/// Aggregated failure summary for one execution.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub execution_id: Uuid,
    pub workflow_name: String,
    pub total_nodes: usize,
    pub executed_nodes: usize,
    pub failed_nodes: usize,
    pub errors: Vec<NodeError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ErrorReport {
    fn new(execution_id: Uuid, workflow_name: String, total_nodes: usize) -> Self {
        Self {
            execution_id,
            workflow_name,
            total_nodes,
            executed_nodes: 0,
            failed_nodes: 0,
            errors: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.executed_nodes == 0 {
            return 0.0;
        }
        (self.executed_nodes - self.failed_nodes) as f64 / self.executed_nodes as f64
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }

    pub fn to_value(&self) -> Value {
        json!({
            "execution_id": self.execution_id,
            "workflow_name": self.workflow_name,
            "summary": {
                "total_nodes": self.total_nodes,
                "executed_nodes": self.executed_nodes,
                "failed_nodes": self.failed_nodes,
                "success_rate": self.success_rate(),
                "has_errors": self.has_errors(),
            },
            "timing": {
                "started_at": self.started_at,
                "finished_at": self.finished_at,
                "duration_ms": self.duration_ms(),
            },
            "errors": self.errors,
        })
    }

    pub fn to_markdown(&self) -> String {
        let mut lines = vec![
            format!("# Error Report: {}", self.workflow_name),
            String::new(),
            format!("**Execution ID**: `{}`", self.execution_id),
            format!(
                "**Started**: {}",
                self.started_at.format("%Y-%m-%d %H:%M:%S")
            ),
        ];

        if let Some(finished) = self.finished_at {
            lines.push(format!("**Finished**: {}", finished.format("%Y-%m-%d %H:%M:%S")));
            if let Some(ms) = self.duration_ms() {
                lines.push(format!("**Duration**: {ms}ms"));
            }
        }

        lines.extend([
            String::new(),
            "## Summary".into(),
            String::new(),
            "| Metric | Value |".into(),
            "|--------|-------|".into(),
            format!("| Total Nodes | {} |", self.total_nodes),
            format!("| Executed | {} |", self.executed_nodes),
            format!("| Failed | {} |", self.failed_nodes),
            format!("| Success Rate | {:.1}% |", self.success_rate() * 100.0),
            String::new(),
            "## Errors".into(),
            String::new(),
        ]);

        if self.errors.is_empty() {
            lines.push("No errors recorded.".into());
        } else {
            for (i, err) in self.errors.iter().enumerate() {
                lines.push(format!("### {}. {}", i + 1, err.node_id));
                lines.push(String::new());
                lines.push(format!("- **Category**: `{}`", err.category));
                lines.push(format!("- **Attempts**: {}", err.attempts));
                if err.continued {
                    lines.push("- **Continued**: yes".into());
                }
                lines.push(format!("- **Error**: {}", err.error));
                lines.push(String::new());
            }
        }

        lines.join("\n")
    }
}

/// Collects error reports across executions.
#[derive(Debug, Default)]
pub struct ErrorReporter {
    reports: Mutex<HashMap<Uuid, ErrorReport>>,
}

impl ErrorReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_report(
        &self,
        execution_id: Uuid,
        workflow_name: impl Into<String>,
        total_nodes: usize,
    ) {
        self.reports.lock().insert(
            execution_id,
            ErrorReport::new(execution_id, workflow_name.into(), total_nodes),
        );
    }

    /// Record a completed node; failures also need `add_error`.
    pub fn record_execution(&self, execution_id: Uuid, success: bool) {
        if let Some(report) = self.reports.lock().get_mut(&execution_id) {
            report.executed_nodes += 1;
            if !success {
                report.failed_nodes += 1;
            }
        }
    }

    pub fn add_error(
        &self,
        execution_id: Uuid,
        node_id: impl Into<String>,
        error: impl Into<String>,
        category: impl Into<String>,
        attempts: u32,
        continued: bool,
    ) {
        if let Some(report) = self.reports.lock().get_mut(&execution_id) {
            report.errors.push(NodeError {
                node_id: node_id.into(),
                error: error.into(),
                category: category.into(),
                attempts,
                continued,
                timestamp: Utc::now(),
            });
        }
    }

    pub fn finish_report(&self, execution_id: Uuid) -> Option<ErrorReport> {
        let mut reports = self.reports.lock();
        let report = reports.get_mut(&execution_id)?;
        report.finished_at = Some(Utc::now());
        Some(report.clone())
    }

    pub fn get_report(&self, execution_id: Uuid) -> Option<ErrorReport> {
        self.reports.lock().get(&execution_id).cloned()
    }

    pub fn clear_report(&self, execution_id: Uuid) -> bool {
        self.reports.lock().remove(&execution_id).is_some()
    }

    pub fn clear_all(&self) {
        self.reports.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_lifecycle() {
        let reporter = ErrorReporter::new();
        let id = Uuid::new_v4();
        reporter.create_report(id, "nightly-sync", 4);

        reporter.record_execution(id, true);
        reporter.record_execution(id, false);
        reporter.add_error(id, "upload", "connection refused", "transient", 3, false);

        let report = reporter.finish_report(id).unwrap();
        assert_eq!(report.total_nodes, 4);
        assert_eq!(report.executed_nodes, 2);
        assert_eq!(report.failed_nodes, 1);
        assert_eq!(report.success_rate(), 0.5);
        assert!(report.has_errors());
        assert!(report.finished_at.is_some());
    }

    #[test]
    fn test_markdown_rendering() {
        let reporter = ErrorReporter::new();
        let id = Uuid::new_v4();
        reporter.create_report(id, "nightly-sync", 2);
        reporter.record_execution(id, false);
        reporter.add_error(id, "upload", "boom", "unknown", 1, true);

        let md = reporter.finish_report(id).unwrap().to_markdown();
        assert!(md.contains("# Error Report: nightly-sync"));
        assert!(md.contains("### 1. upload"));
        assert!(md.contains("`unknown`"));
        assert!(md.contains("**Continued**: yes"));
    }

    #[test]
    fn test_clear() {
        let reporter = ErrorReporter::new();
        let id = Uuid::new_v4();
        reporter.create_report(id, "x", 0);
        assert!(reporter.clear_report(id));
        assert!(!reporter.clear_report(id));
        assert!(reporter.get_report(id).is_none());
    }

    #[test]
    fn test_empty_report_values() {
        let reporter = ErrorReporter::new();
        let id = Uuid::new_v4();
        reporter.create_report(id, "x", 0);
        let report = reporter.get_report(id).unwrap();
        assert_eq!(report.success_rate(), 0.0);
        assert!(!report.has_errors());
        assert_eq!(report.duration_ms(), None);
        assert!(report.to_markdown().contains("No errors recorded."));
    }
}
