// Workflow YAML parser and validator

use std::path::Path;

use thiserror::Error;

use crate::workflow::Workflow;

/// Error parsing or validating a workflow document.
#[derive(Debug, Error)]
pub enum WorkflowParseError {
    #[error("workflow file not found: {0}")]
    FileNotFound(String),

    #[error("failed to read workflow file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("empty workflow document")]
    Empty,

    #[error("invalid YAML syntax: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("workflow validation failed ({source_name}):\n{}", .errors.join("\n"))]
    Validation {
        source_name: String,
        errors: Vec<String>,
    },
}

impl WorkflowParseError {
    /// Validation messages, if this is a validation failure.
    pub fn validation_errors(&self) -> &[String] {
        match self {
            Self::Validation { errors, .. } => errors,
            _ => &[],
        }
    }
}

/// Parser for workflow YAML documents.
#[derive(Debug, Default, Clone)]
pub struct WorkflowParser;

impl WorkflowParser {
    pub fn new() -> Self {
        Self
    }

    /// Parse a workflow from a YAML file on disk.
    pub fn parse_file(&self, path: impl AsRef<Path>) -> Result<Workflow, WorkflowParseError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(WorkflowParseError::FileNotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path).map_err(|source| WorkflowParseError::Io {
            path: path.display().to_string(),
            source,
        })?;
        self.parse_named(&content, &path.display().to_string())
    }

    /// Parse a workflow from YAML content.
    pub fn parse_str(&self, content: &str) -> Result<Workflow, WorkflowParseError> {
        self.parse_named(content, "<string>")
    }

    fn parse_named(
        &self,
        content: &str,
        source_name: &str,
    ) -> Result<Workflow, WorkflowParseError> {
        if content.trim().is_empty() {
            return Err(WorkflowParseError::Empty);
        }

        let workflow: Workflow = serde_yaml::from_str(content)?;

        let errors = workflow.validate();
        if !errors.is_empty() {
            return Err(WorkflowParseError::Validation {
                source_name: source_name.to_string(),
                errors: errors.into_iter().map(|e| format!("  {e}")).collect(),
            });
        }

        Ok(workflow)
    }

    /// Advisory checks beyond schema validation. Returns warnings, not errors:
    /// potentially unreachable nodes and self-dependencies.
    pub fn lint(&self, workflow: &Workflow) -> Vec<String> {
        let mut warnings = Vec::new();

        let mut referenced: std::collections::HashSet<&str> = std::collections::HashSet::new();
        let mut control_targets: Vec<String> = Vec::new();
        for node in &workflow.nodes {
            referenced.extend(node.depends_on.iter().map(String::as_str));
            control_targets.extend(node.control_targets());
        }
        referenced.extend(control_targets.iter().map(String::as_str));

        let entry = workflow.nodes.first().map(|n| n.id.as_str());
        let mut unreachable: Vec<&str> = workflow
            .nodes
            .iter()
            .map(|n| n.id.as_str())
            .filter(|id| !referenced.contains(id) && Some(*id) != entry)
            .collect();
        unreachable.sort_unstable();
        if !unreachable.is_empty() {
            warnings.push(format!(
                "potentially unreachable nodes (not referenced): {unreachable:?}"
            ));
        }

        for node in &workflow.nodes {
            if node.depends_on.iter().any(|d| d == &node.id) {
                warnings.push(format!("node '{}' depends on itself", node.id));
            }
        }

        warnings
    }
}
