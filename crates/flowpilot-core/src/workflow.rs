// Workflow document model and structural validation

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::node::Node;
use crate::trigger::Trigger;

/// Declared input types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    #[default]
    String,
    Number,
    Boolean,
    Array,
    Object,
}

/// Definition for a workflow input parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct InputDefinition {
    #[serde(default, rename = "type")]
    pub input_type: InputType,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Behavior when a node errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    #[default]
    Stop,
    Continue,
    Notify,
}

fn default_workflow_timeout() -> u64 {
    300
}

fn default_retry_delay() -> u64 {
    5
}

/// Workflow execution settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSettings {
    /// Total workflow timeout in seconds
    #[serde(default = "default_workflow_timeout")]
    pub timeout: u64,
    /// Number of retries on node failure (0 = single attempt)
    #[serde(default)]
    pub retry: u32,
    /// Delay between workflow-level retries in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,
    #[serde(default)]
    pub on_error: OnError,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            timeout: default_workflow_timeout(),
            retry: 0,
            retry_delay: default_retry_delay(),
            on_error: OnError::Stop,
        }
    }
}

fn default_version() -> u32 {
    1
}

fn default_triggers() -> Vec<Trigger> {
    vec![Trigger::Manual]
}

/// Complete workflow definition. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// Workflow name (lowercase, alphanumeric, hyphens)
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "default_triggers")]
    pub triggers: Vec<Trigger>,
    /// Declared input parameters (ordering preserved for display)
    #[serde(default)]
    pub inputs: BTreeMap<String, InputDefinition>,
    /// Workflow nodes; the node at index 0 is the implicit entry
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub settings: WorkflowSettings,
}

fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

impl Workflow {
    /// Look up a node by id.
    pub fn get_node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    /// All node ids.
    pub fn node_ids(&self) -> HashSet<&str> {
        self.nodes.iter().map(|n| n.id.as_str()).collect()
    }

    /// Structural validation: identifier shapes, uniqueness, reference
    /// integrity, trigger invariants, and `depends_on` acyclicity.
    /// Returns every violation found.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if !is_valid_identifier(&self.name) {
            errors.push(format!(
                "workflow name '{}' must match [a-z][a-z0-9-]*",
                self.name
            ));
        }

        if self.nodes.is_empty() {
            errors.push("workflow must define at least one node".into());
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for node in &self.nodes {
            if !is_valid_identifier(&node.id) {
                errors.push(format!("node id '{}' must match [a-z][a-z0-9-]*", node.id));
            }
            if !seen.insert(node.id.as_str()) {
                errors.push(format!("duplicate node id '{}'", node.id));
            }
        }

        let ids = self.node_ids();
        for node in &self.nodes {
            for dep in &node.depends_on {
                if !ids.contains(dep.as_str()) {
                    errors.push(format!(
                        "node '{}' depends on unknown node '{}'",
                        node.id, dep
                    ));
                }
            }
            for target in node.control_targets() {
                if !ids.contains(target.as_str()) {
                    errors.push(format!(
                        "{} node '{}' references unknown node '{}'",
                        node.kind, node.id, target
                    ));
                }
            }
        }

        for trigger in &self.triggers {
            errors.extend(trigger.validate());
        }

        if let Some(cycle_node) = self.find_dependency_cycle() {
            errors.push(format!(
                "circular dependency detected involving node '{cycle_node}'"
            ));
        }

        errors
    }

    /// Find a node participating in a `depends_on` cycle, if any.
    /// Control-flow references do not create dependency edges.
    pub fn find_dependency_cycle(&self) -> Option<String> {
        let graph: HashMap<&str, &[String]> = self
            .nodes
            .iter()
            .map(|n| (n.id.as_str(), n.depends_on.as_slice()))
            .collect();

        fn visit<'a>(
            node: &'a str,
            graph: &HashMap<&'a str, &'a [String]>,
            visited: &mut HashSet<&'a str>,
            path: &mut HashSet<&'a str>,
        ) -> Option<String> {
            if path.contains(node) {
                return Some(node.to_string());
            }
            if !visited.insert(node) {
                return None;
            }
            path.insert(node);
            if let Some(deps) = graph.get(node) {
                for dep in deps.iter() {
                    if let Some(hit) = visit(dep, graph, visited, path) {
                        return Some(hit);
                    }
                }
            }
            path.remove(node);
            None
        }

        let mut visited = HashSet::new();
        for node in &self.nodes {
            if let Some(hit) = visit(node.id.as_str(), &graph, &mut visited, &mut HashSet::new()) {
                return Some(hit);
            }
        }
        None
    }

    /// Stable topological order over `depends_on` edges, preserving document
    /// order among ready nodes. Returns the cycle participant on failure.
    pub fn topological_order(&self) -> Result<Vec<String>, String> {
        let mut remaining: Vec<&Node> = self.nodes.iter().collect();
        let mut done: HashSet<&str> = HashSet::new();
        let mut order = Vec::with_capacity(self.nodes.len());

        while !remaining.is_empty() {
            let ready = remaining
                .iter()
                .position(|n| n.depends_on.iter().all(|d| done.contains(d.as_str())));
            match ready {
                Some(idx) => {
                    let node = remaining.remove(idx);
                    done.insert(node.id.as_str());
                    order.push(node.id.clone());
                }
                None => {
                    return Err(remaining[0].id.clone());
                }
            }
        }

        Ok(order)
    }
}
