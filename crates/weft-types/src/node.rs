//! Node tree types.
//!
//! Nodes form an arena keyed by stable string id: parent/child and outbound
//! relations are id lists, never references, so a status snapshot can be
//! cloned, diffed, and persisted wholesale.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::workflow::{Inputs, Outputs, RetryPolicy, TemplateRef};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum NodePhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Error,
    /// Input resolved empty or a `when` condition evaluated false.
    Skipped,
    /// Excluded by dependency policy.
    Omitted,
}

impl NodePhase {
    /// Terminal phases: the node is never scheduled again.
    pub fn fulfilled(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Terminal phases that do not fail a parent.
    pub fn successful(self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped | Self::Omitted)
    }

    pub fn failed_or_error(self) -> bool {
        matches!(self, Self::Failed | Self::Error)
    }
}

impl fmt::Display for NodePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Error => "Error",
            Self::Skipped => "Skipped",
            Self::Omitted => "Omitted",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum NodeType {
    Pod,
    Steps,
    StepGroup,
    #[serde(rename = "DAG")]
    Dag,
    TaskGroup,
    Retry,
    /// Placeholder for a step or task that never ran.
    Skipped,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pod => "Pod",
            Self::Steps => "Steps",
            Self::StepGroup => "StepGroup",
            Self::Dag => "DAG",
            Self::TaskGroup => "TaskGroup",
            Self::Retry => "Retry",
            Self::Skipped => "Skipped",
        };
        write!(f, "{s}")
    }
}

/// Why a node carries a deadline; selects the failure message on expiry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeadlineKind {
    /// Template `timeout`.
    Timeout,
    /// Template `activeDeadlineSeconds`.
    ActiveDeadline,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeDeadline {
    pub at: DateTime<Utc>,
    pub kind: DeadlineKind,
}

/// Retry parameters resolved once when the retry node is created.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedRetry {
    /// `None` retries without bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    pub policy: RetryPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_seconds: Option<u64>,
    #[serde(default = "default_factor")]
    pub factor: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_seconds: Option<u64>,
}

fn default_factor() -> u32 {
    1
}

/// One instantiation of a template.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    /// Fully qualified position in the template tree, e.g. `wf[0].step(1)`.
    pub name: String,
    pub display_name: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_ref: Option<TemplateRef>,
    /// Source of the template when it came from a workflow template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_scope: Option<String>,
    #[serde(default)]
    pub phase: NodePhase,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// Id of the enclosing steps/DAG node; parallelism is counted against it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boundary_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outbound_nodes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Inputs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Outputs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<NodeDeadline>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<ResolvedRetry>,
    /// Lock this node is queued on, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waiting_for_lock: Option<String>,
    /// Lock this node holds, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holding_lock: Option<String>,
}

impl Node {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        display_name: impl Into<String>,
        node_type: NodeType,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            display_name: display_name.into(),
            node_type,
            template_name: None,
            template_ref: None,
            template_scope: None,
            phase: NodePhase::Pending,
            message: String::new(),
            boundary_id: None,
            children: Vec::new(),
            outbound_nodes: Vec::new(),
            inputs: None,
            outputs: None,
            started_at: None,
            finished_at: None,
            deadline: None,
            retry: None,
            waiting_for_lock: None,
            holding_lock: None,
        }
    }

    pub fn fulfilled(&self) -> bool {
        self.phase.fulfilled()
    }
}

/// The node arena, keyed by node id.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Nodes(pub BTreeMap<String, Node>);

impl Nodes {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, id: &str) -> Option<&Node> {
        self.0.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Node> {
        self.0.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.contains_key(id)
    }

    pub fn insert(&mut self, node: Node) {
        self.0.insert(node.id.clone(), node);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.0.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.0.values_mut()
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Node> {
        self.0.values().find(|n| n.name == name)
    }

    pub fn find_by_display_name(&self, display_name: &str) -> Option<&Node> {
        self.0.values().find(|n| n.display_name == display_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_classification() {
        assert!(!NodePhase::Pending.fulfilled());
        assert!(!NodePhase::Running.fulfilled());
        assert!(NodePhase::Omitted.fulfilled());
        assert!(NodePhase::Skipped.successful());
        assert!(!NodePhase::Error.successful());
        assert!(NodePhase::Error.failed_or_error());
    }

    #[test]
    fn dag_node_type_serializes_upper_case() {
        let json = serde_json::to_value(NodeType::Dag).unwrap();
        assert_eq!(json, "DAG");
    }

    #[test]
    fn nodes_serialize_as_plain_map() {
        let mut nodes = Nodes::default();
        nodes.insert(Node::new("wf", "wf", "wf", NodeType::Pod));
        let json = serde_json::to_value(&nodes).unwrap();
        assert_eq!(json["wf"]["type"], "Pod");
        assert_eq!(nodes.find_by_display_name("wf").unwrap().id, "wf");
    }
}
