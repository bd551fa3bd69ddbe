//! Node store: identity and tree bookkeeping for one workflow's nodes.
//!
//! Holds no scheduling policy. Every phase change goes through
//! [`NodeStore::mark_phase`], which records terminal transitions in order so
//! the reconciler can emit exactly one event per transition.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use weft_types::node::{Node, NodePhase, NodeType, Nodes};

/// Stable node id for `node_name` within `workflow`.
///
/// The root node carries the workflow name itself; every other node is
/// `<workflow>-<n>` with `n` derived from a SHA-256 of the node name, so the
/// id is the same on every reconciliation and after restarts.
pub fn node_id(workflow: &str, node_name: &str) -> String {
    if node_name == workflow {
        return workflow.to_string();
    }
    let digest = Sha256::digest(node_name.as_bytes());
    let n = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    format!("{workflow}-{n}")
}

/// A phase change into Succeeded, Failed, or Error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub node_id: String,
    pub phase: NodePhase,
}

#[derive(Debug, Default)]
pub struct NodeStore {
    nodes: Nodes,
    transitions: Vec<Transition>,
}

impl NodeStore {
    pub fn new(nodes: Nodes) -> Self {
        Self {
            nodes,
            transitions: Vec::new(),
        }
    }

    pub fn into_parts(self) -> (Nodes, Vec<Transition>) {
        (self.nodes, self.transitions)
    }

    /// Drain the transitions recorded so far, oldest first.
    pub fn take_transitions(&mut self) -> Vec<Transition> {
        std::mem::take(&mut self.transitions)
    }

    pub fn nodes(&self) -> &Nodes {
        &self.nodes
    }

    pub fn get(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains(id)
    }

    pub fn phase(&self, id: &str) -> Option<NodePhase> {
        self.nodes.get(id).map(|n| n.phase)
    }

    pub fn is_fulfilled(&self, id: &str) -> bool {
        self.nodes.get(id).is_some_and(Node::fulfilled)
    }

    /// Insert a new node. Inserting an already-present id is a no-op, which
    /// keeps creation idempotent across ticks.
    pub fn insert(&mut self, mut node: Node, now: DateTime<Utc>) {
        if self.nodes.contains(&node.id) {
            return;
        }
        if node.started_at.is_none() {
            node.started_at = Some(now);
        }
        if node.phase.fulfilled() {
            node.finished_at = Some(now);
            if node.phase.failed_or_error() || node.phase == NodePhase::Succeeded {
                self.transitions.push(Transition {
                    node_id: node.id.clone(),
                    phase: node.phase,
                });
            }
        }
        self.nodes.insert(node);
    }

    /// Append `child` to `parent`'s children if not already present.
    pub fn add_child(&mut self, parent: &str, child: &str) {
        if !self.nodes.contains(child) {
            return;
        }
        if let Some(p) = self.nodes.get_mut(parent) {
            if !p.children.iter().any(|c| c == child) {
                p.children.push(child.to_string());
            }
        }
    }

    /// Set phase and message. Returns true when anything changed.
    pub fn mark_phase(
        &mut self,
        id: &str,
        phase: NodePhase,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> bool {
        let message = message.into();
        let Some(node) = self.nodes.get_mut(id) else {
            return false;
        };
        if node.phase == phase && node.message == message {
            return false;
        }
        let was_fulfilled = node.phase.fulfilled();
        node.phase = phase;
        node.message = message;
        if phase.fulfilled() && !was_fulfilled {
            node.finished_at = Some(now);
            if phase.failed_or_error() || phase == NodePhase::Succeeded {
                self.transitions.push(Transition {
                    node_id: id.to_string(),
                    phase,
                });
            }
            tracing::debug!(node_id = %id, phase = %phase, "node fulfilled");
        }
        true
    }

    pub fn set_message(&mut self, id: &str, message: impl Into<String>) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.message = message.into();
        }
    }

    pub fn set_outbound(&mut self, id: &str, outbound: Vec<String>) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.outbound_nodes = outbound;
        }
    }

    /// Externally visible exit points of `id`.
    ///
    /// Leaves (pods and skip markers) are their own exit point; composite
    /// nodes report the outbound set computed when they completed, falling
    /// back to themselves while it is still empty.
    pub fn outbound_of(&self, id: &str) -> Vec<String> {
        match self.nodes.get(id) {
            None => Vec::new(),
            Some(node) => match node.node_type {
                NodeType::Pod | NodeType::Skipped => vec![id.to_string()],
                _ if node.outbound_nodes.is_empty() => vec![id.to_string()],
                _ => node.outbound_nodes.clone(),
            },
        }
    }

    /// All descendants of `id` through `children`, depth first.
    pub fn descendants(&self, id: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut stack: Vec<String> = self
            .nodes
            .get(id)
            .map(|n| n.children.iter().rev().cloned().collect())
            .unwrap_or_default();
        while let Some(next) = stack.pop() {
            if out.contains(&next) {
                continue;
            }
            if let Some(node) = self.nodes.get(&next) {
                stack.extend(node.children.iter().rev().cloned());
            }
            out.push(next);
        }
        out
    }

    /// Enclosing steps/DAG node ids of `boundary`, innermost first.
    pub fn boundary_chain(&self, boundary: Option<&str>) -> Vec<String> {
        let mut chain = Vec::new();
        let mut current = boundary.map(str::to_string);
        while let Some(id) = current {
            if chain.contains(&id) {
                break;
            }
            current = self.nodes.get(&id).and_then(|n| n.boundary_id.clone());
            chain.push(id);
        }
        chain
    }

    /// Non-terminal pods anywhere in the workflow.
    pub fn active_pods(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.node_type == NodeType::Pod && !n.fulfilled())
            .count()
    }

    /// Non-terminal pods whose boundary chain passes through `boundary`.
    pub fn active_pods_within(&self, boundary: &str) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.node_type == NodeType::Pod && !n.fulfilled())
            .filter(|n| {
                self.boundary_chain(n.boundary_id.as_deref())
                    .iter()
                    .any(|b| b == boundary)
            })
            .count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn ids(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.id.clone()).collect()
    }
}
