//! Audit events emitted on workflow and node phase transitions.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Annotation carrying the node's fully qualified name.
pub const NODE_NAME_ANNOTATION: &str = "workflows.weft.io/node-name";
/// Annotation carrying the node's type (`Pod`, `DAG`, ...).
pub const NODE_TYPE_ANNOTATION: &str = "workflows.weft.io/node-type";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventReason {
    WorkflowRunning,
    WorkflowNodeSucceeded,
    WorkflowNodeFailed,
    WorkflowSucceeded,
    WorkflowFailed,
}

impl EventReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WorkflowRunning => "WorkflowRunning",
            Self::WorkflowNodeSucceeded => "WorkflowNodeSucceeded",
            Self::WorkflowNodeFailed => "WorkflowNodeFailed",
            Self::WorkflowSucceeded => "WorkflowSucceeded",
            Self::WorkflowFailed => "WorkflowFailed",
        }
    }

    /// Warning-type reasons, as opposed to normal ones.
    pub fn is_warning(self) -> bool {
        matches!(self, Self::WorkflowNodeFailed | Self::WorkflowFailed)
    }
}

impl fmt::Display for EventReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One structured audit event about a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowEvent {
    pub reason: EventReason,
    pub message: String,
    pub namespace: String,
    pub workflow: String,
    pub workflow_uid: Uuid,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}
