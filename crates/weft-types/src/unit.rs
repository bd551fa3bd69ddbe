//! Execution-unit requests and observations.
//!
//! An execution unit runs one Pod node. Its name is the node id, which makes
//! creation idempotent: asking twice for the same unit is harmless.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::workflow::{Artifact, Container, Parameter, WorkflowKey};

/// Desired execution unit, fully resolved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UnitRequest {
    pub name: String,
    pub workflow: WorkflowKey,
    pub node_name: String,
    pub container: Container,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_artifacts: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_artifacts: Vec<Artifact>,
    /// Output parameters the executor must collect.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_parameters: Vec<Parameter>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum UnitPhase {
    /// Created but not yet running, e.g. blocked on capacity.
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Error,
}

/// Latest observation of one execution unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UnitStatus {
    pub name: String,
    pub phase: UnitPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Scheduler or executor message (quota waits, `pvc create error ...`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Output parameter values collected by the executor.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl UnitStatus {
    pub fn new(name: impl Into<String>, phase: UnitPhase) -> Self {
        Self {
            name: name.into(),
            phase,
            ..Default::default()
        }
    }
}

/// All units observed for one workflow, keyed by unit name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnitSnapshot {
    pub units: BTreeMap<String, UnitStatus>,
}

impl UnitSnapshot {
    pub fn get(&self, name: &str) -> Option<&UnitStatus> {
        self.units.get(name)
    }

    pub fn insert(&mut self, status: UnitStatus) {
        self.units.insert(status.name.clone(), status);
    }
}

impl FromIterator<UnitStatus> for UnitSnapshot {
    fn from_iter<I: IntoIterator<Item = UnitStatus>>(iter: I) -> Self {
        let mut snapshot = Self::default();
        for status in iter {
            snapshot.insert(status);
        }
        snapshot
    }
}
