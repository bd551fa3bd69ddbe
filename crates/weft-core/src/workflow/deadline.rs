//! Node and workflow deadlines.
//!
//! Deadlines are computed once, when a node is created, from its resolved
//! template. Enforcement is a pure comparison against the tick's clock;
//! nothing here touches execution units directly.

use chrono::{DateTime, Utc};
use weft_types::duration::parse_duration;
use weft_types::node::{DeadlineKind, NodeDeadline, Nodes};
use weft_types::workflow::{IntOrString, Template, WorkflowSpec, WorkflowStatus};

pub const STEP_DEADLINE_EXCEEDED: &str = "Step exceeded its deadline";
pub const POD_DEADLINE_EXCEEDED: &str =
    "Pod was active on the node longer than the specified deadline";
pub const WORKFLOW_DEADLINE_EXCEEDED: &str = "Workflow exceeded its deadline";

#[derive(Debug, thiserror::Error)]
pub enum DeadlineError {
    #[error("invalid timeout '{value}': {source}")]
    InvalidTimeout {
        value: String,
        source: weft_types::error::DurationError,
    },

    #[error("invalid activeDeadlineSeconds '{0}'")]
    InvalidActiveDeadline(String),
}

pub fn message(kind: DeadlineKind) -> &'static str {
    match kind {
        DeadlineKind::Timeout => STEP_DEADLINE_EXCEEDED,
        DeadlineKind::ActiveDeadline => POD_DEADLINE_EXCEEDED,
    }
}

/// Deadline for a node created at `now` from `template`. When both a
/// timeout and an active deadline are set the earlier one wins.
pub fn node_deadline(
    template: &Template,
    now: DateTime<Utc>,
) -> Result<Option<NodeDeadline>, DeadlineError> {
    let mut candidates = Vec::new();

    if let Some(timeout) = &template.timeout {
        let d = parse_duration(timeout).map_err(|source| DeadlineError::InvalidTimeout {
            value: timeout.clone(),
            source,
        })?;
        let at = now + chrono::Duration::milliseconds(d.as_millis() as i64);
        candidates.push(NodeDeadline {
            at,
            kind: DeadlineKind::Timeout,
        });
    }

    if let Some(ads) = &template.active_deadline_seconds {
        let secs = match ads {
            IntOrString::Int(i) => Some(*i),
            IntOrString::String(s) => s.trim().parse().ok(),
        }
        .filter(|s| *s >= 0)
        .ok_or_else(|| DeadlineError::InvalidActiveDeadline(ads.to_string()))?;
        candidates.push(NodeDeadline {
            at: now + chrono::Duration::seconds(secs),
            kind: DeadlineKind::ActiveDeadline,
        });
    }

    Ok(candidates.into_iter().min_by_key(|d| d.at))
}

/// Non-fulfilled nodes whose deadline has passed, plus the nearest deadline
/// still in the future.
#[derive(Debug, Default, PartialEq)]
pub struct Sweep {
    pub expired: Vec<(String, DeadlineKind)>,
    pub next: Option<DateTime<Utc>>,
}

pub fn sweep(nodes: &Nodes, now: DateTime<Utc>) -> Sweep {
    let mut out = Sweep::default();
    for node in nodes.iter().filter(|n| !n.fulfilled()) {
        let Some(deadline) = node.deadline else {
            continue;
        };
        if deadline.at <= now {
            out.expired.push((node.id.clone(), deadline.kind));
        } else {
            out.next = Some(out.next.map_or(deadline.at, |n: DateTime<Utc>| n.min(deadline.at)));
        }
    }
    out
}

/// Absolute deadline of the whole workflow, if it declares one and started.
pub fn workflow_deadline(spec: &WorkflowSpec, status: &WorkflowStatus) -> Option<DateTime<Utc>> {
    let secs = spec.active_deadline_seconds?;
    let started = status.started_at?;
    Some(started + chrono::Duration::seconds(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_types::node::{Node, NodePhase, NodeType};

    #[test]
    fn timeout_and_active_deadline_pick_the_earliest() {
        let now = Utc::now();
        let template = Template {
            name: "t".into(),
            timeout: Some("5s".into()),
            active_deadline_seconds: Some(IntOrString::String("10".into())),
            ..Default::default()
        };
        let deadline = node_deadline(&template, now).unwrap().unwrap();
        assert_eq!(deadline.kind, DeadlineKind::Timeout);
        assert_eq!(deadline.at, now + chrono::Duration::seconds(5));
    }

    #[test]
    fn invalid_deadlines_are_errors() {
        let now = Utc::now();
        let bad_timeout = Template {
            timeout: Some("soon".into()),
            ..Default::default()
        };
        assert!(matches!(
            node_deadline(&bad_timeout, now),
            Err(DeadlineError::InvalidTimeout { .. })
        ));
        let bad_ads = Template {
            active_deadline_seconds: Some(IntOrString::String("{{inputs.parameters.x}}".into())),
            ..Default::default()
        };
        assert!(node_deadline(&bad_ads, now).is_err());
        assert_eq!(node_deadline(&Template::default(), now).unwrap(), None);
    }

    #[test]
    fn sweep_reports_expired_and_next_deadline() {
        let now = Utc::now();
        let mut nodes = Nodes::default();
        let with_deadline = |id: &str, secs: i64, phase: NodePhase| {
            let mut n = Node::new(id, id, id, NodeType::Pod);
            n.phase = phase;
            n.deadline = Some(NodeDeadline {
                at: now + chrono::Duration::seconds(secs),
                kind: DeadlineKind::ActiveDeadline,
            });
            n
        };
        nodes.insert(with_deadline("expired", -1, NodePhase::Running));
        nodes.insert(with_deadline("done", -1, NodePhase::Succeeded));
        nodes.insert(with_deadline("later", 30, NodePhase::Pending));
        nodes.insert(with_deadline("sooner", 10, NodePhase::Running));

        let sweep = sweep(&nodes, now);
        assert_eq!(
            sweep.expired,
            vec![("expired".to_string(), DeadlineKind::ActiveDeadline)]
        );
        assert_eq!(sweep.next, Some(now + chrono::Duration::seconds(10)));
    }

    #[test]
    fn workflow_deadline_counts_from_start() {
        let started = Utc::now();
        let spec = WorkflowSpec {
            active_deadline_seconds: Some(30),
            ..Default::default()
        };
        let mut status = WorkflowStatus::default();
        assert_eq!(workflow_deadline(&spec, &status), None);
        status.started_at = Some(started);
        assert_eq!(
            workflow_deadline(&spec, &status),
            Some(started + chrono::Duration::seconds(30))
        );
    }
}
