//! Time-based garbage collection of completed workflows.

use chrono::{DateTime, Utc};
use weft_types::error::RepositoryError;
use weft_types::workflow::{Workflow, WorkflowKey, WorkflowPhase};

use crate::repository::workflow::WorkflowStore;

/// Seconds to keep a workflow that completed in `phase`.
///
/// Phase-specific settings win over `secondsAfterCompletion`.
pub fn ttl_seconds(wf: &Workflow) -> Option<i64> {
    let strategy = wf.spec.ttl_strategy?;
    match wf.status.phase {
        WorkflowPhase::Succeeded => strategy
            .seconds_after_success
            .or(strategy.seconds_after_completion),
        WorkflowPhase::Failed | WorkflowPhase::Error => strategy
            .seconds_after_failure
            .or(strategy.seconds_after_completion),
        WorkflowPhase::Pending | WorkflowPhase::Running => None,
    }
}

/// When a completed workflow becomes eligible for deletion.
pub fn expires_at(wf: &Workflow) -> Option<DateTime<Utc>> {
    let secs = ttl_seconds(wf)?;
    let finished = wf.status.finished_at?;
    Some(finished + chrono::Duration::seconds(secs.max(0)))
}

pub fn is_expired(wf: &Workflow, now: DateTime<Utc>) -> bool {
    expires_at(wf).is_some_and(|at| at <= now)
}

/// Delete every expired workflow in `store`.
///
/// A workflow that is already gone counts as collected. Returns the keys
/// of workflows removed by this pass.
pub async fn collect_expired<S: WorkflowStore>(
    store: &S,
    now: DateTime<Utc>,
) -> Result<Vec<WorkflowKey>, RepositoryError> {
    let mut collected = Vec::new();
    for wf in store.list().await? {
        if !is_expired(&wf, now) {
            continue;
        }
        let key = wf.key();
        match store.delete(&key).await {
            Ok(_) | Err(RepositoryError::NotFound) => {
                tracing::info!(workflow = %key, "deleted workflow after TTL");
                collected.push(key);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(collected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_types::workflow::{ObjectMeta, TtlStrategy, WorkflowSpec};

    fn completed(phase: WorkflowPhase, ttl: TtlStrategy, finished: DateTime<Utc>) -> Workflow {
        let mut wf = Workflow {
            metadata: ObjectMeta::new("weft", "ttl"),
            spec: WorkflowSpec {
                entrypoint: "main".into(),
                ttl_strategy: Some(ttl),
                ..Default::default()
            },
            status: Default::default(),
        };
        wf.status.phase = phase;
        wf.status.finished_at = Some(finished);
        wf
    }

    #[test]
    fn zero_delay_expires_immediately() {
        let now = Utc::now();
        let ttl = TtlStrategy {
            seconds_after_completion: Some(0),
            ..Default::default()
        };
        let wf = completed(WorkflowPhase::Succeeded, ttl, now);
        assert!(is_expired(&wf, now));
    }

    #[test]
    fn phase_specific_delay_wins() {
        let now = Utc::now();
        let ttl = TtlStrategy {
            seconds_after_completion: Some(0),
            seconds_after_failure: Some(60),
            seconds_after_success: None,
        };
        let failed = completed(WorkflowPhase::Failed, ttl, now);
        assert_eq!(expires_at(&failed), Some(now + chrono::Duration::seconds(60)));
        assert!(!is_expired(&failed, now));

        let succeeded = completed(WorkflowPhase::Succeeded, ttl, now);
        assert!(is_expired(&succeeded, now));
    }

    #[test]
    fn running_workflow_never_expires() {
        let now = Utc::now();
        let ttl = TtlStrategy {
            seconds_after_completion: Some(0),
            ..Default::default()
        };
        let wf = completed(WorkflowPhase::Running, ttl, now);
        assert_eq!(expires_at(&wf), None);
    }
}
