//! Scripted execution units.
//!
//! Every created unit runs for a configurable time and then reports the
//! outcome its script chose. Scripts are matched against the node name
//! (`<workflow>.<step>...`) by suffix, the first match wins, and units with no
//! match succeed immediately. A held unit reports Pending first, the way an
//! admission-blocked executor would.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::broadcast;
use weft_core::unit::UnitClient;
use weft_types::error::UnitError;
use weft_types::unit::{UnitPhase, UnitRequest, UnitStatus};
use weft_types::workflow::WorkflowKey;

use super::table::{UnitTable, terminated};

/// What a scripted unit does.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Exit 0 after `after`, reporting `result` and output parameters.
    Succeed {
        after: Duration,
        result: Option<String>,
        parameters: BTreeMap<String, String>,
    },
    /// Exit with `code` after `after`.
    Fail { after: Duration, code: i32 },
    /// Report an executor error after `after`.
    Error { after: Duration, message: String },
    /// Stay Pending with `reason` for `held`, then behave as `then`.
    Pending {
        held: Duration,
        reason: String,
        then: Box<Outcome>,
    },
    /// Keep running until terminated.
    Hang,
    /// Refuse creation.
    Reject(String),
}

impl Outcome {
    pub fn succeed() -> Self {
        Self::Succeed {
            after: Duration::ZERO,
            result: None,
            parameters: BTreeMap::new(),
        }
    }

    pub fn print(result: impl Into<String>) -> Self {
        Self::Succeed {
            after: Duration::ZERO,
            result: Some(result.into()),
            parameters: BTreeMap::new(),
        }
    }

    pub fn fail(code: i32) -> Self {
        Self::Fail {
            after: Duration::ZERO,
            code,
        }
    }

    /// Keep the unit admission-blocked for `held` before it starts.
    pub fn held_for(self, held: Duration, reason: impl Into<String>) -> Self {
        Self::Pending {
            held,
            reason: reason.into(),
            then: Box::new(self),
        }
    }

    /// Delay the final report by `delay`.
    pub fn after(self, delay: Duration) -> Self {
        match self {
            Self::Succeed {
                result, parameters, ..
            } => Self::Succeed {
                after: delay,
                result,
                parameters,
            },
            Self::Fail { code, .. } => Self::Fail { after: delay, code },
            Self::Error { message, .. } => Self::Error {
                after: delay,
                message,
            },
            other => other,
        }
    }

    fn delay(&self) -> Option<Duration> {
        match self {
            Self::Succeed { after, .. } | Self::Fail { after, .. } | Self::Error { after, .. } => {
                Some(*after)
            }
            Self::Pending { .. } | Self::Hang | Self::Reject(_) => None,
        }
    }

    fn status(&self) -> Option<UnitStatus> {
        let status = match self {
            Self::Succeed {
                result, parameters, ..
            } => UnitStatus {
                phase: UnitPhase::Succeeded,
                exit_code: Some(0),
                result: result.clone(),
                parameters: parameters.clone(),
                ..Default::default()
            },
            Self::Fail { code, .. } => UnitStatus {
                phase: UnitPhase::Failed,
                exit_code: Some(*code),
                ..Default::default()
            },
            Self::Error { message, .. } => UnitStatus {
                phase: UnitPhase::Error,
                message: Some(message.clone()),
                ..Default::default()
            },
            Self::Pending { .. } | Self::Hang | Self::Reject(_) => return None,
        };
        Some(status)
    }
}

#[derive(Clone)]
pub struct SimulatedUnitClient {
    table: Arc<UnitTable>,
    script: Arc<RwLock<Vec<(String, Outcome)>>>,
    created: Arc<RwLock<Vec<String>>>,
}

impl SimulatedUnitClient {
    pub fn new() -> Self {
        Self {
            table: Arc::new(UnitTable::new()),
            script: Arc::new(RwLock::new(Vec::new())),
            created: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Units whose node name ends with `suffix` behave as `outcome`.
    pub fn script(&self, suffix: impl Into<String>, outcome: Outcome) -> &Self {
        if let Ok(mut script) = self.script.write() {
            script.push((suffix.into(), outcome));
        }
        self
    }

    /// Names of every unit created so far, in creation order.
    pub fn created(&self) -> Vec<String> {
        self.created.read().map(|c| c.clone()).unwrap_or_default()
    }

    fn outcome_for(&self, node_name: &str) -> Outcome {
        self.script
            .read()
            .ok()
            .and_then(|script| {
                script
                    .iter()
                    .find(|(suffix, _)| node_name.ends_with(suffix.as_str()))
                    .map(|(_, outcome)| outcome.clone())
            })
            .unwrap_or_else(Outcome::succeed)
    }
}

impl Default for SimulatedUnitClient {
    fn default() -> Self {
        Self::new()
    }
}

impl UnitClient for SimulatedUnitClient {
    async fn create(&self, request: &UnitRequest) -> Result<(), UnitError> {
        let outcome = self.outcome_for(&request.node_name);
        if let Outcome::Reject(reason) = &outcome {
            return Err(UnitError::Rejected {
                name: request.name.clone(),
                reason: reason.clone(),
            });
        }
        let Some(cancel) = self.table.start(request) else {
            return Ok(());
        };
        if let Ok(mut created) = self.created.write() {
            created.push(request.name.clone());
        }

        if let Outcome::Pending { reason, .. } = &outcome {
            self.table.hold(&request.name, reason);
        }

        let table = Arc::clone(&self.table);
        let name = request.name.clone();
        tokio::spawn(async move {
            let mut next = outcome;
            let outcome = loop {
                match next {
                    Outcome::Pending { held, reason, then } => {
                        table.hold(&name, &reason);
                        tokio::select! {
                            _ = tokio::time::sleep(held) => table.release(&name),
                            _ = cancel.cancelled() => {
                                table.finish(&name, terminated());
                                return;
                            }
                        }
                        next = *then;
                    }
                    other => break other,
                }
            };
            let finished = match outcome.delay() {
                Some(delay) => tokio::select! {
                    _ = tokio::time::sleep(delay) => outcome.status(),
                    _ = cancel.cancelled() => Some(terminated()),
                },
                None => {
                    cancel.cancelled().await;
                    Some(terminated())
                }
            };
            if let Some(status) = finished {
                table.finish(&name, status);
            }
        });
        Ok(())
    }

    async fn terminate(&self, name: &str) -> Result<(), UnitError> {
        self.table.terminate(name);
        Ok(())
    }

    async fn list(&self, workflow: &WorkflowKey) -> Result<Vec<UnitStatus>, UnitError> {
        Ok(self.table.list(workflow))
    }

    async fn remove_workflow(&self, workflow: &WorkflowKey) -> Result<(), UnitError> {
        self.table.remove_workflow(workflow);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<WorkflowKey> {
        self.table.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_types::workflow::Container;

    fn request(name: &str) -> UnitRequest {
        UnitRequest {
            name: format!("sim-{name}"),
            workflow: WorkflowKey::new("weft", "sim"),
            node_name: format!("sim.{name}"),
            container: Container::default(),
            input_artifacts: Vec::new(),
            output_artifacts: Vec::new(),
            output_parameters: Vec::new(),
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn phase_of(statuses: &[UnitStatus], name: &str) -> UnitPhase {
        statuses.iter().find(|s| s.name == name).unwrap().phase
    }

    #[tokio::test(start_paused = true)]
    async fn scripted_outcomes_are_reported_after_their_delay() {
        let client = SimulatedUnitClient::new();
        client
            .script("slow", Outcome::fail(2).after(Duration::from_secs(5)))
            .script("fast", Outcome::print("done"));

        client.create(&request("slow")).await.unwrap();
        client.create(&request("fast")).await.unwrap();
        settle().await;

        let key = WorkflowKey::new("weft", "sim");
        let units = client.list(&key).await.unwrap();
        assert_eq!(phase_of(&units, "sim-slow"), UnitPhase::Running);
        assert_eq!(phase_of(&units, "sim-fast"), UnitPhase::Succeeded);

        tokio::time::advance(Duration::from_secs(6)).await;
        settle().await;
        let units = client.list(&key).await.unwrap();
        let slow = units.iter().find(|s| s.name == "sim-slow").unwrap();
        assert_eq!(slow.phase, UnitPhase::Failed);
        assert_eq!(slow.exit_code, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn held_unit_stays_pending_until_admitted() {
        let client = SimulatedUnitClient::new();
        client.script(
            "queued",
            Outcome::print("ok").held_for(Duration::from_secs(30), "exceeded quota"),
        );
        client.create(&request("queued")).await.unwrap();
        settle().await;

        let key = WorkflowKey::new("weft", "sim");
        let units = client.list(&key).await.unwrap();
        assert_eq!(units[0].phase, UnitPhase::Pending);
        assert_eq!(units[0].message.as_deref(), Some("exceeded quota"));

        tokio::time::advance(Duration::from_secs(31)).await;
        settle().await;
        let units = client.list(&key).await.unwrap();
        assert_eq!(units[0].phase, UnitPhase::Succeeded);
        assert_eq!(units[0].result.as_deref(), Some("ok"));
        assert_eq!(units[0].message, None);
    }

    #[tokio::test]
    async fn creation_is_idempotent_by_name() {
        let client = SimulatedUnitClient::new();
        client.script("a", Outcome::Hang);
        client.create(&request("a")).await.unwrap();
        client.create(&request("a")).await.unwrap();
        assert_eq!(client.created(), vec!["sim-a"]);
    }

    #[tokio::test]
    async fn rejected_creation_is_an_error() {
        let client = SimulatedUnitClient::new();
        client.script("a", Outcome::Reject("pvc create error".into()));
        let err = client.create(&request("a")).await.unwrap_err();
        assert!(matches!(err, UnitError::Rejected { reason, .. } if reason == "pvc create error"));
        assert!(client.created().is_empty());
    }

    #[tokio::test]
    async fn hanging_unit_stops_on_terminate() {
        let client = SimulatedUnitClient::new();
        client.script("a", Outcome::Hang);
        client.create(&request("a")).await.unwrap();

        client.terminate("sim-a").await.unwrap();
        settle().await;
        let units = client.list(&WorkflowKey::new("weft", "sim")).await.unwrap();
        assert_eq!(units[0].phase, UnitPhase::Failed);
        assert_eq!(units[0].message.as_deref(), Some("terminated"));
    }

    #[tokio::test]
    async fn remove_workflow_forgets_units() {
        let client = SimulatedUnitClient::new();
        client.script("a", Outcome::Hang);
        client.create(&request("a")).await.unwrap();

        let key = WorkflowKey::new("weft", "sim");
        client.remove_workflow(&key).await.unwrap();
        assert!(client.list(&key).await.unwrap().is_empty());
    }
}
