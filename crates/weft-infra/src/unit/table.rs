//! Bookkeeping shared by the unit clients: the latest status of every unit,
//! the token that stops it, and the change feed the controller watches.

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use weft_types::unit::{UnitPhase, UnitRequest, UnitStatus};
use weft_types::workflow::WorkflowKey;

const CHANGE_FEED_CAPACITY: usize = 256;

struct TrackedUnit {
    workflow: WorkflowKey,
    status: UnitStatus,
    cancel: CancellationToken,
}

pub(crate) struct UnitTable {
    units: DashMap<String, TrackedUnit>,
    changes: broadcast::Sender<WorkflowKey>,
}

impl UnitTable {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            units: DashMap::new(),
            changes,
        }
    }

    /// Track a new unit as Running. Returns `None` when a unit with this
    /// name already exists.
    pub fn start(&self, request: &UnitRequest) -> Option<CancellationToken> {
        let Entry::Vacant(entry) = self.units.entry(request.name.clone()) else {
            return None;
        };
        let cancel = CancellationToken::new();
        let mut status = UnitStatus::new(&request.name, UnitPhase::Running);
        status.started_at = Some(Utc::now());
        entry.insert(TrackedUnit {
            workflow: request.workflow.clone(),
            status,
            cancel: cancel.clone(),
        });
        self.notify(&request.workflow);
        Some(cancel)
    }

    /// Record a final observation. Ignored for units removed meanwhile.
    pub fn finish(&self, name: &str, mut status: UnitStatus) {
        let workflow = {
            let Some(mut tracked) = self.units.get_mut(name) else {
                return;
            };
            status.name = name.to_string();
            status.started_at = tracked.status.started_at;
            status.finished_at.get_or_insert_with(Utc::now);
            tracked.status = status;
            tracked.workflow.clone()
        };
        self.notify(&workflow);
    }

    /// Report a unit as admission-blocked.
    pub fn hold(&self, name: &str, reason: &str) {
        self.set_phase(name, UnitPhase::Pending, Some(reason.to_string()));
    }

    /// Admit a held unit.
    pub fn release(&self, name: &str) {
        self.set_phase(name, UnitPhase::Running, None);
    }

    fn set_phase(&self, name: &str, phase: UnitPhase, message: Option<String>) {
        let workflow = {
            let Some(mut tracked) = self.units.get_mut(name) else {
                return;
            };
            tracked.status.phase = phase;
            tracked.status.message = message;
            tracked.workflow.clone()
        };
        self.notify(&workflow);
    }

    pub fn terminate(&self, name: &str) {
        if let Some(tracked) = self.units.get(name) {
            tracked.cancel.cancel();
        }
    }

    pub fn list(&self, workflow: &WorkflowKey) -> Vec<UnitStatus> {
        self.units
            .iter()
            .filter(|entry| &entry.workflow == workflow)
            .map(|entry| entry.status.clone())
            .collect()
    }

    pub fn remove_workflow(&self, workflow: &WorkflowKey) {
        self.units.retain(|_, tracked| {
            if &tracked.workflow != workflow {
                return true;
            }
            tracked.cancel.cancel();
            false
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowKey> {
        self.changes.subscribe()
    }

    fn notify(&self, workflow: &WorkflowKey) {
        // No receivers just means nobody is watching yet.
        let _ = self.changes.send(workflow.clone());
    }
}

/// Final status for a unit stopped through its cancellation token.
pub(crate) fn terminated() -> UnitStatus {
    UnitStatus {
        phase: UnitPhase::Failed,
        message: Some("terminated".to_string()),
        ..Default::default()
    }
}
