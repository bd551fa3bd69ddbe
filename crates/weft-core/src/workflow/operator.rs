//! One reconciliation pass over a workflow.
//!
//! [`Reconciler::reconcile`] is a function of the stored workflow, the
//! execution units observed for it, and the clock. It never performs side
//! effects itself: unit creation and termination, events, and lock releases
//! are returned in a [`ReconcileOutcome`] for the controller to apply after
//! the new status has been persisted. Running it again on an unchanged
//! workflow and snapshot produces no new nodes; the only action it repeats
//! is the create request for a pod whose unit has not been observed yet.
//!
//! A pass runs in a fixed order:
//!
//! 1. start a pending workflow (validation, artifact repository, workflow lock)
//! 2. fold observed unit phases into pod nodes
//! 3. enforce node and workflow deadlines
//! 4. apply a requested shutdown
//! 5. walk the template tree from the entrypoint, creating what is ready
//! 6. run the exit handler once the entrypoint is done
//! 7. decide the workflow's terminal phase
//!
//! Steps and DAG templates are walked by the sibling `steps` and `dag`
//! modules, which extend [`Operation`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use weft_types::config::ControllerConfig;
use weft_types::event::{EventReason, WorkflowEvent, NODE_NAME_ANNOTATION, NODE_TYPE_ANNOTATION};
use weft_types::node::{Node, NodePhase, NodeType};
use weft_types::unit::{UnitPhase, UnitRequest, UnitSnapshot, UnitStatus};
use weft_types::workflow::{
    Arguments, ArtifactRepository, Inputs, Invocation, LockEntry, ObjectMeta, Outputs,
    ShutdownStrategy, Synchronization, SynchronizationStatus, Template, TemplateKind, TemplateRef,
    Workflow, WorkflowKey, WorkflowPhase, WorkflowSpec, WorkflowStatus,
};

use super::admission::Admission;
use super::artifacts;
use super::context::{self, Scope, ScopeError};
use super::deadline;
use super::definition;
use super::expression::WorkflowEvaluator;
use super::nodes::{node_id, NodeStore};
use super::retry::{self, RetryDecision};
use super::sync::{self, Acquisition, LockSpec, SyncError, SyncManager};
use super::templates;
use crate::repository::lookup::{ConfigMapLookup, TemplateLookup};

/// Message for a running pod whose execution unit disappeared.
pub const UNIT_DELETED: &str = "execution unit deleted";
pub const EMPTY_PARAMS: &str = "Skipped, empty params";

/// Side effect on execution units requested by a reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitAction {
    Create(UnitRequest),
    Terminate { name: String },
}

#[derive(Debug)]
pub struct ReconcileOutcome {
    pub workflow: Workflow,
    pub actions: Vec<UnitAction>,
    pub events: Vec<WorkflowEvent>,
    /// Reconcile again after this delay even without a unit change.
    pub requeue_after: Option<Duration>,
    /// Locks that had a slot freed; their waiters should be re-enqueued.
    pub released_locks: Vec<String>,
}

impl ReconcileOutcome {
    fn unchanged(workflow: Workflow) -> Self {
        Self {
            workflow,
            actions: Vec::new(),
            events: Vec::new(),
            requeue_after: None,
            released_locks: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

pub struct Reconciler {
    config: ControllerConfig,
    sync: Arc<SyncManager>,
    templates: Arc<dyn TemplateLookup>,
    config_maps: Arc<dyn ConfigMapLookup>,
}

impl Reconciler {
    pub fn new(
        config: ControllerConfig,
        sync: Arc<SyncManager>,
        templates: Arc<dyn TemplateLookup>,
        config_maps: Arc<dyn ConfigMapLookup>,
    ) -> Self {
        Self {
            config,
            sync,
            templates,
            config_maps,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn sync(&self) -> &Arc<SyncManager> {
        &self.sync
    }

    pub fn reconcile(
        &self,
        workflow: Workflow,
        units: &UnitSnapshot,
        now: DateTime<Utc>,
    ) -> ReconcileOutcome {
        if workflow.status.phase.is_terminal() {
            return ReconcileOutcome::unchanged(workflow);
        }

        let globals = Scope::for_workflow(&workflow);
        let Workflow {
            metadata,
            spec,
            mut status,
        } = workflow;
        let nodes = NodeStore::new(std::mem::take(&mut status.nodes));

        let (status, effects) = {
            let mut op = Operation {
                reconciler: self,
                meta: &metadata,
                spec: &spec,
                key: WorkflowKey::new(&metadata.namespace, &metadata.name),
                units,
                now,
                status,
                nodes,
                admission: Admission::new(None, 0),
                globals,
                evaluator: WorkflowEvaluator::new(),
                effects: Effects::default(),
            };
            op.run();
            op.finish()
        };

        let requeue_after = effects
            .wake_at
            .map(|at| (at - now).to_std().unwrap_or_default());
        ReconcileOutcome {
            workflow: Workflow {
                metadata,
                spec,
                status,
            },
            actions: effects.actions,
            events: effects.events,
            requeue_after,
            released_locks: effects.released,
        }
    }
}

// ---------------------------------------------------------------------------
// Operation state
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Effects {
    actions: Vec<UnitAction>,
    events: Vec<WorkflowEvent>,
    wake_at: Option<DateTime<Utc>>,
    released: Vec<String>,
}

/// A call site about to be executed.
pub(super) struct Call {
    pub name: String,
    pub display: String,
    pub template: Option<String>,
    pub template_ref: Option<TemplateRef>,
    /// Already resolved against the caller's scope.
    pub arguments: Arguments,
    pub boundary: Option<String>,
    /// Workflow template the caller came from.
    pub source: Option<String>,
}

/// A located template bound to its inputs, ready to become a node.
#[derive(Debug, Clone)]
pub(super) struct Instance {
    pub id: String,
    pub name: String,
    pub display: String,
    pub boundary: Option<String>,
    pub template: Template,
    pub template_ref: Option<TemplateRef>,
    pub source: Option<String>,
    pub inputs: Inputs,
    pub scope: Scope,
}

/// Which of a template's deadlines a node carries. A retried template puts
/// its timeout on the retry node and its active deadline on each attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeadlineScope {
    All,
    TimeoutOnly,
    ActiveOnly,
}

impl DeadlineScope {
    fn select(self, template: &Template) -> Template {
        Template {
            timeout: (self != Self::ActiveOnly)
                .then(|| template.timeout.clone())
                .flatten(),
            active_deadline_seconds: (self != Self::TimeoutOnly)
                .then(|| template.active_deadline_seconds.clone())
                .flatten(),
            ..Template::default()
        }
    }
}

/// A step or task call site inside a composite template.
#[derive(Debug, Clone, Copy)]
pub(super) struct Site<'s> {
    pub name: &'s str,
    pub display: &'s str,
    pub invocation: &'s Invocation,
    pub boundary: &'s str,
    pub source: Option<&'s str>,
}

/// Nodes produced by one call site. `None` members were not admitted yet.
#[derive(Debug, Clone)]
pub(super) struct Expansion {
    pub members: Vec<Option<String>>,
    pub looped: bool,
}

impl Expansion {
    fn single(member: Option<String>) -> Self {
        Self {
            members: vec![member],
            looped: false,
        }
    }

    pub fn is_fulfilled(&self, nodes: &NodeStore) -> bool {
        self.members
            .iter()
            .all(|m| m.as_deref().is_some_and(|id| nodes.is_fulfilled(id)))
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.members.iter().flatten().map(String::as_str)
    }
}

pub(super) struct Operation<'a> {
    reconciler: &'a Reconciler,
    pub(super) meta: &'a ObjectMeta,
    spec: &'a WorkflowSpec,
    key: WorkflowKey,
    units: &'a UnitSnapshot,
    pub(super) now: DateTime<Utc>,
    status: WorkflowStatus,
    pub(super) nodes: NodeStore,
    pub(super) admission: Admission,
    globals: Scope,
    evaluator: WorkflowEvaluator,
    effects: Effects,
}

impl Operation<'_> {
    fn run(&mut self) {
        if self.status.phase == WorkflowPhase::Pending && !self.start() {
            self.record_synchronization();
            return;
        }

        self.observe_units();
        self.enforce_deadlines();
        self.apply_shutdown();
        self.release_fulfilled_locks();

        let limit = self
            .spec
            .parallelism
            .or(self.reconciler.config.default_parallelism);
        self.admission = Admission::new(limit, self.nodes.active_pods());

        if self.spec.shutdown.is_none() {
            let root = self.meta.name.clone();
            self.execute_template(Call {
                name: root.clone(),
                display: root,
                template: Some(self.spec.entrypoint.clone()),
                template_ref: None,
                arguments: self.spec.arguments.clone(),
                boundary: None,
                source: None,
            });
        }
        self.run_exit_handler();

        self.release_fulfilled_locks();
        self.assess_completion();
        self.flush_node_events();
        self.record_synchronization();
    }

    fn finish(self) -> (WorkflowStatus, Effects) {
        let mut status = self.status;
        status.nodes = self.nodes.into_parts().0;
        (status, self.effects)
    }

    // -----------------------------------------------------------------------
    // Workflow lifecycle
    // -----------------------------------------------------------------------

    /// Move a pending workflow to Running. Returns false while it must stay
    /// pending or when it failed to start.
    fn start(&mut self) -> bool {
        let spec = self.spec;
        if let Some(strategy) = spec.shutdown {
            self.fail_workflow(WorkflowPhase::Failed, stopped_message(strategy));
            return false;
        }
        if let Err(e) = definition::validate(spec) {
            self.fail_workflow(WorkflowPhase::Error, e.to_string());
            return false;
        }
        if self.status.artifact_repository_ref.is_none() {
            match artifacts::resolve(
                &self.meta.namespace,
                spec.artifact_repository_ref.as_ref(),
                self.reconciler.config_maps.as_ref(),
                &self.reconciler.config,
            ) {
                Ok(resolved) => self.status.artifact_repository_ref = Some(resolved),
                Err(e) => {
                    self.fail_workflow(WorkflowPhase::Error, e.to_string());
                    return false;
                }
            }
        }
        if let Some(declared) = &spec.synchronization {
            let lock = match self.lock_spec(declared) {
                Ok(lock) => lock,
                Err(e) => {
                    self.fail_workflow(WorkflowPhase::Error, e.to_string());
                    return false;
                }
            };
            let holder = sync::workflow_holder(&self.key);
            if let Acquisition::Queued { held, limit } =
                self.reconciler.sync.try_acquire(&lock, &holder)
            {
                tracing::debug!(workflow = %self.key, lock = %lock.key, "workflow waiting for lock");
                self.status.message = sync::waiting_message(&lock, held, limit);
                return false;
            }
        }

        self.status.phase = WorkflowPhase::Running;
        self.status.message.clear();
        self.status.started_at = Some(self.now);
        tracing::info!(workflow = %self.key, "workflow running");
        self.emit(EventReason::WorkflowRunning, "Workflow Running", BTreeMap::new());
        true
    }

    fn fail_workflow(&mut self, phase: WorkflowPhase, message: String) {
        tracing::warn!(workflow = %self.key, %message, "workflow could not start");
        self.status.phase = phase;
        self.status.message = message.clone();
        self.status.finished_at = Some(self.now);
        let released = self.reconciler.sync.purge_workflow(&self.key);
        self.effects.released.extend(released);
        self.emit(EventReason::WorkflowFailed, message, BTreeMap::new());
    }

    fn exit_handler_id(&self) -> Option<String> {
        self.spec.on_exit.as_ref()?;
        if self.spec.shutdown == Some(ShutdownStrategy::Terminate) {
            return None;
        }
        let root = &self.meta.name;
        Some(node_id(root, &format!("{root}.onExit")))
    }

    /// The exit handler node and everything below it.
    fn exit_subtree(&self) -> BTreeSet<String> {
        let root = &self.meta.name;
        let id = node_id(root, &format!("{root}.onExit"));
        let mut out: BTreeSet<String> = self.nodes.descendants(&id).into_iter().collect();
        out.insert(id);
        out
    }

    fn run_exit_handler(&mut self) {
        let spec = self.spec;
        let Some(on_exit) = &spec.on_exit else {
            return;
        };
        if spec.shutdown == Some(ShutdownStrategy::Terminate) {
            return;
        }
        let root = self.meta.name.clone();
        let Some(entry) = self.nodes.get(&root) else {
            return;
        };
        if !entry.fulfilled() {
            return;
        }
        let outcome = match entry.phase {
            _ if spec.shutdown.is_some() => WorkflowPhase::Failed,
            NodePhase::Failed => WorkflowPhase::Failed,
            NodePhase::Error => WorkflowPhase::Error,
            _ => WorkflowPhase::Succeeded,
        };
        let failures = self.failures_json();
        self.globals.insert("workflow.status", outcome.to_string());
        self.globals.insert("workflow.failures", failures);

        let name = format!("{root}.onExit");
        self.execute_template(Call {
            display: name.clone(),
            name,
            template: Some(on_exit.clone()),
            template_ref: None,
            arguments: Arguments::default(),
            boundary: None,
            source: None,
        });
    }

    fn failures_json(&self) -> String {
        let failures: Vec<Value> = self
            .nodes
            .iter()
            .filter(|n| n.node_type == NodeType::Pod && n.phase.failed_or_error())
            .map(|n| {
                serde_json::json!({
                    "displayName": n.display_name,
                    "message": n.message,
                    "templateName": n.template_name,
                    "phase": n.phase.to_string(),
                    "podName": n.id,
                    "finishedAt": n.finished_at.map(|t| t.to_rfc3339()),
                })
            })
            .collect();
        Value::Array(failures).to_string()
    }

    /// Record the terminal phase once the entrypoint and exit handler are
    /// both done.
    fn assess_completion(&mut self) {
        let root = self.meta.name.clone();
        let (mut phase, mut message) = match self.nodes.get(&root) {
            Some(node) if !node.fulfilled() => return,
            Some(node) => match node.phase {
                NodePhase::Failed => (WorkflowPhase::Failed, self.root_cause(&root)),
                NodePhase::Error => (WorkflowPhase::Error, self.root_cause(&root)),
                _ => (WorkflowPhase::Succeeded, String::new()),
            },
            None if self.spec.shutdown.is_some() => (WorkflowPhase::Failed, String::new()),
            None => return,
        };

        if let Some(exit_id) = self.exit_handler_id() {
            match self.nodes.get(&exit_id) {
                Some(exit) if exit.fulfilled() => {
                    if phase == WorkflowPhase::Succeeded && exit.phase.failed_or_error() {
                        phase = if exit.phase == NodePhase::Error {
                            WorkflowPhase::Error
                        } else {
                            WorkflowPhase::Failed
                        };
                        message = self.root_cause(&exit_id);
                    }
                }
                _ if self.nodes.contains(&root) => return,
                _ => {}
            }
        }

        if phase != WorkflowPhase::Succeeded {
            let finished = self.nodes.get(&root).and_then(|n| n.finished_at);
            let deadline_hit = deadline::workflow_deadline(self.spec, &self.status)
                .is_some_and(|at| finished.is_some_and(|f| f >= at));
            if let Some(strategy) = self.spec.shutdown {
                phase = WorkflowPhase::Failed;
                message = stopped_message(strategy);
            } else if deadline_hit {
                phase = WorkflowPhase::Failed;
                message = deadline::WORKFLOW_DEADLINE_EXCEEDED.to_string();
            }
        }

        self.status.phase = phase;
        self.status.message = message.clone();
        self.status.finished_at = Some(self.now);
        let released = self.reconciler.sync.purge_workflow(&self.key);
        self.effects.released.extend(released);

        tracing::info!(workflow = %self.key, phase = %phase, "workflow completed");
        self.flush_node_events();
        match phase {
            WorkflowPhase::Succeeded => {
                self.emit(EventReason::WorkflowSucceeded, "Workflow completed", BTreeMap::new())
            }
            _ => self.emit(EventReason::WorkflowFailed, message, BTreeMap::new()),
        }
    }

    // -----------------------------------------------------------------------
    // Observation, deadlines, shutdown
    // -----------------------------------------------------------------------

    fn observe_units(&mut self) {
        let units = self.units;
        let pods: Vec<String> = self
            .nodes
            .iter()
            .filter(|n| n.node_type == NodeType::Pod && !n.fulfilled())
            .filter(|n| n.waiting_for_lock.is_none())
            .map(|n| n.id.clone())
            .collect();
        for id in pods {
            match units.get(&id) {
                Some(unit) => self.apply_unit(&id, unit),
                None if self.nodes.phase(&id) == Some(NodePhase::Running) => {
                    tracing::warn!(workflow = %self.key, node_id = %id, "execution unit vanished");
                    self.nodes
                        .mark_phase(&id, NodePhase::Error, UNIT_DELETED, self.now);
                }
                None => {}
            }
        }
    }

    fn apply_unit(&mut self, id: &str, unit: &UnitStatus) {
        let now = self.now;
        match unit.phase {
            UnitPhase::Pending => {
                let message = unit.message.clone().unwrap_or_default();
                self.nodes.mark_phase(id, NodePhase::Pending, message, now);
            }
            UnitPhase::Running => {
                self.nodes.mark_phase(id, NodePhase::Running, "", now);
            }
            UnitPhase::Succeeded => {
                self.record_unit_outputs(id, unit);
                self.nodes.mark_phase(id, NodePhase::Succeeded, "", now);
            }
            UnitPhase::Failed => {
                self.record_unit_outputs(id, unit);
                let message = unit.message.clone().unwrap_or_else(|| {
                    format!("failed with exit code {}", unit.exit_code.unwrap_or(1))
                });
                self.nodes.mark_phase(id, NodePhase::Failed, message, now);
            }
            UnitPhase::Error => {
                let message = unit
                    .message
                    .clone()
                    .unwrap_or_else(|| "execution unit error".to_string());
                self.nodes.mark_phase(id, NodePhase::Error, message, now);
            }
        }
    }

    fn record_unit_outputs(&mut self, id: &str, unit: &UnitStatus) {
        let Some(node) = self.nodes.get_mut(id) else {
            return;
        };
        let mut outputs = node.outputs.take().unwrap_or_default();
        for param in &mut outputs.parameters {
            if let Some(value) = unit.parameters.get(&param.name) {
                param.value = Some(value.clone());
            }
        }
        outputs.result = unit.result.clone();
        outputs.exit_code = unit
            .exit_code
            .or((unit.phase == UnitPhase::Succeeded).then_some(0))
            .map(|code| code.to_string());
        node.outputs = Some(outputs);
    }

    fn enforce_deadlines(&mut self) {
        let sweep = deadline::sweep(self.nodes.nodes(), self.now);
        for (id, kind) in sweep.expired {
            tracing::info!(workflow = %self.key, node_id = %id, "node deadline exceeded");
            self.fail_subtree(&id, deadline::message(kind));
        }
        if let Some(next) = sweep.next {
            self.wake(next);
        }

        let Some(at) = deadline::workflow_deadline(self.spec, &self.status) else {
            return;
        };
        if at > self.now {
            self.wake(at);
            return;
        }
        if self.nodes.is_fulfilled(&self.meta.name) {
            return;
        }
        tracing::info!(workflow = %self.key, "workflow deadline exceeded");
        let protected = self.exit_subtree();
        let open: Vec<String> = self
            .nodes
            .iter()
            .filter(|n| !n.fulfilled() && !protected.contains(&n.id))
            .map(|n| n.id.clone())
            .collect();
        for id in open {
            self.terminate_unit(&id);
            self.nodes.mark_phase(
                &id,
                NodePhase::Failed,
                deadline::STEP_DEADLINE_EXCEEDED,
                self.now,
            );
        }
    }

    fn apply_shutdown(&mut self) {
        let Some(strategy) = self.spec.shutdown else {
            return;
        };
        let message = stopped_message(strategy);
        let protected = match strategy {
            ShutdownStrategy::Stop => self.exit_subtree(),
            ShutdownStrategy::Terminate => BTreeSet::new(),
        };
        let open: Vec<String> = self
            .nodes
            .iter()
            .filter(|n| !n.fulfilled() && !protected.contains(&n.id))
            .map(|n| n.id.clone())
            .collect();
        for id in open {
            self.terminate_unit(&id);
            self.nodes
                .mark_phase(&id, NodePhase::Failed, message.as_str(), self.now);
        }
    }

    /// Fail `id` and every non-fulfilled node below it.
    fn fail_subtree(&mut self, id: &str, message: &str) {
        let mut targets = vec![id.to_string()];
        targets.extend(self.nodes.descendants(id));
        for target in targets {
            if self.nodes.is_fulfilled(&target) {
                continue;
            }
            self.terminate_unit(&target);
            self.nodes
                .mark_phase(&target, NodePhase::Failed, message, self.now);
        }
    }

    fn terminate_unit(&mut self, id: &str) {
        let live = self
            .units
            .get(id)
            .is_some_and(|u| matches!(u.phase, UnitPhase::Pending | UnitPhase::Running));
        if live {
            self.effects.actions.push(UnitAction::Terminate {
                name: id.to_string(),
            });
        }
    }

    pub(super) fn wake(&mut self, at: DateTime<Utc>) {
        self.effects.wake_at = Some(self.effects.wake_at.map_or(at, |w| w.min(at)));
    }

    // -----------------------------------------------------------------------
    // Locks
    // -----------------------------------------------------------------------

    fn lock_spec(&self, declared: &Synchronization) -> Result<LockSpec, SyncError> {
        sync::lock_spec(
            &self.meta.namespace,
            declared,
            self.reconciler.config_maps.as_ref(),
        )
    }

    fn release_fulfilled_locks(&mut self) {
        let finished: Vec<String> = self
            .nodes
            .iter()
            .filter(|n| n.fulfilled())
            .filter(|n| n.holding_lock.is_some() || n.waiting_for_lock.is_some())
            .map(|n| n.id.clone())
            .collect();
        for id in finished {
            let holder = sync::node_holder(&self.key, &id);
            let Some(node) = self.nodes.get_mut(&id) else {
                continue;
            };
            let holding = node.holding_lock.take();
            let waiting = node.waiting_for_lock.take();
            if let Some(lock) = holding {
                if self.reconciler.sync.release(&lock, &holder) {
                    self.effects.released.push(lock);
                }
            }
            if let Some(lock) = waiting {
                self.reconciler.sync.release(&lock, &holder);
            }
        }
    }

    /// Take the template lock for node `id`. Returns false while queued.
    fn hold_node_lock(&mut self, id: &str, node_type: NodeType, declared: &Synchronization) -> bool {
        if self.nodes.get(id).is_some_and(|n| n.holding_lock.is_some()) {
            return true;
        }
        let lock = match self.lock_spec(declared) {
            Ok(lock) => lock,
            Err(e) => {
                self.nodes
                    .mark_phase(id, NodePhase::Error, e.to_string(), self.now);
                return false;
            }
        };
        let holder = sync::node_holder(&self.key, id);
        match self.reconciler.sync.try_acquire(&lock, &holder) {
            Acquisition::Acquired => {
                tracing::debug!(workflow = %self.key, node_id = %id, lock = %lock.key, "lock acquired");
                let mut was_waiting = false;
                if let Some(node) = self.nodes.get_mut(id) {
                    was_waiting = node.waiting_for_lock.take().is_some();
                    node.holding_lock = Some(lock.key);
                }
                if node_type != NodeType::Pod {
                    self.nodes.mark_phase(id, NodePhase::Running, "", self.now);
                } else if was_waiting {
                    self.nodes.set_message(id, "");
                }
                true
            }
            Acquisition::Queued { held, limit } => {
                let message = sync::waiting_message(&lock, held, limit);
                if let Some(node) = self.nodes.get_mut(id) {
                    node.waiting_for_lock = Some(lock.key);
                }
                self.nodes
                    .mark_phase(id, NodePhase::Pending, message, self.now);
                false
            }
        }
    }

    fn record_synchronization(&mut self) {
        let mut recorded = SynchronizationStatus::default();
        if !self.status.phase.is_terminal() {
            for node in self.nodes.iter() {
                let holder = sync::node_holder(&self.key, &node.id);
                if let Some(lock) = &node.holding_lock {
                    recorded.holding.push(LockEntry {
                        lock: lock.clone(),
                        holder: holder.clone(),
                    });
                }
                if let Some(lock) = &node.waiting_for_lock {
                    recorded.waiting.push(LockEntry {
                        lock: lock.clone(),
                        holder,
                    });
                }
            }
            if let Some(declared) = &self.spec.synchronization {
                if let Ok(lock) = self.lock_spec(declared) {
                    let holder = sync::workflow_holder(&self.key);
                    let manager = &self.reconciler.sync;
                    let entry = LockEntry {
                        lock: lock.key.clone(),
                        holder: holder.clone(),
                    };
                    if manager.holders(&lock.key).contains(&holder) {
                        recorded.holding.push(entry);
                    } else if manager.waiters(&lock.key).contains(&holder) {
                        recorded.waiting.push(entry);
                    }
                }
            }
        }
        self.status.synchronization = recorded;
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    fn emit(
        &mut self,
        reason: EventReason,
        message: impl Into<String>,
        annotations: BTreeMap<String, String>,
    ) {
        self.effects.events.push(WorkflowEvent {
            reason,
            message: message.into(),
            namespace: self.meta.namespace.clone(),
            workflow: self.meta.name.clone(),
            workflow_uid: self.meta.uid,
            annotations,
            timestamp: self.now,
        });
    }

    /// One event per pod that reached Succeeded or Failed. Errored pods
    /// (rejected creation, vanished unit) surface through the workflow's
    /// own terminal event.
    fn flush_node_events(&mut self) {
        for transition in self.nodes.take_transitions() {
            let Some(node) = self.nodes.get(&transition.node_id) else {
                continue;
            };
            if node.node_type != NodeType::Pod {
                continue;
            }
            let detail = |verb: &str| match node.message.as_str() {
                "" => format!("{verb} node {}", node.name),
                message => format!("{verb} node {}: {message}", node.name),
            };
            let (reason, message) = match transition.phase {
                NodePhase::Succeeded => (
                    EventReason::WorkflowNodeSucceeded,
                    format!("Succeeded node {}", node.name),
                ),
                NodePhase::Failed => (EventReason::WorkflowNodeFailed, detail("Failed")),
                _ => continue,
            };
            let annotations = BTreeMap::from([
                (NODE_NAME_ANNOTATION.to_string(), node.name.clone()),
                (NODE_TYPE_ANNOTATION.to_string(), node.node_type.to_string()),
            ]);
            self.emit(reason, message, annotations);
        }
    }

    // -----------------------------------------------------------------------
    // Template execution
    // -----------------------------------------------------------------------

    /// Execute one call site. Returns the node id standing for it, or `None`
    /// when the node could not be created yet because of parallelism.
    pub(super) fn execute_template(&mut self, call: Call) -> Option<String> {
        let id = node_id(&self.meta.name, &call.name);
        if self.nodes.is_fulfilled(&id) {
            return Some(id);
        }

        let spec = self.spec;
        let lookup = self.reconciler.templates.as_ref();
        let located = match templates::locate(
            &self.meta.namespace,
            spec,
            &mut self.status.stored_templates,
            lookup,
            call.template.as_deref(),
            call.template_ref.as_ref(),
            call.source.as_deref(),
        ) {
            Ok(located) => located,
            Err(e) => return Some(self.error_node(&id, &call, e.to_string())),
        };
        let (scope, inputs) =
            match context::bind_inputs(&located.template, &call.arguments, &self.globals) {
                Ok(bound) => bound,
                Err(e) => return Some(self.error_node(&id, &call, e.to_string())),
            };
        let template = match context::resolve_template(&located.template, &scope) {
            Ok(template) => template,
            Err(e) => return Some(self.error_node(&id, &call, e.to_string())),
        };
        if template.kind().is_none() {
            let message = format!("template '{}' defines nothing to run", template.name);
            return Some(self.error_node(&id, &call, message));
        }

        let instance = Instance {
            id,
            name: call.name,
            display: call.display,
            boundary: call.boundary,
            template,
            template_ref: call.template_ref,
            source: located.source,
            inputs,
            scope,
        };
        if instance.template.retry_strategy.is_some() {
            self.execute_retry(instance)
        } else {
            self.execute_node(instance, DeadlineScope::All)
        }
    }

    fn error_node(&mut self, id: &str, call: &Call, message: String) -> String {
        tracing::warn!(workflow = %self.key, node = %call.name, %message, "node could not be started");
        if self.nodes.contains(id) {
            self.nodes
                .mark_phase(id, NodePhase::Error, message, self.now);
            return id.to_string();
        }
        let mut node = Node::new(id, &call.name, &call.display, NodeType::Pod);
        node.template_name = call.template.clone();
        node.template_ref = call.template_ref.clone();
        node.template_scope = call.source.clone();
        node.boundary_id = call.boundary.clone();
        node.phase = NodePhase::Error;
        node.message = message;
        self.nodes.insert(node, self.now);
        id.to_string()
    }

    /// Place a node that runs nothing: a skip, omission, or resolution error.
    pub(super) fn marker(
        &mut self,
        site: &Site<'_>,
        node_type: NodeType,
        phase: NodePhase,
        message: String,
    ) -> String {
        let id = node_id(&self.meta.name, site.name);
        if self.nodes.contains(&id) {
            if !self.nodes.is_fulfilled(&id) {
                self.nodes.mark_phase(&id, phase, message, self.now);
            }
            return id;
        }
        let mut node = Node::new(&id, site.name, site.display, node_type);
        node.template_name = site.invocation.template.clone();
        node.template_ref = site.invocation.template_ref.clone();
        node.boundary_id = Some(site.boundary.to_string());
        node.phase = phase;
        node.message = message;
        self.nodes.insert(node, self.now);
        id
    }

    fn new_node(&self, inst: &Instance, node_type: NodeType, deadlines: DeadlineScope) -> Node {
        let mut node = Node::new(&inst.id, &inst.name, &inst.display, node_type);
        node.template_name = Some(inst.template.name.clone());
        node.template_ref = inst.template_ref.clone();
        node.template_scope = inst.source.clone();
        node.boundary_id = inst.boundary.clone();
        if !inst.inputs.is_empty() {
            node.inputs = Some(inst.inputs.clone());
        }
        match deadline::node_deadline(&deadlines.select(&inst.template), self.now) {
            Ok(deadline) => node.deadline = deadline,
            Err(e) => {
                node.phase = NodePhase::Error;
                node.message = e.to_string();
                return node;
            }
        }
        match node_type {
            NodeType::Pod => node.outputs = self.planned_outputs(inst),
            _ if inst.template.synchronization.is_none() => node.phase = NodePhase::Running,
            _ => {}
        }
        node
    }

    fn planned_outputs(&self, inst: &Instance) -> Option<Outputs> {
        let declared = &inst.template.outputs;
        if declared.is_empty() {
            return None;
        }
        let fallback = ArtifactRepository::default();
        let repository = self
            .status
            .artifact_repository_ref
            .as_ref()
            .map_or(&fallback, |r| &r.artifact_repository);
        Some(Outputs {
            parameters: declared.parameters.clone(),
            artifacts: artifacts::plan_outputs(
                &declared.artifacts,
                repository,
                &self.meta.name,
                &inst.id,
            ),
            ..Default::default()
        })
    }

    fn execute_node(&mut self, inst: Instance, deadlines: DeadlineScope) -> Option<String> {
        let kind = inst.template.kind()?;
        let node_type = match kind {
            TemplateKind::Container => NodeType::Pod,
            TemplateKind::Steps => NodeType::Steps,
            TemplateKind::Dag => NodeType::Dag,
        };

        if !self.nodes.contains(&inst.id) {
            if node_type == NodeType::Pod {
                let chain = self.nodes.boundary_chain(inst.boundary.as_deref());
                if !self.admission.try_admit(&chain) {
                    tracing::debug!(workflow = %self.key, node = %inst.name, "parallelism limit reached");
                    return None;
                }
            }
            let node = self.new_node(&inst, node_type, deadlines);
            tracing::debug!(workflow = %self.key, node = %inst.name, node_type = %node_type, "node created");
            self.nodes.insert(node, self.now);
        }
        if self.nodes.is_fulfilled(&inst.id) {
            return Some(inst.id);
        }

        if let Some(declared) = &inst.template.synchronization {
            if !self.hold_node_lock(&inst.id, node_type, declared) {
                return Some(inst.id);
            }
        }

        match kind {
            TemplateKind::Container => self.launch_unit(&inst),
            TemplateKind::Steps => self.execute_steps(&inst),
            TemplateKind::Dag => self.execute_dag(&inst),
        }
        Some(inst.id)
    }

    fn launch_unit(&mut self, inst: &Instance) {
        let Some(node) = self.nodes.get(&inst.id) else {
            return;
        };
        if node.phase != NodePhase::Pending || self.units.get(&inst.id).is_some() {
            return;
        }
        let request = UnitRequest {
            name: inst.id.clone(),
            workflow: self.key.clone(),
            node_name: inst.name.clone(),
            container: inst.template.container.clone().unwrap_or_default(),
            input_artifacts: inst.inputs.artifacts.clone(),
            output_artifacts: node
                .outputs
                .as_ref()
                .map(|o| o.artifacts.clone())
                .unwrap_or_default(),
            output_parameters: inst.template.outputs.parameters.clone(),
        };
        tracing::debug!(workflow = %self.key, unit = %request.name, "requesting execution unit");
        self.effects.actions.push(UnitAction::Create(request));
    }

    // -----------------------------------------------------------------------
    // Retries
    // -----------------------------------------------------------------------

    fn execute_retry(&mut self, inst: Instance) -> Option<String> {
        let retry_id = inst.id.clone();
        if !self.nodes.contains(&retry_id) {
            let mut node = self.new_node(&inst, NodeType::Retry, DeadlineScope::TimeoutOnly);
            if node.phase != NodePhase::Error {
                let strategy = inst.template.retry_strategy.clone().unwrap_or_default();
                match retry::resolve_strategy(&strategy) {
                    Ok(resolved) => {
                        node.retry = Some(resolved);
                        node.phase = NodePhase::Running;
                    }
                    Err(e) => {
                        node.phase = NodePhase::Error;
                        node.message = e.to_string();
                    }
                }
            }
            self.nodes.insert(node, self.now);
        }

        let node = self.nodes.get(&retry_id)?;
        if node.fulfilled() {
            return Some(retry_id);
        }
        let policy = node.retry?;
        let retry_started = node.started_at.unwrap_or(self.now);

        let mut attempt_template = inst.template.clone();
        attempt_template.retry_strategy = None;
        let base = Instance {
            template: attempt_template,
            ..inst
        };

        let mut launched = false;
        loop {
            let attempts = self
                .nodes
                .get(&retry_id)
                .map(|n| n.children.clone())
                .unwrap_or_default();
            if let Some(last_id) = attempts.last() {
                if !self.nodes.is_fulfilled(last_id) {
                    self.execute_attempt(&base, attempts.len() - 1);
                    if !self.nodes.is_fulfilled(last_id) {
                        return Some(retry_id);
                    }
                }
                let last = self.nodes.get(last_id)?.clone();
                let decision = retry::decide(
                    &policy,
                    attempts.len(),
                    &last,
                    retry_started,
                    self.now,
                    &self.reconciler.config,
                );
                match decision {
                    RetryDecision::Succeeded => {
                        self.finish_retry(&retry_id, &last, String::new());
                        return Some(retry_id);
                    }
                    RetryDecision::NotRetryable => {
                        self.finish_retry(&retry_id, &last, last.message.clone());
                        return Some(retry_id);
                    }
                    RetryDecision::Exhausted { reason } => {
                        let message = retry::exhausted_message(&last.message, reason);
                        self.finish_retry(&retry_id, &last, message);
                        return Some(retry_id);
                    }
                    RetryDecision::Backoff { until, message } => {
                        self.nodes.set_message(&retry_id, message);
                        self.wake(until);
                        return Some(retry_id);
                    }
                    // An attempt that failed without running; pick it up on
                    // the next pass instead of spinning here.
                    RetryDecision::Retry if launched => {
                        self.wake(self.now);
                        return Some(retry_id);
                    }
                    RetryDecision::Retry => {}
                }
            }

            let Some(attempt_id) = self.execute_attempt(&base, attempts.len()) else {
                return Some(retry_id);
            };
            launched = true;
            tracing::debug!(workflow = %self.key, node = %base.name, attempt = attempts.len(), "retry attempt created");
            self.nodes.add_child(&retry_id, &attempt_id);
            self.nodes.set_message(&retry_id, "");
            if !self.nodes.is_fulfilled(&attempt_id) {
                return Some(retry_id);
            }
        }
    }

    fn execute_attempt(&mut self, base: &Instance, attempt: usize) -> Option<String> {
        let name = format!("{}({attempt})", base.name);
        let instance = Instance {
            id: node_id(&self.meta.name, &name),
            display: format!("{}({attempt})", base.display),
            name,
            ..base.clone()
        };
        self.execute_node(instance, DeadlineScope::ActiveOnly)
    }

    fn finish_retry(&mut self, retry_id: &str, last: &Node, message: String) {
        let outbound = self.nodes.outbound_of(&last.id);
        self.nodes.set_outbound(retry_id, outbound);
        if let Some(node) = self.nodes.get_mut(retry_id) {
            node.outputs = last.outputs.clone();
        }
        let phase = if last.phase.successful() {
            NodePhase::Succeeded
        } else {
            last.phase
        };
        self.nodes.mark_phase(retry_id, phase, message, self.now);
    }

    // -----------------------------------------------------------------------
    // Shared by steps and DAG templates
    // -----------------------------------------------------------------------

    /// Expand a call site over its loop items and execute each member.
    pub(super) fn expand(&mut self, site: &Site<'_>, scope: &Scope) -> Expansion {
        let base_id = node_id(&self.meta.name, site.name);
        if self
            .nodes
            .get(&base_id)
            .is_some_and(|n| n.node_type == NodeType::Skipped)
        {
            return Expansion::single(Some(base_id));
        }

        let items = match loop_items(site.invocation, scope) {
            Ok(items) => items,
            Err(message) => {
                let id = self.marker(site, NodeType::Pod, NodePhase::Error, message);
                return Expansion::single(Some(id));
            }
        };
        let Some(items) = items else {
            return Expansion::single(self.invoke(site, scope));
        };
        if items.is_empty() {
            let id = self.marker(
                site,
                NodeType::Skipped,
                NodePhase::Skipped,
                EMPTY_PARAMS.to_string(),
            );
            return Expansion::single(Some(id));
        }

        let mut members = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            let label = item_label(item);
            let name = format!("{}({i}:{label})", site.name);
            let display = format!("{}({i}:{label})", site.display);
            let member = Site {
                name: &name,
                display: &display,
                ..*site
            };
            members.push(self.invoke(&member, &item_scope(scope, item)));
        }
        Expansion {
            members,
            looped: true,
        }
    }

    fn invoke(&mut self, site: &Site<'_>, scope: &Scope) -> Option<String> {
        let id = node_id(&self.meta.name, site.name);
        if self.nodes.is_fulfilled(&id) {
            return Some(id);
        }
        if !self.nodes.contains(&id) {
            if let Some(expression) = &site.invocation.when {
                match self.evaluate_when(expression, scope) {
                    Ok((true, _)) => {}
                    Ok((false, resolved)) => {
                        let message = format!("when '{resolved}' evaluated false");
                        return Some(self.marker(site, NodeType::Skipped, NodePhase::Skipped, message));
                    }
                    Err(message) => {
                        return Some(self.marker(site, NodeType::Pod, NodePhase::Error, message));
                    }
                }
            }
        }
        let arguments = match context::resolve_arguments(&site.invocation.arguments, scope) {
            Ok(arguments) => arguments,
            Err(e) => {
                return Some(self.marker(site, NodeType::Pod, NodePhase::Error, e.to_string()));
            }
        };
        self.execute_template(Call {
            name: site.name.to_string(),
            display: site.display.to_string(),
            template: site.invocation.template.clone(),
            template_ref: site.invocation.template_ref.clone(),
            arguments,
            boundary: Some(site.boundary.to_string()),
            source: site.source.map(str::to_string),
        })
    }

    fn evaluate_when(&self, expression: &str, scope: &Scope) -> Result<(bool, String), String> {
        let resolved = scope.substitute(expression).map_err(|e| e.to_string())?;
        let result = self
            .evaluator
            .evaluate_when(&resolved)
            .map_err(|e| e.to_string())?;
        Ok((result, resolved))
    }

    /// Register a composite node's own parallelism budget for this pass.
    pub(super) fn register_parallelism(&mut self, inst: &Instance) {
        if inst.template.parallelism.is_some() {
            let running = self.nodes.active_pods_within(&inst.id);
            self.admission
                .register_scope(&inst.id, inst.template.parallelism, running);
        }
    }

    /// Publish a fulfilled call site's outputs under `key`
    /// (e.g. `steps.generate`).
    pub(super) fn publish(&self, key: &str, expansion: &Expansion, scope: &mut Scope) {
        if !expansion.looped {
            if let Some(id) = expansion.ids().next() {
                self.publish_node(key, id, scope);
            }
            return;
        }

        let outputs: Vec<&Outputs> = expansion
            .ids()
            .filter_map(|id| self.nodes.get(id)?.outputs.as_ref())
            .collect();
        let results: Vec<Value> = outputs
            .iter()
            .filter_map(|o| o.result.clone())
            .map(Value::String)
            .collect();
        let parameters: Vec<Value> = outputs
            .iter()
            .filter(|o| !o.parameters.is_empty())
            .map(|o| {
                Value::Object(
                    o.parameters
                        .iter()
                        .filter_map(|p| Some((p.name.clone(), Value::String(p.value.clone()?))))
                        .collect(),
                )
            })
            .collect();
        if !results.is_empty() {
            scope.insert(format!("{key}.outputs.result"), Value::Array(results).to_string());
        }
        if !parameters.is_empty() {
            scope.insert(
                format!("{key}.outputs.parameters"),
                Value::Array(parameters).to_string(),
            );
        }
    }

    fn publish_node(&self, key: &str, id: &str, scope: &mut Scope) {
        let Some(node) = self.nodes.get(id) else {
            return;
        };
        scope.insert(format!("{key}.id"), id);
        scope.insert(format!("{key}.status"), node.phase.to_string());
        let Some(outputs) = &node.outputs else {
            return;
        };
        if let Some(result) = &outputs.result {
            scope.insert(format!("{key}.outputs.result"), result.clone());
        }
        if let Some(code) = &outputs.exit_code {
            scope.insert(format!("{key}.outputs.exitCode"), code.clone());
        }
        for param in &outputs.parameters {
            if let Some(value) = &param.value {
                scope.insert(
                    format!("{key}.outputs.parameters.{}", param.name),
                    value.clone(),
                );
            }
        }
        for artifact in &outputs.artifacts {
            scope.insert_artifact(
                format!("{key}.outputs.artifacts.{}", artifact.name),
                artifact.clone(),
            );
        }
    }

    /// First member whose failure the call site's `continueOn` does not
    /// tolerate, with its root-cause message.
    pub(super) fn unhandled_failure(
        &self,
        expansion: &Expansion,
        invocation: &Invocation,
    ) -> Option<(NodePhase, String)> {
        expansion.ids().find_map(|id| {
            let node = self.nodes.get(id)?;
            let tolerated = match node.phase {
                NodePhase::Failed => invocation.continues_on_failed(),
                NodePhase::Error => invocation.continues_on_error(),
                _ => return None,
            };
            (!tolerated).then(|| (node.phase, self.root_cause(id)))
        })
    }

    /// Message explaining why `id` failed: its own, or that of the first
    /// failed descendant that has one.
    pub(super) fn root_cause(&self, id: &str) -> String {
        if let Some(node) = self.nodes.get(id) {
            if !node.message.is_empty() {
                return node.message.clone();
            }
        }
        self.nodes
            .descendants(id)
            .iter()
            .filter_map(|d| self.nodes.get(d))
            .find(|n| n.phase.failed_or_error() && !n.message.is_empty())
            .map(|n| n.message.clone())
            .unwrap_or_default()
    }

    /// Finish a steps or DAG node.
    pub(super) fn complete(
        &mut self,
        inst: &Instance,
        phase: NodePhase,
        message: String,
        outbound: Vec<String>,
        scope: &Scope,
    ) {
        self.nodes.set_outbound(&inst.id, outbound);
        if phase == NodePhase::Succeeded {
            match resolve_outputs(&inst.template.outputs, scope) {
                Ok(Some(outputs)) => {
                    if let Some(node) = self.nodes.get_mut(&inst.id) {
                        node.outputs = Some(outputs);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    self.nodes
                        .mark_phase(&inst.id, NodePhase::Error, e.to_string(), self.now);
                    return;
                }
            }
        }
        self.nodes.mark_phase(&inst.id, phase, message, self.now);
    }
}

fn stopped_message(strategy: ShutdownStrategy) -> String {
    format!("Stopped with strategy '{strategy}'")
}

fn resolve_outputs(declared: &Outputs, scope: &Scope) -> Result<Option<Outputs>, ScopeError> {
    if declared.is_empty() {
        return Ok(None);
    }
    let mut outputs = context::resolve(declared, scope)?;
    for artifact in &mut outputs.artifacts {
        if let Some(from) = artifact.from.take() {
            let key = context::reference_key(&from).unwrap_or(from.as_str());
            let source = scope
                .artifact(key)
                .ok_or_else(|| ScopeError::Unresolved(key.to_string()))?;
            artifact.s3 = source.s3.clone();
        }
    }
    Ok(Some(outputs))
}

/// Loop items of a call site; `None` when it does not loop.
fn loop_items(invocation: &Invocation, scope: &Scope) -> Result<Option<Vec<Value>>, String> {
    if let Some(items) = &invocation.with_items {
        return context::resolve(items, scope)
            .map(Some)
            .map_err(|e| e.to_string());
    }
    let Some(param) = &invocation.with_param else {
        return Ok(None);
    };
    let text = scope.substitute(param).map_err(|e| e.to_string())?;
    match serde_json::from_str::<Value>(&text) {
        Ok(Value::Array(items)) => Ok(Some(items)),
        _ => Err(format!(
            "withParam value could not be parsed as a JSON list: {text}"
        )),
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Label used in expanded node names: strings verbatim, objects as sorted
/// `key:value` pairs joined by commas.
fn item_label(item: &Value) -> String {
    match item {
        Value::Object(map) => {
            let mut pairs: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{k}:{}", value_text(v)))
                .collect();
            pairs.sort();
            pairs.join(",")
        }
        other => value_text(other),
    }
}

fn item_scope(scope: &Scope, item: &Value) -> Scope {
    let mut out = scope.clone();
    out.insert("item", value_text(item));
    if let Value::Object(map) = item {
        for (k, v) in map {
            out.insert(format!("item.{k}"), value_text(v));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_labels_follow_node_naming() {
        assert_eq!(item_label(&serde_json::json!("hello")), "hello");
        assert_eq!(item_label(&serde_json::json!(3)), "3");
        assert_eq!(
            item_label(&serde_json::json!({"res": 1, "a": "x"})),
            "a:x,res:1"
        );
    }

    #[test]
    fn item_scope_exposes_fields() {
        let scope = item_scope(&Scope::new(), &serde_json::json!({"os": "linux", "n": 2}));
        assert_eq!(scope.get("item.os"), Some("linux"));
        assert_eq!(scope.get("item.n"), Some("2"));
        assert!(scope.get("item").unwrap().starts_with('{'));
    }

    #[test]
    fn with_param_must_be_a_json_list() {
        let invocation = Invocation {
            with_param: Some("{{steps.gen.outputs.result}}".into()),
            ..Default::default()
        };
        let mut scope = Scope::new();
        scope.insert("steps.gen.outputs.result", "[1, 2]");
        let items = loop_items(&invocation, &scope).unwrap().unwrap();
        assert_eq!(items.len(), 2);

        scope.insert("steps.gen.outputs.result", "not json");
        assert!(loop_items(&invocation, &scope).is_err());
    }

    #[test]
    fn deadline_scope_splits_retry_deadlines() {
        let template = Template {
            timeout: Some("10s".into()),
            active_deadline_seconds: Some(weft_types::workflow::IntOrString::Int(5)),
            ..Default::default()
        };
        let retry = DeadlineScope::TimeoutOnly.select(&template);
        assert!(retry.timeout.is_some() && retry.active_deadline_seconds.is_none());
        let attempt = DeadlineScope::ActiveOnly.select(&template);
        assert!(attempt.timeout.is_none() && attempt.active_deadline_seconds.is_some());
    }
}
