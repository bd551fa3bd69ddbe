//! Async controller: work queue, worker pool, and the side effects of a
//! reconciliation.
//!
//! Workers pull workflow keys from a de-duplicating [`WorkQueue`], so one
//! workflow is never reconciled by two workers at once. A pass loads the
//! workflow, lists its execution units, runs the pure [`Reconciler`], and
//! persists the new status with optimistic concurrency. Only after the write
//! succeeds are unit actions dispatched and events published; a conflicting
//! write drops the pass and re-enqueues the key.
//!
//! Besides the workers, [`Controller::run`] drives three loops: unit change
//! notifications, a periodic resync of every live workflow, and TTL garbage
//! collection.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use weft_types::config::ControllerConfig;
use weft_types::error::{RepositoryError, UnitError};
use weft_types::node::NodeType;
use weft_types::unit::{UnitPhase, UnitSnapshot, UnitStatus};
use weft_types::workflow::{Workflow, WorkflowKey};

use super::definition::{self, WorkflowError};
use super::operator::{ReconcileOutcome, Reconciler, UnitAction};
use super::queue::WorkQueue;
use super::sync::{self, SyncManager};
use super::ttl;
use crate::event::bus::EventBus;
use crate::repository::lookup::{ConfigMapLookup, TemplateLookup};
use crate::repository::workflow::WorkflowStore;
use crate::unit::UnitClient;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Capacity of the workflow event bus.
pub const EVENT_BUS_CAPACITY: usize = 1024;

/// Delay before retrying a key whose pass hit a store or collaborator error.
const ERROR_REQUEUE_DELAY: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// ControllerError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("store error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("execution unit error: {0}")]
    Unit(#[from] UnitError),

    #[error("invalid workflow: {0}")]
    Workflow(#[from] WorkflowError),
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Generic over the store and the execution-unit client so the same
/// controller runs against the in-memory store, local processes, or the
/// simulated client used in tests.
pub struct Controller<S: WorkflowStore, U: UnitClient> {
    store: Arc<S>,
    units: Arc<U>,
    reconciler: Reconciler,
    queue: Arc<WorkQueue<WorkflowKey>>,
    events: EventBus,
    /// Creations the collaborator refused, replayed as Error observations
    /// until the workflow completes.
    rejected: DashMap<WorkflowKey, BTreeMap<String, UnitStatus>>,
}

impl<S, U> Controller<S, U>
where
    S: WorkflowStore + 'static,
    U: UnitClient + 'static,
{
    pub fn new(
        store: Arc<S>,
        units: Arc<U>,
        templates: Arc<dyn TemplateLookup>,
        config_maps: Arc<dyn ConfigMapLookup>,
        config: ControllerConfig,
    ) -> Self {
        let sync = Arc::new(SyncManager::new());
        Self {
            store,
            units,
            reconciler: Reconciler::new(config, sync, templates, config_maps),
            queue: Arc::new(WorkQueue::new()),
            events: EventBus::new(EVENT_BUS_CAPACITY),
            rejected: DashMap::new(),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &ControllerConfig {
        self.reconciler.config()
    }

    pub fn sync(&self) -> &Arc<SyncManager> {
        self.reconciler.sync()
    }

    /// Store a new workflow and schedule its first reconciliation.
    pub async fn submit(&self, workflow: Workflow) -> Result<Workflow, ControllerError> {
        let stored = self.store.create(&workflow).await?;
        let key = stored.key();
        tracing::info!(workflow = %key, "workflow submitted");
        self.enqueue(key);
        Ok(stored)
    }

    /// Parse a YAML manifest and submit it.
    pub async fn submit_manifest(&self, yaml: &str) -> Result<Workflow, ControllerError> {
        let workflow = definition::parse_workflow(yaml)?;
        self.submit(workflow).await
    }

    pub fn enqueue(&self, key: WorkflowKey) {
        self.queue.add(key);
    }

    /// Delete a workflow, terminating its live units and dropping it from
    /// every lock. Returns whether the object existed.
    pub async fn delete(&self, namespace: &str, name: &str) -> Result<bool, ControllerError> {
        let key = WorkflowKey::new(namespace, name);
        if let Some(workflow) = self.store.get(&key).await? {
            if !workflow.status.phase.is_terminal() {
                let live: Vec<&str> = workflow
                    .status
                    .nodes
                    .iter()
                    .filter(|n| n.node_type == NodeType::Pod && !n.fulfilled())
                    .map(|n| n.id.as_str())
                    .collect();
                for unit in live {
                    if let Err(e) = self.units.terminate(unit).await {
                        tracing::warn!(workflow = %key, %unit, error = %e, "failed to terminate unit");
                    }
                }
            }
        }

        let existed = match self.store.delete(&key).await {
            Ok(existed) => existed,
            Err(RepositoryError::NotFound) => false,
            Err(e) => return Err(e.into()),
        };
        self.forget(&key).await?;
        tracing::info!(workflow = %key, existed, "workflow deleted");
        Ok(existed)
    }

    /// Rebuild the lock table from stored status and enqueue every live
    /// workflow. Returns the number enqueued.
    pub async fn restore(&self) -> Result<usize, ControllerError> {
        let workflows = self.store.list().await?;
        self.sync().restore(&workflows);
        let mut live = 0;
        for wf in &workflows {
            if !wf.status.phase.is_terminal() {
                self.enqueue(wf.key());
                live += 1;
            }
        }
        Ok(live)
    }

    /// Delete every workflow whose TTL has elapsed.
    pub async fn collect_garbage(&self) -> Result<Vec<WorkflowKey>, ControllerError> {
        let collected = ttl::collect_expired(self.store.as_ref(), Utc::now()).await?;
        for key in &collected {
            self.forget(key).await?;
        }
        Ok(collected)
    }

    /// Drop collaborator and lock state held for a removed workflow.
    async fn forget(&self, key: &WorkflowKey) -> Result<(), ControllerError> {
        self.units.remove_workflow(key).await?;
        self.rejected.remove(key);
        let released = self.sync().purge_workflow(key);
        self.wake_waiters(&released);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // One worker pass
    // -----------------------------------------------------------------------

    /// Reconcile the workflow stored under `key` once and apply the result.
    pub async fn reconcile_key(&self, key: &WorkflowKey) -> Result<(), ControllerError> {
        let Some(workflow) = self.store.get(key).await? else {
            tracing::debug!(workflow = %key, "workflow no longer exists");
            self.rejected.remove(key);
            return Ok(());
        };

        if workflow.status.phase.is_terminal() {
            self.rejected.remove(key);
            if ttl::is_expired(&workflow, Utc::now()) {
                self.delete(&key.namespace, &key.name).await?;
            } else {
                self.schedule_ttl(&workflow);
            }
            return Ok(());
        }

        let snapshot = self.snapshot(key).await?;
        let before = workflow.status.clone();
        let outcome = self.reconciler.reconcile(workflow, &snapshot, Utc::now());

        let ReconcileOutcome {
            workflow,
            actions,
            events,
            requeue_after,
            released_locks,
        } = outcome;
        let workflow = if workflow.status != before {
            match self.store.update(&workflow).await {
                Ok(stored) => stored,
                Err(RepositoryError::Conflict(reason)) => {
                    tracing::debug!(workflow = %key, %reason, "stale workflow, retrying");
                    self.queue.add(key.clone());
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            workflow
        };

        let rejected = self.dispatch(key, &actions).await;
        for event in events {
            if event.reason.is_warning() {
                tracing::warn!(workflow = %key, reason = %event.reason, message = %event.message, "workflow event");
            } else {
                tracing::info!(workflow = %key, reason = %event.reason, message = %event.message, "workflow event");
            }
            self.events.publish(event);
        }
        self.wake_waiters(&released_locks);

        if rejected {
            self.queue.add(key.clone());
        } else if let Some(delay) = requeue_after {
            tracing::debug!(workflow = %key, delay_ms = delay.as_millis() as u64, "requeue scheduled");
            self.queue.add_after(key.clone(), delay);
        }
        if workflow.status.phase.is_terminal() {
            self.rejected.remove(key);
            self.schedule_ttl(&workflow);
        }
        Ok(())
    }

    async fn snapshot(&self, key: &WorkflowKey) -> Result<UnitSnapshot, ControllerError> {
        let mut snapshot: UnitSnapshot = self.units.list(key).await?.into_iter().collect();
        if let Some(rejected) = self.rejected.get(key) {
            for (name, status) in rejected.iter() {
                if snapshot.get(name).is_none() {
                    snapshot.insert(status.clone());
                }
            }
        }
        Ok(snapshot)
    }

    /// Apply unit actions concurrently. Returns true when a creation was
    /// rejected and the workflow should see it right away.
    async fn dispatch(&self, key: &WorkflowKey, actions: &[UnitAction]) -> bool {
        let results = join_all(actions.iter().map(|action| async move {
            let result = match action {
                UnitAction::Create(request) => self.units.create(request).await,
                UnitAction::Terminate { name } => self.units.terminate(name).await,
            };
            (action, result)
        }))
        .await;

        let mut rejected = false;
        for (action, result) in results {
            match result {
                Ok(()) => {}
                Err(UnitError::Rejected { name, reason }) => {
                    tracing::warn!(workflow = %key, unit = %name, %reason, "unit creation rejected");
                    let mut status = UnitStatus::new(&name, UnitPhase::Error);
                    status.message = Some(reason);
                    self.rejected
                        .entry(key.clone())
                        .or_default()
                        .insert(name, status);
                    rejected = true;
                }
                Err(UnitError::NotFound(name)) => {
                    tracing::debug!(workflow = %key, unit = %name, "unit already gone");
                }
                Err(e) => {
                    tracing::warn!(workflow = %key, action = ?action, error = %e, "unit action failed");
                    self.queue.add_after(key.clone(), ERROR_REQUEUE_DELAY);
                }
            }
        }
        rejected
    }

    /// Re-enqueue every workflow waiting on one of `locks`.
    fn wake_waiters(&self, locks: &[String]) {
        for lock in locks {
            for holder in self.sync().waiters(lock) {
                if let Some(waiting) = sync::holder_workflow(&holder) {
                    tracing::debug!(lock = %lock, workflow = %waiting, "lock freed, waking waiter");
                    self.queue.add(waiting);
                }
            }
        }
    }

    fn schedule_ttl(&self, workflow: &Workflow) {
        let Some(at) = ttl::expires_at(workflow) else {
            return;
        };
        let delay = (at - Utc::now()).to_std().unwrap_or_default();
        self.queue.add_after(workflow.key(), delay);
    }

    // -----------------------------------------------------------------------
    // Run loop
    // -----------------------------------------------------------------------

    /// Run workers and background loops until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), ControllerError> {
        let restored = self.restore().await?;
        let workers = self.config().workers.max(1);
        tracing::info!(workers, restored, "controller started");

        let mut tasks = JoinSet::new();
        for worker in 0..workers {
            let this = Arc::clone(&self);
            let cancel = cancel.clone();
            tasks.spawn(async move { this.work(worker, cancel).await });
        }
        {
            let this = Arc::clone(&self);
            let cancel = cancel.clone();
            tasks.spawn(async move { this.watch_units(cancel).await });
        }
        {
            let this = Arc::clone(&self);
            let cancel = cancel.clone();
            tasks.spawn(async move { this.resync_loop(cancel).await });
        }
        {
            let this = Arc::clone(&self);
            let cancel = cancel.clone();
            tasks.spawn(async move { this.ttl_loop(cancel).await });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::warn!(error = %e, "controller task ended abnormally");
            }
        }
        tracing::info!("controller stopped");
        Ok(())
    }

    async fn work(&self, worker: usize, cancel: CancellationToken) {
        loop {
            let key = tokio::select! {
                _ = cancel.cancelled() => break,
                key = self.queue.next() => match key {
                    Some(key) => key,
                    None => break,
                },
            };
            if let Err(e) = self.reconcile_key(&key).await {
                tracing::warn!(worker, workflow = %key, error = %e, "reconcile failed");
                self.queue.add_after(key.clone(), ERROR_REQUEUE_DELAY);
            }
            self.queue.done(&key);
        }
    }

    async fn watch_units(&self, cancel: CancellationToken) {
        let mut changes = self.units.subscribe();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                change = changes.recv() => match change {
                    Ok(key) => self.queue.add(key),
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "unit notifications lagged, resyncing");
                        self.resync().await;
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    }

    async fn resync_loop(&self, cancel: CancellationToken) {
        let period = Duration::from_secs(self.config().resync_interval_secs.max(1));
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => self.resync().await,
            }
        }
    }

    async fn resync(&self) {
        match self.store.list().await {
            Ok(workflows) => {
                for wf in workflows.iter().filter(|wf| !wf.status.phase.is_terminal()) {
                    self.queue.add(wf.key());
                }
            }
            Err(e) => tracing::warn!(error = %e, "resync failed to list workflows"),
        }
    }

    async fn ttl_loop(&self, cancel: CancellationToken) {
        let period = Duration::from_secs(self.config().ttl_interval_secs.max(1));
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.collect_garbage().await {
                        tracing::warn!(error = %e, "TTL collection failed");
                    }
                }
            }
        }
    }
}
