//! Cluster-wide mutexes and semaphores shared by all workflows.
//!
//! The [`SyncManager`] is the only state shared across concurrently
//! reconciled workflows. Each lock entry lives in a `DashMap` shard, so an
//! acquire is a single compare-then-grant under that shard's lock: two
//! workflows can never both believe they hold the same mutex.
//!
//! Waiters are served strictly FIFO. A waiter is granted only when it is
//! within the first `free slots` positions of the queue, so a late arrival
//! can never overtake an earlier one.
//!
//! Lock keys:
//! - mutex: `<namespace>/Mutex/<name>`
//! - semaphore: `<namespace>/ConfigMap/<config-map>/<key>`
//!
//! Holder keys:
//! - workflow level: `<namespace>/<workflow>`
//! - template level: `<namespace>/<workflow>/<node-id>`

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use weft_types::workflow::{LockEntry, Synchronization, Workflow, WorkflowKey};

use crate::repository::lookup::ConfigMapLookup;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("synchronization declares neither a mutex nor a semaphore")]
    Empty,

    #[error("config map '{namespace}/{name}' not found")]
    ConfigMapNotFound { namespace: String, name: String },

    #[error("config map '{name}' has no key '{key}'")]
    KeyNotFound { name: String, key: String },

    #[error("semaphore limit '{value}' in '{name}/{key}' is not a non-negative integer")]
    InvalidLimit {
        name: String,
        key: String,
        value: String,
    },
}

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// A lock declaration resolved to its table key and current limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockSpec {
    pub key: String,
    pub limit: usize,
}

impl LockSpec {
    pub fn is_mutex(&self) -> bool {
        self.key.split('/').nth(1) == Some("Mutex")
    }
}

/// Resolve a synchronization declaration.
///
/// Semaphore limits are re-read from the config map on every call so a
/// changed limit takes effect on the next acquire.
pub fn lock_spec(
    namespace: &str,
    sync: &Synchronization,
    config_maps: &dyn ConfigMapLookup,
) -> Result<LockSpec, SyncError> {
    if let Some(mutex) = &sync.mutex {
        return Ok(LockSpec {
            key: format!("{namespace}/Mutex/{}", mutex.name),
            limit: 1,
        });
    }
    let Some(semaphore) = &sync.semaphore else {
        return Err(SyncError::Empty);
    };
    let selector = &semaphore.config_map_key_ref;
    let cm = config_maps
        .get_config_map(namespace, &selector.name)
        .ok_or_else(|| SyncError::ConfigMapNotFound {
            namespace: namespace.to_string(),
            name: selector.name.clone(),
        })?;
    let raw = cm
        .data
        .get(&selector.key)
        .ok_or_else(|| SyncError::KeyNotFound {
            name: selector.name.clone(),
            key: selector.key.clone(),
        })?;
    let limit = raw
        .trim()
        .parse::<usize>()
        .map_err(|_| SyncError::InvalidLimit {
            name: selector.name.clone(),
            key: selector.key.clone(),
            value: raw.clone(),
        })?;
    Ok(LockSpec {
        key: format!("{namespace}/ConfigMap/{}/{}", selector.name, selector.key),
        limit,
    })
}

pub fn workflow_holder(key: &WorkflowKey) -> String {
    format!("{}/{}", key.namespace, key.name)
}

pub fn node_holder(key: &WorkflowKey, node_id: &str) -> String {
    format!("{}/{}/{node_id}", key.namespace, key.name)
}

/// The workflow that owns a holder key.
pub fn holder_workflow(holder: &str) -> Option<WorkflowKey> {
    let mut parts = holder.splitn(3, '/');
    let namespace = parts.next()?;
    let name = parts.next()?;
    Some(WorkflowKey::new(namespace, name))
}

/// Message recorded on a workflow or node queued behind `lock`.
pub fn waiting_message(lock: &LockSpec, held: usize, limit: usize) -> String {
    if lock.is_mutex() {
        format!("Waiting for {} mutex to be released", lock.key)
    } else {
        format!("Waiting for {} lock. Lock status: {held}/{limit}", lock.key)
    }
}

fn belongs_to(holder: &str, workflow: &str) -> bool {
    holder == workflow
        || holder
            .strip_prefix(workflow)
            .is_some_and(|rest| rest.starts_with('/'))
}

// ---------------------------------------------------------------------------
// SyncManager
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquisition {
    Acquired,
    Queued { held: usize, limit: usize },
}

#[derive(Debug, Default)]
struct LockState {
    limit: usize,
    holders: Vec<String>,
    queue: VecDeque<String>,
}

#[derive(Debug, Default)]
pub struct SyncManager {
    locks: DashMap<String, LockState>,
}

impl SyncManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take a slot of `spec.key` for `holder`.
    ///
    /// Re-acquiring a held lock succeeds. A holder that cannot be granted is
    /// appended to the queue once and keeps its position on later calls.
    pub fn try_acquire(&self, spec: &LockSpec, holder: &str) -> Acquisition {
        let mut state = self.locks.entry(spec.key.clone()).or_default();
        state.limit = spec.limit;
        if state.holders.iter().any(|h| h == holder) {
            return Acquisition::Acquired;
        }
        if !state.queue.iter().any(|h| h == holder) {
            state.queue.push_back(holder.to_string());
        }
        let free = state.limit.saturating_sub(state.holders.len());
        let position = state.queue.iter().position(|h| h == holder).unwrap_or(usize::MAX);
        if position < free {
            state.queue.remove(position);
            state.holders.push(holder.to_string());
            tracing::debug!(lock = %spec.key, holder = %holder, "lock acquired");
            return Acquisition::Acquired;
        }
        Acquisition::Queued {
            held: state.holders.len(),
            limit: state.limit,
        }
    }

    /// Release `holder`'s slot and drop any queue entry. Returns true when a
    /// slot was actually freed.
    pub fn release(&self, key: &str, holder: &str) -> bool {
        let Some(mut state) = self.locks.get_mut(key) else {
            return false;
        };
        state.queue.retain(|h| h != holder);
        let before = state.holders.len();
        state.holders.retain(|h| h != holder);
        let released = state.holders.len() != before;
        if released {
            tracing::debug!(lock = %key, holder = %holder, "lock released");
        }
        released
    }

    /// Remove every hold and queue entry belonging to `workflow`. Returns
    /// the keys of locks that had a slot freed.
    pub fn purge_workflow(&self, workflow: &WorkflowKey) -> Vec<String> {
        let prefix = workflow_holder(workflow);
        let mut freed = Vec::new();
        for mut entry in self.locks.iter_mut() {
            entry.queue.retain(|h| !belongs_to(h, &prefix));
            let before = entry.holders.len();
            entry.holders.retain(|h| !belongs_to(h, &prefix));
            if entry.holders.len() != before {
                freed.push(entry.key().clone());
            }
        }
        freed.sort();
        freed
    }

    /// Holders currently queued on `key`, in order.
    pub fn waiters(&self, key: &str) -> Vec<String> {
        self.locks
            .get(key)
            .map(|s| s.queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn holders(&self, key: &str) -> Vec<String> {
        self.locks
            .get(key)
            .map(|s| s.holders.clone())
            .unwrap_or_default()
    }

    /// Rebuild the table from persisted workflow status after a restart.
    ///
    /// Waiters are re-queued in workflow creation order, then by holder key
    /// within a workflow. Limits are refreshed by the next acquire.
    pub fn restore(&self, workflows: &[Workflow]) {
        let mut waiting: Vec<(DateTime<Utc>, &LockEntry)> = Vec::new();
        for wf in workflows {
            if wf.status.phase.is_terminal() {
                continue;
            }
            for held in &wf.status.synchronization.holding {
                let mut state = self.locks.entry(held.lock.clone()).or_default();
                if !state.holders.contains(&held.holder) {
                    state.holders.push(held.holder.clone());
                }
                state.limit = state.limit.max(state.holders.len());
            }
            for entry in &wf.status.synchronization.waiting {
                waiting.push((wf.metadata.creation_timestamp, entry));
            }
        }
        waiting.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)));
        for (_, entry) in waiting {
            let mut state = self.locks.entry(entry.lock.clone()).or_default();
            if !state.queue.contains(&entry.holder) && !state.holders.contains(&entry.holder) {
                state.queue.push_back(entry.holder.clone());
            }
        }
        tracing::info!(locks = self.locks.len(), "synchronization state restored");
    }
}
