//! Parallelism admission.
//!
//! Only pods consume budget. A pod counts from the moment its node exists
//! until it is fulfilled, including while it waits for a lock or for cluster
//! capacity. Candidates that do not fit are simply not materialized this tick
//! and are offered again on the next one.

use std::collections::HashMap;

/// Admit candidates in declaration order up to the remaining budget.
pub fn admit<T: Clone>(candidates: &[T], running: usize, limit: Option<u32>) -> Vec<T> {
    match limit {
        None => candidates.to_vec(),
        Some(limit) => {
            let remaining = (limit as usize).saturating_sub(running);
            candidates.iter().take(remaining).cloned().collect()
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Budget {
    limit: u32,
    running: usize,
}

impl Budget {
    fn has_room(&self) -> bool {
        !admit(&[()], self.running, Some(self.limit)).is_empty()
    }
}

/// Budgets for one reconciliation tick: the workflow-wide limit plus one
/// per steps/DAG node that declares `parallelism`.
#[derive(Debug, Default)]
pub struct Admission {
    workflow: Option<Budget>,
    scopes: HashMap<String, Budget>,
}

impl Admission {
    pub fn new(limit: Option<u32>, running: usize) -> Self {
        Self {
            workflow: limit.map(|limit| Budget { limit, running }),
            scopes: HashMap::new(),
        }
    }

    /// Register the budget of a boundary node. Re-registering keeps the
    /// counts already admitted during this tick.
    pub fn register_scope(&mut self, boundary: &str, limit: Option<u32>, running: usize) {
        if let Some(limit) = limit {
            self.scopes
                .entry(boundary.to_string())
                .or_insert(Budget { limit, running });
        }
    }

    /// Admit one pod whose enclosing boundaries are `chain`. On success the
    /// pod is charged against every budget on the way up.
    pub fn try_admit(&mut self, chain: &[String]) -> bool {
        if self.workflow.is_some_and(|b| !b.has_room()) {
            return false;
        }
        if chain
            .iter()
            .filter_map(|id| self.scopes.get(id))
            .any(|b| !b.has_room())
        {
            return false;
        }
        if let Some(b) = self.workflow.as_mut() {
            b.running += 1;
        }
        for id in chain {
            if let Some(b) = self.scopes.get_mut(id) {
                b.running += 1;
            }
        }
        true
    }
}
