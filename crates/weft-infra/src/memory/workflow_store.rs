//! DashMap-backed workflow store with optimistic concurrency.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use weft_core::repository::workflow::WorkflowStore;
use weft_types::error::RepositoryError;
use weft_types::workflow::{Workflow, WorkflowKey};

#[derive(Debug, Default)]
pub struct MemoryWorkflowStore {
    workflows: DashMap<WorkflowKey, Workflow>,
}

impl MemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }
}

impl WorkflowStore for MemoryWorkflowStore {
    async fn create(&self, workflow: &Workflow) -> Result<Workflow, RepositoryError> {
        match self.workflows.entry(workflow.key()) {
            Entry::Occupied(entry) => Err(RepositoryError::AlreadyExists(entry.key().to_string())),
            Entry::Vacant(entry) => {
                let mut stored = workflow.clone();
                stored.metadata.resource_version = 1;
                entry.insert(stored.clone());
                tracing::debug!(workflow = %workflow.key(), "workflow stored");
                Ok(stored)
            }
        }
    }

    async fn get(&self, key: &WorkflowKey) -> Result<Option<Workflow>, RepositoryError> {
        Ok(self.workflows.get(key).map(|entry| entry.value().clone()))
    }

    async fn list(&self) -> Result<Vec<Workflow>, RepositoryError> {
        let mut all: Vec<Workflow> = self
            .workflows
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        all.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(all)
    }

    async fn update(&self, workflow: &Workflow) -> Result<Workflow, RepositoryError> {
        let key = workflow.key();
        let mut entry = self
            .workflows
            .get_mut(&key)
            .ok_or(RepositoryError::NotFound)?;
        let current = entry.metadata.resource_version;
        if current != workflow.metadata.resource_version {
            return Err(RepositoryError::Conflict(format!(
                "{key} is at version {current}, update carried {}",
                workflow.metadata.resource_version
            )));
        }
        let mut stored = workflow.clone();
        stored.metadata.resource_version = current + 1;
        *entry = stored.clone();
        Ok(stored)
    }

    async fn delete(&self, key: &WorkflowKey) -> Result<bool, RepositoryError> {
        Ok(self.workflows.remove(key).is_some())
    }
}
