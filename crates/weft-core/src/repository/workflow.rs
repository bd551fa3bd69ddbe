//! Workflow store trait definition.
//!
//! The store persists whole workflow objects with optimistic concurrency:
//! every successful write bumps `metadata.resourceVersion`, and an update
//! carrying a stale version is rejected with [`RepositoryError::Conflict`].

use weft_types::error::RepositoryError;
use weft_types::workflow::{Workflow, WorkflowKey};

/// Repository trait for workflow objects.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowStore: Send + Sync {
    /// Insert a new workflow. Fails with `AlreadyExists` on a name clash.
    fn create(
        &self,
        workflow: &Workflow,
    ) -> impl std::future::Future<Output = Result<Workflow, RepositoryError>> + Send;

    /// Get a workflow by key.
    fn get(
        &self,
        key: &WorkflowKey,
    ) -> impl std::future::Future<Output = Result<Option<Workflow>, RepositoryError>> + Send;

    /// List every stored workflow.
    fn list(&self) -> impl std::future::Future<Output = Result<Vec<Workflow>, RepositoryError>> + Send;

    /// Replace a workflow if its `resourceVersion` matches the stored one.
    /// Returns the stored copy with the bumped version.
    fn update(
        &self,
        workflow: &Workflow,
    ) -> impl std::future::Future<Output = Result<Workflow, RepositoryError>> + Send;

    /// Delete a workflow. Returns `true` if it existed.
    fn delete(
        &self,
        key: &WorkflowKey,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}
