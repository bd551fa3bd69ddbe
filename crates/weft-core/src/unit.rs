//! Execution-unit collaborator trait.
//!
//! The collaborator turns a [`UnitRequest`] into something that runs and
//! reports its lifecycle. Creation is idempotent by unit name; termination
//! and lookups of unknown units are not errors.

use tokio::sync::broadcast;
use weft_types::error::UnitError;
use weft_types::unit::{UnitRequest, UnitStatus};
use weft_types::workflow::WorkflowKey;

pub trait UnitClient: Send + Sync {
    /// Request a unit. Asking again for an existing name succeeds.
    fn create(
        &self,
        request: &UnitRequest,
    ) -> impl std::future::Future<Output = Result<(), UnitError>> + Send;

    /// Request termination. Unknown or finished units are ignored.
    fn terminate(&self, name: &str) -> impl std::future::Future<Output = Result<(), UnitError>> + Send;

    /// Latest observation of every unit belonging to `workflow`.
    fn list(
        &self,
        workflow: &WorkflowKey,
    ) -> impl std::future::Future<Output = Result<Vec<UnitStatus>, UnitError>> + Send;

    /// Forget every unit of a deleted workflow.
    fn remove_workflow(
        &self,
        workflow: &WorkflowKey,
    ) -> impl std::future::Future<Output = Result<(), UnitError>> + Send;

    /// Notifications naming the workflow whose units changed.
    fn subscribe(&self) -> broadcast::Receiver<WorkflowKey>;
}
