//! In-memory implementations of the core repository and lookup traits.

pub mod registry;
pub mod workflow_store;

pub use registry::{ConfigMapRegistry, TemplateRegistry};
pub use workflow_store::MemoryWorkflowStore;
