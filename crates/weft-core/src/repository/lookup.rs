//! Read-only lookups consulted during reconciliation.
//!
//! These are synchronous on purpose: reconciliation works against an
//! in-memory snapshot and must not wait on I/O. Implementations are expected
//! to serve from a local cache.

use weft_types::workflow::{ConfigMap, WorkflowTemplate};

/// Source of workflow templates referenced through `templateRef`.
pub trait TemplateLookup: Send + Sync {
    fn get_template(&self, namespace: &str, name: &str) -> Option<WorkflowTemplate>;
}

/// Source of config maps (semaphore limits, artifact repositories).
pub trait ConfigMapLookup: Send + Sync {
    fn get_config_map(&self, namespace: &str, name: &str) -> Option<ConfigMap>;
}
