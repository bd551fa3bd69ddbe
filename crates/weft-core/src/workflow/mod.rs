//! Workflow scheduling: every policy the reconciler applies, the pure
//! reconciler itself, and the async controller that drives it.

pub mod admission;
pub mod artifacts;
pub mod context;
pub mod controller;
mod dag;
pub mod deadline;
pub mod definition;
pub mod expression;
pub mod nodes;
pub mod operator;
pub mod queue;
pub mod retry;
mod steps;
pub mod sync;
pub mod templates;
pub mod ttl;

#[cfg(test)]
mod test_support;
