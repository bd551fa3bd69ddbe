//! Workflow reconciliation engine and port definitions for Weft.
//!
//! This crate defines the "ports" (repository and execution-unit traits) that
//! the infrastructure layer implements, plus every scheduling policy and the
//! reconciler that applies them. It depends only on `weft-types`, never on
//! `weft-infra` or any I/O crate.

pub mod event;
pub mod repository;
pub mod unit;
pub mod workflow;
