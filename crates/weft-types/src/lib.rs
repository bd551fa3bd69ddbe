//! Shared domain types for Weft.
//!
//! Everything that crosses a crate boundary lives here: the workflow object
//! and its spec/status, the node tree, execution-unit requests and
//! observations, audit events, controller configuration, and the error
//! enums used by the repository and collaborator traits in `weft-core`.

pub mod config;
pub mod duration;
pub mod error;
pub mod event;
pub mod node;
pub mod unit;
pub mod workflow;
