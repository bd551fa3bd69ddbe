//! Execution-unit clients.
//!
//! [`ProcessUnitClient`] runs each unit's container command as a local
//! process. [`SimulatedUnitClient`] plays back scripted outcomes and is what
//! the end-to-end controller tests run against.

pub mod process;
pub mod simulated;
mod table;

pub use process::ProcessUnitClient;
pub use simulated::{Outcome, SimulatedUnitClient};
