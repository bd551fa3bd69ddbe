//! Repository trait definitions (ports).
//!
//! These traits define the storage and lookup interfaces that the
//! infrastructure layer (weft-infra) implements. The core crate never
//! depends on any specific storage technology.

pub mod lookup;
pub mod workflow;
