//! Infrastructure layer for Weft.
//!
//! Implements the ports defined in `weft-core`: an in-memory workflow store,
//! template and config-map registries, the TOML config loader, and two
//! execution-unit clients (local processes and a scripted simulation).

pub mod config;
pub mod memory;
pub mod unit;
