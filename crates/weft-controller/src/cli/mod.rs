//! CLI command definitions for the `weft` binary.

pub mod render;
pub mod run;
pub mod validate;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Run container workflows against local execution units.
#[derive(Parser)]
#[command(name = "weft", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Controller configuration file (defaults to ~/.weft/config.toml).
    #[arg(long, global = true, env = "WEFT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Print results as JSON instead of a table.
    #[arg(long, global = true)]
    pub json: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    /// Detailed logs (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Submit workflows and run them to completion.
    Run(run::RunArgs),

    /// Parse and validate workflow manifests without running them.
    Validate {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}
