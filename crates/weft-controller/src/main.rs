//! Weft workflow controller entry point.
//!
//! Binary name: `weft`
//!
//! Parses CLI arguments, loads configuration, initializes tracing, then
//! dispatches to the command handler.

mod cli;

use clap::Parser;
use weft_observe::tracing_setup::{self, TracingOptions};

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_setup::init_tracing(TracingOptions {
        verbosity: cli.verbose,
        json: cli.log_json,
        otel: cli.otel,
    })
    .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(weft_infra::config::default_config_path);
    let config = weft_infra::config::load_controller_config(&config_path).await;

    let result = match cli.command {
        Commands::Run(args) => cli::run::run(args, config, cli.json).await,
        Commands::Validate { files } => cli::validate::validate(&files),
    };

    tracing_setup::shutdown_tracing();
    result
}
