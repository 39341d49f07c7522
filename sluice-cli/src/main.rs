//! Sluice CLI
//!
//! Command-line interface for checking pipeline definitions, evaluating
//! triggers and running pipelines locally.

mod commands;
mod config;
mod render;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, handle_command};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "sluice")]
#[command(about = "Sluice container pipeline CLI", long_about = None)]
struct Cli {
    /// Maximum number of runs executing at the same time
    #[arg(long, env = "SLUICE_MAX_CONCURRENT_RUNS")]
    max_concurrent_runs: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sluice_runner=warn,sluice_cli=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = config::load(cli.max_concurrent_runs)?;

    handle_command(cli.command, &config).await
}
