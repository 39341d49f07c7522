//! Sluice Runner
//!
//! Long-running process that executes pipelines for incoming VCS events.
//!
//! Architecture:
//! - Configuration: load settings from environment or defaults
//! - Definitions: the project's pipelines, loaded once at startup
//! - Scheduler: queues, supersedes and dispatches runs
//! - Publisher: reports commit statuses in the background
//!
//! Trigger events arrive on stdin as one JSON object per line (as produced by
//! a webhook receiver). The process stops at end of input or on Ctrl-C,
//! winding down according to the configured shutdown policy.

use anyhow::{Context, Result};
use sluice_core::domain::event::{RunEventKind, TriggerEvent};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sluice_runner::definitions::{self, DefinitionSet};
use sluice_runner::executor::PodmanRuntime;
use sluice_runner::workspace::GitCheckout;
use sluice_runner::{Config, Scheduler};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sluice_runner=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Sluice Runner");

    let config = load_config()?;
    info!(
        "Loaded configuration: max_concurrent_runs={}, workspace_base={}, publishing={}",
        config.max_concurrent_runs,
        config.workspace_base.display(),
        if config.publishing_enabled() { "enabled" } else { "disabled" }
    );

    let definitions_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("SLUICE_DEFINITIONS").ok())
        .map(PathBuf::from)
        .context("Usage: sluice-runner <definitions.json> (or set SLUICE_DEFINITIONS)")?;
    let project = definitions::load_file(&definitions_path)
        .with_context(|| format!("Failed to load {}", definitions_path.display()))?;
    let definitions = DefinitionSet::new(project);

    let runtime = PodmanRuntime::new(config.container_binary.clone());
    runtime
        .check_available()
        .await
        .context("Container runtime is not available")?;

    let vcs_url = definitions
        .vcs_root()
        .map(|root| root.url.clone())
        .context("Definitions have no VCS root")?;
    let runner = sluice_runner::pipeline_runner(
        &config,
        Arc::new(runtime),
        Arc::new(GitCheckout::new(vcs_url, config.workspace_base.clone())),
        sluice_runner::status_publisher(&config),
    );

    let scheduler = Scheduler::start(&config, definitions, Arc::new(runner));
    let reporter = spawn_event_logger(&scheduler);

    info!("Runner initialized, reading trigger events from stdin");
    tokio::select! {
        result = read_events(&scheduler) => {
            if let Err(e) = result {
                error!("Event input failed: {:#}", e);
            }
            info!("End of input");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
        }
    }

    scheduler.shutdown(config.shutdown_policy).await;
    reporter.abort();
    Ok(())
}

/// Loads configuration from environment variables, falling back to defaults
fn load_config() -> Result<Config> {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            warn!("Invalid environment configuration ({}), using defaults", e);
            Config::default()
        }
    };
    config.validate()?;
    Ok(config)
}

/// Feeds newline-delimited JSON trigger events to the scheduler
async fn read_events(scheduler: &Scheduler) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        if line.trim().is_empty() {
            continue;
        }

        let event: TriggerEvent = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(e) => {
                warn!("Ignoring malformed event: {}", e);
                continue;
            }
        };

        let handles = scheduler.handle_event(&event);
        info!(
            "Event {} at {} started {} run(s)",
            event.git_ref,
            event.commit_sha,
            handles.len()
        );
    }

    Ok(())
}

/// Mirrors run transitions into the process log
fn spawn_event_logger(scheduler: &Scheduler) -> tokio::task::JoinHandle<()> {
    let mut events = scheduler.subscribe();

    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match &event.kind {
                    RunEventKind::StateChanged(state) => {
                        info!("[{}] {} on {}: {}", event.run_id, event.pipeline, event.git_ref, state)
                    }
                    RunEventKind::StepStarted { name, .. } => {
                        info!("[{}] {}: step '{}' started", event.run_id, event.pipeline, name)
                    }
                    RunEventKind::Log(entry) => {
                        debug!("[{}] {}", event.run_id, entry.message)
                    }
                    _ => {}
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Event logger lagged, {} event(s) skipped", missed);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
