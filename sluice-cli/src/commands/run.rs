//! Run command handler
//!
//! Runs every pipeline an event triggers on this machine and streams the run
//! events to the terminal until all of them finish.

use anyhow::{Context, Result};
use colored::*;
use sluice_core::domain::event::{RunEvent, TriggerEvent};
use sluice_core::domain::run::{Run, RunState};
use sluice_runner::executor::PodmanRuntime;
use sluice_runner::workspace::{GitCheckout, LocalWorkspace, WorkspaceProvider};
use sluice_runner::{Config, RunHandle, Scheduler, ShutdownPolicy};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::warn;

use super::definitions::load;
use crate::render::{print_event, print_run_summary};

pub async fn run(
    path: &Path,
    event: &TriggerEvent,
    workdir: Option<PathBuf>,
    config: &Config,
) -> Result<()> {
    let set = load(path)?;

    let workspace: Arc<dyn WorkspaceProvider> = match workdir {
        Some(dir) => Arc::new(LocalWorkspace::new(dir)),
        None => {
            let url = set
                .vcs_root()
                .map(|root| root.url.clone())
                .context("Definitions have no VCS root to check out")?;
            Arc::new(GitCheckout::new(url, config.workspace_base.clone()))
        }
    };

    let runtime = PodmanRuntime::new(config.container_binary.clone());
    runtime
        .check_available()
        .await
        .context("Container runtime is not available")?;

    let runner = sluice_runner::pipeline_runner(
        config,
        Arc::new(runtime),
        workspace,
        sluice_runner::status_publisher(config),
    );
    let scheduler = Scheduler::start(config, set, Arc::new(runner));

    let mut events = scheduler.subscribe();
    let handles = scheduler.handle_event(event);
    if handles.is_empty() {
        println!(
            "{}",
            format!("No pipeline is triggered by {}.", event.git_ref).yellow()
        );
        return Ok(());
    }

    println!(
        "{}",
        format!("Running {} pipeline(s) for {}", handles.len(), event.git_ref).bold()
    );
    let runs = follow(&mut events, handles).await?;
    scheduler.shutdown(ShutdownPolicy::Drain).await;

    println!();
    println!("{}", "Summary:".bold());
    for run in &runs {
        print_run_summary(run);
    }

    let failed = runs
        .iter()
        .filter(|run| run.state != RunState::Succeeded)
        .count();
    if failed > 0 {
        anyhow::bail!("{} of {} run(s) did not succeed", failed, runs.len());
    }

    println!("{} {}", "✓".green(), "All runs succeeded".green());
    Ok(())
}

/// Prints events until every handle has finished
async fn follow(
    events: &mut broadcast::Receiver<RunEvent>,
    handles: Vec<RunHandle>,
) -> Result<Vec<Run>> {
    let waiter = tokio::spawn(async move {
        let mut runs = Vec::with_capacity(handles.len());
        for handle in handles {
            runs.push(handle.wait().await?);
        }
        Ok::<_, sluice_runner::error::SchedulerError>(runs)
    });
    tokio::pin!(waiter);

    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(missed)) => warn!("{} event(s) skipped", missed),
                Err(RecvError::Closed) => {}
            },
            finished = &mut waiter => {
                loop {
                    match events.try_recv() {
                        Ok(event) => print_event(&event),
                        Err(TryRecvError::Lagged(_)) => continue,
                        Err(_) => break,
                    }
                }
                let runs = finished.context("Run watcher panicked")??;
                return Ok(runs);
            }
        }
    }
}
