//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod definitions;
mod run;

use anyhow::Result;
use clap::{Args, Subcommand, ValueEnum};
use sluice_core::domain::event::{EventKind, TriggerEvent};
use sluice_runner::Config;
use std::path::PathBuf;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Load a definitions file and summarize its pipelines
    Validate {
        /// Path to the definitions JSON file
        definitions: PathBuf,
    },
    /// Show which pipelines an event would trigger
    Match {
        /// Path to the definitions JSON file
        definitions: PathBuf,

        #[command(flatten)]
        event: EventArgs,
    },
    /// Run every pipeline an event triggers, locally
    Run {
        /// Path to the definitions JSON file
        definitions: PathBuf,

        #[command(flatten)]
        event: EventArgs,

        /// Use this directory as the working tree instead of checking out the commit
        #[arg(long)]
        workdir: Option<PathBuf>,
    },
}

/// Kind of VCS event to simulate
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum KindArg {
    Push,
    PullRequest,
}

/// Describes the trigger event
#[derive(Debug, Args)]
pub struct EventArgs {
    /// Full git ref (e.g., refs/heads/main, refs/pull/42/head)
    #[arg(long = "ref")]
    git_ref: String,

    /// Commit SHA
    #[arg(long, default_value = "HEAD")]
    sha: String,

    /// Changed path; repeat for several. Omit when unknown.
    #[arg(long = "path")]
    paths: Vec<String>,

    #[arg(long, value_enum, default_value = "push")]
    kind: KindArg,
}

impl EventArgs {
    pub fn to_event(&self) -> TriggerEvent {
        let event = TriggerEvent {
            kind: self.kind.into(),
            ..TriggerEvent::push(&self.git_ref, &self.sha)
        };
        if self.paths.is_empty() {
            event
        } else {
            event.with_changed_paths(&self.paths)
        }
    }
}

impl From<KindArg> for EventKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Push => EventKind::Push,
            KindArg::PullRequest => EventKind::PullRequest,
        }
    }
}

/// Handle a CLI command
///
/// # Arguments
/// * `command` - The command to execute
/// * `config` - Runner configuration for this invocation
pub async fn handle_command(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Validate { definitions } => definitions::validate(&definitions),
        Commands::Match { definitions, event } => {
            definitions::show_matches(&definitions, &event.to_event())
        }
        Commands::Run {
            definitions,
            event,
            workdir,
        } => run::run(&definitions, &event.to_event(), workdir, config).await,
    }
}
