//! Sluice runner
//!
//! Turns VCS events into pipeline runs:
//! - Definitions: load and validate the project's pipelines
//! - Trigger: decide which pipelines an event fires
//! - Scheduler: queue, supersede, dispatch and time-box runs
//! - Pipeline: execute a run's steps in containers and collect artifacts
//! - Publisher: report commit statuses back to the provider

pub mod artifacts;
pub mod cancel;
pub mod config;
pub mod context;
pub mod definitions;
pub mod error;
pub mod executor;
pub mod pipeline;
pub mod publisher;
pub mod scheduler;
pub mod trigger;
pub mod workspace;

pub use config::{Config, ShutdownPolicy};
pub use definitions::DefinitionSet;
pub use pipeline::PipelineRunner;
pub use scheduler::{RunHandle, Scheduler};

use std::sync::Arc;

use crate::artifacts::ArtifactCollector;
use crate::executor::{ContainerRuntime, StepExecutor};
use crate::publisher::{GitHubStatusSink, NoopStatusSink, RetryPolicy, StatusPublisher, StatusSink};
use crate::workspace::WorkspaceProvider;
use sluice_client::StatusClient;

/// Status publisher for `config`: GitHub when a token and repository are set,
/// otherwise a sink that drops everything
pub fn status_publisher(config: &Config) -> StatusPublisher {
    let sink: Arc<dyn StatusSink> = match (&config.repository, &config.status_token) {
        (Some(repository), Some(token)) => {
            let client = StatusClient::new(config.status_api_url.clone(), repository.clone())
                .with_token(token.clone());
            Arc::new(GitHubStatusSink::new(client))
        }
        _ => Arc::new(NoopStatusSink),
    };
    StatusPublisher::spawn(sink, RetryPolicy::from_config(config))
}

/// Wires a pipeline runner from its collaborators and `config`
pub fn pipeline_runner(
    config: &Config,
    runtime: Arc<dyn ContainerRuntime>,
    workspace: Arc<dyn WorkspaceProvider>,
    publisher: StatusPublisher,
) -> PipelineRunner {
    PipelineRunner::new(
        StepExecutor::new(runtime, config.output_limit),
        workspace,
        ArtifactCollector::new(config.artifact_dir.clone()),
        publisher,
    )
}
