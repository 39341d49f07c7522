//! Error taxonomy for the runner
//!
//! Only `ConfigError` is fatal, and only at load time. Execution, timeout and
//! publish errors end (or merely annotate) a single run.

use sluice_client::ClientError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Malformed definitions; rejects the whole definition set
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read definitions from {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid definitions document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid project: {0}")]
    InvalidProject(String),

    #[error("pipeline '{pipeline}': {message}")]
    InvalidPipeline { pipeline: String, message: String },

    #[error("duplicate pipeline name '{0}'")]
    DuplicatePipeline(String),

    #[error("invalid rule '{rule}': {message}")]
    InvalidRule { rule: String, message: String },
}

/// A container could not be run; fails the run, never the process
#[derive(Debug, Clone, Error)]
pub enum ExecutionError {
    #[error("failed to launch container runtime '{binary}': {message}")]
    Spawn { binary: String, message: String },

    #[error("failed to pull image '{image}': {message}")]
    ImagePull { image: String, message: String },

    #[error("container for image '{image}' failed to start: {message}")]
    ContainerStart { image: String, message: String },

    #[error("container runtime error for '{name}': {message}")]
    Runtime { name: String, message: String },

    #[error("workspace preparation failed: {0}")]
    Workspace(String),
}

/// A run went over its budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("run exceeded its timeout budget of {}s", .budget.as_secs())]
pub struct TimeoutError {
    pub budget: Duration,
}

/// Status delivery failed; logged, never propagated to the run
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("status delivery failed: {0}")]
    Client(#[from] ClientError),

    #[error("status delivery gave up after {attempts} attempt(s): {last}")]
    Exhausted { attempts: u32, last: String },
}

impl PublishError {
    pub fn is_transient(&self) -> bool {
        match self {
            PublishError::Client(e) => e.is_transient(),
            PublishError::Exhausted { .. } => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler is shutting down, no new runs are accepted")]
    ShuttingDown,

    #[error("run {0} ended without reporting a result")]
    RunLost(Uuid),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message() {
        let err = TimeoutError {
            budget: Duration::from_secs(300),
        };
        assert_eq!(err.to_string(), "run exceeded its timeout budget of 300s");
    }

    #[test]
    fn test_publish_error_transience() {
        let transient = PublishError::Client(ClientError::api_error(502, "Bad Gateway"));
        assert!(transient.is_transient());

        let permanent = PublishError::Client(ClientError::api_error(422, "Validation Failed"));
        assert!(!permanent.is_transient());

        let exhausted = PublishError::Exhausted {
            attempts: 3,
            last: "503".to_string(),
        };
        assert!(!exhausted.is_transient());
    }
}
