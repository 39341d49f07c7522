//! Event types
//!
//! `TriggerEvent` is what a VCS webhook normalizes to; `RunEvent` is what the
//! scheduler streams out while runs progress.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::log::LogEntry;
use crate::domain::run::{RunState, StepResult};

/// Kind of VCS activity that produced a trigger event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Push,
    PullRequest,
}

/// A normalized VCS event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub git_ref: String,
    pub commit_sha: String,

    /// Paths touched by the change, when the provider reports them
    pub changed_paths: Option<Vec<String>>,

    pub kind: EventKind,
}

impl TriggerEvent {
    pub fn push(git_ref: impl Into<String>, commit_sha: impl Into<String>) -> Self {
        Self {
            git_ref: git_ref.into(),
            commit_sha: commit_sha.into(),
            changed_paths: None,
            kind: EventKind::Push,
        }
    }

    pub fn pull_request(git_ref: impl Into<String>, commit_sha: impl Into<String>) -> Self {
        Self {
            kind: EventKind::PullRequest,
            ..Self::push(git_ref, commit_sha)
        }
    }

    pub fn with_changed_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.changed_paths = Some(paths.into_iter().map(Into::into).collect());
        self
    }
}

/// A state transition or progress notification for one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub run_id: Uuid,
    pub pipeline: String,
    pub git_ref: String,
    pub timestamp: DateTime<Utc>,
    pub kind: RunEventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RunEventKind {
    Queued,
    StateChanged(RunState),
    StepStarted { index: usize, name: String },
    StepFinished(StepResult),
    Log(LogEntry),
    Superseded { by: Uuid },
}

impl RunEvent {
    pub fn new(
        run_id: Uuid,
        pipeline: impl Into<String>,
        git_ref: impl Into<String>,
        kind: RunEventKind,
    ) -> Self {
        Self {
            run_id,
            pipeline: pipeline.into(),
            git_ref: git_ref.into(),
            timestamp: Utc::now(),
            kind,
        }
    }
}
