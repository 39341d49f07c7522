//! Run domain types
//!
//! A run is one execution of a pipeline against a commit. Its step results
//! only ever grow, and once the run reaches a terminal state it is frozen.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Run execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunState {
    Queued,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Succeeded | RunState::Failed | RunState::TimedOut | RunState::Cancelled
        )
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(self, next: RunState) -> bool {
        match self {
            RunState::Queued => matches!(
                next,
                RunState::Running | RunState::Failed | RunState::Cancelled
            ),
            RunState::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Queued => write!(f, "Queued"),
            RunState::Running => write!(f, "Running"),
            RunState::Succeeded => write!(f, "Succeeded"),
            RunState::Failed => write!(f, "Failed"),
            RunState::TimedOut => write!(f, "TimedOut"),
            RunState::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Outcome of one executed step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub name: String,

    /// Process exit code, -1 when the container never ran
    pub exit_code: i32,

    /// Tail of the merged stdout/stderr
    pub output: String,

    /// Set when earlier output was dropped to respect the size bound
    pub output_truncated: bool,

    pub duration: Duration,

    /// Container could not be pulled or started
    pub execution_error: Option<String>,
}

impl StepResult {
    pub fn passed(&self) -> bool {
        self.execution_error.is_none() && self.exit_code == 0
    }
}

/// Files kept from a successful run, grouped by archive name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectedArtifact {
    pub archive: String,
    /// Archive file (or directory) written for the run
    pub path: PathBuf,
    pub files: Vec<PathBuf>,
}

/// Errors raised when mutating a run illegally
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunError {
    #[error("run is already in terminal state {0}")]
    Terminal(RunState),

    #[error("invalid run transition from {from} to {to}")]
    InvalidTransition { from: RunState, to: RunState },

    #[error("step results can only be recorded while running (state: {0})")]
    NotRunning(RunState),

    #[error("pipeline has {total} step(s), cannot record another")]
    TooManySteps { total: usize },
}

/// Run execution record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub pipeline: String,
    pub commit_sha: String,
    pub git_ref: String,
    pub state: RunState,
    pub steps: Vec<StepResult>,
    pub artifacts: Vec<CollectedArtifact>,
    pub total_steps: usize,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl Run {
    /// Creates a queued run
    pub fn new(
        pipeline: impl Into<String>,
        commit_sha: impl Into<String>,
        git_ref: impl Into<String>,
        total_steps: usize,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            pipeline: pipeline.into(),
            commit_sha: commit_sha.into(),
            git_ref: git_ref.into(),
            state: RunState::Queued,
            steps: Vec::new(),
            artifacts: Vec::new(),
            total_steps,
            queued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error_message: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Moves the run to `next`, stamping start and finish times
    pub fn transition(&mut self, next: RunState) -> Result<(), RunError> {
        if self.state.is_terminal() {
            return Err(RunError::Terminal(self.state));
        }
        if !self.state.can_transition_to(next) {
            return Err(RunError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }

        let now = Utc::now();
        if next == RunState::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        self.state = next;
        Ok(())
    }

    /// Moves the run to a terminal state and records why
    pub fn finish(&mut self, state: RunState, reason: Option<String>) -> Result<(), RunError> {
        self.transition(state)?;
        if reason.is_some() {
            self.error_message = reason;
        }
        Ok(())
    }

    /// Appends the result of the next step
    pub fn record_step(&mut self, result: StepResult) -> Result<(), RunError> {
        if self.state != RunState::Running {
            return Err(RunError::NotRunning(self.state));
        }
        if self.steps.len() >= self.total_steps {
            return Err(RunError::TooManySteps {
                total: self.total_steps,
            });
        }
        self.steps.push(result);
        Ok(())
    }

    pub fn record_artifacts(&mut self, artifacts: Vec<CollectedArtifact>) -> Result<(), RunError> {
        if self.state.is_terminal() {
            return Err(RunError::Terminal(self.state));
        }
        self.artifacts = artifacts;
        Ok(())
    }

    /// Wall-clock time between start and finish, if both happened
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.finished_at) {
            (Some(started), Some(finished)) => Some(finished.signed_duration_since(started)),
            _ => None,
        }
    }
}
