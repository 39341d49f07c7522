//! Commit status domain types

use serde::{Deserialize, Serialize};

use crate::domain::run::RunState;

/// Provider-side label attached to a commit for a named context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitState {
    Pending,
    Success,
    Failure,
    Error,
}

impl CommitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CommitState::Pending => "pending",
            CommitState::Success => "success",
            CommitState::Failure => "failure",
            CommitState::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        self != CommitState::Pending
    }
}

impl From<RunState> for CommitState {
    fn from(state: RunState) -> Self {
        match state {
            RunState::Queued | RunState::Running => CommitState::Pending,
            RunState::Succeeded => CommitState::Success,
            RunState::Failed => CommitState::Failure,
            RunState::TimedOut | RunState::Cancelled => CommitState::Error,
        }
    }
}

impl std::fmt::Display for CommitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a status update; delivering the same key twice in a row is a no-op
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatusKey {
    pub commit_sha: String,
    pub context: String,
    pub state: CommitState,
}

/// A commit status to deliver to the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitStatus {
    pub commit_sha: String,
    pub context: String,
    pub state: CommitState,
    pub description: Option<String>,
    pub target_url: Option<String>,
}

impl CommitStatus {
    pub fn key(&self) -> StatusKey {
        StatusKey {
            commit_sha: self.commit_sha.clone(),
            context: self.context.clone(),
            state: self.state,
        }
    }
}
