//! Commit status wire bodies

use serde::{Deserialize, Serialize};

use crate::domain::status::{CommitState, CommitStatus};

/// Body of `POST /repos/{owner}/{repo}/statuses/{sha}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateStatus {
    pub state: CommitState,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub context: String,
}

/// Provider limit on the description field
const MAX_DESCRIPTION_CHARS: usize = 140;

impl From<&CommitStatus> for CreateStatus {
    fn from(status: &CommitStatus) -> Self {
        Self {
            state: status.state,
            target_url: status.target_url.clone(),
            description: status
                .description
                .as_ref()
                .map(|d| d.chars().take(MAX_DESCRIPTION_CHARS).collect()),
            context: status.context.clone(),
        }
    }
}

/// Subset of the provider's response we care about
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub id: u64,
    pub state: CommitState,
    pub context: String,
}
