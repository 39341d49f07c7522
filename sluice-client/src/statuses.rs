//! Commit status endpoints

use crate::StatusClient;
use crate::error::{ClientError, Result};
use sluice_core::domain::status::CommitStatus;
use sluice_core::dto::status::{CreateStatus, StatusResponse};
use tracing::debug;

impl StatusClient {
    /// Create a status for a commit
    ///
    /// # Arguments
    /// * `status` - The commit, context and state to report
    ///
    /// # Returns
    /// The status as recorded by the provider
    pub async fn create_status(&self, status: &CommitStatus) -> Result<StatusResponse> {
        if status.commit_sha.trim().is_empty() {
            return Err(ClientError::InvalidRequest(
                "commit sha cannot be empty".to_string(),
            ));
        }

        let url = self.statuses_url(&status.commit_sha);
        debug!(
            "Posting status {} for context '{}' to {}",
            status.state, status.context, url
        );

        let response = self
            .request(reqwest::Method::POST, &url)
            .json(&CreateStatus::from(status))
            .send()
            .await?;

        self.handle_response(response).await
    }

    pub(crate) fn statuses_url(&self, commit_sha: &str) -> String {
        format!(
            "{}/repos/{}/statuses/{}",
            self.base_url(),
            self.repository(),
            commit_sha
        )
    }
}
