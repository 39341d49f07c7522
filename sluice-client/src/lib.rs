//! Sluice Status Client
//!
//! A small, type-safe HTTP client for the source-hosting provider's
//! commit-status API (GitHub's `/repos/{owner}/{repo}/statuses/{sha}`).
//!
//! # Example
//!
//! ```no_run
//! use sluice_client::StatusClient;
//! use sluice_core::domain::status::{CommitState, CommitStatus};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), sluice_client::ClientError> {
//!     let client = StatusClient::new("https://api.github.com", "your-org/your-repo")
//!         .with_token("ghp_example");
//!
//!     client
//!         .create_status(&CommitStatus {
//!             commit_sha: "4f2a9c1".to_string(),
//!             context: "Lint".to_string(),
//!             state: CommitState::Pending,
//!             description: Some("Run queued".to_string()),
//!             target_url: None,
//!         })
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod error;
mod statuses;

pub use error::{ClientError, Result};

use reqwest::Client;
use serde::de::DeserializeOwned;

const USER_AGENT: &str = concat!("sluice/", env!("CARGO_PKG_VERSION"));

/// HTTP client for the commit-status API of one repository
#[derive(Debug, Clone)]
pub struct StatusClient {
    /// Base URL of the API (e.g., "https://api.github.com")
    base_url: String,
    /// Repository in "owner/name" form
    repository: String,
    /// Bearer token, if any
    token: Option<String>,
    /// HTTP client instance
    client: Client,
}

impl StatusClient {
    /// Create a new status client
    ///
    /// # Arguments
    /// * `base_url` - The base URL of the API (e.g., "https://api.github.com")
    /// * `repository` - The repository in "owner/name" form
    pub fn new(base_url: impl Into<String>, repository: impl Into<String>) -> Self {
        Self::with_client(base_url, repository, Client::new())
    }

    /// Create a new status client with a custom HTTP client
    ///
    /// This allows you to configure timeouts, proxies, TLS settings, etc.
    pub fn with_client(
        base_url: impl Into<String>,
        repository: impl Into<String>,
        client: Client,
    ) -> Self {
        let base_url = base_url.into();
        let repository = repository.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            repository: repository.trim_matches('/').to_string(),
            token: None,
            client,
        }
    }

    /// Authenticate requests with a bearer token
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Get the base URL of the API
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Get the repository this client reports to
    pub fn repository(&self) -> &str {
        &self.repository
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json");

        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Handle an API response and deserialize JSON
    ///
    /// This method checks the status code and returns an appropriate error if
    /// the request failed, or deserializes the response body if successful.
    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))
    }
}
