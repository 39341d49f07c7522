//! Runner configuration
//!
//! Defines all configurable parameters for the orchestrator: execution
//! capacity, workspace and artifact locations, output bounds, and commit-status
//! delivery settings.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// What happens to in-flight runs when the scheduler stops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPolicy {
    /// Let in-flight and queued runs finish
    Drain,
    /// Cancel everything that has not finished
    Cancel,
}

impl FromStr for ShutdownPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drain" => Ok(ShutdownPolicy::Drain),
            "cancel" => Ok(ShutdownPolicy::Cancel),
            other => anyhow::bail!("unknown shutdown policy '{}' (expected drain or cancel)", other),
        }
    }
}

/// Runner configuration
///
/// All limits are configurable to allow tuning for different deployment
/// scenarios (a laptop running one pipeline vs. a shared build host).
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of runs executing at the same time
    pub max_concurrent_runs: usize,

    /// Directory under which per-run working trees are created
    pub workspace_base: PathBuf,

    /// Directory under which collected artifacts are stored
    pub artifact_dir: PathBuf,

    /// Maximum bytes of output kept per step (the tail is kept)
    pub output_limit: usize,

    /// Container runtime binary
    pub container_binary: String,

    /// Commit-status API base URL (e.g., "https://api.github.com")
    pub status_api_url: String,

    /// Token for the commit-status API; publishing is disabled without it
    pub status_token: Option<String>,

    /// Repository statuses are reported to, in "owner/name" form
    pub repository: Option<String>,

    /// Delivery attempts per status before giving up
    pub publish_attempts: u32,

    /// Delay before the first retry; doubles on each further attempt
    pub publish_initial_backoff: Duration,

    /// Upper bound for the retry delay
    pub publish_max_backoff: Duration,

    /// What to do with in-flight runs on shutdown
    pub shutdown_policy: ShutdownPolicy,
}

impl Config {
    /// Creates a new configuration with defaults rooted at `base_dir`
    pub fn new(base_dir: PathBuf) -> Self {
        Self {
            max_concurrent_runs: 2,
            workspace_base: base_dir.join("workspaces"),
            artifact_dir: base_dir.join("artifacts"),
            output_limit: 64 * 1024,
            container_binary: "podman".to_string(),
            status_api_url: "https://api.github.com".to_string(),
            status_token: None,
            repository: None,
            publish_attempts: 3,
            publish_initial_backoff: Duration::from_millis(500),
            publish_max_backoff: Duration::from_secs(10),
            shutdown_policy: ShutdownPolicy::Drain,
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Recognized environment variables (all optional):
    /// - SLUICE_MAX_CONCURRENT_RUNS (default: 2)
    /// - SLUICE_WORKSPACE_BASE, SLUICE_ARTIFACT_DIR (default: under $TMPDIR/sluice)
    /// - SLUICE_OUTPUT_LIMIT (bytes, default: 65536)
    /// - SLUICE_CONTAINER_BINARY (default: podman)
    /// - SLUICE_STATUS_API_URL (default: https://api.github.com)
    /// - SLUICE_STATUS_TOKEN or GITHUB_TOKEN
    /// - SLUICE_REPOSITORY (owner/name)
    /// - SLUICE_PUBLISH_ATTEMPTS (default: 3)
    /// - SLUICE_PUBLISH_BACKOFF_MS (default: 500)
    /// - SLUICE_SHUTDOWN_POLICY (drain or cancel, default: drain)
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Config::from_env`], reading variables through `lookup`
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup("SLUICE_MAX_CONCURRENT_RUNS") {
            config.max_concurrent_runs = value
                .parse()
                .map_err(|_| anyhow::anyhow!("SLUICE_MAX_CONCURRENT_RUNS must be a number"))?;
        }

        if let Some(value) = lookup("SLUICE_WORKSPACE_BASE") {
            config.workspace_base = PathBuf::from(value);
        }

        if let Some(value) = lookup("SLUICE_ARTIFACT_DIR") {
            config.artifact_dir = PathBuf::from(value);
        }

        config.output_limit = lookup("SLUICE_OUTPUT_LIMIT")
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(config.output_limit);

        if let Some(value) = lookup("SLUICE_CONTAINER_BINARY") {
            config.container_binary = value;
        }

        if let Some(value) = lookup("SLUICE_STATUS_API_URL") {
            config.status_api_url = value;
        }

        config.status_token = lookup("SLUICE_STATUS_TOKEN")
            .or_else(|| lookup("GITHUB_TOKEN"))
            .filter(|token| !token.trim().is_empty());

        config.repository = lookup("SLUICE_REPOSITORY").filter(|repo| !repo.trim().is_empty());

        config.publish_attempts = lookup("SLUICE_PUBLISH_ATTEMPTS")
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(config.publish_attempts);

        config.publish_initial_backoff = lookup("SLUICE_PUBLISH_BACKOFF_MS")
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(config.publish_initial_backoff);

        if let Some(value) = lookup("SLUICE_SHUTDOWN_POLICY") {
            config.shutdown_policy = value.parse()?;
        }

        Ok(config)
    }

    /// Overrides the concurrency limit
    pub fn with_max_concurrent_runs(mut self, max: usize) -> Self {
        self.max_concurrent_runs = max;
        self
    }

    /// Enables status publishing for a repository
    pub fn with_status_publishing(mut self, repository: String, token: String) -> Self {
        self.repository = Some(repository);
        self.status_token = Some(token);
        self
    }

    /// Whether commit statuses should be sent to the provider
    pub fn publishing_enabled(&self) -> bool {
        self.status_token.is_some() && self.repository.is_some()
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_concurrent_runs == 0 {
            anyhow::bail!("max_concurrent_runs must be greater than 0");
        }

        if self.output_limit == 0 {
            anyhow::bail!("output_limit must be greater than 0");
        }

        if self.container_binary.trim().is_empty() {
            anyhow::bail!("container_binary cannot be empty");
        }

        if !self.status_api_url.starts_with("http://")
            && !self.status_api_url.starts_with("https://")
        {
            anyhow::bail!("status_api_url must start with http:// or https://");
        }

        if self.publish_attempts == 0 {
            anyhow::bail!("publish_attempts must be greater than 0");
        }

        if let Some(repo) = &self.repository {
            let mut parts = repo.split('/');
            let valid = matches!(
                (parts.next(), parts.next(), parts.next()),
                (Some(owner), Some(name), None) if !owner.is_empty() && !name.is_empty()
            );
            if !valid {
                anyhow::bail!("repository must be in owner/name form, got '{}'", repo);
            }
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(std::env::temp_dir().join("sluice"))
    }
}
