//! Configuration module
//!
//! The CLI runs pipelines with the runner's configuration, read from the
//! environment, with command-line flags taking precedence.

use anyhow::{Context, Result};
use sluice_runner::Config;

/// Builds the runner configuration for this invocation
pub fn load(max_concurrent_runs: Option<usize>) -> Result<Config> {
    let mut config = Config::from_env().context("Invalid SLUICE_* environment")?;

    if let Some(max) = max_concurrent_runs {
        config = config.with_max_concurrent_runs(max);
    }

    config.validate()?;
    Ok(config)
}
