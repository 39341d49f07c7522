//! Podman container runtime
//!
//! Each step gets a fresh `podman run --rm` container:
//! - the image is pulled first when it is not present locally
//! - the working tree is mounted at `/workspace`
//! - the script runs through `/bin/sh -c`, overriding any image entrypoint
//! - stdout and stderr are merged line by line into a bounded buffer

use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{BoundedOutput, ContainerOutput, ContainerRequest, ContainerRuntime, LineSink};
use crate::error::ExecutionError;

/// Exit code podman uses when it could not create or start the container.
/// A script can exit with it too, so it only counts together with a podman
/// `Error:` line on stderr.
const PODMAN_START_FAILURE: i32 = 125;

const PODMAN_ERROR_PREFIX: &str = "Error: ";

/// Runs steps with the podman CLI
#[derive(Debug, Clone)]
pub struct PodmanRuntime {
    binary: String,
}

impl PodmanRuntime {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Checks that the binary is installed and working, returning its version
    pub async fn check_available(&self) -> Result<String, ExecutionError> {
        let output = Command::new(&self.binary)
            .arg("--version")
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        if !output.status.success() {
            return Err(ExecutionError::Runtime {
                name: self.binary.clone(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!("Container runtime is available: {}", version);
        Ok(version)
    }

    /// Pulls `image` unless it already exists locally
    async fn ensure_image(&self, image: &str) -> Result<(), ExecutionError> {
        let exists = Command::new(&self.binary)
            .args(["image", "exists", image])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| self.spawn_error(e))?;

        if exists.success() {
            debug!("Image {} already present", image);
            return Ok(());
        }

        info!("Pulling image {}", image);
        let output = Command::new(&self.binary)
            .args(["pull", "--quiet", image])
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        if !output.status.success() {
            return Err(ExecutionError::ImagePull {
                image: image.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(())
    }

    fn run_args(request: &ContainerRequest) -> Vec<String> {
        vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            request.name.clone(),
            "-v".to_string(),
            format!("{}:/workspace", request.workdir.display()),
            "-w".to_string(),
            "/workspace".to_string(),
            "--entrypoint".to_string(),
            "/bin/sh".to_string(),
            request.image.clone(),
            "-c".to_string(),
            request.script.clone(),
        ]
    }

    fn spawn_error(&self, e: std::io::Error) -> ExecutionError {
        ExecutionError::Spawn {
            binary: self.binary.clone(),
            message: e.to_string(),
        }
    }
}

#[async_trait]
impl ContainerRuntime for PodmanRuntime {
    async fn run(
        &self,
        request: &ContainerRequest,
        on_line: &LineSink<'_>,
    ) -> Result<ContainerOutput, ExecutionError> {
        self.ensure_image(&request.image).await?;

        debug!("Starting container {} from {}", request.name, request.image);
        let mut child = Command::new(&self.binary)
            .args(Self::run_args(request))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        let missing_pipe = || ExecutionError::Runtime {
            name: request.name.clone(),
            message: "container output pipe unavailable".to_string(),
        };
        let mut stdout = BufReader::new(child.stdout.take().ok_or_else(missing_pipe)?).split(b'\n');
        let mut stderr = BufReader::new(child.stderr.take().ok_or_else(missing_pipe)?).split(b'\n');

        let mut buffer = BoundedOutput::new(request.output_limit);
        let (mut stdout_done, mut stderr_done) = (false, false);
        let mut runtime_error = None;

        while !(stdout_done && stderr_done) {
            let (from_stdout, segment) = tokio::select! {
                s = stdout.next_segment(), if !stdout_done => (true, s),
                s = stderr.next_segment(), if !stderr_done => (false, s),
            };

            match segment {
                Ok(Some(bytes)) => {
                    let line = String::from_utf8_lossy(&bytes);
                    let line = line.trim_end_matches('\r');
                    if !from_stdout && line.starts_with(PODMAN_ERROR_PREFIX) {
                        runtime_error = Some(line.to_string());
                    }
                    on_line(line);
                    buffer.push_line(line);
                    continue;
                }
                Ok(None) => {}
                Err(e) => warn!("Error reading output of {}: {}", request.name, e),
            }

            if from_stdout {
                stdout_done = true;
            } else {
                stderr_done = true;
            }
        }

        let status = child.wait().await.map_err(|e| ExecutionError::Runtime {
            name: request.name.clone(),
            message: e.to_string(),
        })?;
        let exit_code = status.code().unwrap_or(-1);
        let (output, truncated) = buffer.finish();

        if let Some(message) = start_failure(exit_code, runtime_error) {
            return Err(ExecutionError::ContainerStart {
                image: request.image.clone(),
                message,
            });
        }

        debug!("Container {} exited with {}", request.name, exit_code);
        Ok(ContainerOutput {
            exit_code,
            output,
            truncated,
        })
    }

    async fn kill(&self, name: &str) -> Result<(), ExecutionError> {
        let output = Command::new(&self.binary)
            .args(["rm", "-f", name])
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        if output.status.success() {
            debug!("Container {} removed", name);
        } else {
            // `run --rm` usually got there first
            debug!(
                "podman rm -f {}: {}",
                name,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

/// Podman's own error message when it failed to start the container
fn start_failure(exit_code: i32, runtime_error: Option<String>) -> Option<String> {
    if exit_code != PODMAN_START_FAILURE {
        return None;
    }
    runtime_error.map(|line| line.trim_start_matches(PODMAN_ERROR_PREFIX).to_string())
}
