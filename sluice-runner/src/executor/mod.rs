//! Step execution
//!
//! Runs one step in its own container and turns the outcome into a
//! `StepResult`. The container runtime sits behind [`ContainerRuntime`] so the
//! rest of the runner never talks to podman directly.

mod podman;

pub use podman::PodmanRuntime;

use async_trait::async_trait;
use sluice_core::domain::pipeline::StepSpec;
use sluice_core::domain::run::StepResult;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cancel::{CancelReason, CancelToken};
use crate::error::ExecutionError;

/// Everything a runtime needs to execute one step
#[derive(Debug, Clone)]
pub struct ContainerRequest {
    /// Unique container name, used to kill it from outside
    pub name: String,
    pub image: String,
    pub script: String,

    /// Host directory mounted read-write at `/workspace`
    pub workdir: PathBuf,

    /// Bytes of output to keep; older output is dropped first
    pub output_limit: usize,
}

/// What a container produced before exiting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerOutput {
    pub exit_code: i32,
    pub output: String,
    pub truncated: bool,
}

/// Receives each line of container output as it arrives
pub type LineSink<'s> = dyn for<'a> Fn(&'a str) + Send + Sync + 's;

/// Container runtime abstraction
///
/// `run` must tear the container down before returning. If the returned
/// future is dropped the caller follows up with `kill`.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Runs the script to completion, feeding each output line to `on_line`
    async fn run(
        &self,
        request: &ContainerRequest,
        on_line: &LineSink<'_>,
    ) -> Result<ContainerOutput, ExecutionError>;

    /// Forcefully stops and removes a container by name
    async fn kill(&self, name: &str) -> Result<(), ExecutionError>;
}

/// Output buffer that keeps the most recent `limit` bytes
#[derive(Debug)]
pub struct BoundedOutput {
    buf: String,
    limit: usize,
    truncated: bool,
}

impl BoundedOutput {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: String::new(),
            limit,
            truncated: false,
        }
    }

    pub fn push_line(&mut self, line: &str) {
        self.buf.push_str(line);
        self.buf.push('\n');

        if self.buf.len() > self.limit {
            let mut cut = self.buf.len() - self.limit;
            while !self.buf.is_char_boundary(cut) {
                cut += 1;
            }
            self.buf.drain(..cut);
            self.truncated = true;
        }
    }

    pub fn as_str(&self) -> &str {
        &self.buf
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn finish(self) -> (String, bool) {
        (self.buf, self.truncated)
    }
}

/// How a step ended
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// The step ran (or failed to start); its result belongs in the run
    Completed(StepResult),

    /// The run was cancelled while the step was executing; no result is kept
    Interrupted(CancelReason),
}

/// Executes steps through a container runtime
#[derive(Clone)]
pub struct StepExecutor {
    runtime: Arc<dyn ContainerRuntime>,
    output_limit: usize,
}

impl StepExecutor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, output_limit: usize) -> Self {
        Self {
            runtime,
            output_limit,
        }
    }

    /// Container name for a step of a run
    pub fn container_name(run_id: Uuid, step: &StepSpec) -> String {
        format!("sluice-{}-{}", run_id, step.position)
    }

    /// Executes one step in `workdir`
    ///
    /// Execution errors (image pull, container start) complete the step with
    /// exit code -1 and `execution_error` set. Cancellation kills the container
    /// and yields [`StepOutcome::Interrupted`].
    pub async fn execute(
        &self,
        step: &StepSpec,
        run_id: Uuid,
        workdir: &Path,
        cancel: &CancelToken,
        on_line: &LineSink<'_>,
    ) -> StepOutcome {
        let request = ContainerRequest {
            name: Self::container_name(run_id, step),
            image: step.image.clone(),
            script: step.script.clone(),
            workdir: workdir.to_path_buf(),
            output_limit: self.output_limit,
        };

        info!(
            "Executing step '{}' of run {} in {}",
            step.name, run_id, step.image
        );
        let started = Instant::now();

        let result = tokio::select! {
            biased;
            reason = cancel.cancelled() => Err(reason),
            result = self.runtime.run(&request, on_line) => Ok(result),
        };

        match result {
            Err(reason) => {
                info!("Step '{}' of run {} interrupted: {}", step.name, run_id, reason);
                if let Err(e) = self.runtime.kill(&request.name).await {
                    warn!("Failed to kill container {}: {}", request.name, e);
                }
                StepOutcome::Interrupted(reason)
            }
            Ok(Ok(output)) => {
                debug!(
                    "Step '{}' exited with {} after {:?}",
                    step.name,
                    output.exit_code,
                    started.elapsed()
                );
                StepOutcome::Completed(StepResult {
                    name: step.name.clone(),
                    exit_code: output.exit_code,
                    output: output.output,
                    output_truncated: output.truncated,
                    duration: started.elapsed(),
                    execution_error: None,
                })
            }
            Ok(Err(e)) => {
                warn!("Step '{}' could not execute: {}", step.name, e);
                StepOutcome::Completed(StepResult {
                    name: step.name.clone(),
                    exit_code: -1,
                    output: String::new(),
                    output_truncated: false,
                    duration: started.elapsed(),
                    execution_error: Some(e.to_string()),
                })
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{Behavior, FakeRuntime};
    use super::*;
    use crate::cancel::CancelSignal;
    use std::sync::Mutex;
    use std::time::Duration;

    fn step(position: usize, script: &str) -> StepSpec {
        StepSpec {
            position,
            name: format!("step-{}", position),
            image: "node:20-alpine".to_string(),
            script: script.to_string(),
        }
    }

    fn ignore_lines(_: &str) {}

    #[test]
    fn test_bounded_output_keeps_tail() {
        let mut out = BoundedOutput::new(10);
        out.push_line("12345");
        assert!(!out.is_truncated());
        out.push_line("abcdef");
        assert!(out.is_truncated());
        assert_eq!(out.as_str(), "45\nabcdef\n");
    }

    #[test]
    fn test_bounded_output_respects_char_boundaries() {
        let mut out = BoundedOutput::new(4);
        out.push_line("ééé");
        let (text, truncated) = out.finish();
        assert!(truncated);
        assert!(text.len() <= 4);
        assert!(text.ends_with('\n'));
    }

    #[tokio::test]
    async fn test_execute_success_captures_output() {
        let runtime = Arc::new(FakeRuntime::new().on(
            "npm test",
            Behavior::Exit {
                code: 0,
                output: vec!["ok 1".to_string(), "ok 2".to_string()],
            },
        ));
        let executor = StepExecutor::new(runtime.clone(), 1024);
        let seen = Mutex::new(Vec::new());
        let collect = |line: &str| seen.lock().unwrap().push(line.to_string());

        let outcome = executor
            .execute(
                &step(0, "npm test"),
                Uuid::new_v4(),
                Path::new("/tmp"),
                &CancelToken::never(),
                &collect,
            )
            .await;

        let StepOutcome::Completed(result) = outcome else {
            panic!("step should complete");
        };
        assert!(result.passed());
        assert_eq!(result.output, "ok 1\nok 2\n");
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_execute_maps_execution_error() {
        let runtime = Arc::new(FakeRuntime::new().on(
            "npm ci",
            Behavior::Fail(ExecutionError::ImagePull {
                image: "node:20-alpine".to_string(),
                message: "manifest unknown".to_string(),
            }),
        ));
        let executor = StepExecutor::new(runtime, 1024);

        let outcome = executor
            .execute(
                &step(0, "npm ci"),
                Uuid::new_v4(),
                Path::new("/tmp"),
                &CancelToken::never(),
                &ignore_lines,
            )
            .await;

        let StepOutcome::Completed(result) = outcome else {
            panic!("step should complete");
        };
        assert_eq!(result.exit_code, -1);
        assert!(!result.passed());
        assert!(result.execution_error.unwrap().contains("manifest unknown"));
    }

    #[tokio::test]
    async fn test_cancel_kills_container() {
        let runtime = Arc::new(
            FakeRuntime::new().on("sleep 300", Behavior::Sleep(Duration::from_secs(300))),
        );
        let executor = StepExecutor::new(runtime.clone(), 1024);
        let signal = CancelSignal::new();
        let token = signal.token();
        let run_id = Uuid::new_v4();
        let spec = step(0, "sleep 300");

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            signal.cancel(CancelReason::Shutdown);
        });

        let outcome = executor
            .execute(&spec, run_id, Path::new("/tmp"), &token, &ignore_lines)
            .await;
        canceller.await.unwrap();

        assert!(matches!(
            outcome,
            StepOutcome::Interrupted(CancelReason::Shutdown)
        ));
        assert_eq!(
            runtime.killed(),
            vec![StepExecutor::container_name(run_id, &spec)]
        );
    }

    #[tokio::test]
    async fn test_already_cancelled_never_completes() {
        let runtime = Arc::new(FakeRuntime::new());
        let executor = StepExecutor::new(runtime, 1024);
        let signal = CancelSignal::new();
        signal.cancel(CancelReason::Shutdown);

        let outcome = executor
            .execute(
                &step(0, "true"),
                Uuid::new_v4(),
                Path::new("/tmp"),
                &signal.token(),
                &ignore_lines,
            )
            .await;
        assert!(matches!(outcome, StepOutcome::Interrupted(_)));
    }
}
