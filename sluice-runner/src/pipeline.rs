//! Pipeline runner
//!
//! Drives one run from Queued to a terminal state: publishes pending, prepares
//! the working tree, executes steps in order until the first failure, collects
//! artifacts on success and always publishes the terminal status.

use sluice_core::domain::event::RunEventKind;
use sluice_core::domain::pipeline::PipelineDefinition;
use sluice_core::domain::run::{Run, RunState};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::artifacts::ArtifactCollector;
use crate::cancel::CancelReason;
use crate::context::RunContext;
use crate::error::TimeoutError;
use crate::executor::{StepExecutor, StepOutcome};
use crate::publisher::StatusPublisher;
use crate::workspace::WorkspaceProvider;

/// How the step loop ended
enum StepsOutcome {
    Passed,
    Failed,
    Interrupted(CancelReason),
}

pub struct PipelineRunner {
    executor: StepExecutor,
    workspace: Arc<dyn WorkspaceProvider>,
    artifacts: ArtifactCollector,
    publisher: StatusPublisher,
}

impl PipelineRunner {
    pub fn new(
        executor: StepExecutor,
        workspace: Arc<dyn WorkspaceProvider>,
        artifacts: ArtifactCollector,
        publisher: StatusPublisher,
    ) -> Self {
        Self {
            executor,
            workspace,
            artifacts,
            publisher,
        }
    }

    pub fn publisher(&self) -> &StatusPublisher {
        &self.publisher
    }

    /// Executes a queued run and returns it in a terminal state
    pub async fn run(&self, def: &PipelineDefinition, mut run: Run, ctx: &RunContext) -> Run {
        let cancel = ctx.cancel_token();
        if let Some(reason) = cancel.reason() {
            return self.abandon(def, run, ctx, reason);
        }

        if let Err(e) = run.transition(RunState::Running) {
            error!("Run {} cannot start: {}", run.id, e);
            return run;
        }
        ctx.set_state(RunState::Running);
        self.publisher.publish_run(&run, &def.status_context);
        info!(
            "Run {} of '{}' started for {} at {}",
            run.id, def.name, run.git_ref, run.commit_sha
        );

        let prepared = tokio::select! {
            biased;
            reason = cancel.cancelled() => Err(reason),
            prepared = self.workspace.prepare(&run) => Ok(prepared),
        };

        let (state, reason) = match prepared {
            Err(reason) => interrupted(reason),
            Ok(Err(e)) => {
                ctx.log_error(format!("Workspace preparation failed: {}", e));
                (RunState::Failed, Some(e.to_string()))
            }
            Ok(Ok(workdir)) => match self.execute_steps(def, &mut run, workdir, ctx).await {
                StepsOutcome::Passed => (RunState::Succeeded, None),
                StepsOutcome::Failed => (RunState::Failed, None),
                StepsOutcome::Interrupted(reason) => interrupted(reason),
            },
        };

        self.workspace.release(&run).await;
        self.complete(def, run, ctx, state, reason)
    }

    /// Ends a run that never started executing
    pub fn abandon(
        &self,
        def: &PipelineDefinition,
        run: Run,
        ctx: &RunContext,
        reason: CancelReason,
    ) -> Run {
        let (state, message) = interrupted(reason);
        let state = if run.state.can_transition_to(state) {
            state
        } else {
            RunState::Cancelled
        };
        self.complete(def, run, ctx, state, message)
    }

    async fn execute_steps(
        &self,
        def: &PipelineDefinition,
        run: &mut Run,
        workdir: PathBuf,
        ctx: &RunContext,
    ) -> StepsOutcome {
        let cancel = ctx.cancel_token();
        let forward_output = |line: &str| ctx.log_info(line);

        for step in &def.steps {
            if let Some(reason) = cancel.reason() {
                return StepsOutcome::Interrupted(reason);
            }

            ctx.emit(RunEventKind::StepStarted {
                index: step.position,
                name: step.name.clone(),
            });

            let result = match self
                .executor
                .execute(step, run.id, &workdir, cancel, &forward_output)
                .await
            {
                StepOutcome::Completed(result) => result,
                StepOutcome::Interrupted(reason) => return StepsOutcome::Interrupted(reason),
            };

            let passed = result.passed();
            if let Some(e) = &result.execution_error {
                ctx.log_error(format!("Step '{}' could not run: {}", step.name, e));
            } else if !passed {
                ctx.log_error(format!(
                    "Step '{}' exited with code {}",
                    step.name, result.exit_code
                ));
            }

            ctx.emit(RunEventKind::StepFinished(result.clone()));
            if let Err(e) = run.record_step(result) {
                warn!("Dropping result of step '{}': {}", step.name, e);
            }

            if !passed {
                return StepsOutcome::Failed;
            }
        }

        if !def.artifact_rules.is_empty() {
            let collector = self.artifacts.clone();
            let rules = def.artifact_rules.clone();
            let run_id = run.id;
            let collected =
                tokio::task::spawn_blocking(move || collector.collect(run_id, &workdir, &rules))
                    .await;

            match collected {
                Ok(artifacts) => {
                    if let Err(e) = run.record_artifacts(artifacts) {
                        warn!("Cannot record artifacts of run {}: {}", run.id, e);
                    }
                }
                Err(e) => {
                    warn!("Artifact collection for run {} panicked: {}", run.id, e);
                    ctx.log_warning("Artifact collection failed");
                }
            }
        }

        StepsOutcome::Passed
    }

    fn complete(
        &self,
        def: &PipelineDefinition,
        mut run: Run,
        ctx: &RunContext,
        state: RunState,
        reason: Option<String>,
    ) -> Run {
        if let Err(e) = run.finish(state, reason) {
            error!("Run {} cannot move to {}: {}", run.id, state, e);
            return run;
        }

        ctx.set_state(state);
        self.publisher.publish_run(&run, &def.status_context);

        match &run.error_message {
            Some(message) => info!("Run {} of '{}' ended {}: {}", run.id, def.name, state, message),
            None => info!("Run {} of '{}' ended {}", run.id, def.name, state),
        }
        run
    }
}

/// Terminal state and message for an interrupted run
fn interrupted(reason: CancelReason) -> (RunState, Option<String>) {
    match reason {
        CancelReason::TimedOut { budget } => (
            RunState::TimedOut,
            Some(TimeoutError { budget }.to_string()),
        ),
        CancelReason::Superseded { .. } | CancelReason::Shutdown => {
            (RunState::Cancelled, Some(reason.to_string()))
        }
    }
}
