//! Per-run dispatch task
//!
//! Each enqueued run gets one task that:
//! - waits for the run it superseded to finish
//! - waits for an execution slot (FIFO)
//! - arms the timeout once dispatched
//! - hands the run to the pipeline runner

use sluice_core::domain::pipeline::PipelineDefinition;
use sluice_core::domain::run::Run;
use std::sync::Arc;
use tokio::sync::{Semaphore, watch};
use tracing::{debug, warn};

use crate::cancel::{CancelReason, CancelSignal};
use crate::context::RunContext;
use crate::pipeline::PipelineRunner;

pub(super) struct Dispatch {
    pub def: Arc<PipelineDefinition>,
    pub run: Run,
    pub ctx: RunContext,
    pub signal: CancelSignal,
    pub predecessor: Option<watch::Receiver<Option<Run>>>,
}

/// Drives a run to its terminal state and returns it
///
/// Returns only after the superseded predecessor (if any) has finished.
pub(super) async fn drive(
    dispatch: Dispatch,
    runner: Arc<PipelineRunner>,
    slots: Arc<Semaphore>,
) -> Run {
    let Dispatch {
        def,
        run,
        ctx,
        signal,
        mut predecessor,
    } = dispatch;
    let cancel = ctx.cancel_token().clone();

    if let Some(prev) = predecessor.as_mut() {
        debug!("Run {} waiting for the run it superseded", run.id);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {}
            _ = prev.wait_for(Option::is_some) => {}
        }
    }

    let permit = if cancel.is_cancelled() {
        None
    } else {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = slots.acquire_owned() => permit.ok(),
        }
    };

    let finished = match permit {
        Some(_permit) => {
            let budget = def.timeout;
            let timer = tokio::spawn({
                let signal = signal.clone();
                let run_id = run.id;
                async move {
                    tokio::time::sleep(budget).await;
                    if signal.cancel(CancelReason::TimedOut { budget }) {
                        warn!("Run {} exceeded its {:?} budget", run_id, budget);
                    }
                }
            });

            let finished = runner.run(&def, run, &ctx).await;
            timer.abort();
            finished
        }
        None => {
            let reason = cancel.reason().unwrap_or(CancelReason::Shutdown);
            runner.abandon(&def, run, &ctx, reason)
        }
    };

    // A run that never started still completes only after its predecessor,
    // so successors never overlap a run that is still executing.
    if let Some(prev) = predecessor.as_mut() {
        let _ = prev.wait_for(Option::is_some).await;
    }

    finished
}
