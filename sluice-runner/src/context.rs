//! Execution context for a single run
//!
//! Carries what the pipeline runner needs while it owns a run:
//! - the event stream observers subscribe to
//! - a watch on the run's current state, read by run handles
//! - the cancellation token for the run

use sluice_core::domain::event::{RunEvent, RunEventKind};
use sluice_core::domain::log::LogEntry;
use sluice_core::domain::run::RunState;
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use crate::cancel::CancelToken;

pub struct RunContext {
    run_id: Uuid,
    pipeline: String,
    git_ref: String,
    events: broadcast::Sender<RunEvent>,
    state: watch::Sender<RunState>,
    cancel: CancelToken,
}

impl RunContext {
    pub fn new(
        run_id: Uuid,
        pipeline: impl Into<String>,
        git_ref: impl Into<String>,
        events: broadcast::Sender<RunEvent>,
        state: watch::Sender<RunState>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            run_id,
            pipeline: pipeline.into(),
            git_ref: git_ref.into(),
            events,
            state,
            cancel,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Broadcasts an event; having no subscribers is fine
    pub fn emit(&self, kind: RunEventKind) {
        let event = RunEvent::new(self.run_id, &self.pipeline, &self.git_ref, kind);
        let _ = self.events.send(event);
    }

    /// Records a state change and announces it
    pub fn set_state(&self, state: RunState) {
        self.state.send_replace(state);
        self.emit(RunEventKind::StateChanged(state));
    }

    pub fn log(&self, entry: LogEntry) {
        self.emit(RunEventKind::Log(entry));
    }

    pub fn log_info(&self, message: impl Into<String>) {
        self.log(LogEntry::info(message));
    }

    pub fn log_warning(&self, message: impl Into<String>) {
        self.log(LogEntry::warning(message));
    }

    pub fn log_error(&self, message: impl Into<String>) {
        self.log(LogEntry::error(message));
    }
}

#[cfg(test)]
impl RunContext {
    /// Context wired to fresh channels, returning the receiving ends
    pub(crate) fn detached(
        run_id: Uuid,
        cancel: CancelToken,
    ) -> (Self, broadcast::Receiver<RunEvent>, watch::Receiver<RunState>) {
        let (events, events_rx) = broadcast::channel(256);
        let (state, state_rx) = watch::channel(RunState::Queued);
        let ctx = Self::new(run_id, "test", "refs/heads/main", events, state, cancel);
        (ctx, events_rx, state_rx)
    }
}
