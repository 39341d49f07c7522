//! Run scheduler
//!
//! The single entry point for trigger events. Matching pipelines become runs
//! keyed by (pipeline, ref); a newer trigger for a key supersedes the active
//! run for it. Runs are dispatched to a bounded number of execution slots in
//! arrival order, and each one is held to its pipeline's timeout budget.

mod dispatcher;

use sluice_core::domain::event::{RunEvent, RunEventKind, TriggerEvent};
use sluice_core::domain::pipeline::PipelineDefinition;
use sluice_core::domain::run::{Run, RunState};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Semaphore, broadcast, watch};
use tracing::{info, warn};
use uuid::Uuid;

use crate::cancel::{CancelReason, CancelSignal};
use crate::config::{Config, ShutdownPolicy};
use crate::context::RunContext;
use crate::definitions::DefinitionSet;
use crate::error::SchedulerError;
use crate::pipeline::PipelineRunner;
use dispatcher::Dispatch;

const EVENT_CAPACITY: usize = 1024;

/// Observer's view of one run
#[derive(Debug, Clone)]
pub struct RunHandle {
    pub id: Uuid,
    pub pipeline: String,
    pub git_ref: String,
    state: watch::Receiver<RunState>,
    done: watch::Receiver<Option<Run>>,
}

impl RunHandle {
    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    /// Waits for the run to finish and returns it
    pub async fn wait(&self) -> Result<Run, SchedulerError> {
        let mut done = self.done.clone();
        let finished = done.wait_for(Option::is_some).await.ok().and_then(|r| r.clone());
        finished.ok_or(SchedulerError::RunLost(self.id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RunKey {
    pipeline: String,
    git_ref: String,
}

struct ActiveRun {
    handle: RunHandle,
    cancel: CancelSignal,
}

struct Inner {
    definitions: DefinitionSet,
    runner: Arc<PipelineRunner>,
    slots: Arc<Semaphore>,
    events: broadcast::Sender<RunEvent>,
    state: Mutex<State>,
}

struct State {
    accepting: bool,
    active: HashMap<RunKey, ActiveRun>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cheap to clone; all clones share the same queue
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn start(config: &Config, definitions: DefinitionSet, runner: Arc<PipelineRunner>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        info!(
            "Scheduler started for project '{}' with {} pipeline(s), {} slot(s)",
            definitions.project(),
            definitions.pipelines().len(),
            config.max_concurrent_runs
        );

        Self {
            inner: Arc::new(Inner {
                definitions,
                runner,
                slots: Arc::new(Semaphore::new(config.max_concurrent_runs)),
                events,
                state: Mutex::new(State {
                    accepting: true,
                    active: HashMap::new(),
                }),
            }),
        }
    }

    pub fn definitions(&self) -> &DefinitionSet {
        &self.inner.definitions
    }

    /// Stream of run transitions; slow subscribers may lag and miss events
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.inner.events.subscribe()
    }

    /// Evaluates an event against the loaded definitions and enqueues a run
    /// for every match
    pub fn handle_event(&self, event: &TriggerEvent) -> Vec<RunHandle> {
        let matching = self.inner.definitions.matching(event);
        if matching.is_empty() {
            info!("No pipeline matches {} at {}", event.git_ref, event.commit_sha);
            return Vec::new();
        }

        let mut handles = Vec::with_capacity(matching.len());
        for def in matching {
            match self.enqueue(def, event) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    warn!("Dropping event for {}: {}", event.git_ref, e);
                    break;
                }
            }
        }
        handles
    }

    /// Queues a run of `def` for the event's commit
    ///
    /// Any active run for the same pipeline and ref is cancelled; the new run
    /// starts only once it has finished.
    pub fn enqueue(
        &self,
        def: Arc<PipelineDefinition>,
        event: &TriggerEvent,
    ) -> Result<RunHandle, SchedulerError> {
        let run = Run::new(&def.name, &event.commit_sha, &event.git_ref, def.steps.len());
        let key = RunKey {
            pipeline: def.name.clone(),
            git_ref: event.git_ref.clone(),
        };

        let signal = CancelSignal::new();
        let (state_tx, state_rx) = watch::channel(RunState::Queued);
        let (done_tx, done_rx) = watch::channel(None);
        let handle = RunHandle {
            id: run.id,
            pipeline: def.name.clone(),
            git_ref: event.git_ref.clone(),
            state: state_rx,
            done: done_rx,
        };

        let predecessor = {
            let mut state = self.inner.lock();
            if !state.accepting {
                return Err(SchedulerError::ShuttingDown);
            }

            let replaced = state.active.insert(
                key,
                ActiveRun {
                    handle: handle.clone(),
                    cancel: signal.clone(),
                },
            );

            replaced.map(|prev| {
                if prev.cancel.cancel(CancelReason::Superseded { by: run.id }) {
                    info!(
                        "Run {} of '{}' on {} superseded by {}",
                        prev.handle.id, def.name, event.git_ref, run.id
                    );
                    let _ = self.inner.events.send(RunEvent::new(
                        prev.handle.id,
                        &def.name,
                        &event.git_ref,
                        RunEventKind::Superseded { by: run.id },
                    ));
                }
                prev.handle.done
            })
        };

        let ctx = RunContext::new(
            run.id,
            &def.name,
            &event.git_ref,
            self.inner.events.clone(),
            state_tx,
            signal.token(),
        );
        ctx.emit(RunEventKind::Queued);
        info!(
            "Queued run {} of '{}' for {} at {}",
            run.id, def.name, event.git_ref, event.commit_sha
        );

        let dispatch = Dispatch {
            def,
            run,
            ctx,
            signal,
            predecessor,
        };
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let key = RunKey {
                pipeline: dispatch.def.name.clone(),
                git_ref: dispatch.run.git_ref.clone(),
            };
            let finished =
                dispatcher::drive(dispatch, Arc::clone(&inner.runner), Arc::clone(&inner.slots))
                    .await;

            {
                let mut state = inner.lock();
                if state.active.get(&key).map(|a| a.handle.id) == Some(finished.id) {
                    state.active.remove(&key);
                }
            }
            done_tx.send_replace(Some(finished));
        });

        Ok(handle)
    }

    /// Runs that have not finished yet, including queued ones
    pub fn active_runs(&self) -> Vec<RunHandle> {
        self.inner
            .lock()
            .active
            .values()
            .map(|a| a.handle.clone())
            .collect()
    }

    /// Stops accepting events and winds down according to `policy`
    ///
    /// Returns once every run has finished and all statuses were handed to
    /// the provider.
    pub async fn shutdown(&self, policy: ShutdownPolicy) {
        let pending: Vec<RunHandle> = {
            let mut state = self.inner.lock();
            state.accepting = false;

            if policy == ShutdownPolicy::Cancel {
                for active in state.active.values() {
                    active.cancel.cancel(CancelReason::Shutdown);
                }
            }
            state.active.values().map(|a| a.handle.clone()).collect()
        };

        info!(
            "Shutting down ({:?}), waiting for {} run(s)",
            policy,
            pending.len()
        );
        for handle in pending {
            if let Err(e) = handle.wait().await {
                warn!("{}", e);
            }
        }

        self.inner.runner.publisher().flush().await;
        info!("Scheduler stopped");
    }
}
