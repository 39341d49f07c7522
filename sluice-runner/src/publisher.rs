//! Commit status publishing
//!
//! Runs report to the provider through a single background worker so that
//! updates for a commit arrive in the order they were produced and never
//! hold up the run itself. Delivery failures are logged and dropped.

use async_trait::async_trait;
use sluice_client::StatusClient;
use sluice_core::domain::run::{Run, RunState};
use sluice_core::domain::status::{CommitState, CommitStatus, StatusKey};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::PublishError;

/// Delivers one status to the provider, without retrying
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn deliver(&self, status: &CommitStatus) -> Result<(), PublishError>;
}

/// Sink backed by the GitHub commit status API
pub struct GitHubStatusSink {
    client: StatusClient,
}

impl GitHubStatusSink {
    pub fn new(client: StatusClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StatusSink for GitHubStatusSink {
    async fn deliver(&self, status: &CommitStatus) -> Result<(), PublishError> {
        let response = self.client.create_status(status).await?;
        debug!(
            "Provider recorded status {} ({}) for context '{}'",
            response.id, response.state, response.context
        );
        Ok(())
    }
}

/// Sink used when no provider is configured
pub struct NoopStatusSink;

#[async_trait]
impl StatusSink for NoopStatusSink {
    async fn deliver(&self, status: &CommitStatus) -> Result<(), PublishError> {
        debug!(
            "Status publishing disabled, dropping {} for '{}' on {}",
            status.state, status.context, status.commit_sha
        );
        Ok(())
    }
}

/// Bounded exponential backoff for transient delivery failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            attempts: config.publish_attempts.max(1),
            initial_backoff: config.publish_initial_backoff,
            max_backoff: config.publish_max_backoff,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
        }
    }
}

enum Command {
    Publish(CommitStatus),
    Flush(oneshot::Sender<()>),
}

/// Handle to the publishing worker; cheap to clone
#[derive(Clone)]
pub struct StatusPublisher {
    tx: mpsc::UnboundedSender<Command>,
}

impl StatusPublisher {
    /// Starts the worker on the current runtime
    pub fn spawn(sink: Arc<dyn StatusSink>, policy: RetryPolicy) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(worker(rx, sink, policy));
        Self { tx }
    }

    /// Queues a status for delivery and returns immediately
    pub fn publish(&self, status: CommitStatus) {
        if self.tx.send(Command::Publish(status)).is_err() {
            warn!("Status publisher has stopped, dropping status");
        }
    }

    /// Queues the status matching the run's current state
    pub fn publish_run(&self, run: &Run, context: &str) {
        self.publish(CommitStatus {
            commit_sha: run.commit_sha.clone(),
            context: context.to_string(),
            state: CommitState::from(run.state),
            description: Some(describe(run)),
            target_url: None,
        });
    }

    /// Waits until everything queued before this call has been handled
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

/// Short human-readable summary shown next to the status
pub fn describe(run: &Run) -> String {
    match run.state {
        RunState::Queued => "Queued".to_string(),
        RunState::Running => "Running".to_string(),
        RunState::Succeeded => format!("Passed {} step(s)", run.steps.len()),
        RunState::Failed => match run.steps.last() {
            Some(step) if step.execution_error.is_some() => {
                format!("Step '{}' could not run", step.name)
            }
            Some(step) if !step.passed() => {
                format!("Step '{}' exited with {}", step.name, step.exit_code)
            }
            _ => run
                .error_message
                .clone()
                .unwrap_or_else(|| "Failed".to_string()),
        },
        RunState::TimedOut | RunState::Cancelled => run
            .error_message
            .clone()
            .unwrap_or_else(|| run.state.to_string()),
    }
}

/// Last status delivered per context
///
/// One entry per context: a newer commit replaces the older one, so the map
/// stays as large as the set of pipelines.
#[derive(Debug, Default)]
struct DeliveredStatuses {
    last: HashMap<String, StatusKey>,
}

impl DeliveredStatuses {
    fn is_duplicate(&self, status: &CommitStatus) -> bool {
        self.last.get(&status.context) == Some(&status.key())
    }

    fn record(&mut self, status: &CommitStatus) {
        self.last.insert(status.context.clone(), status.key());
    }

    fn len(&self) -> usize {
        self.last.len()
    }
}

async fn worker(
    mut rx: mpsc::UnboundedReceiver<Command>,
    sink: Arc<dyn StatusSink>,
    policy: RetryPolicy,
) {
    let mut delivered = DeliveredStatuses::default();

    while let Some(command) = rx.recv().await {
        let status = match command {
            Command::Publish(status) => status,
            Command::Flush(done) => {
                let _ = done.send(());
                continue;
            }
        };

        if delivered.is_duplicate(&status) {
            debug!(
                "Status {} for '{}' on {} already delivered",
                status.state, status.context, status.commit_sha
            );
            continue;
        }

        match deliver_with_retry(sink.as_ref(), &status, policy).await {
            Ok(()) => {
                info!(
                    "Published {} for '{}' on {}",
                    status.state, status.context, status.commit_sha
                );
                delivered.record(&status);
                debug!("Tracking last status of {} context(s)", delivered.len());
            }
            Err(e) => {
                error!(
                    "Failed to publish {} for '{}' on {}: {}",
                    status.state, status.context, status.commit_sha, e
                );
            }
        }
    }

    debug!("Status publisher worker stopped");
}

async fn deliver_with_retry(
    sink: &dyn StatusSink,
    status: &CommitStatus,
    policy: RetryPolicy,
) -> Result<(), PublishError> {
    let mut attempt = 1;
    let mut delay = policy.initial_backoff;

    loop {
        match sink.deliver(status).await {
            Ok(()) => return Ok(()),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) if attempt >= policy.attempts => {
                return Err(PublishError::Exhausted {
                    attempts: attempt,
                    last: e.to_string(),
                });
            }
            Err(e) => {
                warn!(
                    "Status delivery failed (attempt {}/{}): {}, retrying in {:?}",
                    attempt, policy.attempts, e, delay
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(policy.max_backoff);
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory sink for tests

    use super::*;
    use sluice_client::ClientError;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Records every delivery attempt; fails with queued HTTP codes first
    #[derive(Default)]
    pub struct RecordingSink {
        failures: Mutex<VecDeque<u16>>,
        pub attempts: Mutex<u32>,
        pub delivered: Mutex<Vec<CommitStatus>>,
    }

    impl RecordingSink {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn failing_with(codes: &[u16]) -> Self {
            let sink = Self::default();
            sink.failures.lock().unwrap().extend(codes);
            sink
        }

        pub fn delivered(&self) -> Vec<CommitStatus> {
            self.delivered.lock().unwrap().clone()
        }

        pub fn states(&self) -> Vec<(String, CommitState)> {
            self.delivered()
                .into_iter()
                .map(|s| (s.context, s.state))
                .collect()
        }
    }

    #[async_trait]
    impl StatusSink for RecordingSink {
        async fn deliver(&self, status: &CommitStatus) -> Result<(), PublishError> {
            *self.attempts.lock().unwrap() += 1;
            let failure = self.failures.lock().unwrap().pop_front();
            if let Some(code) = failure {
                return Err(ClientError::api_error(code, "scripted failure").into());
            }
            self.delivered.lock().unwrap().push(status.clone());
            Ok(())
        }
    }

    pub fn fast_retries() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{RecordingSink, fast_retries};
    use super::*;
    use sluice_core::domain::run::StepResult;

    fn status(sha: &str, context: &str, state: CommitState) -> CommitStatus {
        CommitStatus {
            commit_sha: sha.to_string(),
            context: context.to_string(),
            state,
            description: None,
            target_url: None,
        }
    }

    #[tokio::test]
    async fn test_duplicate_terminal_status_is_delivered_once() {
        let sink = Arc::new(RecordingSink::new());
        let publisher = StatusPublisher::spawn(sink.clone(), fast_retries());

        publisher.publish(status("abc", "Tests", CommitState::Success));
        publisher.publish(status("abc", "Tests", CommitState::Success));
        publisher.flush().await;

        assert_eq!(sink.delivered().len(), 1);
    }

    #[tokio::test]
    async fn test_retrigger_can_go_back_to_pending() {
        let sink = Arc::new(RecordingSink::new());
        let publisher = StatusPublisher::spawn(sink.clone(), fast_retries());

        publisher.publish(status("abc", "Tests", CommitState::Pending));
        publisher.publish(status("abc", "Tests", CommitState::Error));
        publisher.publish(status("abc", "Tests", CommitState::Pending));
        publisher.publish(status("abc", "Tests", CommitState::Success));
        publisher.flush().await;

        let states: Vec<_> = sink.states().into_iter().map(|(_, s)| s).collect();
        assert_eq!(
            states,
            vec![
                CommitState::Pending,
                CommitState::Error,
                CommitState::Pending,
                CommitState::Success
            ]
        );
    }

    #[test]
    fn test_delivered_statuses_keep_one_entry_per_context() {
        let mut delivered = DeliveredStatuses::default();

        for sha in ["aaa", "bbb", "ccc"] {
            for context in ["Tests", "Lint"] {
                let success = status(sha, context, CommitState::Success);
                assert!(!delivered.is_duplicate(&success));
                delivered.record(&success);
                assert!(delivered.is_duplicate(&success));
            }
        }
        assert_eq!(delivered.len(), 2);

        // an older commit no longer counts as delivered once a newer one was
        assert!(!delivered.is_duplicate(&status("aaa", "Tests", CommitState::Success)));
        assert!(!delivered.is_duplicate(&status("ccc", "Tests", CommitState::Failure)));
    }

    #[tokio::test]
    async fn test_same_state_on_a_new_commit_is_delivered() {
        let sink = Arc::new(RecordingSink::new());
        let publisher = StatusPublisher::spawn(sink.clone(), fast_retries());

        publisher.publish(status("abc", "Tests", CommitState::Success));
        publisher.publish(status("def", "Tests", CommitState::Success));
        publisher.publish(status("def", "Tests", CommitState::Success));
        publisher.flush().await;

        let shas: Vec<_> = sink.delivered().into_iter().map(|s| s.commit_sha).collect();
        assert_eq!(shas, vec!["abc", "def"]);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let sink = Arc::new(RecordingSink::failing_with(&[502, 503]));
        let publisher = StatusPublisher::spawn(sink.clone(), fast_retries());

        publisher.publish(status("abc", "Lint", CommitState::Failure));
        publisher.flush().await;

        assert_eq!(*sink.attempts.lock().unwrap(), 3);
        assert_eq!(sink.delivered().len(), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_is_logged_and_worker_keeps_going() {
        let sink = Arc::new(RecordingSink::failing_with(&[500, 500, 500]));
        let publisher = StatusPublisher::spawn(sink.clone(), fast_retries());

        publisher.publish(status("abc", "Lint", CommitState::Failure));
        publisher.publish(status("def", "Lint", CommitState::Success));
        publisher.flush().await;

        assert_eq!(*sink.attempts.lock().unwrap(), 4);
        assert_eq!(sink.delivered().len(), 1);
        assert_eq!(sink.delivered()[0].commit_sha, "def");
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let sink = Arc::new(RecordingSink::failing_with(&[422]));
        let publisher = StatusPublisher::spawn(sink.clone(), fast_retries());

        publisher.publish(status("abc", "Lint", CommitState::Failure));
        publisher.flush().await;

        assert_eq!(*sink.attempts.lock().unwrap(), 1);
        assert!(sink.delivered().is_empty());
    }

    #[tokio::test]
    async fn test_deliver_with_retry_reports_exhaustion() {
        let sink = RecordingSink::failing_with(&[503, 503, 503]);
        let err = deliver_with_retry(&sink, &status("abc", "Build", CommitState::Pending), fast_retries())
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Exhausted { attempts: 3, .. }));
    }

    #[test]
    fn test_describe_failed_run() {
        let mut run = Run::new("Lint", "abc", "refs/heads/main", 2);
        run.transition(RunState::Running).unwrap();
        run.record_step(StepResult {
            name: "flake8".to_string(),
            exit_code: 1,
            output: String::new(),
            output_truncated: false,
            duration: Duration::from_secs(1),
            execution_error: None,
        })
        .unwrap();
        run.finish(RunState::Failed, None).unwrap();

        assert_eq!(describe(&run), "Step 'flake8' exited with 1");
    }

    #[test]
    fn test_retry_policy_from_config() {
        let mut config = Config::default();
        config.publish_attempts = 0;
        assert_eq!(RetryPolicy::from_config(&config).attempts, 1);
    }
}
