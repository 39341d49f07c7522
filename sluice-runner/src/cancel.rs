//! Cooperative cancellation for runs
//!
//! A run is interrupted at step boundaries and while a step's container is
//! executing. The first reason delivered sticks; later ones are ignored.

use std::fmt;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

/// Why a run was interrupted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// A newer run for the same pipeline and ref replaced this one
    Superseded { by: Uuid },

    /// The run's timeout budget elapsed
    TimedOut { budget: Duration },

    /// The scheduler stopped with the cancel policy
    Shutdown,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Superseded { by } => write!(f, "superseded by run {}", by),
            CancelReason::TimedOut { budget } => {
                write!(f, "timed out after {}s", budget.as_secs())
            }
            CancelReason::Shutdown => write!(f, "cancelled by shutdown"),
        }
    }
}

/// Sending half, owned by the scheduler
#[derive(Debug, Clone)]
pub struct CancelSignal {
    tx: watch::Sender<Option<CancelReason>>,
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Requests cancellation; returns false if a reason was already set
    pub fn cancel(&self, reason: CancelReason) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        })
    }

    pub fn reason(&self) -> Option<CancelReason> {
        *self.tx.borrow()
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving half, handed to the code executing a run
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<Option<CancelReason>>,
}

impl CancelToken {
    /// A token that is never cancelled
    pub fn never() -> Self {
        CancelSignal::new().token()
    }

    pub fn reason(&self) -> Option<CancelReason> {
        *self.rx.borrow()
    }

    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    /// Resolves once cancellation is requested
    ///
    /// Pends forever if the signal is dropped without cancelling.
    pub async fn cancelled(&self) -> CancelReason {
        let mut rx = self.rx.clone();
        let reason = rx.wait_for(Option::is_some).await.ok().and_then(|r| *r);
        match reason {
            Some(reason) => reason,
            None => std::future::pending().await,
        }
    }
}
