use std::fmt;
use std::time::Duration;

use ks_telemetry::panic::panic_message;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Timeout applied by [`run_isolated`] callers that have no better bound.
pub const DEFAULT_BACKGROUND_TIMEOUT: Duration = Duration::from_secs(5);

/// An argument-less, side-effecting piece of startup or teardown work.
pub type UnitOfWork = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

/// Why a unit of work did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The work returned an error.
    Error { message: String },
    /// The work panicked.
    Panicked { message: String },
    /// The work did not finish within its deadline. The blocking thread is
    /// left to run to completion; its result is discarded.
    TimedOut { after_ms: u64 },
    /// The work was aborted or never started because its run was cancelled.
    Cancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Error { message } => write!(f, "error: {message}"),
            FailureReason::Panicked { message } => write!(f, "panicked: {message}"),
            FailureReason::TimedOut { after_ms } => write!(f, "timed out after {after_ms}ms"),
            FailureReason::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// A named unit of work that failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("task '{task}' {reason}")]
pub struct TaskFailure {
    pub task: String,
    pub reason: FailureReason,
}

impl TaskFailure {
    pub fn new(task: impl Into<String>, reason: FailureReason) -> Self {
        Self {
            task: task.into(),
            reason,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.reason, FailureReason::TimedOut { .. })
    }
}

/// Run `work` on the blocking pool with failure isolation.
///
/// Errors, panics and timeouts are converted into a [`TaskFailure`] and
/// logged; nothing propagates to the caller or to sibling tasks.
pub fn run_isolated(
    handle: &Handle,
    name: impl Into<String>,
    timeout: Option<Duration>,
    work: UnitOfWork,
) -> JoinHandle<Result<(), TaskFailure>> {
    let name = name.into();
    let mut blocking = handle.spawn_blocking(work);
    handle.spawn(async move {
        let outcome = await_unit(&name, &mut blocking, timeout).await;
        if outcome.as_ref().is_err_and(TaskFailure::is_timeout) {
            // Only prevents the work from starting if it is still queued.
            blocking.abort();
        }
        match &outcome {
            Ok(()) => debug!(task = %name, "background task completed"),
            Err(failure) => warn!(task = %name, reason = %failure.reason, "background task failed"),
        }
        outcome
    })
}

/// Await an already spawned blocking unit, applying the optional timeout.
///
/// On timeout the handle is left untouched so the caller decides whether to
/// abort it or keep waiting for the thread to return.
pub(crate) async fn await_unit(
    name: &str,
    blocking: &mut JoinHandle<anyhow::Result<()>>,
    timeout: Option<Duration>,
) -> Result<(), TaskFailure> {
    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, &mut *blocking).await {
            Ok(joined) => joined,
            Err(_) => {
                return Err(TaskFailure::new(
                    name,
                    FailureReason::TimedOut {
                        after_ms: limit.as_millis() as u64,
                    },
                ));
            }
        },
        None => blocking.await,
    };

    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(TaskFailure::new(
            name,
            FailureReason::Error {
                message: format!("{e:#}"),
            },
        )),
        Err(e) if e.is_panic() => {
            let payload = e.into_panic();
            Err(TaskFailure::new(
                name,
                FailureReason::Panicked {
                    message: panic_message(payload.as_ref()),
                },
            ))
        }
        Err(_) => Err(TaskFailure::new(name, FailureReason::Cancelled)),
    }
}
