use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// ShutdownSignal: cooperative cancellation token
// ---------------------------------------------------------------------------

/// Cloneable, level-triggered cancellation token.
///
/// Once [`trigger`](Self::trigger) has been called every clone reports
/// `is_shutting_down() == true`, and [`cancelled`](Self::cancelled) resolves
/// immediately, including for waiters that start after the trigger.
///
/// The signal also counts drain confirmations so an owner can wait for
/// teardown work to finish:
///
/// ```ignore
/// let signal = ShutdownSignal::new();
/// let guard = ShutdownGuard::new(signal.clone());
/// tokio::spawn(async move { cleanup().await; drop(guard); });
///
/// signal.trigger();
/// signal.wait_for_drain(1, Duration::from_secs(5)).await;
/// ```
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    inner: Arc<SignalState>,
}

#[derive(Debug)]
struct SignalState {
    name: &'static str,
    triggered: watch::Sender<bool>,
    drained: watch::Sender<usize>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::named("shutdown")
    }

    /// A signal whose log lines carry `name`.
    pub fn named(name: &'static str) -> Self {
        let (triggered, _) = watch::channel(false);
        let (drained, _) = watch::channel(0);
        Self {
            inner: Arc::new(SignalState {
                name,
                triggered,
                drained,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Check if the signal has been triggered (non-blocking).
    pub fn is_shutting_down(&self) -> bool {
        *self.inner.triggered.borrow()
    }

    /// Trip the signal. Returns `false` when it was already tripped.
    pub fn trigger(&self) -> bool {
        let first = self.inner.triggered.send_if_modified(|flag| {
            if *flag {
                false
            } else {
                *flag = true;
                true
            }
        });
        if first {
            info!(signal = self.inner.name, "signal triggered");
        } else {
            debug!(signal = self.inner.name, "signal already triggered");
        }
        first
    }

    /// Resolve once the signal is triggered.
    pub async fn cancelled(&self) {
        let mut rx = self.inner.triggered.subscribe();
        // The sender lives as long as `self`, so this cannot observe a close.
        let _ = rx.wait_for(|flag| *flag).await;
    }

    /// Record that one participant finished its teardown.
    pub fn confirm_drained(&self) {
        self.inner.drained.send_modify(|count| *count += 1);
    }

    /// Number of drain confirmations so far.
    pub fn drained(&self) -> usize {
        *self.inner.drained.borrow()
    }

    /// Wait until `expected` participants have confirmed drain, or time out.
    pub async fn wait_for_drain(&self, expected: usize, timeout: Duration) -> DrainResult {
        let mut rx = self.inner.drained.subscribe();
        let outcome = tokio::time::timeout(timeout, rx.wait_for(|count| *count >= expected))
            .await
            .map(|res| res.map(|count| *count));

        match outcome {
            Ok(Ok(count)) => {
                info!(signal = self.inner.name, count, "all participants drained");
                DrainResult::Complete(count)
            }
            Ok(Err(_)) => DrainResult::Complete(self.drained()),
            Err(_) => {
                let confirmed = self.drained();
                warn!(
                    signal = self.inner.name,
                    confirmed,
                    expected,
                    "drain timeout, some participants did not confirm"
                );
                DrainResult::Timeout {
                    confirmed,
                    expected,
                }
            }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// DrainResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainResult {
    /// All expected participants confirmed drain.
    Complete(usize),
    /// Timeout expired before all participants confirmed.
    Timeout { confirmed: usize, expected: usize },
}

impl DrainResult {
    pub fn is_complete(&self) -> bool {
        matches!(self, DrainResult::Complete(_))
    }
}

// ---------------------------------------------------------------------------
// ShutdownGuard: RAII drain confirmation
// ---------------------------------------------------------------------------

/// Calls [`ShutdownSignal::confirm_drained`] when dropped, including when
/// the owning task unwinds.
pub struct ShutdownGuard {
    signal: ShutdownSignal,
}

impl ShutdownGuard {
    pub fn new(signal: ShutdownSignal) -> Self {
        Self { signal }
    }
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.signal.confirm_drained();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_signal_is_not_triggered() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_shutting_down());
        assert_eq!(signal.name(), "shutdown");
    }

    #[test]
    fn trigger_is_idempotent_and_shared() {
        let signal = ShutdownSignal::named("ticker");
        let clone = signal.clone();
        assert!(signal.trigger());
        assert!(!clone.trigger());
        assert!(clone.is_shutting_down());
    }

    #[tokio::test]
    async fn cancelled_resolves_for_late_waiters() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        let res = tokio::time::timeout(Duration::from_millis(100), signal.cancelled()).await;
        assert!(res.is_ok());
    }

    #[tokio::test]
    async fn cancelled_wakes_pending_waiter() {
        let signal = ShutdownSignal::new();
        let waiter = {
            let s = signal.clone();
            tokio::spawn(async move { s.cancelled().await })
        };
        tokio::task::yield_now().await;
        signal.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .expect("waiter joined");
    }

    #[tokio::test]
    async fn drain_completes_when_guards_drop() {
        let signal = ShutdownSignal::new();
        let g1 = ShutdownGuard::new(signal.clone());
        let g2 = ShutdownGuard::new(signal.clone());

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(g1);
        });
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(g2);
        });

        let result = signal.wait_for_drain(2, Duration::from_secs(1)).await;
        assert_eq!(result, DrainResult::Complete(2));
    }

    #[tokio::test]
    async fn drain_times_out_when_guard_held() {
        let signal = ShutdownSignal::new();
        let _held = ShutdownGuard::new(signal.clone());

        let result = signal.wait_for_drain(1, Duration::from_millis(30)).await;
        assert_eq!(
            result,
            DrainResult::Timeout {
                confirmed: 0,
                expected: 1
            }
        );
        assert!(!result.is_complete());
    }

    #[tokio::test]
    async fn zero_expected_drains_immediately() {
        let signal = ShutdownSignal::new();
        let result = signal.wait_for_drain(0, Duration::from_millis(10)).await;
        assert!(result.is_complete());
    }
}
