use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use ks_core::config::TickerConfig;
use ks_harness::shutdown::ShutdownSignal;
use ks_telemetry::panic::panic_message;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace};

/// Receives the global tick broadcast.
///
/// The ticker only keeps a weak reference to each listener, so whoever
/// registers a listener must also keep it alive.
pub trait TickListener: Send + Sync {
    fn on_tick(&self, count: u64);
}

#[derive(Debug, thiserror::Error)]
pub enum TickerError {
    #[error("ticker already started")]
    AlreadyStarted,
    #[error("ticker has been stopped")]
    Stopped,
    #[error("no tokio runtime available to drive the ticker")]
    NoRuntime,
    #[error("invalid ticker config: {0}")]
    InvalidConfig(String),
}

/// Outcome of a single firing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Counter value delivered to listeners.
    pub count: u64,
    /// Listeners whose callback returned normally.
    pub notified: usize,
    /// Dead entries swept before notifying.
    pub pruned: usize,
    /// Listeners whose callback panicked.
    pub failed: usize,
}

/// Self-renewing periodic broadcast timer.
///
/// Every interval the ticker increments its counter, drops registry entries
/// whose listener is gone, and calls [`TickListener::on_tick`] on every live
/// listener. The counter starts at 0, so the first delivered value is 1, and it
/// is never reset for the lifetime of the ticker.
///
/// Running time is split into renewal epochs of `span` length. An epoch
/// boundary is only recorded in [`renewals`](Self::renewals); ticking
/// continues without a gap.
pub struct Ticker {
    interval: Duration,
    span: Duration,
    count: AtomicU64,
    renewals: AtomicU64,
    listeners: Mutex<Vec<Weak<dyn TickListener>>>,
    started: AtomicBool,
    stop: ShutdownSignal,
}

impl Ticker {
    pub fn new(config: &TickerConfig) -> Result<Arc<Self>, TickerError> {
        config
            .validate()
            .map_err(|e| TickerError::InvalidConfig(e.to_string()))?;
        Ok(Arc::new(Self {
            interval: config.interval(),
            span: config.span(),
            count: AtomicU64::new(0),
            renewals: AtomicU64::new(0),
            listeners: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stop: ShutdownSignal::named("ticker"),
        }))
    }

    /// Start firing on the ambient tokio runtime.
    pub fn start(self: &Arc<Self>) -> Result<(), TickerError> {
        let handle = Handle::try_current().map_err(|_| TickerError::NoRuntime)?;
        self.start_on(&handle)
    }

    /// Start firing on the given runtime.
    ///
    /// The timer task only holds a weak reference to the ticker and exits on
    /// [`stop`](Self::stop) or once the ticker is dropped.
    pub fn start_on(self: &Arc<Self>, handle: &Handle) -> Result<(), TickerError> {
        if self.stop.is_shutting_down() {
            return Err(TickerError::Stopped);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(TickerError::AlreadyStarted);
        }

        handle.spawn(run_loop(
            Arc::downgrade(self),
            self.stop.clone(),
            self.interval,
            self.span,
        ));
        info!(
            interval_ms = self.interval.as_millis() as u64,
            span_ms = self.span.as_millis() as u64,
            "ticker started"
        );
        Ok(())
    }

    /// Register a listener. Idempotent per listener instance.
    ///
    /// Returns `true` when a new entry was added. Registration after
    /// [`stop`](Self::stop) is ignored.
    pub fn register<L: TickListener + 'static>(&self, listener: &Arc<L>) -> bool {
        let listener: Arc<dyn TickListener> = listener.clone();
        self.register_dyn(&listener)
    }

    /// [`register`](Self::register) for an already type-erased listener.
    pub fn register_dyn(&self, listener: &Arc<dyn TickListener>) -> bool {
        if self.stop.is_shutting_down() {
            debug!("ignoring listener registration on stopped ticker");
            return false;
        }
        let target = Arc::as_ptr(listener) as *const ();
        let mut entries = self.lock_listeners();
        // `stop` flips the signal while holding this lock.
        if self.stop.is_shutting_down() {
            return false;
        }
        entries.retain(|entry| entry.strong_count() > 0);
        if entries.iter().any(|entry| same_listener(entry, target)) {
            return false;
        }
        entries.push(Arc::downgrade(listener));
        trace!(listeners = entries.len(), "tick listener registered");
        true
    }

    /// Register a listener and get a guard that unregisters it on drop.
    ///
    /// If the listener was already registered, dropping the guard still
    /// removes that existing registration.
    pub fn subscribe<L: TickListener + 'static>(
        self: &Arc<Self>,
        listener: &Arc<L>,
    ) -> TickSubscription {
        self.register(listener);
        let listener: Arc<dyn TickListener> = listener.clone();
        TickSubscription {
            ticker: Arc::downgrade(self),
            listener: Arc::downgrade(&listener),
        }
    }

    /// Remove every entry referring to `listener`. Returns `true` if any was removed.
    pub fn unregister<L: TickListener + ?Sized>(&self, listener: &L) -> bool {
        self.remove_ptr(listener as *const L as *const ())
    }

    fn remove_ptr(&self, target: *const ()) -> bool {
        let mut entries = self.lock_listeners();
        let before = entries.len();
        entries.retain(|entry| !same_listener(entry, target));
        let removed = entries.len() != before;
        entries.retain(|entry| entry.strong_count() > 0);
        removed
    }

    /// Perform one firing: increment, sweep, notify.
    ///
    /// Callbacks run outside the registry lock, so a listener may register
    /// or unregister from inside `on_tick`. A panicking callback is logged and
    /// counted; the remaining listeners are still notified. A stopped ticker
    /// does nothing and reports the current count.
    pub fn fire(&self) -> TickReport {
        if self.stop.is_shutting_down() {
            return TickReport {
                count: self.count(),
                ..TickReport::default()
            };
        }

        let count = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        let (live, pruned) = {
            let mut entries = self.lock_listeners();
            let before = entries.len();
            entries.retain(|entry| entry.strong_count() > 0);
            let pruned = before - entries.len();
            let live: Vec<Arc<dyn TickListener>> =
                entries.iter().filter_map(Weak::upgrade).collect();
            (live, pruned)
        };

        let mut report = TickReport {
            count,
            pruned,
            ..TickReport::default()
        };
        for listener in &live {
            if self.stop.is_shutting_down() {
                break;
            }
            match catch_unwind(AssertUnwindSafe(|| listener.on_tick(count))) {
                Ok(()) => report.notified += 1,
                Err(payload) => {
                    report.failed += 1;
                    error!(
                        count,
                        panic = %panic_message(payload.as_ref()),
                        "tick listener panicked"
                    );
                }
            }
        }

        if pruned > 0 {
            debug!(count, pruned, "swept dead tick listeners");
        }
        report
    }

    /// Cancel future firings and drop every registration. Idempotent.
    pub fn stop(&self) {
        let (first, cleared) = {
            let mut entries = self.lock_listeners();
            let first = self.stop.trigger();
            let n = entries.len();
            entries.clear();
            (first, n)
        };
        if first {
            info!(count = self.count(), cleared, "ticker stopped");
        }
    }

    /// Last counter value delivered (0 before the first firing).
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    /// Number of registry entries, including dead ones not yet swept.
    pub fn listener_count(&self) -> usize {
        self.lock_listeners().len()
    }

    /// Number of completed renewal epochs.
    pub fn renewals(&self) -> u64 {
        self.renewals.load(Ordering::SeqCst)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.stop.is_shutting_down()
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_shutting_down()
    }

    fn lock_listeners(&self) -> MutexGuard<'_, Vec<Weak<dyn TickListener>>> {
        // Callbacks never run under this lock, so a poisoned guard still
        // holds a consistent Vec.
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Ticker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ticker")
            .field("interval", &self.interval)
            .field("span", &self.span)
            .field("count", &self.count())
            .field("renewals", &self.renewals())
            .field("listeners", &self.listener_count())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Identity is the data pointer; vtable pointers of the same object may differ.
fn same_listener(entry: &Weak<dyn TickListener>, target: *const ()) -> bool {
    entry.as_ptr() as *const () == target
}

async fn run_loop(ticker: Weak<Ticker>, stop: ShutdownSignal, period: Duration, span: Duration) {
    let ticks_per_epoch = (span.as_nanos() / period.as_nanos()).max(1) as u64;
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let cancelled = stop.cancelled();
    tokio::pin!(cancelled);

    let mut epoch_ticks = 0_u64;
    loop {
        tokio::select! {
            biased;
            _ = &mut cancelled => break,
            _ = interval.tick() => {}
        }

        let Some(ticker) = ticker.upgrade() else {
            debug!("ticker dropped, timer loop exiting");
            return;
        };
        ticker.fire();

        epoch_ticks += 1;
        if epoch_ticks >= ticks_per_epoch {
            epoch_ticks = 0;
            let renewals = ticker.renewals.fetch_add(1, Ordering::SeqCst) + 1;
            debug!(renewals, count = ticker.count(), "ticker span elapsed, renewing");
        }
    }
    debug!("ticker cancelled, timer loop exiting");
}

// ---------------------------------------------------------------------------
// TickSubscription
// ---------------------------------------------------------------------------

/// Unregisters its listener when dropped.
#[must_use = "dropping the subscription unregisters the listener"]
pub struct TickSubscription {
    ticker: Weak<Ticker>,
    listener: Weak<dyn TickListener>,
}

impl Drop for TickSubscription {
    fn drop(&mut self) {
        if let Some(ticker) = self.ticker.upgrade() {
            ticker.remove_ptr(self.listener.as_ptr() as *const ());
        }
    }
}
