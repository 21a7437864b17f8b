use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use ks_core::config::{BootstrapConfig, CriticalTierConfig, TierConfig};
use ks_harness::shutdown::{DrainResult, ShutdownGuard, ShutdownSignal};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::background::{await_unit, run_isolated, FailureReason, TaskFailure, UnitOfWork};

// ---------------------------------------------------------------------------
// Tier
// ---------------------------------------------------------------------------

/// Startup phase a unit of work belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Runs inline on the caller's thread, in order, before anything else.
    Critical,
    /// Runs concurrently once critical work has finished.
    HighPriority,
    /// Runs concurrently once every high-priority unit has finished.
    Background,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Critical, Tier::HighPriority, Tier::Background];

    fn index(self) -> usize {
        match self {
            Tier::Critical => 0,
            Tier::HighPriority => 1,
            Tier::Background => 2,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Tier::Critical => "critical",
            Tier::HighPriority => "high_priority",
            Tier::Background => "background",
        })
    }
}

/// Failure and timeout policy of one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierPolicy {
    /// `true`: a failed unit is recorded and everything else keeps running.
    /// `false`: the first failure aborts the unit's siblings and skips later tiers.
    pub continue_on_error: bool,
    pub task_timeout: Option<Duration>,
}

impl TierPolicy {
    pub const ISOLATED: TierPolicy = TierPolicy {
        continue_on_error: true,
        task_timeout: None,
    };
    pub const SHARED_FAILURE: TierPolicy = TierPolicy {
        continue_on_error: false,
        task_timeout: None,
    };

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = Some(timeout);
        self
    }
}

impl From<&TierConfig> for TierPolicy {
    fn from(cfg: &TierConfig) -> Self {
        Self {
            continue_on_error: cfg.continue_on_error,
            task_timeout: cfg.task_timeout(),
        }
    }
}

impl From<&CriticalTierConfig> for TierPolicy {
    fn from(cfg: &CriticalTierConfig) -> Self {
        Self {
            continue_on_error: false,
            task_timeout: cfg.task_timeout(),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("tier {0} has already started; no more tasks can be added")]
    TierSealed(Tier),

    #[error("tier {0} has already been run")]
    TierAlreadyRun(Tier),

    #[error("critical tier has not completed successfully")]
    CriticalTierPending,

    #[error("critical task '{task}' failed")]
    CriticalTaskFailed {
        task: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    #[error("bootstrap was cancelled")]
    Cancelled,

    #[error("no tokio runtime available for deferred tiers")]
    NoRuntime,

    #[error("invalid bootstrap config: {0}")]
    InvalidConfig(String),
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// What happened to the units of one tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierReport {
    pub tier: Tier,
    /// Names of units that finished successfully, in completion order.
    pub completed: Vec<String>,
    pub failed: Vec<TaskFailure>,
    /// Units never started because an earlier tier stopped the run.
    pub skipped: Vec<String>,
    /// The tier was interrupted by a failure, cancellation or the deadline.
    pub aborted: bool,
    pub elapsed_ms: u64,
}

impl TierReport {
    fn new(tier: Tier) -> Self {
        Self {
            tier,
            completed: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
            aborted: false,
            elapsed_ms: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty() && !self.aborted
    }

    pub fn total(&self) -> usize {
        self.completed.len() + self.failed.len() + self.skipped.len()
    }
}

/// Outcome of the deferred (high-priority + background) run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub tiers: Vec<TierReport>,
    pub cancelled: bool,
    pub deadline_exceeded: bool,
}

impl BootstrapReport {
    pub fn tier(&self, tier: Tier) -> Option<&TierReport> {
        self.tiers.iter().find(|t| t.tier == tier)
    }

    pub fn is_success(&self) -> bool {
        !self.cancelled && !self.deadline_exceeded && self.tiers.iter().all(TierReport::is_success)
    }

    pub fn failures(&self) -> impl Iterator<Item = &TaskFailure> {
        self.tiers.iter().flat_map(|t| t.failed.iter())
    }
}

// ---------------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------------

struct StartupTask {
    name: String,
    work: UnitOfWork,
}

struct ShutdownHook {
    name: String,
    work: UnitOfWork,
}

#[derive(Default)]
struct BootstrapState {
    queues: [Vec<StartupTask>; 3],
    started: [bool; 3],
    critical_ok: bool,
    hooks: Vec<ShutdownHook>,
}

impl BootstrapState {
    fn take_tier(&mut self, tier: Tier) -> Vec<StartupTask> {
        self.started[tier.index()] = true;
        std::mem::take(&mut self.queues[tier.index()])
    }
}

/// Tiered startup orchestrator.
///
/// Units of work are collected per [`Tier`] and executed with these
/// guarantees:
/// 1. critical units run one after another on the caller's thread, and all of
///    them finish before any deferred unit starts;
/// 2. high-priority units run concurrently on the blocking pool;
/// 3. no background unit starts before every high-priority unit has finished;
/// 4. background units run concurrently.
///
/// Each tier runs at most once and accepts new units only until it starts.
pub struct Bootstrap {
    handle: Handle,
    policies: [TierPolicy; 3],
    startup_deadline: Option<Duration>,
    shutdown_timeout: Duration,
    state: Arc<Mutex<BootstrapState>>,
    cancel: ShutdownSignal,
    run_id: Uuid,
}

impl Bootstrap {
    pub fn new(config: &BootstrapConfig, handle: Handle) -> Result<Self, BootstrapError> {
        config
            .validate()
            .map_err(|e| BootstrapError::InvalidConfig(e.to_string()))?;
        Ok(Self {
            handle,
            policies: [
                TierPolicy::from(&config.critical),
                TierPolicy::from(&config.high_priority),
                TierPolicy::from(&config.background),
            ],
            startup_deadline: config.startup_deadline(),
            shutdown_timeout: config.shutdown_timeout(),
            state: Arc::new(Mutex::new(BootstrapState::default())),
            cancel: ShutdownSignal::named("bootstrap"),
            run_id: Uuid::new_v4(),
        })
    }

    /// Build on the ambient tokio runtime.
    pub fn from_current(config: &BootstrapConfig) -> Result<Self, BootstrapError> {
        let handle = Handle::try_current().map_err(|_| BootstrapError::NoRuntime)?;
        Self::new(config, handle)
    }

    /// Override the policy of one tier. The critical tier always stops at
    /// its first failure; only its timeout is honoured.
    pub fn set_policy(&mut self, tier: Tier, policy: TierPolicy) {
        self.policies[tier.index()] = policy;
    }

    pub fn policy(&self, tier: Tier) -> TierPolicy {
        self.policies[tier.index()]
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Token that aborts pending deferred work when triggered.
    pub fn cancellation(&self) -> ShutdownSignal {
        self.cancel.clone()
    }

    /// Append a unit of work to `tier`.
    pub fn add_task<F>(
        &self,
        tier: Tier,
        name: impl Into<String>,
        work: F,
    ) -> Result<(), BootstrapError>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let name = name.into();
        let mut state = self.lock_state();
        if state.started[tier.index()] {
            return Err(BootstrapError::TierSealed(tier));
        }
        debug!(tier = %tier, task = %name, "startup task registered");
        state.queues[tier.index()].push(StartupTask {
            name,
            work: Box::new(work),
        });
        Ok(())
    }

    /// Number of units still queued in `tier`.
    pub fn pending(&self, tier: Tier) -> usize {
        self.lock_state().queues[tier.index()].len()
    }

    /// Run every critical unit inline, in registration order.
    ///
    /// The first error stops the tier and is returned; the remaining critical
    /// units never run. Panics are not caught.
    pub fn run_critical_tier(&self) -> Result<TierReport, BootstrapError> {
        let tasks = {
            let mut state = self.lock_state();
            if state.started[Tier::Critical.index()] {
                return Err(BootstrapError::TierAlreadyRun(Tier::Critical));
            }
            if self.cancel.is_shutting_down() {
                return Err(BootstrapError::Cancelled);
            }
            state.take_tier(Tier::Critical)
        };

        let policy = self.policy(Tier::Critical);
        let tier_started = std::time::Instant::now();
        let mut report = TierReport::new(Tier::Critical);
        info!(run_id = %self.run_id, count = tasks.len(), "critical tier starting");

        let mut tasks = tasks.into_iter();
        while let Some(StartupTask { name, work }) = tasks.next() {
            let task_started = std::time::Instant::now();
            if let Err(e) = work() {
                error!(
                    task = %name,
                    error = %format!("{e:#}"),
                    not_run = tasks.len(),
                    "critical task failed, aborting startup"
                );
                return Err(BootstrapError::CriticalTaskFailed {
                    task: name,
                    source: e.into(),
                });
            }
            let elapsed = task_started.elapsed();
            if let Some(limit) = policy.task_timeout {
                if elapsed > limit {
                    warn!(
                        task = %name,
                        elapsed_ms = elapsed.as_millis() as u64,
                        limit_ms = limit.as_millis() as u64,
                        "critical task exceeded its time budget"
                    );
                }
            }
            debug!(task = %name, elapsed_ms = elapsed.as_millis() as u64, "critical task completed");
            report.completed.push(name);
        }

        report.elapsed_ms = tier_started.elapsed().as_millis() as u64;
        self.lock_state().critical_ok = true;
        info!(
            run_id = %self.run_id,
            completed = report.completed.len(),
            elapsed_ms = report.elapsed_ms,
            "critical tier finished"
        );
        Ok(report)
    }

    /// Dispatch the high-priority tier, then (after its barrier) the
    /// background tier, without blocking the caller.
    ///
    /// Background units may still be added while the high-priority tier runs.
    /// The returned handle resolves to the report of both tiers.
    pub fn run_deferred_tiers(&self) -> Result<JoinHandle<BootstrapReport>, BootstrapError> {
        {
            let mut state = self.lock_state();
            if !state.critical_ok {
                return Err(BootstrapError::CriticalTierPending);
            }
            if state.started[Tier::HighPriority.index()] {
                return Err(BootstrapError::TierAlreadyRun(Tier::HighPriority));
            }
            // Claim the tier now so a second call fails even before the
            // coordinator gets scheduled.
            state.started[Tier::HighPriority.index()] = true;
        }

        let run = DeferredRun {
            handle: self.handle.clone(),
            state: Arc::clone(&self.state),
            policies: self.policies,
            startup_deadline: self.startup_deadline,
            cancel: self.cancel.clone(),
            run_id: self.run_id,
        };
        Ok(self.handle.spawn(run.execute()))
    }

    /// Register teardown work executed by [`shutdown`](Self::shutdown).
    pub fn on_shutdown<F>(&self, name: impl Into<String>, hook: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.lock_state().hooks.push(ShutdownHook {
            name: name.into(),
            work: Box::new(hook),
        });
    }

    /// Cancel pending deferred work and run the shutdown hooks on the
    /// blocking pool.
    ///
    /// Returns immediately; the handle resolves once every hook finished or
    /// the shutdown timeout expired. Hooks run at most once.
    pub fn shutdown(&self) -> JoinHandle<DrainResult> {
        self.cancel.trigger();
        let hooks = std::mem::take(&mut self.lock_state().hooks);
        let expected = hooks.len();
        let timeout = self.shutdown_timeout;
        let drain = ShutdownSignal::named("bootstrap-shutdown");
        info!(run_id = %self.run_id, hooks = expected, "bootstrap shutdown starting");

        for ShutdownHook { name, work } in hooks {
            let guard = ShutdownGuard::new(drain.clone());
            let work: UnitOfWork = Box::new(move || {
                let _guard = guard;
                work()
            });
            // Failures are logged by the helper; the drain count covers completion.
            drop(run_isolated(&self.handle, name, Some(timeout), work));
        }

        self.handle
            .spawn(async move { drain.wait_for_drain(expected, timeout).await })
    }

    fn lock_state(&self) -> MutexGuard<'_, BootstrapState> {
        lock(&self.state)
    }
}

fn lock(state: &Mutex<BootstrapState>) -> MutexGuard<'_, BootstrapState> {
    // Units of work never run under this lock.
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Deferred run
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Failure,
    Cancelled,
    Deadline,
}

struct DeferredRun {
    handle: Handle,
    state: Arc<Mutex<BootstrapState>>,
    policies: [TierPolicy; 3],
    startup_deadline: Option<Duration>,
    cancel: ShutdownSignal,
    run_id: Uuid,
}

impl DeferredRun {
    async fn execute(self) -> BootstrapReport {
        let mut report = BootstrapReport {
            run_id: self.run_id,
            started_at: Utc::now(),
            tiers: Vec::with_capacity(2),
            cancelled: false,
            deadline_exceeded: false,
        };
        let deadline = self.startup_deadline.map(|d| Instant::now() + d);
        let mut interrupted: Option<Interrupt> = None;

        for tier in [Tier::HighPriority, Tier::Background] {
            let tasks = lock(&self.state).take_tier(tier);

            if interrupted.is_none() && self.cancel.is_shutting_down() {
                interrupted = Some(Interrupt::Cancelled);
            }
            if let Some(cause) = interrupted {
                info!(tier = %tier, count = tasks.len(), cause = ?cause, "skipping tier");
                let mut skipped = TierReport::new(tier);
                skipped.skipped = tasks.into_iter().map(|t| t.name).collect();
                report.tiers.push(skipped);
                continue;
            }

            let (tier_report, interrupt) = self
                .run_concurrent_tier(tier, tasks, self.policies[tier.index()], deadline)
                .await;
            report.tiers.push(tier_report);
            interrupted = interrupt;
        }

        report.cancelled = interrupted == Some(Interrupt::Cancelled);
        report.deadline_exceeded = interrupted == Some(Interrupt::Deadline);

        let failed = report.failures().count();
        if report.is_success() {
            info!(run_id = %self.run_id, "deferred startup finished");
        } else {
            warn!(
                run_id = %self.run_id,
                failed,
                cancelled = report.cancelled,
                deadline_exceeded = report.deadline_exceeded,
                "deferred startup finished with problems"
            );
        }
        report
    }

    /// Fan out every unit of `tier` and wait for all of them (fan-in).
    async fn run_concurrent_tier(
        &self,
        tier: Tier,
        tasks: Vec<StartupTask>,
        policy: TierPolicy,
        deadline: Option<Instant>,
    ) -> (TierReport, Option<Interrupt>) {
        let started = std::time::Instant::now();
        let mut report = TierReport::new(tier);
        info!(run_id = %self.run_id, tier = %tier, count = tasks.len(), "tier starting");

        let mut pending: BTreeMap<usize, String> = BTreeMap::new();
        let mut blocking_aborts = Vec::with_capacity(tasks.len());
        let mut set = JoinSet::new();
        for (idx, StartupTask { name, work }) in tasks.into_iter().enumerate() {
            let blocking = self.handle.spawn_blocking(work);
            blocking_aborts.push(blocking.abort_handle());
            pending.insert(idx, name.clone());
            let timeout = policy.task_timeout;
            set.spawn_on(
                async move {
                    let mut blocking = blocking;
                    let outcome = await_unit(&name, &mut blocking, timeout).await;
                    let lingering = outcome
                        .as_ref()
                        .is_err_and(TaskFailure::is_timeout)
                        .then_some(blocking);
                    (idx, outcome, lingering)
                },
                &self.handle,
            );
        }

        let deadline_reached = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline_reached);
        let cancelled = self.cancel.cancelled();
        tokio::pin!(cancelled);

        let mut lingering = Vec::new();
        let mut interrupt = None;
        loop {
            tokio::select! {
                biased;
                _ = &mut cancelled => {
                    warn!(tier = %tier, "tier cancelled");
                    interrupt = Some(Interrupt::Cancelled);
                    break;
                }
                _ = &mut deadline_reached => {
                    warn!(tier = %tier, "startup deadline exceeded");
                    interrupt = Some(Interrupt::Deadline);
                    break;
                }
                joined = set.join_next() => {
                    let Some(joined) = joined else { break };
                    match joined {
                        Ok((idx, outcome, still_running)) => {
                            lingering.extend(still_running);
                            let Some(name) = pending.remove(&idx) else { continue };
                            match outcome {
                                Ok(()) => {
                                    debug!(tier = %tier, task = %name, "task completed");
                                    report.completed.push(name);
                                }
                                Err(failure) => {
                                    warn!(tier = %tier, task = %name, reason = %failure.reason, "task failed");
                                    report.failed.push(failure);
                                    if !policy.continue_on_error {
                                        interrupt = Some(Interrupt::Failure);
                                        break;
                                    }
                                }
                            }
                        }
                        Err(e) => error!(tier = %tier, error = %e, "task supervisor failed"),
                    }
                }
            }
        }

        if interrupt.is_some() {
            // Queued blocking units are prevented from starting; running ones
            // finish in the background and their results are dropped.
            for abort in &blocking_aborts {
                abort.abort();
            }
            set.abort_all();
            while let Some(joined) = set.join_next().await {
                if let Ok((idx, outcome, _)) = joined {
                    if let Some(name) = pending.remove(&idx) {
                        match outcome {
                            Ok(()) => report.completed.push(name),
                            Err(failure) => report.failed.push(failure),
                        }
                    }
                }
            }
            report.aborted = true;
        } else if !lingering.is_empty() {
            // Timed-out units are already reported, but the next tier must
            // not start while their threads are still busy.
            debug!(tier = %tier, count = lingering.len(), "waiting for timed-out tasks to return");
            for blocking in lingering {
                tokio::select! {
                    biased;
                    _ = &mut cancelled => {
                        warn!(tier = %tier, "tier cancelled");
                        interrupt = Some(Interrupt::Cancelled);
                        break;
                    }
                    _ = &mut deadline_reached => {
                        warn!(tier = %tier, "startup deadline exceeded");
                        interrupt = Some(Interrupt::Deadline);
                        break;
                    }
                    _ = blocking => {}
                }
            }
            report.aborted = interrupt.is_some();
        }

        for (_, name) in pending {
            report
                .failed
                .push(TaskFailure::new(name, FailureReason::Cancelled));
        }

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            run_id = %self.run_id,
            tier = %tier,
            completed = report.completed.len(),
            failed = report.failed.len(),
            aborted = report.aborted,
            elapsed_ms = report.elapsed_ms,
            "tier finished"
        );
        (report, interrupt)
    }
}
