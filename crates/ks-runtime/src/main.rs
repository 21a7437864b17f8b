//! kickstart host: runs the tiered startup, keeps the global ticker alive,
//! pumps main-thread jobs until ctrl-c, then shuts down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ks_core::config::Config;
use ks_runtime::app::{AppContext, Application};
use ks_runtime::ticker::TickListener;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

/// Env var pointing at an alternative config file.
const CONFIG_ENV: &str = "KICKSTART_CONFIG";

/// Logs a liveness line every `every` ticks.
struct UptimeLog {
    every: u64,
    last: AtomicU64,
}

impl TickListener for UptimeLog {
    fn on_tick(&self, count: u64) {
        self.last.store(count, Ordering::Relaxed);
        if count % self.every == 0 {
            debug!(count, "uptime tick");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;

    ks_telemetry::logging::init_logging(&config.general.app_name, &config.logging);
    ks_telemetry::panic::install_panic_hook();
    info!(version = env!("CARGO_PKG_VERSION"), "kickstart starting");

    let data_dir = config.data_dir();
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        warn!(path = %data_dir.display(), error = %e, "could not create data directory");
    }

    let every = (10_000 / config.ticker.interval_ms).max(1);
    let uptime = Arc::new(UptimeLog {
        every,
        last: AtomicU64::new(0),
    });

    let ctx = Arc::new(AppContext::from_config(config));
    let listeners: Vec<Arc<dyn TickListener>> = vec![uptime.clone()];
    let app = Application::new(Arc::clone(&ctx), Handle::current(), listeners)
        .context("failed to assemble startup tasks")?;

    let launch = app.launch().context("critical startup failed")?;
    info!(
        completed = launch.critical.completed.len(),
        elapsed_ms = launch.critical.elapsed_ms,
        "critical startup complete"
    );

    let deferred = launch.deferred;
    tokio::spawn(async move {
        match deferred.await {
            Ok(report) => match serde_json::to_string(&report) {
                Ok(json) => info!(report = %json, "deferred startup report"),
                Err(e) => warn!(error = %e, "failed to serialise startup report"),
            },
            Err(e) => error!(error = %e, "deferred startup coordinator failed"),
        }
    });

    // Main-thread loop: drain posted jobs until ctrl-c.
    let dispatcher = ctx.dispatcher().clone();
    let mut pump = tokio::time::interval(Duration::from_millis(50));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            res = &mut ctrl_c => {
                if let Err(e) = res {
                    error!(error = %e, "failed to listen for ctrl-c");
                }
                info!("ctrl-c received, initiating shutdown");
                break;
            }
            _ = pump.tick() => {
                dispatcher.run_pending();
            }
        }
    }

    match app.save_settings().await {
        Ok(Ok(())) => debug!("settings flushed"),
        Ok(Err(failure)) => warn!(%failure, "settings flush failed"),
        Err(e) => error!(error = %e, "settings flush task failed"),
    }

    let drained = app.terminate().await.context("shutdown task failed")?;
    info!(
        ticks = uptime.last.load(Ordering::Relaxed),
        complete = drained.is_complete(),
        "kickstart stopped"
    );
    Ok(())
}

fn load_config() -> Result<Config> {
    match std::env::var(CONFIG_ENV) {
        Ok(path) if !path.is_empty() => Config::load_from(&path)
            .with_context(|| format!("failed to load config from {path}")),
        _ => Config::load().context("failed to load config"),
    }
}
