use std::sync::{Arc, OnceLock, RwLock};

use anyhow::Context;
use ks_core::config::Config;
use ks_core::dispatch::MainDispatcher;
use ks_core::resources::ResourceCache;
use ks_core::settings::{load_or_seed, AppSettings, FileSettingsStore, SettingsStore};
use ks_harness::shutdown::DrainResult;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::background::{run_isolated, TaskFailure, DEFAULT_BACKGROUND_TIMEOUT};
use crate::bootstrap::{Bootstrap, BootstrapError, BootstrapReport, Tier, TierReport};
use crate::ticker::{TickListener, Ticker};

/// Everything the startup tasks and the host share, constructed once per
/// process and passed around explicitly.
pub struct AppContext {
    config: Config,
    settings_store: Arc<dyn SettingsStore>,
    settings: RwLock<Option<AppSettings>>,
    resources: Arc<ResourceCache>,
    dispatcher: MainDispatcher,
    ticker: OnceLock<Arc<Ticker>>,
}

impl AppContext {
    pub fn new(config: Config, settings_store: Arc<dyn SettingsStore>) -> Self {
        let resources =
            ResourceCache::new(config.resources.dir(), config.resources.extensions.clone());
        Self {
            config,
            settings_store,
            settings: RwLock::new(None),
            resources: Arc::new(resources),
            dispatcher: MainDispatcher::new(),
            ticker: OnceLock::new(),
        }
    }

    /// Context persisting settings under the configured data directory.
    pub fn from_config(config: Config) -> Self {
        let store = FileSettingsStore::in_dir(config.data_dir());
        Self::new(config, Arc::new(store))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn settings_store(&self) -> &Arc<dyn SettingsStore> {
        &self.settings_store
    }

    /// Settings loaded by the critical tier; `None` before that.
    pub fn settings(&self) -> Option<AppSettings> {
        self.settings.read().ok()?.clone()
    }

    pub fn resources(&self) -> &Arc<ResourceCache> {
        &self.resources
    }

    pub fn dispatcher(&self) -> &MainDispatcher {
        &self.dispatcher
    }

    /// The global ticker, once the critical tier has started it.
    pub fn ticker(&self) -> Option<&Arc<Ticker>> {
        self.ticker.get()
    }

    fn install_ticker(&self, ticker: Arc<Ticker>) -> anyhow::Result<()> {
        self.ticker
            .set(ticker)
            .map_err(|_| anyhow::anyhow!("ticker already installed"))
    }

    fn store_settings(&self, settings: AppSettings) {
        if let Ok(mut slot) = self.settings.write() {
            *slot = Some(settings);
        }
    }
}

/// Result of [`Application::launch`].
pub struct Launch {
    pub critical: TierReport,
    pub deferred: JoinHandle<BootstrapReport>,
}

/// Standard startup wiring for a host process.
///
/// - critical: start the ticker, load (or seed) persisted settings
/// - high priority: register the host's tick listeners from the main thread
/// - background: preload bundled resources
/// - shutdown: stop the ticker
pub struct Application {
    ctx: Arc<AppContext>,
    bootstrap: Bootstrap,
    handle: Handle,
}

impl Application {
    pub fn new(
        ctx: Arc<AppContext>,
        handle: Handle,
        listeners: Vec<Arc<dyn TickListener>>,
    ) -> Result<Self, BootstrapError> {
        let bootstrap = Bootstrap::new(&ctx.config.bootstrap, handle.clone())?;
        let runtime = handle.clone();

        {
            let ctx = Arc::clone(&ctx);
            bootstrap.add_task(Tier::Critical, "start-ticker", move || {
                let ticker = Ticker::new(&ctx.config.ticker)?;
                ticker.start_on(&handle)?;
                ctx.install_ticker(ticker)
            })?;
        }

        {
            let ctx = Arc::clone(&ctx);
            bootstrap.add_task(Tier::Critical, "load-settings", move || {
                let settings =
                    load_or_seed(ctx.settings_store.as_ref()).context("loading settings")?;
                info!(
                    language = %settings.language_code,
                    launch_count = settings.launch_count,
                    "settings loaded"
                );
                ctx.store_settings(settings);
                Ok(())
            })?;
        }

        {
            let ctx = Arc::clone(&ctx);
            bootstrap.add_task(Tier::HighPriority, "register-tick-listeners", move || {
                let ticker = ctx
                    .ticker()
                    .cloned()
                    .context("ticker not started by the critical tier")?;
                let count = listeners.len();
                ctx.dispatcher.post(move || {
                    for listener in &listeners {
                        ticker.register_dyn(listener);
                    }
                    debug!(count, "host tick listeners registered");
                });
                Ok(())
            })?;
        }

        {
            let ctx = Arc::clone(&ctx);
            bootstrap.add_task(Tier::Background, "preload-resources", move || {
                ctx.resources.preload().context("preloading resources")?;
                Ok(())
            })?;
        }

        {
            let ctx = Arc::clone(&ctx);
            bootstrap.on_shutdown("stop-ticker", move || {
                if let Some(ticker) = ctx.ticker() {
                    ticker.stop();
                }
                Ok(())
            });
        }

        Ok(Self {
            ctx,
            bootstrap,
            handle: runtime,
        })
    }

    pub fn context(&self) -> &Arc<AppContext> {
        &self.ctx
    }

    /// Access to the orchestrator, e.g. to add host-specific tasks before
    /// [`launch`](Self::launch).
    pub fn bootstrap(&self) -> &Bootstrap {
        &self.bootstrap
    }

    /// Run the critical tier inline, then hand the deferred tiers to the
    /// runtime.
    pub fn launch(&self) -> Result<Launch, BootstrapError> {
        let critical = self.bootstrap.run_critical_tier()?;
        let deferred = self.bootstrap.run_deferred_tiers()?;
        Ok(Launch { critical, deferred })
    }

    /// Fire-and-forget work for the host, isolated and bounded by
    /// [`DEFAULT_BACKGROUND_TIMEOUT`].
    pub fn run_in_background<F>(
        &self,
        name: impl Into<String>,
        work: F,
    ) -> JoinHandle<Result<(), TaskFailure>>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        run_isolated(
            &self.handle,
            name,
            Some(DEFAULT_BACKGROUND_TIMEOUT),
            Box::new(work),
        )
    }

    /// Persist the current settings snapshot, if any, off the caller's thread.
    pub fn save_settings(&self) -> JoinHandle<Result<(), TaskFailure>> {
        let ctx = Arc::clone(&self.ctx);
        self.run_in_background("save-settings", move || {
            if let Some(settings) = ctx.settings() {
                ctx.settings_store.save(&settings).context("saving settings")?;
            }
            Ok(())
        })
    }

    /// Stop long-lived resources without blocking the caller.
    pub fn terminate(&self) -> JoinHandle<DrainResult> {
        self.bootstrap.shutdown()
    }
}
