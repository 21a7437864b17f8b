use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration loaded from `~/.kickstart/config.toml`.
///
/// Every section is optional in the file; missing sections and fields fall
/// back to their `Default` values.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub ticker: TickerConfig,
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub resources: ResourcesConfig,
}

impl Config {
    /// Load config from `~/.kickstart/config.toml`, falling back to
    /// defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml(&text)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.ticker.validate()?;
        self.bootstrap.validate()?;
        self.logging.validate()?;
        Ok(())
    }

    /// Directory holding config, settings and cached resources.
    pub fn data_dir(&self) -> PathBuf {
        match &self.general.data_dir {
            Some(dir) => expand_home(dir),
            None => dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".kickstart"),
        }
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".kickstart")
            .join("config.toml")
    }
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None => PathBuf::from(path),
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_app_name")]
    pub app_name: String,
    /// Overrides the data directory; `~/` is expanded.
    #[serde(default)]
    pub data_dir: Option<String>,
}

fn default_app_name() -> String {
    "kickstart".into()
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            data_dir: None,
        }
    }
}

/// Periodic broadcast timer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickerConfig {
    /// Delay between two firings.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Length of one renewal epoch. The ticker keeps running across epochs.
    #[serde(default = "default_span_ms")]
    pub span_ms: u64,
}

fn default_interval_ms() -> u64 {
    500
}
fn default_span_ms() -> u64 {
    3_600_000
}

impl Default for TickerConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            span_ms: default_span_ms(),
        }
    }
}

impl TickerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn span(&self) -> Duration {
        Duration::from_millis(self.span_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_ms == 0 {
            return Err(ConfigError::Validation(
                "ticker.interval_ms must be greater than 0".into(),
            ));
        }
        if self.span_ms < self.interval_ms {
            return Err(ConfigError::Validation(format!(
                "ticker.span_ms ({}) must be >= ticker.interval_ms ({})",
                self.span_ms, self.interval_ms
            )));
        }
        Ok(())
    }
}

/// Failure and timeout policy of one startup tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    /// Keep running sibling tasks and later tiers after a failure.
    #[serde(default = "default_true")]
    pub continue_on_error: bool,
    /// Per-task deadline; `None` waits forever.
    #[serde(default)]
    pub task_timeout_ms: Option<u64>,
}

fn default_true() -> bool {
    true
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            continue_on_error: true,
            task_timeout_ms: None,
        }
    }
}

impl TierConfig {
    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_ms.map(Duration::from_millis)
    }
}

/// Settings of the critical tier. Critical work always aborts startup on
/// failure, so `continue_on_error` defaults to `false` and may only be
/// written as `false`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CriticalTierConfig {
    #[serde(default)]
    pub continue_on_error: bool,
    /// Time budget per task. Critical work is not pre-empted; overruns are
    /// only reported.
    #[serde(default)]
    pub task_timeout_ms: Option<u64>,
}

impl CriticalTierConfig {
    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapConfig {
    #[serde(default)]
    pub critical: CriticalTierConfig,
    #[serde(default)]
    pub high_priority: TierConfig,
    #[serde(default)]
    pub background: TierConfig,
    /// Deadline for both deferred tiers together.
    #[serde(default)]
    pub startup_deadline_ms: Option<u64>,
    /// How long `shutdown` waits for teardown hooks.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

fn default_shutdown_timeout_ms() -> u64 {
    5_000
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            critical: CriticalTierConfig::default(),
            high_priority: TierConfig::default(),
            background: TierConfig::default(),
            startup_deadline_ms: None,
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl BootstrapConfig {
    pub fn startup_deadline(&self) -> Option<Duration> {
        self.startup_deadline_ms.map(Duration::from_millis)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        // Critical work runs inline and always aborts startup on failure.
        if self.critical.continue_on_error {
            return Err(ConfigError::Validation(
                "bootstrap.critical.continue_on_error cannot be enabled".into(),
            ));
        }
        for (name, timeout_ms) in [
            ("critical", self.critical.task_timeout_ms),
            ("high_priority", self.high_priority.task_timeout_ms),
            ("background", self.background.task_timeout_ms),
        ] {
            if timeout_ms == Some(0) {
                return Err(ConfigError::Validation(format!(
                    "bootstrap.{name}.task_timeout_ms must be greater than 0"
                )));
            }
        }
        if self.startup_deadline_ms == Some(0) {
            return Err(ConfigError::Validation(
                "bootstrap.startup_deadline_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Fallback filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `human` or `json`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "human".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl LoggingConfig {
    pub fn is_json(&self) -> bool {
        self.format == "json"
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.format.as_str() {
            "human" | "json" => Ok(()),
            other => Err(ConfigError::Validation(format!(
                "logging.format must be 'human' or 'json', got '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResourcesConfig {
    /// Directory preloaded into memory by the background tier.
    #[serde(default)]
    pub dir: Option<String>,
    /// Only files with these extensions are loaded; empty loads everything.
    #[serde(default)]
    pub extensions: Vec<String>,
}

impl ResourcesConfig {
    pub fn dir(&self) -> Option<PathBuf> {
        self.dir.as_deref().map(expand_home)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
