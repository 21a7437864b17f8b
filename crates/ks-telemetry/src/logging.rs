use ks_core::config::LoggingConfig;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global subscriber from the logging section of the config.
///
/// `RUST_LOG` wins over `config.level` when set. Safe to call multiple times
/// (e.g. in tests): only the first call installs a subscriber.
///
/// Returns `true` when this call installed the subscriber.
pub fn init_logging(service_name: &str, config: &LoggingConfig) -> bool {
    let filter = env_filter(&config.level);

    let installed = if config.is_json() {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_names(true)
            .with_current_span(true)
            .try_init()
            .is_ok()
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .try_init()
            .is_ok()
    };

    if installed {
        tracing::info!(
            service = service_name,
            format = %config.format,
            "logging initialised"
        );
    }
    installed
}

/// Shortcut for hosts without a config file.
pub fn init_default_logging(service_name: &str) -> bool {
    init_logging(service_name, &LoggingConfig::default())
}

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
