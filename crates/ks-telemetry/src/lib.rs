//! Observability setup for kickstart hosts.
//!
//! - **logging**: `tracing-subscriber` initialisation from [`LoggingConfig`],
//!   human-readable or JSON
//! - **panic**: a panic hook that reports panics through `tracing` before
//!   handing over to the previously installed hook
//!
//! [`LoggingConfig`]: ks_core::config::LoggingConfig

pub mod logging;
pub mod panic;
