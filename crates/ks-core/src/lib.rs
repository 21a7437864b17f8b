//! Core types and collaborator boundaries for the kickstart runtime.
//!
//! Everything here is consumed by the bootstrap orchestrator as opaque units
//! of work or by hosts that want periodic notifications:
//! - **config**: TOML configuration with per-section defaults and validation
//! - **settings**: persisted user settings behind the `SettingsStore` trait
//! - **resources**: in-memory preloading of bundled resource files
//! - **dispatch**: a main-thread job queue that any thread can post into

pub mod config;
pub mod dispatch;
pub mod resources;
pub mod settings;
