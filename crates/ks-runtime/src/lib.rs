//! Startup and lifecycle runtime for kickstart hosts.
//!
//! The runtime owns the small concurrency core that runs when a process
//! starts:
//! - **bootstrap**: the tiered startup orchestrator (critical work inline,
//!   high-priority work fanned out, background work after a barrier)
//! - **ticker**: a periodic broadcast timer notifying weakly-held listeners
//! - **background**: the isolated blocking-task helper both of them build on
//! - **app**: the explicit application context and the standard host wiring

pub mod app;
pub mod background;
pub mod bootstrap;
pub mod ticker;
