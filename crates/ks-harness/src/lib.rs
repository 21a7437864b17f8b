//! Operational plumbing shared by the kickstart runtime.
//!
//! Currently this is cooperative cancellation: the ticker uses a
//! [`shutdown::ShutdownSignal`] as its stop token, the bootstrap orchestrator
//! uses one to abort pending tiers and to wait for teardown hooks to drain.

pub mod shutdown;
