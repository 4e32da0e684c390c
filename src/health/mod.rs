//! Health checking
//!
//! A probe resolves an instance to healthy on its first passing check, or to
//! unhealthy once `retries` consecutive checks have failed or timed out.

pub mod monitor;
pub mod probe;

pub use monitor::{HealthMonitor, WatchHandle};
pub use probe::{CheckResult, HealthOutcome, ProbeMachine, ProbeState};
