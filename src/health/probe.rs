//! Per-watch probe state machine
//!
//! ```text
//! Scheduled --begin_check--> Checking --pass--> Resolved(Healthy)
//!     ^                          |
//!     +-------fail (budget left)-+--fail (budget spent)--> Resolved(Unhealthy)
//! ```
//!
//! Cancellation moves any unresolved state to `Resolved(Cancelled)`. The
//! machine has no notion of time; the monitor task asks it how long to wait
//! and feeds it check results.

use crate::stack::HealthProbe;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Final result of a watch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthOutcome {
    Healthy { checks: u32 },
    Unhealthy { checks: u32, last_error: String },
    Cancelled,
}

impl HealthOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthOutcome::Healthy { .. })
    }
}

/// Result of a single check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckResult {
    Pass,
    Fail(String),
    TimedOut,
}

/// Probe state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeState {
    Scheduled,
    Checking,
    Resolved(HealthOutcome),
}

#[derive(Debug, Clone)]
pub struct ProbeMachine {
    interval: Duration,
    timeout: Duration,
    start_period: Duration,
    retries: u32,
    checks: u32,
    consecutive_failures: u32,
    state: ProbeState,
}

impl ProbeMachine {
    pub fn new(probe: &HealthProbe) -> Self {
        Self {
            interval: probe.interval,
            timeout: probe.timeout,
            start_period: probe.start_period,
            retries: probe.retries.max(1),
            checks: 0,
            consecutive_failures: 0,
            state: ProbeState::Scheduled,
        }
    }

    pub fn state(&self) -> &ProbeState {
        &self.state
    }

    /// Checks completed so far
    pub fn checks(&self) -> u32 {
        self.checks
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// How long to wait before the next check
    pub fn next_delay(&self) -> Duration {
        if self.checks == 0 {
            self.start_period
        } else {
            self.interval
        }
    }

    /// Move from `Scheduled` to `Checking`; false in any other state
    pub fn begin_check(&mut self) -> bool {
        if self.state == ProbeState::Scheduled {
            self.state = ProbeState::Checking;
            true
        } else {
            false
        }
    }

    /// Feed the result of the check that is in flight
    pub fn record(&mut self, result: CheckResult) -> &ProbeState {
        if self.state != ProbeState::Checking {
            return &self.state;
        }
        self.checks += 1;

        let error = match result {
            CheckResult::Pass => {
                self.state = ProbeState::Resolved(HealthOutcome::Healthy {
                    checks: self.checks,
                });
                return &self.state;
            }
            CheckResult::Fail(error) => error,
            CheckResult::TimedOut => format!("check timed out after {:?}", self.timeout),
        };

        self.consecutive_failures += 1;
        self.state = if self.consecutive_failures >= self.retries {
            ProbeState::Resolved(HealthOutcome::Unhealthy {
                checks: self.checks,
                last_error: error,
            })
        } else {
            ProbeState::Scheduled
        };
        &self.state
    }

    pub fn cancel(&mut self) {
        if !matches!(self.state, ProbeState::Resolved(_)) {
            self.state = ProbeState::Resolved(HealthOutcome::Cancelled);
        }
    }

    pub fn outcome(&self) -> Option<&HealthOutcome> {
        match &self.state {
            ProbeState::Resolved(outcome) => Some(outcome),
            _ => None,
        }
    }
}
