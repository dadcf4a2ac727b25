//! Motion Session state machine.
//!
//! A session holds one target position until its deadline. The hold loop
//! that drives the actuator lives in the server; this module only decides
//! what the loop should do next.
//!
//! ```text
//!              deadline reached / repeated faults
//!   Running ──────────────────────────────────────▶ Expired
//!      │  newer request accepted
//!      ├──────────────────────────────────────────▶ Superseded
//!      │  cancel(handle)
//!      └──────────────────────────────────────────▶ Cancelled
//! ```
//!
//! All three end states are terminal; no transition leaves them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// Identity of a motion session, unique within one arbiter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Running,
    Expired,
    Superseded,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionState::Running)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Running => write!(f, "running"),
            SessionState::Expired => write!(f, "expired"),
            SessionState::Superseded => write!(f, "superseded"),
            SessionState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Tunables for the hold loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HoldPolicy {
    /// Time between two re-assertions of the target
    #[serde(with = "crate::serde_millis")]
    pub reassert_interval: Duration,
    /// Consecutive actuator faults after which the session gives up
    pub fault_threshold: u32,
}

impl Default for HoldPolicy {
    fn default() -> Self {
        Self {
            reassert_interval: Duration::from_millis(100),
            fault_threshold: 3,
        }
    }
}

/// What the hold loop should do after an actuator fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultVerdict {
    /// Log and keep re-asserting
    Continue { consecutive: u32 },
    /// Threshold reached; the session has expired early
    GiveUp { consecutive: u32 },
}

/// Per-session bookkeeping for the hold loop.
///
/// Time is passed in by the caller so the same logic can be tested without a
/// clock.
#[derive(Debug, Clone)]
pub struct HoldTracker {
    state: SessionState,
    deadline: Instant,
    policy: HoldPolicy,
    consecutive_faults: u32,
    commands: u64,
    last_fault: Option<String>,
}

impl HoldTracker {
    pub fn new(started: Instant, duration: Duration, policy: HoldPolicy) -> Self {
        Self {
            state: SessionState::Running,
            deadline: started + duration,
            policy,
            consecutive_faults: 0,
            commands: 0,
            last_fault: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Number of actuator commands issued so far (successful or not)
    pub fn commands(&self) -> u64 {
        self.commands
    }

    pub fn last_fault(&self) -> Option<&str> {
        self.last_fault.as_deref()
    }

    pub fn is_running(&self) -> bool {
        self.state == SessionState::Running
    }

    /// Time left before the deadline
    pub fn remaining(&self, now: Instant) -> Duration {
        self.deadline.saturating_duration_since(now)
    }

    pub fn record_success(&mut self) {
        self.commands += 1;
        self.consecutive_faults = 0;
    }

    pub fn record_fault(&mut self, message: impl Into<String>) -> FaultVerdict {
        self.commands += 1;
        self.consecutive_faults += 1;
        self.last_fault = Some(message.into());
        if self.consecutive_faults >= self.policy.fault_threshold.max(1) {
            self.transition(SessionState::Expired);
            FaultVerdict::GiveUp {
                consecutive: self.consecutive_faults,
            }
        } else {
            FaultVerdict::Continue {
                consecutive: self.consecutive_faults,
            }
        }
    }

    /// How long to sleep before the next re-assertion.
    ///
    /// Returns `None` and moves to `Expired` once the deadline has passed. The
    /// wait never overshoots the deadline, so a session stops at most one
    /// interval after it.
    pub fn next_wait(&mut self, now: Instant) -> Option<Duration> {
        if !self.is_running() {
            return None;
        }
        if now >= self.deadline {
            self.transition(SessionState::Expired);
            return None;
        }
        Some(self.policy.reassert_interval.min(self.deadline - now))
    }

    pub fn supersede(&mut self) -> bool {
        self.transition(SessionState::Superseded)
    }

    pub fn cancel(&mut self) -> bool {
        self.transition(SessionState::Cancelled)
    }

    // Only Running may change; terminal states stick.
    fn transition(&mut self, to: SessionState) -> bool {
        if self.state == SessionState::Running && to != SessionState::Running {
            self.state = to;
            true
        } else {
            false
        }
    }
}
