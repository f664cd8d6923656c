//! Per-service circuit state machine.
//!
//! Transition logic takes the current time as an explicit argument so the
//! machine itself never reads a clock. Public registry wrappers pass
//! `Instant::now()`; tests pass whatever instant they need.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// The three circuit states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation; failures are counted.
    Closed,
    /// Calls are rejected without executing.
    Open,
    /// Limited traffic probes for recovery.
    HalfOpen,
}

impl CircuitState {
    /// Canonical string form, as logged and broadcast.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tuning for one circuit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Failures within the monitoring window that trip the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long the circuit stays open before probing.
    #[serde(default = "default_reset_timeout")]
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,

    /// Consecutive half-open successes required to close.
    #[serde(default = "default_half_open_success_threshold")]
    pub half_open_success_threshold: u32,

    /// Rolling window within which failures count toward the threshold.
    #[serde(default = "default_monitor_window")]
    #[serde(with = "humantime_serde")]
    pub monitor_window: Duration,
}

const fn default_failure_threshold() -> u32 {
    5
}

const fn default_reset_timeout() -> Duration {
    Duration::from_secs(30)
}

const fn default_half_open_success_threshold() -> u32 {
    3
}

const fn default_monitor_window() -> Duration {
    Duration::from_secs(60)
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout: default_reset_timeout(),
            half_open_success_threshold: default_half_open_success_threshold(),
            monitor_window: default_monitor_window(),
        }
    }
}

/// A completed state transition, for audit and broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// Service whose circuit transitioned.
    pub service: String,

    /// State before.
    pub previous: CircuitState,

    /// State after.
    pub current: CircuitState,

    /// Failure count at the time of the transition.
    pub failure_count: u32,
}

/// One service's circuit.
///
/// Created lazily by the registry on first use and kept for the process
/// lifetime. All mutation goes through the `*_at` methods.
#[derive(Debug)]
pub struct Circuit {
    name: String,
    config: CircuitConfig,
    state: CircuitState,
    failure_count: u32,
    half_open_successes: u32,
    last_failure_at: Option<Instant>,
    last_success_at: Option<Instant>,
    opened_at: Option<Instant>,
}

impl Circuit {
    /// Creates a closed circuit.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            half_open_successes: 0,
            last_failure_at: None,
            last_success_at: None,
            opened_at: None,
        }
    }

    /// Service name this circuit guards.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> CircuitState {
        self.state
    }

    /// Current failure count.
    #[must_use]
    pub const fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Configuration in effect.
    #[must_use]
    pub const fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Instant of the most recent recorded failure.
    #[must_use]
    pub const fn last_failure_at(&self) -> Option<Instant> {
        self.last_failure_at
    }

    /// Instant of the most recent recorded success.
    #[must_use]
    pub const fn last_success_at(&self) -> Option<Instant> {
        self.last_success_at
    }

    /// Whether a call may proceed at `now`.
    ///
    /// An open circuit whose reset deadline has passed flips to half-open
    /// here, so admission does not depend on timer scheduling.
    pub(crate) fn can_execute_at(&mut self, now: Instant) -> (bool, Option<Transition>) {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => (true, None),
            CircuitState::Open => {
                if self.reset_deadline_passed(now) {
                    let transition = self.transition(CircuitState::HalfOpen);
                    (true, Some(transition))
                } else {
                    (false, None)
                }
            },
        }
    }

    /// Records a successful call at `now`.
    pub(crate) fn record_success_at(&mut self, now: Instant) -> Option<Transition> {
        self.last_success_at = Some(now);
        match self.state {
            CircuitState::Closed => {
                self.failure_count = 0;
                None
            },
            CircuitState::HalfOpen => {
                self.half_open_successes += 1;
                if self.half_open_successes >= self.config.half_open_success_threshold {
                    self.failure_count = 0;
                    Some(self.transition(CircuitState::Closed))
                } else {
                    None
                }
            },
            // A call that was already in flight when the circuit opened.
            CircuitState::Open => None,
        }
    }

    /// Records a failed call at `now`.
    ///
    /// Window semantics: when the previous failure is older than the
    /// monitoring window the whole counter restarts, rather than evicting
    /// stale failures one by one. A slow trickle of old failures therefore
    /// never trips the circuit.
    pub(crate) fn record_failure_at(&mut self, now: Instant) -> Option<Transition> {
        match self.state {
            CircuitState::Closed => {
                if let Some(last) = self.last_failure_at {
                    if now.duration_since(last) > self.config.monitor_window {
                        self.failure_count = 0;
                    }
                }
                self.failure_count += 1;
                self.last_failure_at = Some(now);
                if self.failure_count >= self.config.failure_threshold {
                    Some(self.open_at(now))
                } else {
                    None
                }
            },
            // Any half-open failure trips the circuit again immediately.
            CircuitState::HalfOpen => {
                self.failure_count += 1;
                self.last_failure_at = Some(now);
                Some(self.open_at(now))
            },
            CircuitState::Open => {
                self.last_failure_at = Some(now);
                None
            },
        }
    }

    /// Operator override back to closed, clearing all counters.
    pub(crate) fn force_closed(&mut self) -> Option<Transition> {
        self.failure_count = 0;
        self.half_open_successes = 0;
        self.opened_at = None;
        if self.state == CircuitState::Closed {
            None
        } else {
            Some(self.transition(CircuitState::Closed))
        }
    }

    /// Flips open to half-open if the reset deadline has passed.
    pub(crate) fn try_half_open_at(&mut self, now: Instant) -> Option<Transition> {
        if self.state == CircuitState::Open && self.reset_deadline_passed(now) {
            Some(self.transition(CircuitState::HalfOpen))
        } else {
            None
        }
    }

    fn reset_deadline_passed(&self, now: Instant) -> bool {
        self.opened_at
            .is_some_and(|opened| now.duration_since(opened) >= self.config.reset_timeout)
    }

    fn open_at(&mut self, now: Instant) -> Transition {
        self.opened_at = Some(now);
        self.half_open_successes = 0;
        self.transition(CircuitState::Open)
    }

    fn transition(&mut self, next: CircuitState) -> Transition {
        let previous = self.state;
        self.state = next;
        if next == CircuitState::HalfOpen {
            self.half_open_successes = 0;
        }
        Transition {
            service: self.name.clone(),
            previous,
            current: next,
            failure_count: self.failure_count,
        }
    }
}
