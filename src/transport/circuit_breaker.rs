//! Per-endpoint circuit breaker.
//!
//! `Closed` lets every call through and counts consecutive transient failures. Reaching the
//! threshold opens the circuit: calls fail fast, without I/O, until the cooldown elapses. The
//! first call after the cooldown is the single `HalfOpen` probe; its success closes the circuit,
//! its failure opens it again for another cooldown.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Observable state of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are refused until the cooldown elapses.
    Open,
    /// One probe call is allowed.
    HalfOpen,
}

/// Breaker tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long an open circuit refuses calls.
    pub cooldown: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(5),
        }
    }
}

/// Verdict for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    /// Circuit closed.
    Allowed,
    /// This attempt is the half-open probe.
    Probe,
    /// Fail fast.
    Rejected,
}

#[derive(Debug, Clone)]
pub(crate) struct CircuitBreaker {
    settings: BreakerSettings,
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_started: Option<Instant>,
}

impl CircuitBreaker {
    pub(crate) fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_started: None,
        }
    }

    /// State as seen at `now`: an open circuit whose cooldown elapsed reports `HalfOpen`.
    pub(crate) fn state(&self, now: Instant) -> CircuitState {
        match (self.state, self.opened_at) {
            (CircuitState::Open, Some(at)) if now.duration_since(at) >= self.settings.cooldown => {
                CircuitState::HalfOpen
            }
            (state, _) => state,
        }
    }

    pub(crate) fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub(crate) fn admit(&mut self, now: Instant) -> Admission {
        match self.state(now) {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => Admission::Rejected,
            CircuitState::HalfOpen => {
                // a probe whose outcome never came back (cancelled caller) is given up on
                // after one cooldown
                let probe_pending = self
                    .probe_started
                    .is_some_and(|at| now.duration_since(at) < self.settings.cooldown);
                if probe_pending {
                    return Admission::Rejected;
                }
                self.state = CircuitState::HalfOpen;
                self.probe_started = Some(now);
                debug!("circuit half-open, sending probe");
                Admission::Probe
            }
        }
    }

    /// The endpoint answered (even with an application error).
    pub(crate) fn on_success(&mut self) {
        if self.state != CircuitState::Closed {
            debug!("circuit closed");
        }
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.probe_started = None;
    }

    /// Transient failure (timeout, connection refused).
    pub(crate) fn on_failure(&mut self, now: Instant) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        match self.state {
            CircuitState::HalfOpen => self.open(now),
            CircuitState::Closed if self.consecutive_failures >= self.settings.failure_threshold => {
                self.open(now)
            }
            _ => {}
        }
    }

    fn open(&mut self, now: Instant) {
        warn!(
            failures = self.consecutive_failures(),
            cooldown = ?self.settings.cooldown,
            "circuit opened"
        );
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.probe_started = None;
    }
}
