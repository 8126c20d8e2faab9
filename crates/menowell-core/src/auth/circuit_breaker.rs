//! Retry policy for calls to the identity backend.
//!
//! ```text
//! Closed --[failure_threshold reached]--> Open
//! Open --[reset_timeout elapsed]--> HalfOpen
//! HalfOpen --[success]--> Closed
//! HalfOpen --[failure]--> Open
//! ```
//!
//! `CircuitBreaker` holds configuration only. The mutable fields live in a
//! `BreakerState` owned by the caller, and the current time is passed in, so
//! every decision is a deterministic function of its inputs.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default consecutive failures before the circuit opens
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Default cool-down before an open circuit lets a trial call through
pub const DEFAULT_RESET_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of trial calls allowed while half-open
pub const DEFAULT_HALF_OPEN_MAX_CALLS: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Whether moving from `self` to `next` follows the breaker's cycle.
    /// Staying put is always allowed.
    pub fn can_transition_to(self, next: CircuitState) -> bool {
        use CircuitState::*;
        matches!(
            (self, next),
            (Closed, Closed)
                | (Open, Open)
                | (HalfOpen, HalfOpen)
                | (Closed, Open)
                | (Open, HalfOpen)
                | (HalfOpen, Closed)
                | (HalfOpen, Open)
        )
    }

    /// Legal steps leading from `self` to `target`, excluding `self`. Empty
    /// when already there.
    pub fn path_to(self, target: CircuitState) -> Vec<CircuitState> {
        use CircuitState::*;
        match (self, target) {
            (from, to) if from == to => Vec::new(),
            (Open, Closed) => vec![HalfOpen, Closed],
            (Closed, HalfOpen) => vec![Open, HalfOpen],
            (_, to) => vec![to],
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BreakerState {
    pub state: CircuitState,
    /// Consecutive failures since the last success
    pub failure_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    /// Trial calls handed out since entering half-open
    pub half_open_calls: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    reset_timeout: Duration,
    half_open_max_calls: u32,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            reset_timeout: DEFAULT_RESET_TIMEOUT,
            half_open_max_calls: DEFAULT_HALF_OPEN_MAX_CALLS,
        }
    }
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_timeout: Duration, half_open_max_calls: u32) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
            half_open_max_calls: half_open_max_calls.max(1),
        }
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    pub fn reset_timeout(&self) -> Duration {
        self.reset_timeout
    }

    pub fn half_open_max_calls(&self) -> u32 {
        self.half_open_max_calls
    }

    /// Decide whether a call may go out now. An open circuit whose cool-down
    /// has elapsed moves to half-open and hands out the first trial call.
    pub fn can_execute(&self, breaker: &mut BreakerState, now: DateTime<Utc>) -> bool {
        match breaker.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if !self.cooldown_elapsed(breaker, now) {
                    return false;
                }
                breaker.state = CircuitState::HalfOpen;
                breaker.half_open_calls = 1;
                true
            }
            CircuitState::HalfOpen => {
                if breaker.half_open_calls < self.half_open_max_calls {
                    breaker.half_open_calls += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn on_success(&self, breaker: &mut BreakerState) {
        breaker.state = CircuitState::Closed;
        breaker.failure_count = 0;
        breaker.last_failure_time = None;
        breaker.half_open_calls = 0;
    }

    pub fn on_failure(&self, breaker: &mut BreakerState, now: DateTime<Utc>) {
        breaker.failure_count = breaker.failure_count.saturating_add(1);
        breaker.last_failure_time = Some(now);

        match breaker.state {
            CircuitState::HalfOpen => {
                breaker.state = CircuitState::Open;
                breaker.half_open_calls = 0;
            }
            CircuitState::Closed if breaker.failure_count >= self.failure_threshold => {
                breaker.state = CircuitState::Open;
            }
            _ => {}
        }
    }

    /// Time left before an open circuit allows a trial call. `None` unless
    /// the circuit is open and still cooling down.
    pub fn retry_after(&self, breaker: &BreakerState, now: DateTime<Utc>) -> Option<Duration> {
        if breaker.state != CircuitState::Open {
            return None;
        }
        let last = breaker.last_failure_time?;
        let reset = chrono::Duration::from_std(self.reset_timeout).ok()?;
        let remaining = (last + reset) - now;
        remaining.to_std().ok().filter(|d| !d.is_zero())
    }

    fn cooldown_elapsed(&self, breaker: &BreakerState, now: DateTime<Utc>) -> bool {
        let Some(last) = breaker.last_failure_time else {
            return true;
        };
        match chrono::Duration::from_std(self.reset_timeout) {
            Ok(reset) => now - last >= reset,
            Err(_) => false,
        }
    }
}
