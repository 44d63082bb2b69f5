//! Consecutive-failure circuit breaker.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::bus::{BusError, Result};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through.
    Closed,
    /// Calls are rejected until the break duration elapses.
    Open,
    /// One trial call decides whether to close or reopen.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Opens after `failure_threshold` consecutive failures, stays open for
/// `break_duration`, then admits a single trial call.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    break_duration: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, break_duration: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            break_duration,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Admit a call or reject it with [`BusError::CircuitOpen`].
    ///
    /// The returned guard must be settled with [`CallGuard::success`],
    /// [`CallGuard::failure`] or [`CallGuard::ignore`]. A guard dropped
    /// unsettled (the call was cancelled) records a failure.
    pub fn try_acquire(&self) -> Result<CallGuard<'_>> {
        let mut state = self.lock();
        match state.state {
            CircuitState::Closed => Ok(CallGuard::new(self, false)),
            CircuitState::Open => {
                let elapsed = state
                    .opened_at
                    .map(|opened| opened.elapsed())
                    .unwrap_or(self.break_duration);
                if elapsed < self.break_duration {
                    return Err(BusError::CircuitOpen {
                        retry_after: self.break_duration - elapsed,
                    });
                }
                info!(from = %CircuitState::Open, to = %CircuitState::HalfOpen, "Circuit breaker state transition");
                state.state = CircuitState::HalfOpen;
                state.trial_in_flight = true;
                Ok(CallGuard::new(self, true))
            }
            CircuitState::HalfOpen if state.trial_in_flight => Err(BusError::CircuitOpen {
                retry_after: Duration::ZERO,
            }),
            CircuitState::HalfOpen => {
                state.trial_in_flight = true;
                Ok(CallGuard::new(self, true))
            }
        }
    }

    fn transition(&self, state: &mut BreakerState, to: CircuitState) {
        if state.state == to {
            return;
        }
        match to {
            CircuitState::Open => warn!(
                from = %state.state,
                to = %to,
                consecutive_failures = state.consecutive_failures,
                break_duration_ms = self.break_duration.as_millis() as u64,
                "Circuit breaker state transition"
            ),
            _ => info!(from = %state.state, to = %to, "Circuit breaker state transition"),
        }
        state.state = to;
    }

    /// Only the half-open trial may close the circuit. A late success from a
    /// call admitted before the circuit opened leaves Open and HalfOpen alone.
    fn on_success(&self, trial: bool) {
        let mut state = self.lock();
        if !trial {
            if state.state == CircuitState::Closed {
                state.consecutive_failures = 0;
            }
            return;
        }
        state.trial_in_flight = false;
        state.consecutive_failures = 0;
        state.opened_at = None;
        self.transition(&mut state, CircuitState::Closed);
    }

    fn on_failure(&self, trial: bool) {
        let mut state = self.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);

        let trip = if trial {
            state.trial_in_flight = false;
            true
        } else {
            state.state == CircuitState::Closed
                && state.consecutive_failures >= self.failure_threshold
        };

        if trip {
            state.opened_at = Some(Instant::now());
            self.transition(&mut state, CircuitState::Open);
        }
    }

    fn on_ignored(&self, trial: bool) {
        if trial {
            self.lock().trial_in_flight = false;
        }
    }
}

/// Outcome slot for one admitted call.
#[must_use = "an unsettled guard records a failure when dropped"]
pub struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> CallGuard<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.trial);
    }

    /// Settle without affecting the failure count.
    pub fn ignore(mut self) {
        self.settled = true;
        self.breaker.on_ignored(self.trial);
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_failure(self.trial);
        }
    }
}
