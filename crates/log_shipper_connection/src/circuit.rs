//! Circuit breaker state machine guarding the database connection.
//!
//! A HalfOpen trial closes the breaker on a single success and reopens it
//! on a single failure: no multi-success confirmation window.

use std::time::{
    Duration,
    Instant,
};

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: CircuitState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
}

/// Thread-safe circuit breaker. All mutating operations are short
/// critical sections under a `parking_lot::Mutex`, never held across an
/// `.await`.
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    failure_threshold: u32,
    open_duration: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, open_duration: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_time: None,
            }),
            failure_threshold,
            open_duration,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Returns `Some(CircuitOpen)`-worthy rejection if a caller should fail
    /// fast without touching the connector. When the open window has
    /// elapsed, flips the state to `HalfOpen` and lets exactly this check
    /// (and any racing callers that observe the same flip) through; the
    /// connection manager's connect-serializing lock ensures only one of
    /// them actually dials the database.
    pub fn should_fail_fast(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => false,
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure_time
                    .map(|t| t.elapsed() >= self.open_duration)
                    .unwrap_or(true);
                if elapsed {
                    inner.state = CircuitState::HalfOpen;
                    false
                } else {
                    true
                }
            },
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count += 1;
        inner.last_failure_time = Some(Instant::now());
        match inner.state {
            CircuitState::HalfOpen => inner.state = CircuitState::Open,
            CircuitState::Closed if inner.failure_count >= self.failure_threshold => {
                inner.state = CircuitState::Open;
            },
            CircuitState::Closed | CircuitState::Open => {},
        }
    }
}
