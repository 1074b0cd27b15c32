//! Circuit breaker around remote facilitator calls.
//!
//! Breaker state is process-local on purpose: in a multi-instance deployment
//! each instance tracks facilitator health independently, and the cost of a
//! redundant open circuit is a few extra timeouts, not a correctness
//! violation.
//!
//! States:
//! - `Closed`: calls pass through; failures increment a consecutive counter,
//!   any success resets it.
//! - `Open`: calls fail fast until the recovery timeout elapses.
//! - `HalfOpen`: entered automatically after the timeout; one probe call is
//!   admitted at a time, a configurable run of consecutive successes closes
//!   the circuit, and any failure reopens it with a fresh timeout.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Error returned when a call is rejected because the circuit is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Circuit breaker is open")]
pub struct CircuitOpenError;

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Consecutive-failure circuit breaker with half-open probing.
///
/// Thresholds are constructor parameters; there are no hardcoded policy
/// values.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    success_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Creates a breaker that opens after `failure_threshold` consecutive
    /// failures, half-opens after `recovery_timeout`, and closes again after
    /// `success_threshold` consecutive half-open successes.
    pub fn new(failure_threshold: u32, recovery_timeout: Duration, success_threshold: u32) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            success_threshold: success_threshold.max(1),
            recovery_timeout,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// The current state, after applying any due open → half-open transition.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock().expect("circuit breaker lock poisoned");
        self.refresh(&mut inner);
        inner.state
    }

    /// Admits or rejects a call.
    ///
    /// In `HalfOpen`, only one probe may be in flight; the admitted caller
    /// must report the outcome through [`CircuitBreaker::record_success`] or
    /// [`CircuitBreaker::record_failure`] to release the probe slot.
    pub fn try_acquire(&self) -> Result<(), CircuitOpenError> {
        let mut inner = self.inner.lock().expect("circuit breaker lock poisoned");
        self.refresh(&mut inner);
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => Err(CircuitOpenError),
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(CircuitOpenError)
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Reports a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker lock poisoned");
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.probe_in_flight = false;
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.consecutive_successes = 0;
                    inner.opened_at = None;
                }
            }
            // A success reported after the circuit re-opened is stale.
            CircuitState::Open => {}
        }
    }

    /// Reports a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker lock poisoned");
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    self.trip(&mut inner);
                }
            }
            CircuitState::HalfOpen => {
                self.trip(&mut inner);
            }
            CircuitState::Open => {}
        }
    }

    fn trip(&self, inner: &mut Inner) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.consecutive_successes = 0;
        inner.probe_in_flight = false;
        tracing::warn!(
            failures = inner.consecutive_failures,
            recovery_timeout = ?self.recovery_timeout,
            "Circuit breaker opened"
        );
    }

    fn refresh(&self, inner: &mut Inner) {
        if inner.state == CircuitState::Open
            && let Some(opened_at) = inner.opened_at
            && opened_at.elapsed() >= self.recovery_timeout
        {
            inner.state = CircuitState::HalfOpen;
            inner.consecutive_successes = 0;
            inner.probe_in_flight = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(3, Duration::from_millis(50), 2)
    }

    #[test]
    fn opens_after_consecutive_failures() {
        let breaker = breaker();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.try_acquire(), Err(CircuitOpenError));
    }

    #[test]
    fn success_resets_the_failure_count() {
        let breaker = breaker();
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_opens_after_the_recovery_timeout() {
        let breaker = breaker();
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn half_open_admits_one_probe_at_a_time() {
        let breaker = breaker();
        for _ in 0..3 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(60));
        assert!(breaker.try_acquire().is_ok());
        assert_eq!(breaker.try_acquire(), Err(CircuitOpenError));
        breaker.record_success();
        assert!(breaker.try_acquire().is_ok());
    }

    #[test]
    fn closes_after_enough_half_open_successes() {
        let breaker = breaker();
        for _ in 0..3 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(60));
        breaker.try_acquire().unwrap();
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.try_acquire().unwrap();
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.try_acquire().is_ok());
    }

    #[test]
    fn half_open_failure_reopens_with_a_fresh_timeout() {
        let breaker = breaker();
        for _ in 0..3 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(60));
        breaker.try_acquire().unwrap();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.try_acquire(), Err(CircuitOpenError));
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }
}
