//! Dispatch circuit breaker.
//!
//! After five consecutive unhandled dispatcher failures, new dispatch starts
//! are suspended for five minutes. In-flight dispatches continue; only the
//! supervisor consults the breaker before spawning.

use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::defaults::{CIRCUIT_FAILURE_THRESHOLD, CIRCUIT_SUSPENSION_SECS};

#[derive(Debug)]
struct State {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: std::sync::Mutex<State>,
    threshold: u32,
    suspension: Duration,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(
            CIRCUIT_FAILURE_THRESHOLD,
            Duration::from_secs(CIRCUIT_SUSPENSION_SECS),
        )
    }
}

impl CircuitBreaker {
    pub fn new(threshold: u32, suspension: Duration) -> Self {
        Self {
            state: std::sync::Mutex::new(State {
                consecutive_failures: 0,
                open_until: None,
            }),
            threshold,
            suspension,
        }
    }

    /// Whether new dispatch starts are currently suspended.
    pub fn is_open(&self) -> bool {
        let mut state = self.lock();
        match state.open_until {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                // Suspension elapsed: close and start counting fresh.
                state.open_until = None;
                state.consecutive_failures = 0;
                info!("Dispatch circuit closed after suspension");
                false
            }
            None => false,
        }
    }

    pub fn record_success(&self) {
        self.lock().consecutive_failures = 0;
    }

    /// Record a failure; returns true when this one opened the circuit.
    pub fn record_failure(&self) -> bool {
        let mut state = self.lock();
        state.consecutive_failures += 1;
        if state.open_until.is_none() && state.consecutive_failures >= self.threshold {
            state.open_until = Some(Instant::now() + self.suspension);
            warn!(
                failures = state.consecutive_failures,
                suspension_secs = self.suspension.as_secs(),
                "Dispatch circuit opened, suspending new dispatch starts"
            );
            return true;
        }
        false
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        assert!(!breaker.record_failure());
        assert!(!breaker.record_failure());
        assert!(breaker.record_failure());
        assert!(breaker.is_open());
    }

    #[test]
    fn success_resets_the_streak() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert!(!breaker.record_failure());
        assert!(!breaker.is_open());
    }

    #[test]
    fn closes_after_suspension_elapses() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(0));
        breaker.record_failure();
        // Zero-length suspension is immediately over.
        assert!(!breaker.is_open());
    }
}
