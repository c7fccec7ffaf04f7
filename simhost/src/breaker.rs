//! Per-module circuit breaker.
//!
//! A failing module is quarantined after `failure_threshold` consecutive
//! failures, skipped while open, and probed with a single execution once the
//! reset timeout elapses. Callers pass the clock in, which keeps transitions
//! deterministic under test.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_available: bool,
}

pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    failure_threshold: u32,
    reset_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_available: false,
            }),
            failure_threshold,
            reset_timeout,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Whether an execution may start at `now`. An elapsed reset timeout
    /// moves Open to HalfOpen and admits exactly one probe.
    pub fn can_run(&self, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map_or(false, |at| now.duration_since(at) >= self.reset_timeout);
                if elapsed {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_available = true;
                }
                if inner.state == CircuitState::HalfOpen && inner.probe_available {
                    inner.probe_available = false;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_available {
                    inner.probe_available = false;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        if inner.state != CircuitState::Closed {
            log::info!("circuit closed after successful probe");
        }
        inner.state = CircuitState::Closed;
        inner.opened_at = None;
        inner.probe_available = false;
    }

    pub fn record_failure(&self, now: Instant) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                    log::warn!(
                        "circuit opened after {} consecutive failures",
                        inner.consecutive_failures
                    );
                }
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                inner.probe_available = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESET: Duration = Duration::from_millis(100);

    #[test]
    fn opens_exactly_on_kth_consecutive_failure() {
        let breaker = CircuitBreaker::new(3, RESET);
        let now = Instant::now();

        breaker.record_failure(now);
        breaker.record_failure(now);
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure(now);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_run(now));
    }

    #[test]
    fn success_resets_the_failure_streak() {
        let breaker = CircuitBreaker::new(3, RESET);
        let now = Instant::now();

        breaker.record_failure(now);
        breaker.record_failure(now);
        breaker.record_success();
        breaker.record_failure(now);
        breaker.record_failure(now);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn one_probe_per_reset_interval() {
        let breaker = CircuitBreaker::new(1, RESET);
        let t0 = Instant::now();
        breaker.record_failure(t0);
        assert!(!breaker.can_run(t0));

        let t1 = t0 + RESET;
        assert!(breaker.can_run(t1));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        // The single probe is spent; nothing else may run this interval.
        assert!(!breaker.can_run(t1));

        breaker.record_failure(t1);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_run(t1 + RESET / 2));
        assert!(breaker.can_run(t1 + RESET));
    }

    #[test]
    fn successful_probe_closes_the_circuit() {
        let breaker = CircuitBreaker::new(1, RESET);
        let t0 = Instant::now();
        breaker.record_failure(t0);
        assert!(breaker.can_run(t0 + RESET));
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.can_run(t0 + RESET));
    }
}
