//! Per-backend circuit breaker (§4.4): closed/open/half-open, opening after
//! `failure_threshold` consecutive failures for `reset_timeout`, with a
//! single probe allowed in half-open.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
}

impl BreakerSnapshot {
    pub fn closed() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
        }
    }
}

pub(crate) struct Breaker {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_probe_in_flight: bool,
}

impl Breaker {
    pub(crate) fn new() -> Self {
        Self {
            consecutive_failures: 0,
            opened_at: None,
            half_open_probe_in_flight: false,
        }
    }

    fn state(&self, reset_timeout: Duration) -> BreakerState {
        match self.opened_at {
            None => BreakerState::Closed,
            Some(opened_at) => {
                if self.half_open_probe_in_flight {
                    BreakerState::HalfOpen
                } else if opened_at.elapsed() >= reset_timeout {
                    BreakerState::HalfOpen
                } else {
                    BreakerState::Open
                }
            }
        }
    }

    /// Whether a new call may be attempted right now. Consumes the single
    /// half-open probe slot if the breaker has just transitioned.
    pub(crate) fn allow_call(&mut self, reset_timeout: Duration) -> bool {
        match self.state(reset_timeout) {
            BreakerState::Closed => true,
            BreakerState::Open => false,
            BreakerState::HalfOpen => {
                if self.half_open_probe_in_flight {
                    false
                } else {
                    self.half_open_probe_in_flight = true;
                    true
                }
            }
        }
    }

    pub(crate) fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.half_open_probe_in_flight = false;
    }

    pub(crate) fn record_failure(&mut self, failure_threshold: u32) {
        self.half_open_probe_in_flight = false;
        self.consecutive_failures += 1;
        if self.consecutive_failures >= failure_threshold {
            self.opened_at = Some(Instant::now());
        }
    }

    pub(crate) fn snapshot(&self) -> BreakerSnapshot {
        // `reset_timeout` only affects open->half-open transition, which a
        // caller-facing snapshot reports as still `Open` until a call is
        // actually attempted; pass a timeout of zero duration semantics by
        // reusing the stored `opened_at` directly here.
        let state = if self.opened_at.is_some() {
            BreakerState::Open
        } else {
            BreakerState::Closed
        };
        BreakerSnapshot {
            state,
            consecutive_failures: self.consecutive_failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let mut breaker = Breaker::new();
        for _ in 0..4 {
            breaker.record_failure(5);
            assert_eq!(breaker.state(Duration::from_secs(30)), BreakerState::Closed);
        }
        breaker.record_failure(5);
        assert_eq!(breaker.state(Duration::from_secs(30)), BreakerState::Open);
    }

    #[test]
    fn success_resets_the_failure_count() {
        let mut breaker = Breaker::new();
        breaker.record_failure(5);
        breaker.record_failure(5);
        breaker.record_success();
        assert_eq!(breaker.consecutive_failures, 0);
        assert_eq!(breaker.state(Duration::from_secs(30)), BreakerState::Closed);
    }

    #[test]
    fn half_open_admits_exactly_one_probe() {
        let mut breaker = Breaker::new();
        for _ in 0..5 {
            breaker.record_failure(5);
        }
        breaker.opened_at = Some(Instant::now() - Duration::from_secs(31));
        assert!(breaker.allow_call(Duration::from_secs(30)));
        assert!(!breaker.allow_call(Duration::from_secs(30)));
    }
}
