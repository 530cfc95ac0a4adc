use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// Start of the single in-flight half-open trial request
    trial_started: Option<Instant>,
    failure_threshold: u32,
    cooldown: Duration,
}

/// Per-model circuit breaker.
///
/// Closed -> Open after `failure_threshold` consecutive failures.
/// Open -> HalfOpen once `cooldown` has elapsed, letting one trial request through;
/// other callers fail fast until it resolves or has run for `cooldown`.
/// HalfOpen -> Closed on success, back to Open on failure.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_started: None,
                failure_threshold: failure_threshold.max(1),
                cooldown,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn reconfigure(&self, failure_threshold: u32, cooldown: Duration) {
        let mut inner = self.lock();
        inner.failure_threshold = failure_threshold.max(1);
        inner.cooldown = cooldown;
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Whether a request may proceed. Moves Open to HalfOpen once the
    /// cooldown has passed; the caller that gets `true` there makes the trial request.
    pub fn allow(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => {
                // A trial that never reported back is replaced after a cooldown
                let free = inner
                    .trial_started
                    .map_or(true, |at| at.elapsed() >= inner.cooldown);
                if free {
                    inner.trial_started = Some(Instant::now());
                }
                free
            }
            BreakerState::Open => {
                let cooled = inner
                    .opened_at
                    .map_or(true, |at| at.elapsed() >= inner.cooldown);
                if cooled {
                    info!("Circuit for {} half-open, trying one request", self.name);
                    inner.state = BreakerState::HalfOpen;
                    inner.trial_started = Some(Instant::now());
                }
                cooled
            }
        }
    }

    /// End a request that says nothing about backend health
    pub fn release(&self) {
        self.lock().trial_started = None;
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != BreakerState::Closed {
            info!("Circuit for {} closed", self.name);
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_started = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures += 1;
        let trip = match inner.state {
            BreakerState::HalfOpen => true,
            BreakerState::Closed => inner.consecutive_failures >= inner.failure_threshold,
            BreakerState::Open => false,
        };
        if trip {
            warn!(
                "Circuit for {} opened after {} consecutive failures",
                self.name, inner.consecutive_failures
            );
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
        }
        inner.trial_started = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new("m", 3, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow());
    }

    #[test]
    fn test_success_resets_count() {
        let breaker = CircuitBreaker::new("m", 2, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_transitions() {
        let breaker = CircuitBreaker::new("m", 1, Duration::ZERO);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        assert!(breaker.allow());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        assert!(breaker.allow());
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_admits_a_single_trial() {
        let breaker = CircuitBreaker::new("m", 1, Duration::from_millis(200));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(250));

        assert!(breaker.allow());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(!breaker.allow());
        assert!(!breaker.allow());

        // An inconclusive trial frees the slot without closing the circuit
        breaker.release();
        assert!(breaker.allow());
        assert!(!breaker.allow());

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.allow());
        assert!(breaker.allow());
    }
}
