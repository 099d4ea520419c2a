//! Circuit breaker for the fetch loop.
//!
//! A sliding window of recent job results decides whether a worker keeps
//! claiming. When the failure rate reaches the threshold the breaker opens and
//! the worker pauses; after the cooldown one probe job is let through
//! (half-open) and its result closes or re-opens the breaker.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::BreakerConfig;
use crate::metrics::MetricsCollector;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    HalfOpen,
    Open,
}

impl BreakerState {
    /// Gauge value exported as `workq_circuit_breaker_state`.
    pub fn as_gauge(&self) -> i64 {
        match self {
            BreakerState::Closed => 0,
            BreakerState::HalfOpen => 1,
            BreakerState::Open => 2,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    last_transition: Instant,
    results: VecDeque<(Instant, bool)>,
    probe_in_flight: bool,
}

/// Sliding-window circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    window: Duration,
    cooldown: Duration,
    failure_threshold: f64,
    min_samples: usize,
    inner: Mutex<Inner>,
    metrics: MetricsCollector,
}

impl CircuitBreaker {
    pub fn new(
        window: Duration,
        cooldown: Duration,
        failure_threshold: f64,
        min_samples: usize,
    ) -> Self {
        Self {
            window,
            cooldown,
            failure_threshold,
            min_samples,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                last_transition: Instant::now(),
                results: VecDeque::new(),
                probe_in_flight: false,
            }),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn from_config(config: &BreakerConfig) -> Self {
        Self::new(
            Duration::from_millis(config.window_ms),
            Duration::from_millis(config.cooldown_ms),
            config.failure_threshold,
            config.min_samples,
        )
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Returns whether the caller may start another job.
    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    /// Records the result of a job started after `allow` returned true.
    pub fn record(&self, ok: bool) {
        self.record_at(Instant::now(), ok)
    }

    /// Hands back a permit that did not start a job, e.g. a half-open probe
    /// that found every queue empty.
    pub fn cancel(&self) {
        let mut inner = self.lock();
        if inner.state == BreakerState::HalfOpen {
            inner.probe_in_flight = false;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn allow_at(&self, now: Instant) -> bool {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                if now.saturating_duration_since(inner.last_transition) < self.cooldown {
                    return false;
                }
                self.transition(&mut inner, BreakerState::HalfOpen, now);
                inner.probe_in_flight = true;
                true
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    return false;
                }
                inner.probe_in_flight = true;
                true
            }
        }
    }

    pub(crate) fn record_at(&self, now: Instant, ok: bool) {
        let mut inner = self.lock();

        while inner
            .results
            .front()
            .is_some_and(|(at, _)| now.saturating_duration_since(*at) > self.window)
        {
            inner.results.pop_front();
        }
        inner.results.push_back((now, ok));

        match inner.state {
            BreakerState::HalfOpen => {
                inner.probe_in_flight = false;
                if ok {
                    // Failures from before the trip no longer count.
                    inner.results.clear();
                    self.transition(&mut inner, BreakerState::Closed, now);
                } else {
                    self.transition(&mut inner, BreakerState::Open, now);
                }
            }
            BreakerState::Closed => {
                let total = inner.results.len();
                if total < self.min_samples.max(1) {
                    return;
                }
                let failures = inner.results.iter().filter(|(_, ok)| !ok).count();
                let rate = failures as f64 / total as f64;
                if rate >= self.failure_threshold {
                    self.transition(&mut inner, BreakerState::Open, now);
                }
            }
            BreakerState::Open => {}
        }
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState, now: Instant) {
        if inner.state == to {
            return;
        }
        match to {
            BreakerState::Open => {
                warn!(from = ?inner.state, "Circuit breaker opened");
                self.metrics.record_breaker_trip();
            }
            BreakerState::Closed => info!("Circuit breaker closed"),
            BreakerState::HalfOpen => info!("Circuit breaker half-open, probing"),
        }
        inner.state = to;
        inner.last_transition = now;
        self.metrics.update_breaker_state(to.as_gauge());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(Duration::from_secs(60), Duration::from_secs(30), 0.5, 4)
    }

    #[test]
    fn test_stays_closed_below_min_samples() {
        let cb = breaker();
        let t = Instant::now();
        for _ in 0..3 {
            cb.record_at(t, false);
        }
        assert_eq!(cb.state(), BreakerState::Closed);
        assert!(cb.allow_at(t));
    }

    #[test]
    fn test_opens_at_failure_threshold() {
        let cb = breaker();
        let t = Instant::now();
        cb.record_at(t, true);
        cb.record_at(t, true);
        cb.record_at(t, false);
        assert_eq!(cb.state(), BreakerState::Closed);
        cb.record_at(t, false);
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(!cb.allow_at(t + Duration::from_secs(10)));
    }

    #[test]
    fn test_single_probe_after_cooldown() {
        let cb = breaker();
        let t = Instant::now();
        for _ in 0..4 {
            cb.record_at(t, false);
        }
        let later = t + Duration::from_secs(31);
        assert!(cb.allow_at(later));
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        assert!(!cb.allow_at(later));

        cb.record_at(later, true);
        assert_eq!(cb.state(), BreakerState::Closed);
        assert!(cb.allow_at(later));
        // Pre-trip failures were cleared; one failure does not re-open.
        cb.record_at(later, false);
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn test_failed_probe_reopens() {
        let cb = breaker();
        let t = Instant::now();
        for _ in 0..4 {
            cb.record_at(t, false);
        }
        let later = t + Duration::from_secs(31);
        assert!(cb.allow_at(later));
        cb.record_at(later, false);
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(!cb.allow_at(later + Duration::from_secs(1)));
        assert!(cb.allow_at(later + Duration::from_secs(30)));
    }

    #[test]
    fn test_cancelled_probe_can_be_retaken() {
        let cb = breaker();
        let t = Instant::now();
        for _ in 0..4 {
            cb.record_at(t, false);
        }
        let later = t + Duration::from_secs(31);
        assert!(cb.allow_at(later));
        cb.cancel();
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        assert!(cb.allow_at(later));
        assert!(!cb.allow_at(later));
    }

    #[test]
    fn test_old_results_leave_the_window() {
        let cb = breaker();
        let t = Instant::now();
        cb.record_at(t, false);
        cb.record_at(t, false);
        cb.record_at(t, false);
        let later = t + Duration::from_secs(61);
        cb.record_at(later, true);
        cb.record_at(later, true);
        cb.record_at(later, true);
        cb.record_at(later, false);
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn test_from_config() {
        let cb = CircuitBreaker::from_config(&BreakerConfig::default());
        assert_eq!(cb.state(), BreakerState::Closed);
        assert!(cb.allow());
        cb.record(true);
    }
}
