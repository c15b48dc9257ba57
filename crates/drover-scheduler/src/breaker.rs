use drover_core::Scope;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Outcome of recording a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    /// Counted; the scope keeps running. Carries the failures in the window.
    Counted(usize),
    /// This failure crossed the threshold and paused the scope.
    Tripped(usize),
    /// The scope was already paused.
    AlreadyPaused,
}

#[derive(Default)]
struct FailureWindow {
    failures: VecDeque<Instant>,
    paused: bool,
}

impl FailureWindow {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(front) = self.failures.front() {
            if now.saturating_duration_since(*front) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Sliding-window failure counter that pauses a scope at a threshold.
///
/// A pause stays in place until [`CircuitBreaker::resume`] is called.
pub struct CircuitBreaker {
    threshold: usize,
    window: Duration,
    scopes: Mutex<HashMap<Scope, FailureWindow>>,
}

impl CircuitBreaker {
    /// Breaker pausing after `threshold` failures within `window`.
    pub fn new(threshold: usize, window: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            window,
            scopes: Mutex::new(HashMap::new()),
        }
    }

    /// Count a failure now.
    pub fn record_failure(&self, scope: &Scope) -> BreakerDecision {
        self.record_failure_at(scope, Instant::now())
    }

    /// Record a failure at an explicit instant.
    pub fn record_failure_at(&self, scope: &Scope, at: Instant) -> BreakerDecision {
        let mut scopes = self.scopes.lock();
        let state = scopes.entry(scope.clone()).or_default();
        if state.paused {
            return BreakerDecision::AlreadyPaused;
        }
        state.failures.push_back(at);
        state.prune(at, self.window);
        let count = state.failures.len();
        if count >= self.threshold {
            state.paused = true;
            BreakerDecision::Tripped(count)
        } else {
            BreakerDecision::Counted(count)
        }
    }

    /// Whether admissions are paused for the scope.
    pub fn is_paused(&self, scope: &Scope) -> bool {
        self.scopes.lock().get(scope).is_some_and(|s| s.paused)
    }

    /// Failures currently inside the window.
    pub fn failure_count(&self, scope: &Scope) -> usize {
        let mut scopes = self.scopes.lock();
        match scopes.get_mut(scope) {
            Some(state) => {
                state.prune(Instant::now(), self.window);
                state.failures.len()
            }
            None => 0,
        }
    }

    /// Clear the pause and the window. Returns whether the scope was paused.
    pub fn resume(&self, scope: &Scope) -> bool {
        self.scopes
            .lock()
            .remove(scope)
            .is_some_and(|s| s.paused)
    }

    /// Failures that trip the breaker.
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Sliding window failures are counted in.
    pub fn window(&self) -> Duration {
        self.window
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(60))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_trips_once_at_threshold() {
        let breaker = CircuitBreaker::default();
        let scope = Scope::new("/p");
        let t0 = Instant::now();
        assert_eq!(breaker.record_failure_at(&scope, t0), BreakerDecision::Counted(1));
        assert_eq!(
            breaker.record_failure_at(&scope, t0 + Duration::from_secs(10)),
            BreakerDecision::Counted(2)
        );
        assert_eq!(
            breaker.record_failure_at(&scope, t0 + Duration::from_secs(20)),
            BreakerDecision::Tripped(3)
        );
        assert!(breaker.is_paused(&scope));
        assert_eq!(
            breaker.record_failure_at(&scope, t0 + Duration::from_secs(21)),
            BreakerDecision::AlreadyPaused
        );
    }

    #[test]
    fn test_old_failures_fall_out_of_window() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        let scope = Scope::new("/p");
        let t0 = Instant::now();
        breaker.record_failure_at(&scope, t0);
        breaker.record_failure_at(&scope, t0 + Duration::from_secs(30));
        assert_eq!(
            breaker.record_failure_at(&scope, t0 + Duration::from_secs(61)),
            BreakerDecision::Counted(2)
        );
        assert!(!breaker.is_paused(&scope));
    }

    #[test]
    fn test_resume_clears_state() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(60));
        let scope = Scope::new("/p");
        assert_eq!(breaker.record_failure(&scope), BreakerDecision::Tripped(1));
        assert!(breaker.resume(&scope));
        assert!(!breaker.is_paused(&scope));
        assert_eq!(breaker.failure_count(&scope), 0);
        assert!(!breaker.resume(&scope));
    }

    #[test]
    fn test_scopes_are_independent() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(60));
        let a = Scope::new("/a");
        let b = Scope::new("/b");
        breaker.record_failure(&a);
        breaker.record_failure(&a);
        assert!(breaker.is_paused(&a));
        assert!(!breaker.is_paused(&b));
        assert_eq!(breaker.record_failure(&b), BreakerDecision::Counted(1));
    }
}
