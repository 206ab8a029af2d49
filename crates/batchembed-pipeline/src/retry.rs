//! Backoff schedule and the request-level error window.
use std::collections::VecDeque;
use std::time::Duration;

use batchembed_core::config::PipelineSettings;
use batchembed_core::BackendError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

/// What to do after attempt number `attempt` (1-based) failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    RetryAfter(Duration),
    GiveUp,
}

impl RetryPolicy {
    pub fn from_settings(s: &PipelineSettings) -> Self {
        Self {
            max_attempts: s.max_attempts.max(1),
            initial_backoff: Duration::from_millis(s.initial_backoff_ms),
            max_backoff: Duration::from_millis(s.max_backoff_ms),
        }
    }

    /// `initial * 2^(attempt-1)`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        self.initial_backoff.saturating_mul(1u32 << shift).min(self.max_backoff)
    }

    pub fn after_failure(&self, attempt: u32, err: &BackendError) -> NextStep {
        if err.is_transient() && attempt < self.max_attempts {
            NextStep::RetryAfter(self.backoff(attempt))
        } else {
            NextStep::GiveUp
        }
    }
}

/// Sliding window over the most recent request outcomes.
#[derive(Debug)]
pub struct ErrorWindow {
    outcomes: VecDeque<bool>,
    failures: usize,
    capacity: usize,
    max_rate: f64,
}

impl ErrorWindow {
    pub fn new(capacity: usize, max_rate: f64) -> Self {
        let capacity = capacity.max(1);
        Self { outcomes: VecDeque::with_capacity(capacity), failures: 0, capacity, max_rate }
    }

    /// Record one outcome. Returns the failure ratio when the window is full
    /// and the ratio exceeds the limit.
    pub fn record(&mut self, ok: bool) -> Option<f64> {
        if self.outcomes.len() == self.capacity {
            if let Some(false) = self.outcomes.pop_front() {
                self.failures -= 1;
            }
        }
        self.outcomes.push_back(ok);
        if !ok {
            self.failures += 1;
        }
        if self.outcomes.len() < self.capacity {
            return None;
        }
        let rate = self.failures as f64 / self.capacity as f64;
        (rate > self.max_rate).then_some(rate)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn max_rate(&self) -> f64 {
        self.max_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(250),
        }
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let p = policy();
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(250));
        assert_eq!(p.backoff(64), Duration::from_millis(250));
    }

    #[test]
    fn only_transient_errors_are_retried_within_budget() {
        let p = policy();
        let t = BackendError::transient("e", "503");
        assert_eq!(p.after_failure(1, &t), NextStep::RetryAfter(Duration::from_millis(100)));
        assert_eq!(p.after_failure(3, &t), NextStep::GiveUp);
        assert_eq!(p.after_failure(1, &BackendError::permanent("e", "400")), NextStep::GiveUp);
    }

    #[test]
    fn window_trips_only_when_full() {
        let mut w = ErrorWindow::new(4, 0.5);
        assert_eq!(w.record(false), None);
        assert_eq!(w.record(false), None);
        assert_eq!(w.record(false), None);
        assert_eq!(w.record(true), Some(0.75));
        let mut w = ErrorWindow::new(4, 0.5);
        for ok in [false, true, false, true] {
            assert_eq!(w.record(ok), None);
        }
        // Oldest failure slides out.
        assert_eq!(w.record(true), None);
        assert_eq!(w.record(false), None);
    }
}
