//! Exponential reconnection backoff with a sliding attempt window.
//!
//! Delay for the n-th consecutive failure is `base * 2^(n-1)`, capped at
//! `max`. At most `max_attempts` retries are scheduled inside any `window`;
//! past that the peer is left alone until the window slides and it is
//! rediscovered.

use crate::core::config::MeshConfig;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: usize,
    pub window: Duration,
}

impl From<&MeshConfig> for BackoffPolicy {
    fn from(cfg: &MeshConfig) -> Self {
        Self {
            base: cfg.backoff_base,
            max: cfg.backoff_max,
            max_attempts: cfg.backoff_max_attempts,
            window: cfg.backoff_window,
        }
    }
}

impl BackoffPolicy {
    /// Delay after `failures` consecutive failures (1-based).
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << exp).min(self.max)
    }
}

#[derive(Debug, Default, Clone)]
pub struct Backoff {
    failures: u32,
    attempts: VecDeque<Instant>,
    retry_at: Option<Instant>,
}

impl Backoff {
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Register a failed connection. Returns the delay before the next
    /// attempt, or `None` when the window's attempt budget is spent.
    pub fn record_failure(&mut self, policy: &BackoffPolicy, now: Instant) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        self.prune(policy, now);
        if self.attempts.len() >= policy.max_attempts {
            self.retry_at = None;
            return None;
        }
        let delay = policy.delay_for(self.failures);
        self.attempts.push_back(now);
        self.retry_at = Some(now + delay);
        Some(delay)
    }

    /// A channel opened: forget everything.
    pub fn reset(&mut self) {
        self.failures = 0;
        self.attempts.clear();
        self.retry_at = None;
    }

    /// Whether a new attempt must not start yet.
    pub fn blocks(&mut self, policy: &BackoffPolicy, now: Instant) -> bool {
        self.prune(policy, now);
        if self.retry_at.is_some_and(|at| at > now) {
            return true;
        }
        self.attempts.len() >= policy.max_attempts
    }

    pub fn is_waiting(&self, now: Instant) -> bool {
        self.retry_at.is_some_and(|at| at > now)
    }

    fn prune(&mut self, policy: &BackoffPolicy, now: Instant) {
        while self
            .attempts
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= policy.window)
        {
            self.attempts.pop_front();
        }
    }
}
