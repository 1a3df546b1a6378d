//! Retry and backoff policy.
//!
//! [`RetryPolicy::decide`] maps (error, attempt, now) to a decision and
//! never sleeps itself; the executor owns the waiting.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::tracker::{ErrorKind, TrackerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per change, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Longest rate-limit wait taken in-line before deferring.
    pub max_rate_limit_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            max_rate_limit_wait: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait `delay`, then try again.
    Retry { delay: Duration },
    /// Stop working this tracker until `resume_at`.
    Defer { resume_at: DateTime<Utc> },
    GiveUp,
}

impl RetryPolicy {
    /// Decide what to do after `attempt` (1-based) failed with `error`.
    pub fn decide(&self, error: &TrackerError, attempt: u32, now: DateTime<Utc>) -> RetryDecision {
        match (error.kind(), error) {
            (ErrorKind::RateLimited, TrackerError::RateLimited { resume_at, .. }) => {
                let wait = (*resume_at - now).to_std().unwrap_or(Duration::ZERO);
                if wait <= self.max_rate_limit_wait && attempt < self.max_attempts {
                    RetryDecision::Retry { delay: wait }
                } else {
                    RetryDecision::Defer {
                        resume_at: *resume_at,
                    }
                }
            }
            (ErrorKind::Transient, _) if attempt < self.max_attempts => RetryDecision::Retry {
                delay: self.backoff(attempt),
            },
            _ => RetryDecision::GiveUp,
        }
    }

    /// `base * 2^(attempt - 1)`, capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}
