//! Retry and exponential backoff policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::QueueConfig;
use crate::job::{Job, add_duration};

/// Decides between retrying a failed job and dead-lettering it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay after the n-th attempt is `backoff_base^n` seconds.
    pub backoff_base: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_base: crate::config::DEFAULT_BACKOFF_BASE,
        }
    }
}

/// Outcome of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another attempt at `at`.
    Retry { delay: Duration, at: DateTime<Utc> },
    /// Retries exhausted.
    DeadLetter,
}

impl RetryPolicy {
    pub fn new(backoff_base: f64) -> Self {
        Self { backoff_base }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(config.backoff_base)
    }

    /// Another attempt is allowed while `attempts < max_retries`.
    ///
    /// `attempts` is already incremented for the failed run.
    pub fn should_retry(job: &Job) -> bool {
        job.attempts < job.max_retries
    }

    /// `base^attempts` seconds. Saturates at `Duration::MAX`.
    pub fn calculate_backoff(attempts: u32, base: f64) -> Duration {
        let exponent = i32::try_from(attempts).unwrap_or(i32::MAX);
        let seconds = base.powi(exponent);
        Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
    }

    pub fn backoff(&self, attempts: u32) -> Duration {
        Self::calculate_backoff(attempts, self.backoff_base)
    }

    pub fn next_retry_at(&self, attempts: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        add_duration(now, self.backoff(attempts))
    }

    pub fn decide(&self, job: &Job, now: DateTime<Utc>) -> RetryDecision {
        if Self::should_retry(job) {
            let delay = self.backoff(job.attempts);
            RetryDecision::Retry {
                delay,
                at: add_duration(now, delay),
            }
        } else {
            RetryDecision::DeadLetter
        }
    }

    /// Reason recorded on the DLQ entry.
    pub fn exhausted_reason(job: &Job) -> String {
        format!("max retries ({}) exceeded", job.max_retries)
    }
}
