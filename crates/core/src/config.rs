//! Queue configuration.
//!
//! `QueueConfig` is an explicit value: it is loaded from the store, handed to
//! the worker pool and workers, and never read from process-wide globals.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BACKOFF_BASE: f64 = 2.0;
pub const DEFAULT_WORKER_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_JOB_TIMEOUT_MS: u64 = 300_000;

pub const MIN_WORKER_POLL_INTERVAL_MS: u64 = 100;
pub const MIN_JOB_TIMEOUT_MS: u64 = 1_000;

/// Tunables shared by every worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Default retry budget for jobs enqueued without one.
    pub max_retries: u32,
    /// Exponential backoff base, strictly greater than 1.
    pub backoff_base: f64,
    /// Idle poll interval in milliseconds.
    pub worker_poll_interval: u64,
    /// Per-job wall-clock timeout in milliseconds.
    pub job_timeout: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base: DEFAULT_BACKOFF_BASE,
            worker_poll_interval: DEFAULT_WORKER_POLL_INTERVAL_MS,
            job_timeout: DEFAULT_JOB_TIMEOUT_MS,
        }
    }
}

/// Recognised configuration keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    MaxRetries,
    BackoffBase,
    WorkerPollInterval,
    JobTimeout,
}

impl ConfigKey {
    pub const ALL: [ConfigKey; 4] = [
        ConfigKey::MaxRetries,
        ConfigKey::BackoffBase,
        ConfigKey::WorkerPollInterval,
        ConfigKey::JobTimeout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigKey::MaxRetries => "max_retries",
            ConfigKey::BackoffBase => "backoff_base",
            ConfigKey::WorkerPollInterval => "worker_poll_interval",
            ConfigKey::JobTimeout => "job_timeout",
        }
    }
}

impl core::fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for ConfigKey {
    type Err = DomainError;

    /// Accepts `max_retries` as well as the dashed `max-retries` spelling.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        ConfigKey::ALL
            .into_iter()
            .find(|key| key.as_str() == normalized)
            .ok_or_else(|| DomainError::validation(format!("unknown config key {s:?}")))
    }
}

impl QueueConfig {
    /// Check every range constraint.
    pub fn validate(&self) -> DomainResult<()> {
        check_backoff_base(self.backoff_base)?;
        if self.worker_poll_interval < MIN_WORKER_POLL_INTERVAL_MS {
            return Err(DomainError::validation(format!(
                "worker_poll_interval must be >= {MIN_WORKER_POLL_INTERVAL_MS}ms, got {}",
                self.worker_poll_interval
            )));
        }
        if self.job_timeout < MIN_JOB_TIMEOUT_MS {
            return Err(DomainError::validation(format!(
                "job_timeout must be >= {MIN_JOB_TIMEOUT_MS}ms, got {}",
                self.job_timeout
            )));
        }
        Ok(())
    }

    /// Return a copy with `key` set from its textual form. `self` is left
    /// untouched when parsing or validation fails.
    pub fn with_value(&self, key: ConfigKey, raw: &str) -> DomainResult<Self> {
        let raw = raw.trim();
        let mut next = self.clone();
        match key {
            ConfigKey::MaxRetries => next.max_retries = parse_int(key, raw)?,
            ConfigKey::BackoffBase => {
                let base: f64 = raw.parse().map_err(|_| {
                    DomainError::validation(format!("{key} must be a number, got {raw:?}"))
                })?;
                next.backoff_base = base;
            }
            ConfigKey::WorkerPollInterval => next.worker_poll_interval = parse_int(key, raw)?,
            ConfigKey::JobTimeout => next.job_timeout = parse_int(key, raw)?,
        }
        next.validate()?;
        Ok(next)
    }

    /// Textual value of `key`.
    pub fn value(&self, key: ConfigKey) -> String {
        match key {
            ConfigKey::MaxRetries => self.max_retries.to_string(),
            ConfigKey::BackoffBase => self.backoff_base.to_string(),
            ConfigKey::WorkerPollInterval => self.worker_poll_interval.to_string(),
            ConfigKey::JobTimeout => self.job_timeout.to_string(),
        }
    }

    /// Every key with its textual value, in declaration order.
    pub fn entries(&self) -> Vec<(ConfigKey, String)> {
        ConfigKey::ALL
            .into_iter()
            .map(|key| (key, self.value(key)))
            .collect()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker_poll_interval)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout)
    }
}

fn parse_int<T: core::str::FromStr>(key: ConfigKey, raw: &str) -> DomainResult<T> {
    raw.parse().map_err(|_| {
        DomainError::validation(format!("{key} must be a non-negative integer, got {raw:?}"))
    })
}

fn check_backoff_base(base: f64) -> DomainResult<()> {
    if !base.is_finite() || base <= 1.0 {
        return Err(DomainError::validation(format!(
            "backoff_base must be a finite number > 1, got {base}"
        )));
    }
    Ok(())
}
