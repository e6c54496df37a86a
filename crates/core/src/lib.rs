//! `jobq-core`: job queue domain.
//!
//! This crate contains **pure domain** types (no storage, no process spawning):
//! the job record and its lifecycle, retry policy, queue configuration and the
//! worker registry record.

pub mod config;
pub mod error;
pub mod id;
pub mod job;
pub mod retry;
pub mod worker;

pub use config::{ConfigKey, QueueConfig};
pub use error::{DomainError, DomainResult};
pub use id::{JobId, WorkerId};
pub use job::{DeadLetterEntry, Job, JobState, NewJob};
pub use retry::{RetryDecision, RetryPolicy};
pub use worker::{WorkerRecord, WorkerStatus};
