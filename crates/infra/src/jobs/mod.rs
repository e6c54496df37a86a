//! Job lifecycle on top of the record store.
//!
//! ## Design
//!
//! - Every state change is one atomic per-key update of the job record
//! - Claiming re-checks claimability under the key's lock (at most one claimant)
//! - Failures retry with exponential backoff, then move to the dead-letter queue
//! - Claims carry a lease of the claimant's `job_timeout + 30s`; an expired lease is a failed attempt
//!
//! ## Components
//!
//! - `JobStore`: enqueue, claim, attempt/complete bookkeeping, stats
//! - `RetryScheduler`: retry-vs-dead decision, promotion of due retries, lease expiry
//! - `DeadLetterQueue`: moves to/from the DLQ and crash repair
//! - `JobExecutor`: runs the command and records the outcome

pub mod dlq;
pub mod executor;
pub mod retry;
pub mod store;

pub use dlq::{DeadLetterQueue, ReconcileReport};
pub use executor::{
    CommandOutput, CommandRunner, ExecutionFailure, ExecutorOptions, JobExecutor, JobOutcome,
};
pub use retry::{RetryOutcome, RetryScheduler};
pub use store::{JobStats, JobStore};

use std::time::Duration;

/// Grace added to the job timeout before a processing job's lease expires.
pub const LEASE_GRACE: Duration = Duration::from_secs(30);

/// Lease length for a given job timeout.
pub fn lease_for(job_timeout: Duration) -> Duration {
    job_timeout.saturating_add(LEASE_GRACE)
}
