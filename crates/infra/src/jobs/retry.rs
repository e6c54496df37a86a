//! Failure handling: retry with backoff, or dead-letter.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use jobq_core::{Job, JobState, RetryDecision, RetryPolicy, WorkerId};

use super::dlq::DeadLetterQueue;
use super::store::JobStore;
use crate::error::{QueueResult, retry_transient};
use crate::store::Mutation;

/// Result of handling a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// processing -> failed; claimable again at `next_retry_at`.
    Retrying {
        attempts: u32,
        next_retry_at: DateTime<Utc>,
    },
    /// Retries exhausted; the job now lives in the DLQ.
    DeadLettered { attempts: u32 },
    /// The job was no longer processing under the expected lease.
    LeaseLost,
}

enum Step {
    Retry(Job),
    Dead(Job),
    Lost,
}

#[derive(Debug, Clone)]
pub struct RetryScheduler {
    jobs: JobStore,
    dlq: DeadLetterQueue,
}

impl RetryScheduler {
    pub fn new(jobs: JobStore, dlq: DeadLetterQueue) -> Self {
        Self { jobs, dlq }
    }

    /// Record a failed attempt of a processing job.
    ///
    /// With `holder` set, nothing happens unless that worker still holds the
    /// lease. The retry-or-dead decision and the state change are one atomic
    /// update of the main record.
    pub async fn schedule_retry(
        &self,
        id: &str,
        holder: Option<WorkerId>,
        error: &str,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> QueueResult<RetryOutcome> {
        self.schedule(
            id,
            |job| holder.is_none_or(|worker| job.locked_by == Some(worker)),
            error,
            policy,
            now,
        )
        .await
    }

    async fn schedule(
        &self,
        id: &str,
        guard: impl Fn(&Job) -> bool + Send,
        error: &str,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> QueueResult<RetryOutcome> {
        let step = self
            .jobs
            .records()
            .update(id, move |current| -> QueueResult<_> {
                let Some(mut job) = current else {
                    return Ok((Mutation::Keep, Step::Lost));
                };
                if job.state != JobState::Processing || !guard(&job) {
                    return Ok((Mutation::Keep, Step::Lost));
                }
                match policy.decide(&job, now) {
                    RetryDecision::Retry { at, .. } => {
                        job.fail(error, at, now)?;
                        Ok((Mutation::Put(job.clone()), Step::Retry(job)))
                    }
                    RetryDecision::DeadLetter => {
                        job.mark_dead(error, now)?;
                        Ok((Mutation::Put(job.clone()), Step::Dead(job)))
                    }
                }
            })
            .await?;

        match step {
            Step::Retry(job) => {
                let next_retry_at = job.next_retry_at.unwrap_or(now);
                info!(
                    job_id = %job.id,
                    attempts = job.attempts,
                    max_retries = job.max_retries,
                    next_retry_at = %next_retry_at,
                    error = %error,
                    "job failed, retry scheduled"
                );
                Ok(RetryOutcome::Retrying {
                    attempts: job.attempts,
                    next_retry_at,
                })
            }
            Step::Dead(job) => {
                let attempts = job.attempts;
                let reason = RetryPolicy::exhausted_reason(&job);
                retry_transient("archive dead job", || {
                    self.dlq.archive(job.clone(), &reason, now)
                })
                .await?;
                Ok(RetryOutcome::DeadLettered { attempts })
            }
            Step::Lost => {
                debug!(job_id = %id, "failure not recorded, job no longer leased");
                Ok(RetryOutcome::LeaseLost)
            }
        }
    }

    /// Failed jobs whose backoff has elapsed.
    pub async fn retryable_jobs(&self, now: DateTime<Utc>) -> QueueResult<Vec<Job>> {
        let mut jobs = self
            .jobs
            .records()
            .list(|job| job.is_retry_due(now))
            .await?;
        super::store::sort_fifo(&mut jobs);
        Ok(jobs)
    }

    /// failed -> pending for every due retry. `created_at` is untouched, so
    /// promoted jobs keep their place in FIFO order.
    pub async fn promote_due(&self, now: DateTime<Utc>) -> QueueResult<usize> {
        let mut promoted = 0;
        for job in self.retryable_jobs(now).await? {
            let done = self
                .jobs
                .records()
                .update(job.id.as_str(), |current| -> QueueResult<_> {
                    match current {
                        Some(mut job) if job.is_retry_due(now) => {
                            job.promote(now)?;
                            Ok((Mutation::Put(job), true))
                        }
                        _ => Ok((Mutation::Keep, false)),
                    }
                })
                .await?;
            if done {
                debug!(job_id = %job.id, "due retry promoted to pending");
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    /// Treat processing jobs whose lease expired as failed attempts.
    ///
    /// Each job's own lease deadline decides; `fallback` only covers records
    /// claimed without one.
    pub async fn recover_expired_leases(
        &self,
        now: DateTime<Utc>,
        fallback: Duration,
        policy: &RetryPolicy,
    ) -> QueueResult<usize> {
        let mut recovered = 0;
        for job in self.jobs.expired_leases(now, fallback).await? {
            let holder = job.locked_by;
            let error = match holder {
                Some(worker) => format!("lease expired: worker {worker} presumed dead"),
                None => "lease expired: no lease holder recorded".to_string(),
            };
            warn!(job_id = %job.id, locked_at = ?job.locked_at, error = %error, "recovering expired lease");

            let outcome = self
                .schedule(
                    job.id.as_str(),
                    |current| current.locked_by == holder && current.lease_expired(now, fallback),
                    &error,
                    policy,
                    now,
                )
                .await?;
            if outcome != RetryOutcome::LeaseLost {
                recovered += 1;
            }
        }
        Ok(recovered)
    }
}
