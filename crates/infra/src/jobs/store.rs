//! Job persistence and the claim protocol.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use jobq_core::{DeadLetterEntry, DomainError, Job, JobState, NewJob, WorkerId};

use crate::error::QueueResult;
use crate::store::{Collection, Mutation, RecordStore, Records};

/// Per-state job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead: usize,
    pub total: usize,
}

impl JobStats {
    fn count(&mut self, state: JobState) {
        match state {
            JobState::Pending => self.pending += 1,
            JobState::Processing => self.processing += 1,
            JobState::Completed => self.completed += 1,
            JobState::Failed => self.failed += 1,
            JobState::Dead => self.dead += 1,
        }
        self.total += 1;
    }
}

/// Jobs in the main collection plus read access to the DLQ.
#[derive(Debug, Clone)]
pub struct JobStore {
    jobs: Records<Job>,
    dead_letters: Records<DeadLetterEntry>,
}

impl JobStore {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            jobs: Records::new(store.clone(), Collection::Jobs),
            dead_letters: Records::new(store, Collection::DeadLetters),
        }
    }

    pub(crate) fn records(&self) -> &Records<Job> {
        &self.jobs
    }

    /// Validate and persist a new pending job.
    ///
    /// Rejects ids already present in the main collection or the DLQ.
    pub async fn enqueue(
        &self,
        spec: NewJob,
        default_max_retries: u32,
        now: DateTime<Utc>,
    ) -> QueueResult<Job> {
        let job = Job::new(spec, default_max_retries, now)?;

        if self.dead_letters.get(job.id.as_str()).await?.is_some() {
            return Err(DomainError::validation(format!(
                "job {} already exists in the dead letter queue",
                job.id
            ))
            .into());
        }

        let job = self
            .jobs
            .update(job.id.as_str(), |current| -> QueueResult<_> {
                if current.is_some() {
                    return Err(
                        DomainError::validation(format!("job {} already exists", job.id)).into(),
                    );
                }
                Ok((Mutation::Put(job.clone()), job.clone()))
            })
            .await?;

        info!(job_id = %job.id, command = %job.command, max_retries = job.max_retries, "job enqueued");
        Ok(job)
    }

    /// A job from the main collection.
    pub async fn get(&self, id: &str) -> QueueResult<Option<Job>> {
        Ok(self.jobs.get(id).await?)
    }

    /// Jobs ordered by `created_at`. `Some(Dead)` reads the DLQ; `None`
    /// returns both collections.
    pub async fn list(&self, state: Option<JobState>) -> QueueResult<Vec<Job>> {
        let mut jobs = match state {
            Some(JobState::Dead) => self.dead_jobs().await?,
            Some(state) => self.jobs.list(|job| job.state == state).await?,
            None => {
                let mut jobs = self.jobs.all().await?;
                jobs.extend(self.dead_jobs().await?);
                jobs
            }
        };
        sort_fifo(&mut jobs);
        Ok(jobs)
    }

    async fn dead_jobs(&self) -> QueueResult<Vec<Job>> {
        Ok(self
            .dead_letters
            .all()
            .await?
            .into_iter()
            .map(|entry| entry.job)
            .collect())
    }

    /// Claim the oldest claimable job for `worker`, leased for `lease`.
    ///
    /// Each candidate is re-checked inside its own atomic update, so a job
    /// can be claimed by at most one worker. A candidate taken by a racing
    /// worker is skipped.
    pub async fn claim_next(
        &self,
        worker: WorkerId,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> QueueResult<Option<Job>> {
        let mut candidates = self.jobs.list(|job| job.is_claimable(now)).await?;
        sort_fifo(&mut candidates);

        for candidate in candidates {
            let claimed = self
                .jobs
                .update(candidate.id.as_str(), |current| -> QueueResult<_> {
                    match current {
                        Some(mut job) if job.is_claimable(now) => {
                            job.claim(worker, now, lease)?;
                            Ok((Mutation::Put(job.clone()), Some(job)))
                        }
                        _ => Ok((Mutation::Keep, None)),
                    }
                })
                .await?;

            match claimed {
                Some(job) => {
                    debug!(worker_id = %worker, job_id = %job.id, attempts = job.attempts, "claimed job");
                    return Ok(Some(job));
                }
                None => debug!(worker_id = %worker, job_id = %candidate.id, "candidate claimed elsewhere"),
            }
        }
        Ok(None)
    }

    /// Count the start of an execution. `None` when `worker` no longer holds
    /// the lease.
    pub async fn begin_attempt(
        &self,
        id: &str,
        worker: WorkerId,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<Job>> {
        self.jobs
            .update(id, |current| -> QueueResult<_> {
                match current {
                    Some(mut job) if job.is_leased_to(worker) => {
                        job.begin_attempt(worker, now)?;
                        Ok((Mutation::Put(job.clone()), Some(job)))
                    }
                    _ => Ok((Mutation::Keep, None)),
                }
            })
            .await
    }

    /// processing -> completed. `None` when the lease was lost.
    pub async fn complete(
        &self,
        id: &str,
        worker: WorkerId,
        output: Option<String>,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<Job>> {
        self.jobs
            .update(id, |current| -> QueueResult<_> {
                match current {
                    Some(mut job) if job.is_leased_to(worker) => {
                        job.complete(worker, output, now)?;
                        Ok((Mutation::Put(job.clone()), Some(job)))
                    }
                    _ => Ok((Mutation::Keep, None)),
                }
            })
            .await
    }

    /// Processing jobs whose lease ran out. `fallback` applies to records
    /// claimed without a recorded deadline.
    pub async fn expired_leases(&self, now: DateTime<Utc>, fallback: Duration) -> QueueResult<Vec<Job>> {
        Ok(self.jobs.list(|job| job.lease_expired(now, fallback)).await?)
    }

    /// Per-state counts over both collections.
    pub async fn stats(&self) -> QueueResult<JobStats> {
        let mut stats = JobStats::default();
        for job in self.jobs.all().await? {
            stats.count(job.state);
        }
        for entry in self.dead_letters.all().await? {
            // A crash mid-move can leave the job in both collections.
            if !self.jobs.get(entry.job.id.as_str()).await?.is_some_and(|j| j.state == JobState::Dead) {
                stats.count(JobState::Dead);
            }
        }
        Ok(stats)
    }
}

/// Oldest first; ties broken by id for a stable order.
pub(crate) fn sort_fifo(jobs: &mut [Job]) {
    jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}
