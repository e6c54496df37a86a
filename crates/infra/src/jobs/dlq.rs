//! Dead-letter queue.
//!
//! Moves between the main collection and the DLQ are "write new, then delete
//! old". A crash in between leaves a duplicate that `reconcile` repairs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use jobq_core::{DeadLetterEntry, DomainError, Job, JobState, RetryPolicy};

use crate::error::QueueResult;
use crate::store::{Collection, Mutation, RecordStore, Records};

/// What `reconcile` repaired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Dead main records whose DLQ entry already existed.
    pub removed_duplicates: usize,
    /// Dead main records with no DLQ entry; the move was finished.
    pub completed_moves: usize,
    /// DLQ entries shadowed by an active main record.
    pub dropped_entries: usize,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone)]
pub struct DeadLetterQueue {
    jobs: Records<Job>,
    entries: Records<DeadLetterEntry>,
}

impl DeadLetterQueue {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            jobs: Records::new(store.clone(), Collection::Jobs),
            entries: Records::new(store, Collection::DeadLetters),
        }
    }

    /// All entries, oldest move first.
    pub async fn list(&self) -> QueueResult<Vec<DeadLetterEntry>> {
        let mut entries = self.entries.all().await?;
        entries.sort_by(|a, b| {
            a.moved_to_dlq_at
                .cmp(&b.moved_to_dlq_at)
                .then_with(|| a.job.id.cmp(&b.job.id))
        });
        Ok(entries)
    }

    pub async fn get(&self, id: &str) -> QueueResult<Option<DeadLetterEntry>> {
        Ok(self.entries.get(id).await?)
    }

    /// Move a processing (or already dead) job into the DLQ.
    pub async fn move_to_dlq(
        &self,
        id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<DeadLetterEntry> {
        let dead = self
            .jobs
            .update(id, |current| -> QueueResult<_> {
                let Some(mut job) = current else {
                    return Err(DomainError::not_found(format!("job {id}")).into());
                };
                match job.state {
                    JobState::Dead => Ok((Mutation::Keep, job)),
                    _ => {
                        let error = job.last_error.clone().unwrap_or_else(|| reason.to_string());
                        job.mark_dead(error, now)?;
                        Ok((Mutation::Put(job.clone()), job))
                    }
                }
            })
            .await?;

        self.archive(dead, reason, now).await
    }

    /// Write the DLQ entry for a job already marked dead in the main
    /// collection, then drop the main record.
    pub(crate) async fn archive(
        &self,
        job: Job,
        reason: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<DeadLetterEntry> {
        let entry = DeadLetterEntry::new(job, reason, now);
        let id = entry.job.id.clone();
        self.entries.put(id.as_str(), &entry).await?;
        self.remove_dead_main(id.as_str()).await?;

        warn!(
            job_id = %id,
            attempts = entry.job.attempts,
            reason = %entry.dlq_reason,
            last_error = entry.job.last_error.as_deref().unwrap_or(""),
            "job moved to dead letter queue"
        );
        Ok(entry)
    }

    /// Remove the main record only while it is still dead.
    async fn remove_dead_main(&self, id: &str) -> QueueResult<bool> {
        self.jobs
            .update(id, |current| -> QueueResult<_> {
                match current {
                    Some(job) if job.state == JobState::Dead => Ok((Mutation::Remove, true)),
                    _ => Ok((Mutation::Keep, false)),
                }
            })
            .await
    }

    /// Put a dead job back in the main collection as pending, with a fresh
    /// retry budget.
    pub async fn retry(&self, id: &str, now: DateTime<Utc>) -> QueueResult<Job> {
        let entry = self
            .entries
            .get(id)
            .await?
            .ok_or_else(|| DomainError::not_found(format!("job {id} in dead letter queue")))?;
        let revived = entry.clone().revive(now)?;

        let job = self
            .jobs
            .update(id, |current| -> QueueResult<_> {
                match current {
                    Some(active) if active.state != JobState::Dead => Err(DomainError::conflict(
                        format!("job {id} is already active ({})", active.state),
                    )
                    .into()),
                    _ => Ok((Mutation::Put(revived.clone()), revived)),
                }
            })
            .await?;

        if self.remove_entry(&entry).await? {
            info!(job_id = %job.id, "job retried from dead letter queue");
        } else {
            warn!(job_id = %job.id, "job retried, but its dead letter entry was replaced in the meantime");
        }
        Ok(job)
    }

    /// Remove the DLQ entry only while it is still `expected`. A newer entry
    /// for the same id means the job died again and must stay.
    async fn remove_entry(&self, expected: &DeadLetterEntry) -> QueueResult<bool> {
        self.entries
            .update(expected.job.id.as_str(), |current| -> QueueResult<_> {
                match current {
                    Some(entry) if entry == *expected => Ok((Mutation::Remove, true)),
                    _ => Ok((Mutation::Keep, false)),
                }
            })
            .await
    }

    /// Repair duplicates left by an interrupted move in either direction.
    pub async fn reconcile(&self, now: DateTime<Utc>) -> QueueResult<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for entry in self.entries.all().await? {
            let id = entry.job.id.as_str();
            if self.jobs.get(id).await?.is_some_and(|job| job.state != JobState::Dead)
                && self.remove_entry(&entry).await?
            {
                report.dropped_entries += 1;
            }
        }

        for job in self.jobs.list(|job| job.state == JobState::Dead).await? {
            let id = job.id.clone();
            if self.entries.get(id.as_str()).await?.is_some() {
                if self.remove_dead_main(id.as_str()).await? {
                    report.removed_duplicates += 1;
                }
            } else {
                let reason = RetryPolicy::exhausted_reason(&job);
                self.archive(job, &reason, now).await?;
                report.completed_moves += 1;
            }
        }

        if !report.is_clean() {
            info!(
                removed_duplicates = report.removed_duplicates,
                completed_moves = report.completed_moves,
                dropped_entries = report.dropped_entries,
                "reconciled dead letter queue"
            );
        }
        Ok(report)
    }
}
