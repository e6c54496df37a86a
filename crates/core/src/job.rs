//! Job record and lifecycle state machine.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{JobId, WorkerId};

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Queued, waiting to be claimed
    Pending,
    /// Claimed by a worker
    Processing,
    /// Finished successfully
    Completed,
    /// Failed, retry scheduled
    Failed,
    /// Retries exhausted, lives in the DLQ
    Dead,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Pending,
        JobState::Processing,
        JobState::Completed,
        JobState::Failed,
        JobState::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Failed, Processing)
                | (Failed, Pending)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Dead)
                | (Dead, Pending)
        )
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                DomainError::validation(format!(
                    "unknown job state {s:?} (expected pending, processing, completed, failed or dead)"
                ))
            })
    }
}

/// Job submission as received from a client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    /// Optional caller-chosen id; generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    /// Shell command to run.
    pub command: String,
    /// Overrides the configured `max_retries`.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl NewJob {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            id: None,
            command: command.into(),
            max_retries: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// A queued shell command and its execution bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub command: String,
    pub state: JobState,
    /// Executions started so far
    pub attempts: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub locked_by: Option<WorkerId>,
    #[serde(default)]
    pub locked_at: Option<DateTime<Utc>>,
    /// End of the current lease, set by the claimant from its own timeout.
    #[serde(default)]
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Worker that held the most recent lease.
    #[serde(default)]
    pub processed_by: Option<WorkerId>,
}

impl Job {
    /// Validate a submission and build the pending record.
    pub fn new(spec: NewJob, default_max_retries: u32, now: DateTime<Utc>) -> DomainResult<Self> {
        let command = spec.command.trim();
        if command.is_empty() {
            return Err(DomainError::validation("command is required"));
        }

        let id = match spec.id {
            Some(raw) => JobId::parse(raw)?,
            None => JobId::generate(),
        };

        Ok(Self {
            id,
            command: command.to_string(),
            state: JobState::Pending,
            attempts: 0,
            max_retries: spec.max_retries.unwrap_or(default_max_retries),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            output: None,
            last_error: None,
            next_retry_at: None,
            locked_by: None,
            locked_at: None,
            lease_expires_at: None,
            processed_by: None,
        })
    }

    fn transition(&mut self, next: JobState, now: DateTime<Utc>) -> DomainResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(DomainError::InvalidTransition {
                job_id: self.id.to_string(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.updated_at = now;
        Ok(())
    }

    fn release_lease(&mut self) {
        if let Some(worker) = self.locked_by.take() {
            self.processed_by = Some(worker);
        }
        self.locked_at = None;
        self.lease_expires_at = None;
    }

    /// A failed job whose backoff has elapsed. A missing `next_retry_at`
    /// counts as due.
    pub fn is_retry_due(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Failed && self.next_retry_at.is_none_or(|at| at <= now)
    }

    /// Whether `claim` would succeed at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Pending || self.is_retry_due(now)
    }

    pub fn is_leased_to(&self, worker: WorkerId) -> bool {
        self.state == JobState::Processing && self.locked_by == Some(worker)
    }

    /// A processing job whose lease has run out.
    ///
    /// Uses the deadline recorded at claim time; records without one fall
    /// back to `locked_at + fallback`.
    pub fn lease_expired(&self, now: DateTime<Utc>, fallback: Duration) -> bool {
        if self.state != JobState::Processing {
            return false;
        }
        match (self.lease_expires_at, self.locked_at) {
            (Some(expires_at), _) => expires_at <= now,
            (None, Some(locked_at)) => add_duration(locked_at, fallback) <= now,
            (None, None) => true,
        }
    }

    /// Claim the job for `worker` for at most `lease`: claimable -> processing.
    pub fn claim(&mut self, worker: WorkerId, now: DateTime<Utc>, lease: Duration) -> DomainResult<()> {
        if !self.is_claimable(now) {
            return Err(DomainError::conflict(format!(
                "job {} is not claimable ({})",
                self.id, self.state
            )));
        }
        self.transition(JobState::Processing, now)?;
        self.locked_by = Some(worker);
        self.locked_at = Some(now);
        self.lease_expires_at = Some(add_duration(now, lease));
        self.started_at = Some(now);
        self.next_retry_at = None;
        Ok(())
    }

    /// Record the start of an execution attempt under `worker`'s lease.
    pub fn begin_attempt(&mut self, worker: WorkerId, now: DateTime<Utc>) -> DomainResult<()> {
        if !self.is_leased_to(worker) {
            return Err(DomainError::conflict(format!(
                "job {} is not leased to worker {worker}",
                self.id
            )));
        }
        self.attempts += 1;
        self.started_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// processing -> completed.
    pub fn complete(
        &mut self,
        worker: WorkerId,
        output: Option<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        if !self.is_leased_to(worker) {
            return Err(DomainError::conflict(format!(
                "job {} is not leased to worker {worker}",
                self.id
            )));
        }
        self.transition(JobState::Completed, now)?;
        self.release_lease();
        self.output = output;
        self.completed_at = Some(now);
        Ok(())
    }

    /// processing -> failed, with a retry scheduled at `next_retry_at`.
    pub fn fail(
        &mut self,
        error: impl Into<String>,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.transition(JobState::Failed, now)?;
        self.release_lease();
        self.last_error = Some(error.into());
        self.next_retry_at = Some(next_retry_at);
        Ok(())
    }

    /// processing -> dead.
    pub fn mark_dead(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(JobState::Dead, now)?;
        self.release_lease();
        self.last_error = Some(error.into());
        self.next_retry_at = None;
        Ok(())
    }

    /// failed -> pending, once the retry is due.
    pub fn promote(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if !self.is_retry_due(now) {
            return Err(DomainError::conflict(format!(
                "job {} has no due retry",
                self.id
            )));
        }
        self.transition(JobState::Pending, now)?;
        self.next_retry_at = None;
        Ok(())
    }
}

/// A dead job as stored in the DLQ.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    #[serde(flatten)]
    pub job: Job,
    pub dlq_reason: String,
    pub moved_to_dlq_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(job: Job, reason: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            job,
            dlq_reason: reason.into(),
            moved_to_dlq_at: now,
        }
    }

    /// Turn the entry back into a fresh pending job (dead -> pending).
    pub fn revive(self, now: DateTime<Utc>) -> DomainResult<Job> {
        let mut job = self.job;
        job.transition(JobState::Pending, now)?;
        job.attempts = 0;
        job.last_error = None;
        job.next_retry_at = None;
        job.locked_by = None;
        job.locked_at = None;
        job.lease_expires_at = None;
        job.started_at = None;
        job.completed_at = None;
        Ok(job)
    }
}

/// `at + d`, saturating at the maximum representable instant.
pub fn add_duration(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEASE: Duration = Duration::from_secs(60);

    fn pending(command: &str, max_retries: u32) -> Job {
        Job::new(
            NewJob::new(command).with_max_retries(max_retries),
            3,
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn new_job_defaults() {
        let now = Utc::now();
        let job = Job::new(NewJob::new("  echo hi  "), 3, now).unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.command, "echo hi");
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_retries, 3);
        assert_eq!(job.created_at, now);
        assert!(job.locked_by.is_none());
    }

    #[test]
    fn new_job_rejects_empty_command_and_bad_id() {
        assert!(matches!(
            Job::new(NewJob::new("   "), 3, Utc::now()),
            Err(DomainError::Validation(_))
        ));
        assert!(matches!(
            Job::new(NewJob::new("true").with_id("a/b"), 3, Utc::now()),
            Err(DomainError::InvalidId(_))
        ));
    }

    #[test]
    fn successful_lifecycle() {
        let worker = WorkerId::new();
        let mut job = pending("echo hi", 3);
        let now = Utc::now();

        job.claim(worker, now, LEASE).unwrap();
        assert_eq!(job.state, JobState::Processing);
        assert_eq!(job.locked_by, Some(worker));

        job.begin_attempt(worker, now).unwrap();
        assert_eq!(job.attempts, 1);

        job.complete(worker, Some("hi".into()), now).unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert!(job.locked_by.is_none());
        assert!(job.locked_at.is_none());
        assert_eq!(job.processed_by, Some(worker));
        assert_eq!(job.output.as_deref(), Some("hi"));
        assert_eq!(job.completed_at, Some(now));
    }

    #[test]
    fn completed_job_cannot_be_claimed_again() {
        let worker = WorkerId::new();
        let mut job = pending("true", 3);
        let now = Utc::now();
        job.claim(worker, now, LEASE).unwrap();
        job.complete(worker, None, now).unwrap();

        assert!(!job.is_claimable(now));
        assert!(job.claim(worker, now, LEASE).is_err());
    }

    #[test]
    fn only_the_lease_holder_may_complete() {
        let owner = WorkerId::new();
        let other = WorkerId::new();
        let mut job = pending("true", 3);
        let now = Utc::now();
        job.claim(owner, now, LEASE).unwrap();

        assert!(job.begin_attempt(other, now).is_err());
        assert!(job.complete(other, None, now).is_err());
        assert_eq!(job.state, JobState::Processing);
    }

    #[test]
    fn failed_job_is_claimable_once_due() {
        let worker = WorkerId::new();
        let mut job = pending("exit 1", 3);
        let now = Utc::now();
        job.claim(worker, now, LEASE).unwrap();
        job.begin_attempt(worker, now).unwrap();

        let retry_at = now + chrono::Duration::seconds(2);
        job.fail("boom", retry_at, now).unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert!(job.locked_by.is_none());
        assert_eq!(job.next_retry_at, Some(retry_at));

        assert!(!job.is_claimable(now));
        assert!(job.is_claimable(retry_at));

        job.claim(worker, retry_at, LEASE).unwrap();
        assert!(job.next_retry_at.is_none());
    }

    #[test]
    fn promote_clears_retry_schedule() {
        let worker = WorkerId::new();
        let mut job = pending("exit 1", 3);
        let now = Utc::now();
        job.claim(worker, now, LEASE).unwrap();
        job.fail("boom", now, now).unwrap();

        job.promote(now).unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert!(job.next_retry_at.is_none());
        assert_eq!(job.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let mut job = pending("true", 3);
        let now = Utc::now();
        assert!(matches!(
            job.mark_dead("nope", now),
            Err(DomainError::InvalidTransition {
                from: JobState::Pending,
                to: JobState::Dead,
                ..
            })
        ));
        assert!(job.fail("nope", now, now).is_err());
        assert!(job.promote(now).is_err());
    }

    #[test]
    fn transition_table() {
        use JobState::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Dead.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Dead.can_transition_to(Processing));
    }

    #[test]
    fn lease_expiry() {
        let worker = WorkerId::new();
        let mut job = pending("sleep 100", 3);
        let now = Utc::now();
        job.claim(worker, now, LEASE).unwrap();
        assert_eq!(job.lease_expires_at, Some(now + chrono::Duration::seconds(60)));

        let fallback = Duration::from_secs(5);
        assert!(!job.lease_expired(now + chrono::Duration::seconds(30), fallback));
        assert!(job.lease_expired(now + chrono::Duration::seconds(60), fallback));
    }

    #[test]
    fn lease_without_deadline_uses_fallback() {
        let worker = WorkerId::new();
        let mut job = pending("sleep 100", 3);
        let now = Utc::now();
        job.claim(worker, now, LEASE).unwrap();
        job.lease_expires_at = None;

        let fallback = Duration::from_secs(10);
        assert!(!job.lease_expired(now + chrono::Duration::seconds(9), fallback));
        assert!(job.lease_expired(now + chrono::Duration::seconds(10), fallback));

        job.complete(worker, None, now).unwrap();
        assert!(job.lease_expires_at.is_none());
        assert!(!job.lease_expired(now + chrono::Duration::seconds(99), fallback));
    }

    #[test]
    fn dead_letter_entry_flattens_job_fields() {
        let worker = WorkerId::new();
        let mut job = pending("exit 1", 0);
        let now = Utc::now();
        job.claim(worker, now, LEASE).unwrap();
        job.begin_attempt(worker, now).unwrap();
        job.mark_dead("exit 1", now).unwrap();

        let entry = DeadLetterEntry::new(job, "max retries (0) exceeded", now);
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["state"], "dead");
        assert_eq!(json["attempts"], 1);
        assert_eq!(json["dlq_reason"], "max retries (0) exceeded");

        let back: DeadLetterEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn revive_resets_attempts() {
        let worker = WorkerId::new();
        let mut job = pending("exit 1", 1);
        let now = Utc::now();
        job.claim(worker, now, LEASE).unwrap();
        job.begin_attempt(worker, now).unwrap();
        job.mark_dead("exit 1", now).unwrap();

        let later = now + chrono::Duration::seconds(5);
        let revived = DeadLetterEntry::new(job, "max retries (1) exceeded", now)
            .revive(later)
            .unwrap();
        assert_eq!(revived.state, JobState::Pending);
        assert_eq!(revived.attempts, 0);
        assert!(revived.last_error.is_none());
        assert_eq!(revived.updated_at, later);
    }

    #[test]
    fn state_parses_case_insensitively() {
        assert_eq!("FAILED".parse::<JobState>().unwrap(), JobState::Failed);
        assert!("running".parse::<JobState>().is_err());
    }
}
