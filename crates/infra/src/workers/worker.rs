//! Worker loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use jobq_core::{QueueConfig, RetryPolicy, WorkerId};

use super::registry::WorkerRegistry;
use crate::error::QueueResult;
use crate::jobs::{JobExecutor, JobOutcome, JobStore, RetryScheduler, lease_for};

/// Longest pause after a store error.
const ERROR_BACKOFF_CAP: Duration = Duration::from_millis(250);

/// Lifecycle phase of a worker loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum WorkerPhase {
    Starting = 0,
    Running = 1,
    Draining = 2,
    Stopped = 3,
}

impl WorkerPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerPhase::Starting,
            1 => WorkerPhase::Running,
            2 => WorkerPhase::Draining,
            _ => WorkerPhase::Stopped,
        }
    }
}

/// Shared, lock-free view of a worker's phase.
#[derive(Debug, Clone)]
pub struct PhaseCell(Arc<AtomicU8>);

impl PhaseCell {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU8::new(WorkerPhase::Starting as u8)))
    }

    pub fn get(&self) -> WorkerPhase {
        WorkerPhase::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, phase: WorkerPhase) {
        self.0.store(phase as u8, Ordering::Release);
    }
}

impl Default for PhaseCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_dead_lettered: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCell {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    dead_lettered: AtomicU64,
}

impl StatsCell {
    fn record(&self, outcome: &JobOutcome) {
        let counter = match outcome {
            JobOutcome::Completed { .. } => &self.succeeded,
            JobOutcome::Retrying { .. } => &self.failed,
            JobOutcome::DeadLettered { .. } => &self.dead_lettered,
            JobOutcome::LeaseLost => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            jobs_processed: self.processed.load(Ordering::Relaxed),
            jobs_succeeded: self.succeeded.load(Ordering::Relaxed),
            jobs_failed: self.failed.load(Ordering::Relaxed),
            jobs_dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

/// One sequential worker: claims a job, runs it to completion, repeats.
///
/// Never runs two jobs at once. Shutdown is observed between jobs only, so an
/// in-flight job always finishes (or times out) first.
#[derive(Debug)]
pub struct Worker {
    id: WorkerId,
    jobs: JobStore,
    scheduler: RetryScheduler,
    executor: JobExecutor,
    registry: WorkerRegistry,
    config: QueueConfig,
    policy: RetryPolicy,
    phase: PhaseCell,
    stats: Arc<StatsCell>,
}

impl Worker {
    pub fn new(
        id: WorkerId,
        jobs: JobStore,
        scheduler: RetryScheduler,
        executor: JobExecutor,
        registry: WorkerRegistry,
        config: QueueConfig,
    ) -> Self {
        Self {
            id,
            jobs,
            scheduler,
            executor,
            registry,
            policy: RetryPolicy::from_config(&config),
            config,
            phase: PhaseCell::new(),
            stats: Arc::new(StatsCell::default()),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn phase(&self) -> PhaseCell {
        self.phase.clone()
    }

    pub(crate) fn stats(&self) -> Arc<StatsCell> {
        self.stats.clone()
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped).
    ///
    /// The worker must already be registered.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let poll = self.config.poll_interval();
        let error_backoff = poll.min(ERROR_BACKOFF_CAP);

        self.phase.set(WorkerPhase::Running);
        info!(worker_id = %self.id, poll_ms = poll.as_millis() as u64, "worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let pause = match self.tick().await {
                Ok(true) => continue,
                Ok(false) => poll,
                Err(e) if e.is_transient() => {
                    warn!(worker_id = %self.id, error = %e, "transient store error, backing off");
                    error_backoff
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "worker cycle failed");
                    error_backoff
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.phase.set(WorkerPhase::Draining);
        info!(worker_id = %self.id, "worker draining");

        if let Err(e) = self.registry.mark_stopped(self.id, Utc::now()).await {
            warn!(worker_id = %self.id, error = %e, "failed to mark worker stopped");
        }

        self.phase.set(WorkerPhase::Stopped);
        let stats = self.stats.snapshot();
        info!(
            worker_id = %self.id,
            jobs_processed = stats.jobs_processed,
            jobs_succeeded = stats.jobs_succeeded,
            jobs_failed = stats.jobs_failed,
            jobs_dead_lettered = stats.jobs_dead_lettered,
            "worker stopped"
        );
    }

    /// One cycle. Returns whether a job was claimed.
    ///
    /// Housekeeping errors are logged and do not keep the worker from
    /// claiming.
    async fn tick(&self) -> QueueResult<bool> {
        let now = Utc::now();
        let lease = lease_for(self.config.job_timeout());

        if let Err(e) = self
            .scheduler
            .recover_expired_leases(now, lease, &self.policy)
            .await
        {
            warn!(worker_id = %self.id, error = %e, "lease recovery failed");
        }
        if let Err(e) = self.scheduler.promote_due(now).await {
            warn!(worker_id = %self.id, error = %e, "retry promotion failed");
        }

        let Some(job) = self.jobs.claim_next(self.id, now, lease).await? else {
            return Ok(false);
        };

        let outcome = self.executor.execute(&job, self.id).await?;
        debug!(worker_id = %self.id, job_id = %job.id, outcome = ?outcome, "job finished");
        self.stats.record(&outcome);
        if outcome != JobOutcome::LeaseLost {
            if let Err(e) = self.registry.record_processed(self.id).await {
                warn!(worker_id = %self.id, error = %e, "failed to update worker stats");
            }
        }
        Ok(true)
    }
}
