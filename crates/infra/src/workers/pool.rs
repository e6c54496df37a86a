//! Worker pool coordinator: starts and stops N worker loops.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use jobq_core::{DomainError, QueueConfig, RetryPolicy, WorkerId};

use super::registry::WorkerRegistry;
use super::worker::{PhaseCell, StatsCell, Worker, WorkerPhase, WorkerStats};
use crate::error::QueueResult;
use crate::jobs::{DeadLetterQueue, ExecutorOptions, JobExecutor, JobStore, RetryScheduler};
use crate::store::RecordStore;

pub const MAX_WORKERS: usize = 10;

/// How long `stop_workers` waits for a voluntary drain.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Outcome of `stop_workers`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StopReport {
    /// Workers that finished on their own.
    pub drained: Vec<WorkerId>,
    /// Workers aborted after the grace period.
    pub forced: Vec<WorkerId>,
}

/// Handle to control and join one worker task.
#[derive(Debug)]
struct WorkerHandle {
    id: WorkerId,
    phase: PhaseCell,
    stats: Arc<StatsCell>,
    join: JoinHandle<()>,
}

#[derive(Debug)]
struct RunningPool {
    shutdown: watch::Sender<bool>,
    workers: Vec<WorkerHandle>,
}

#[derive(Debug)]
pub struct WorkerPool {
    store: Arc<dyn RecordStore>,
    registry: WorkerRegistry,
    grace: Duration,
    running: Mutex<Option<RunningPool>>,
}

impl WorkerPool {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self::with_grace(store, DEFAULT_SHUTDOWN_GRACE)
    }

    pub fn with_grace(store: Arc<dyn RecordStore>, grace: Duration) -> Self {
        Self {
            registry: WorkerRegistry::new(store.clone()),
            store,
            grace,
            running: Mutex::new(None),
        }
    }

    /// Start `count` workers using `config`.
    ///
    /// Interrupted DLQ moves are repaired first. Every worker is registered
    /// before its task is spawned. When the pool is already running, the
    /// running worker ids are returned and nothing new is spawned.
    pub async fn start_workers(&self, count: usize, config: QueueConfig) -> QueueResult<Vec<WorkerId>> {
        if !(1..=MAX_WORKERS).contains(&count) {
            return Err(DomainError::validation(format!(
                "worker count must be between 1 and {MAX_WORKERS}, got {count}"
            ))
            .into());
        }

        let mut running = self.running.lock().await;
        if let Some(pool) = running.as_ref() {
            info!(workers = pool.workers.len(), "worker pool already running");
            return Ok(pool.workers.iter().map(|w| w.id).collect());
        }

        let jobs = JobStore::new(self.store.clone());
        let dlq = DeadLetterQueue::new(self.store.clone());
        dlq.reconcile(Utc::now()).await?;

        let scheduler = RetryScheduler::new(jobs.clone(), dlq);
        let executor = JobExecutor::new(
            jobs.clone(),
            scheduler.clone(),
            ExecutorOptions::from_config(&config),
            RetryPolicy::from_config(&config),
        );

        let (shutdown, _) = watch::channel(false);
        let pid = std::process::id();
        let mut workers = Vec::with_capacity(count);

        for _ in 0..count {
            let id = WorkerId::new();
            if let Err(e) = self.registry.register(id, pid, Utc::now()).await {
                // Registration failure aborts the start; undo what was spawned.
                let partial = RunningPool { shutdown, workers };
                self.shutdown(partial).await;
                return Err(e);
            }

            let worker = Worker::new(
                id,
                jobs.clone(),
                scheduler.clone(),
                executor.clone(),
                self.registry.clone(),
                config.clone(),
            );
            let phase = worker.phase();
            let stats = worker.stats();
            let join = tokio::spawn(worker.run(shutdown.subscribe()));
            workers.push(WorkerHandle {
                id,
                phase,
                stats,
                join,
            });
        }

        let ids: Vec<_> = workers.iter().map(|w| w.id).collect();
        info!(workers = ids.len(), pid, "worker pool started");
        *running = Some(RunningPool { shutdown, workers });
        Ok(ids)
    }

    /// Signal shutdown and wait for workers to drain.
    ///
    /// Workers still running after the grace period are aborted and removed
    /// from the registry. Stopping an idle pool is a no-op.
    pub async fn stop_workers(&self) -> QueueResult<StopReport> {
        let Some(pool) = self.running.lock().await.take() else {
            return Ok(StopReport::default());
        };
        Ok(self.shutdown(pool).await)
    }

    async fn shutdown(&self, pool: RunningPool) -> StopReport {
        let RunningPool { shutdown, workers } = pool;
        // Receivers may all be gone already; that is fine.
        let _ = shutdown.send(true);

        let deadline = tokio::time::Instant::now() + self.grace;
        let mut report = StopReport::default();

        for mut handle in workers {
            match tokio::time::timeout_at(deadline, &mut handle.join).await {
                Ok(Ok(())) => report.drained.push(handle.id),
                Ok(Err(e)) => {
                    warn!(worker_id = %handle.id, error = %e, "worker task failed");
                    self.forget(handle.id).await;
                    report.forced.push(handle.id);
                }
                Err(_) => {
                    warn!(worker_id = %handle.id, phase = ?handle.phase.get(), "worker did not drain in time, aborting");
                    handle.join.abort();
                    self.forget(handle.id).await;
                    report.forced.push(handle.id);
                }
            }
        }

        info!(
            drained = report.drained.len(),
            forced = report.forced.len(),
            "worker pool stopped"
        );
        report
    }

    async fn forget(&self, id: WorkerId) {
        if let Err(e) = self.registry.remove(id).await {
            warn!(worker_id = %id, error = %e, "failed to remove worker record");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Phase of every worker in the running pool.
    pub async fn phases(&self) -> Vec<(WorkerId, WorkerPhase)> {
        match self.running.lock().await.as_ref() {
            Some(pool) => pool.workers.iter().map(|w| (w.id, w.phase.get())).collect(),
            None => Vec::new(),
        }
    }

    /// In-process counters of every worker in the running pool.
    pub async fn stats(&self) -> Vec<(WorkerId, WorkerStats)> {
        match self.running.lock().await.as_ref() {
            Some(pool) => pool.workers.iter().map(|w| (w.id, w.stats.snapshot())).collect(),
            None => Vec::new(),
        }
    }

    /// Wait for Ctrl-C (or SIGTERM on unix), then stop the pool.
    pub async fn stop_on_signal(&self) -> QueueResult<StopReport> {
        wait_for_signal().await;
        info!("shutdown signal received");
        self.stop_workers().await
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable, waiting for Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueueError;
    use crate::store::MemoryStore;
    use jobq_core::WorkerStatus;

    fn fast_config() -> QueueConfig {
        QueueConfig {
            worker_poll_interval: 100,
            ..QueueConfig::default()
        }
    }

    #[tokio::test]
    async fn worker_count_is_bounded() {
        let pool = WorkerPool::new(MemoryStore::arc());
        for count in [0, MAX_WORKERS + 1] {
            let err = pool.start_workers(count, fast_config()).await.unwrap_err();
            assert!(matches!(err, QueueError::Domain(DomainError::Validation(_))));
        }
        assert!(!pool.is_running().await);
    }

    #[tokio::test]
    async fn start_registers_and_stop_drains() {
        let store = MemoryStore::arc();
        let pool = WorkerPool::new(store.clone());
        let registry = WorkerRegistry::new(store);

        let ids = pool.start_workers(3, fast_config()).await.unwrap();
        assert_eq!(ids.len(), 3);
        assert_eq!(registry.active().await.unwrap().len(), 3);

        // Idempotent start.
        let again = pool.start_workers(2, fast_config()).await.unwrap();
        assert_eq!(again, ids);

        let report = pool.stop_workers().await.unwrap();
        assert_eq!(report.drained.len(), 3);
        assert!(report.forced.is_empty());
        assert!(!pool.is_running().await);

        let records = registry.all().await.unwrap();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.status == WorkerStatus::Stopped));

        // Idempotent stop.
        assert_eq!(pool.stop_workers().await.unwrap(), StopReport::default());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn busy_worker_is_forced_after_grace() {
        let store = MemoryStore::arc();
        let jobs = JobStore::new(store.clone());
        jobs.enqueue(jobq_core::NewJob::new("sleep 30").with_id("long"), 3, Utc::now())
            .await
            .unwrap();

        let pool = WorkerPool::with_grace(store.clone(), Duration::from_millis(200));
        let registry = WorkerRegistry::new(store);
        pool.start_workers(1, fast_config()).await.unwrap();

        // Wait for the job to be claimed.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while jobs.get("long").await.unwrap().unwrap().state != jobq_core::JobState::Processing {
            assert!(tokio::time::Instant::now() < deadline, "job never claimed");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let report = pool.stop_workers().await.unwrap();
        assert!(report.drained.is_empty());
        assert_eq!(report.forced.len(), 1);
        assert!(registry.all().await.unwrap().is_empty());
    }
}
