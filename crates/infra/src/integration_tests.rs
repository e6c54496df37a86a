//! End-to-end tests for the full queue pipeline.
//!
//! Tests: enqueue → claim → execute → complete / retry / DLQ
//!
//! Verifies:
//! - Successful, failing and timing-out commands land in the right state
//! - Concurrent claimers never take the same job twice
//! - A worker never runs two jobs at once
//! - DLQ retry and config updates behave across a real file store
//! - An unreadable record file does not stall the queue

#![cfg(unix)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;

use jobq_core::{DomainError, Job, JobState, NewJob, QueueConfig, WorkerId};

use crate::error::QueueError;
use crate::jobs::JobStore;
use crate::queue::{JobQueue, QueueOptions, StoreBackend};
use crate::store::{Collection, FileStore, RecordStore};

const WAIT_LIMIT: Duration = Duration::from_secs(15);

async fn file_queue() -> (JobQueue, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let queue = JobQueue::open(
        QueueOptions::default()
            .with_backend(StoreBackend::File)
            .with_data_dir(dir.path()),
    )
    .await
    .unwrap();
    (queue, dir)
}

fn fast_config() -> QueueConfig {
    QueueConfig {
        backoff_base: 1.01,
        worker_poll_interval: 100,
        ..QueueConfig::default()
    }
}

/// Poll `id` until `done` holds, recording every state observed on the way.
async fn wait_for(queue: &JobQueue, id: &str, done: impl Fn(&Job) -> bool) -> (Job, Vec<JobState>) {
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    let mut seen = Vec::new();
    loop {
        if let Some(job) = queue.get(id).await.unwrap() {
            if seen.last() != Some(&job.state) {
                seen.push(job.state);
            }
            if done(&job) {
                return (job, seen);
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {id} did not settle, states seen: {seen:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn successful_command_completes_with_output() {
    let (queue, _dir) = file_queue().await;
    queue
        .enqueue(NewJob::new("echo hi").with_id("hello").with_max_retries(3))
        .await
        .unwrap();

    queue.start_workers_with(1, fast_config()).await.unwrap();
    let (job, _) = wait_for(&queue, "hello", |j| j.state == JobState::Completed).await;
    queue.stop_workers().await.unwrap();

    assert!(job.output.unwrap_or_default().contains("hi"));
    assert_eq!(job.attempts, 1);
    assert!(job.completed_at.is_some());
    assert!(job.locked_by.is_none());

    let status = queue.status().await.unwrap();
    assert_eq!(status.jobs.completed, 1);
    assert_eq!(status.jobs.total, 1);
    assert!(status.workers.is_empty());
}

#[tokio::test]
async fn failing_command_retries_then_dead_letters() {
    let (queue, _dir) = file_queue().await;
    queue
        .enqueue(NewJob::new("exit 1").with_id("doomed").with_max_retries(2))
        .await
        .unwrap();

    queue.start_workers_with(1, fast_config()).await.unwrap();
    let (job, seen) = wait_for(&queue, "doomed", |j| j.state == JobState::Dead).await;
    queue.stop_workers().await.unwrap();

    assert!(seen.contains(&JobState::Failed), "never observed failed: {seen:?}");
    assert_eq!(job.attempts, 2);

    let dlq = queue.dlq_list().await.unwrap();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].job.id.as_str(), "doomed");
    assert_eq!(dlq[0].dlq_reason, "max retries (2) exceeded");
    assert!(queue.list(Some(JobState::Failed)).await.unwrap().is_empty());
    assert_eq!(queue.status().await.unwrap().jobs.dead, 1);
}

#[tokio::test]
async fn workers_never_overlap_their_own_jobs() {
    let (queue, _dir) = file_queue().await;
    for i in 0..5 {
        queue
            .enqueue(NewJob::new("sleep 0.3").with_id(format!("long-{i}")))
            .await
            .unwrap();
    }

    queue.start_workers_with(3, fast_config()).await.unwrap();
    let mut finished = Vec::new();
    for i in 0..5 {
        let (job, _) = wait_for(&queue, &format!("long-{i}"), |j| j.state == JobState::Completed).await;
        finished.push(job);
    }
    let report = queue.stop_workers().await.unwrap();
    assert_eq!(report.drained.len(), 3);

    let mut per_worker: HashMap<WorkerId, Vec<&Job>> = HashMap::new();
    for job in &finished {
        per_worker.entry(job.processed_by.unwrap()).or_default().push(job);
    }
    assert!(per_worker.len() > 1, "only one worker picked up jobs");

    for jobs in per_worker.values_mut() {
        jobs.sort_by_key(|j| j.started_at);
        for pair in jobs.windows(2) {
            let (earlier, later) = (pair[0], pair[1]);
            assert!(
                earlier.completed_at.unwrap() <= later.started_at.unwrap(),
                "{} and {} overlapped on one worker",
                earlier.id,
                later.id
            );
        }
    }
}

#[tokio::test]
async fn timed_out_command_is_dead_lettered() {
    let (queue, _dir) = file_queue().await;
    queue
        .enqueue(NewJob::new("sleep 2").with_id("slow").with_max_retries(0))
        .await
        .unwrap();

    let config = QueueConfig {
        job_timeout: 500,
        ..fast_config()
    };
    queue.start_workers_with(1, config).await.unwrap();
    let started = tokio::time::Instant::now();
    let (job, _) = wait_for(&queue, "slow", |j| j.state == JobState::Dead).await;
    queue.stop_workers().await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(job.last_error.unwrap_or_default().contains("timed out"));
    assert_eq!(job.attempts, 1);
}

#[tokio::test]
async fn corrupt_record_does_not_stall_workers() {
    let (queue, dir) = file_queue().await;
    std::fs::write(dir.path().join("jobs").join("zzz.json"), "{not json").unwrap();
    queue
        .enqueue(NewJob::new("echo fine").with_id("fine"))
        .await
        .unwrap();

    queue.start_workers_with(1, fast_config()).await.unwrap();
    let (job, _) = wait_for(&queue, "fine", |j| j.state == JobState::Completed).await;
    queue.stop_workers().await.unwrap();

    assert_eq!(job.output.as_deref(), Some("fine"));
    let status = queue.status().await.unwrap();
    assert_eq!(status.jobs.completed, 1);
    assert_eq!(status.jobs.total, 1);
}

#[tokio::test]
async fn racing_claimers_take_each_job_once() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn RecordStore> = Arc::new(FileStore::open(dir.path()).await.unwrap());
    let jobs = JobStore::new(store);

    const JOBS: usize = 20;
    for i in 0..JOBS {
        jobs.enqueue(NewJob::new("true").with_id(format!("job-{i:02}")), 3, Utc::now())
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..6 {
        let jobs = jobs.clone();
        handles.push(tokio::spawn(async move {
            let worker = WorkerId::new();
            let mut claimed = Vec::new();
            while let Some(job) = jobs.claim_next(worker, Utc::now(), Duration::from_secs(330)).await.unwrap() {
                assert_eq!(job.locked_by, Some(worker));
                claimed.push(job.id.to_string());
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    let unique: HashSet<_> = all.iter().cloned().collect();
    assert_eq!(all.len(), JOBS);
    assert_eq!(unique.len(), JOBS);
    assert!(jobs.list(Some(JobState::Pending)).await.unwrap().is_empty());
}

#[tokio::test]
async fn two_pools_share_one_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let options = QueueOptions::default().with_data_dir(dir.path());
    let first = JobQueue::open(options.clone()).await.unwrap();
    let second = JobQueue::open(options).await.unwrap();

    for i in 0..8 {
        first
            .enqueue(NewJob::new(format!("echo {i}")).with_id(format!("shared-{i}")))
            .await
            .unwrap();
    }

    first.start_workers_with(2, fast_config()).await.unwrap();
    second.start_workers_with(2, fast_config()).await.unwrap();
    for i in 0..8 {
        let (job, _) = wait_for(&second, &format!("shared-{i}"), |j| j.state == JobState::Completed).await;
        assert_eq!(job.output.as_deref(), Some(i.to_string().as_str()));
        assert_eq!(job.attempts, 1);
    }
    first.stop_workers().await.unwrap();
    second.stop_workers().await.unwrap();

    let registry = crate::workers::WorkerRegistry::new(first.store().clone());
    let processed: u64 = registry
        .all()
        .await
        .unwrap()
        .iter()
        .map(|r| r.jobs_processed)
        .sum();
    assert_eq!(processed, 8);
}

#[tokio::test]
async fn dlq_retry_round_trip() {
    let (queue, _dir) = file_queue().await;
    queue
        .enqueue(NewJob::new("exit 3").with_id("bounce").with_max_retries(0))
        .await
        .unwrap();

    queue.start_workers_with(1, fast_config()).await.unwrap();
    wait_for(&queue, "bounce", |j| j.state == JobState::Dead).await;
    queue.stop_workers().await.unwrap();

    let revived = queue.dlq_retry("bounce").await.unwrap();
    assert_eq!(revived.state, JobState::Pending);
    assert_eq!(revived.attempts, 0);
    assert!(revived.last_error.is_none());
    assert!(queue.dlq_list().await.unwrap().is_empty());
    assert_eq!(queue.list(Some(JobState::Pending)).await.unwrap().len(), 1);

    let err = queue.dlq_retry("bounce").await.unwrap_err();
    assert!(matches!(err, QueueError::Domain(DomainError::NotFound(_))));
    assert_eq!(err.exit_code(), 1);
}

#[tokio::test]
async fn config_set_is_idempotent_on_disk() -> anyhow::Result<()> {
    let (queue, dir) = file_queue().await;
    let path = dir.path().join(Collection::Config.as_str()).join("queue.json");

    queue.set_config("worker-poll-interval", "250").await?;
    let first = std::fs::read(&path)?;
    queue.set_config("worker_poll_interval", "250").await?;
    let second = std::fs::read(&path)?;
    assert_eq!(first, second);

    assert_eq!(queue.config_value("worker_poll_interval").await?, "250");

    let err = queue.set_config("job_timeout", "10").await.unwrap_err();
    assert!(matches!(err, QueueError::Domain(DomainError::Validation(_))));
    assert_eq!(std::fs::read(&path)?, second);
    Ok(())
}

#[tokio::test]
async fn enqueue_rejects_bad_submissions() {
    let (queue, _dir) = file_queue().await;

    let err = queue.enqueue(NewJob::new("   ")).await.unwrap_err();
    assert!(matches!(err, QueueError::Domain(DomainError::Validation(_))));

    queue.enqueue(NewJob::new("true").with_id("dup")).await.unwrap();
    let err = queue
        .enqueue(NewJob::new("true").with_id("dup"))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::Domain(DomainError::Validation(_))));

    let err = queue
        .enqueue(NewJob::new("true").with_id("../escape"))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::Domain(DomainError::InvalidId(_))));
}
