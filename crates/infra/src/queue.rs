//! `JobQueue`: one handle wiring the store, job lifecycle, DLQ, config and
//! worker pool together.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::info;

use jobq_core::{
    ConfigKey, DeadLetterEntry, DomainError, Job, JobState, NewJob, QueueConfig, WorkerId,
    WorkerRecord,
};

use crate::config::ConfigStore;
use crate::error::{QueueResult, retry_transient};
use crate::jobs::{DeadLetterQueue, JobStats, JobStore};
use crate::store::file::{DEFAULT_STALE_LOCK_AFTER, FileStoreOptions};
use crate::store::{DEFAULT_LOCK_TIMEOUT, FileStore, MemoryStore, RecordStore};
use crate::workers::pool::DEFAULT_SHUTDOWN_GRACE;
use crate::workers::{StopReport, WorkerPool, WorkerRegistry};

pub const STORE_ENV: &str = "JOBQ_STORE";
pub const DATA_DIR_ENV: &str = "JOBQ_DATA_DIR";
pub const DEFAULT_DATA_DIR: &str = "./data";

/// File name of the SQLite database inside the data directory.
pub const SQLITE_FILE: &str = "jobq.db";

/// Which `RecordStore` implementation backs the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreBackend {
    #[default]
    File,
    Sqlite,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(StoreBackend::File),
            "sqlite" => Ok(StoreBackend::Sqlite),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(DomainError::validation(format!(
                "unknown store backend '{other}' (expected file, sqlite or memory)"
            ))),
        }
    }
}

/// Process wiring for a `JobQueue`.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub backend: StoreBackend,
    pub data_dir: PathBuf,
    pub lock_timeout: Duration,
    pub stale_lock_after: Duration,
    pub shutdown_grace: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            stale_lock_after: DEFAULT_STALE_LOCK_AFTER,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

impl QueueOptions {
    /// Read `JOBQ_STORE` and `JOBQ_DATA_DIR`; everything else keeps its default.
    pub fn from_env() -> QueueResult<Self> {
        let mut options = Self::default();
        if let Ok(raw) = std::env::var(STORE_ENV) {
            options.backend = raw.parse()?;
        }
        if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
            if !dir.trim().is_empty() {
                options.data_dir = PathBuf::from(dir);
            }
        }
        Ok(options)
    }

    pub fn with_backend(mut self, backend: StoreBackend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

/// Snapshot returned by `JobQueue::status`.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub jobs: JobStats,
    pub workers: Vec<WorkerRecord>,
    pub config: QueueConfig,
}

/// Entry point for embedding the queue.
#[derive(Debug)]
pub struct JobQueue {
    store: Arc<dyn RecordStore>,
    jobs: JobStore,
    dlq: DeadLetterQueue,
    config: ConfigStore,
    registry: WorkerRegistry,
    pool: WorkerPool,
}

impl JobQueue {
    /// Open the backend selected in `options`.
    pub async fn open(options: QueueOptions) -> QueueResult<Self> {
        let store: Arc<dyn RecordStore> = match options.backend {
            StoreBackend::Memory => MemoryStore::arc(),
            StoreBackend::File => Arc::new(
                FileStore::open_with(
                    &options.data_dir,
                    FileStoreOptions {
                        lock_timeout: options.lock_timeout,
                        stale_lock_after: options.stale_lock_after,
                    },
                )
                .await?,
            ),
            StoreBackend::Sqlite => open_sqlite(&options).await?,
        };

        info!(
            backend = ?options.backend,
            data_dir = %options.data_dir.display(),
            "job queue opened"
        );
        Ok(Self::with_store(store, options))
    }

    /// Build on an existing store.
    pub fn with_store(store: Arc<dyn RecordStore>, options: QueueOptions) -> Self {
        Self {
            jobs: JobStore::new(store.clone()),
            dlq: DeadLetterQueue::new(store.clone()),
            config: ConfigStore::new(store.clone()),
            registry: WorkerRegistry::new(store.clone()),
            pool: WorkerPool::with_grace(store.clone(), options.shutdown_grace),
            store,
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub async fn enqueue(&self, spec: NewJob) -> QueueResult<Job> {
        let spec = &spec;
        retry_transient("enqueue", || async move {
            let config = self.config.load().await?;
            self.jobs
                .enqueue(spec.clone(), config.max_retries, Utc::now())
                .await
        })
        .await
    }

    /// Start `count` workers with the persisted config.
    pub async fn start_workers(&self, count: usize) -> QueueResult<Vec<WorkerId>> {
        let config = retry_transient("load config", || self.config.load()).await?;
        self.start_workers_with(count, config).await
    }

    /// Start `count` workers with an explicit config.
    pub async fn start_workers_with(
        &self,
        count: usize,
        config: QueueConfig,
    ) -> QueueResult<Vec<WorkerId>> {
        self.pool.start_workers(count, config).await
    }

    pub async fn stop_workers(&self) -> QueueResult<StopReport> {
        self.pool.stop_workers().await
    }

    /// Block until Ctrl-C or SIGTERM, then stop the workers.
    pub async fn stop_on_signal(&self) -> QueueResult<StopReport> {
        self.pool.stop_on_signal().await
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub async fn status(&self) -> QueueResult<QueueStatus> {
        retry_transient("status", || async move {
            Ok(QueueStatus {
                jobs: self.jobs.stats().await?,
                workers: self.registry.active().await?,
                config: self.config.load().await?,
            })
        })
        .await
    }

    pub async fn list(&self, state: Option<JobState>) -> QueueResult<Vec<Job>> {
        retry_transient("list", || self.jobs.list(state)).await
    }

    /// A job by id, looking in the DLQ when the main collection has none.
    pub async fn get(&self, id: &str) -> QueueResult<Option<Job>> {
        retry_transient("get", || async move {
            if let Some(job) = self.jobs.get(id).await? {
                return Ok(Some(job));
            }
            Ok(self.dlq.get(id).await?.map(|entry| entry.job))
        })
        .await
    }

    pub async fn dlq_list(&self) -> QueueResult<Vec<DeadLetterEntry>> {
        retry_transient("dlq list", || self.dlq.list()).await
    }

    /// Send a dead job back to pending.
    pub async fn dlq_retry(&self, id: &str) -> QueueResult<Job> {
        retry_transient("dlq retry", || self.dlq.retry(id, Utc::now())).await
    }

    pub async fn config(&self) -> QueueResult<QueueConfig> {
        retry_transient("load config", || self.config.load()).await
    }

    pub async fn config_value(&self, key: &str) -> QueueResult<String> {
        let key = ConfigKey::from_str(key)?;
        Ok(self.config().await?.value(key))
    }

    /// Validate and persist one config value. Dashes may replace underscores
    /// in `key`.
    pub async fn set_config(&self, key: &str, value: &str) -> QueueResult<QueueConfig> {
        let key = ConfigKey::from_str(key)?;
        retry_transient("set config", || self.config.set(key, value)).await
    }
}

#[cfg(feature = "sqlite")]
async fn open_sqlite(options: &QueueOptions) -> QueueResult<Arc<dyn RecordStore>> {
    let path = options.data_dir.join(SQLITE_FILE);
    let store = crate::store::SqliteStore::open_with(path, options.lock_timeout).await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "sqlite"))]
async fn open_sqlite(_options: &QueueOptions) -> QueueResult<Arc<dyn RecordStore>> {
    Err(crate::store::StoreError::unavailable("jobq-infra was built without the `sqlite` feature").into())
}
