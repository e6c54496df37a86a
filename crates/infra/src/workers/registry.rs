//! Durable worker registry (the `workers` collection).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use jobq_core::{WorkerId, WorkerRecord};

use crate::error::QueueResult;
use crate::store::{Collection, Mutation, RecordStore, Records};

#[derive(Debug, Clone)]
pub struct WorkerRegistry {
    records: Records<WorkerRecord>,
}

impl WorkerRegistry {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            records: Records::new(store, Collection::Workers),
        }
    }

    pub async fn register(&self, id: WorkerId, pid: u32, now: DateTime<Utc>) -> QueueResult<WorkerRecord> {
        let record = WorkerRecord::running(id, pid, now);
        self.records.put(&id.to_string(), &record).await?;
        debug!(worker_id = %id, pid, "worker registered");
        Ok(record)
    }

    /// Bump `jobs_processed`. A missing record is left missing.
    pub async fn record_processed(&self, id: WorkerId) -> QueueResult<()> {
        self.records
            .update(&id.to_string(), |current| -> QueueResult<_> {
                Ok(match current {
                    Some(mut record) => {
                        record.record_processed();
                        (Mutation::Put(record), ())
                    }
                    None => (Mutation::Keep, ()),
                })
            })
            .await
    }

    pub async fn mark_stopped(&self, id: WorkerId, now: DateTime<Utc>) -> QueueResult<()> {
        self.records
            .update(&id.to_string(), |current| -> QueueResult<_> {
                Ok(match current {
                    Some(mut record) => {
                        record.mark_stopped(now);
                        (Mutation::Put(record), ())
                    }
                    None => (Mutation::Keep, ()),
                })
            })
            .await
    }

    pub async fn remove(&self, id: WorkerId) -> QueueResult<bool> {
        Ok(self.records.delete(&id.to_string()).await?)
    }

    pub async fn get(&self, id: WorkerId) -> QueueResult<Option<WorkerRecord>> {
        Ok(self.records.get(&id.to_string()).await?)
    }

    /// Workers currently marked running, oldest first.
    pub async fn active(&self) -> QueueResult<Vec<WorkerRecord>> {
        let mut records = self.records.list(WorkerRecord::is_running).await?;
        records.sort_by_key(|record| record.started_at);
        Ok(records)
    }

    pub async fn all(&self) -> QueueResult<Vec<WorkerRecord>> {
        Ok(self.records.all().await?)
    }
}
