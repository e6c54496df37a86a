//! Worker registry record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::WorkerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Running,
    Stopped,
}

/// Durable record of a worker loop, kept in the `workers` collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: WorkerId,
    /// OS process hosting the worker.
    pub pid: u32,
    pub status: WorkerStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub jobs_processed: u64,
}

impl WorkerRecord {
    pub fn running(id: WorkerId, pid: u32, now: DateTime<Utc>) -> Self {
        Self {
            id,
            pid,
            status: WorkerStatus::Running,
            started_at: now,
            stopped_at: None,
            jobs_processed: 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == WorkerStatus::Running
    }

    pub fn record_processed(&mut self) {
        self.jobs_processed = self.jobs_processed.saturating_add(1);
    }

    pub fn mark_stopped(&mut self, now: DateTime<Utc>) {
        self.status = WorkerStatus::Stopped;
        self.stopped_at = Some(now);
    }
}
