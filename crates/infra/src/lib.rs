//! Infrastructure layer: record stores, job lifecycle, workers and the queue facade.

pub mod config;
pub mod error;
pub mod jobs;
pub mod queue;
pub mod store;
pub mod workers;

#[cfg(test)]
mod integration_tests;

pub use config::ConfigStore;
pub use error::{QueueError, QueueResult};
pub use queue::{JobQueue, QueueOptions, QueueStatus, StoreBackend};
pub use store::{FileStore, MemoryStore, RecordStore, StoreError};
#[cfg(feature = "sqlite")]
pub use store::SqliteStore;
pub use workers::{StopReport, WorkerPool};
