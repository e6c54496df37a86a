//! Memory store with injectable faults, for exercising failure paths.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::{Collection, MemoryStore, RecordStore, StoreError, StoreResult, UpdateFn};

/// A record write applied out of band: `None` removes the record.
pub(crate) type Interleaved = (Collection, String, Option<Value>);

#[derive(Debug, Default)]
struct Faults {
    /// Job updates let through before failures start.
    skip: u32,
    /// Job updates still to fail.
    fail: u32,
    /// Applied just before the next DLQ update or delete.
    before_dlq_change: Vec<Interleaved>,
}

#[derive(Debug, Default)]
pub(crate) struct FlakyStore {
    inner: MemoryStore,
    faults: Mutex<Faults>,
}

impl FlakyStore {
    pub(crate) fn arc() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Let `skip` job updates through, then fail the next `fail` with a lock
    /// timeout.
    pub(crate) fn fail_job_updates(&self, skip: u32, fail: u32) {
        let mut faults = self.faults.lock().unwrap();
        faults.skip = skip;
        faults.fail = fail;
    }

    /// Make `writes` land right before the next DLQ update or delete, as if
    /// another process got there first.
    pub(crate) fn before_dlq_change(&self, writes: Vec<Interleaved>) {
        self.faults.lock().unwrap().before_dlq_change = writes;
    }

    fn check_job_update(&self, key: &str) -> StoreResult<()> {
        let mut faults = self.faults.lock().unwrap();
        if faults.skip > 0 {
            faults.skip -= 1;
            return Ok(());
        }
        if faults.fail > 0 {
            faults.fail -= 1;
            return Err(StoreError::LockTimeout {
                key: format!("{}/{key}", Collection::Jobs),
                waited: Duration::from_millis(1),
            });
        }
        Ok(())
    }

    async fn interleave(&self) -> StoreResult<()> {
        let writes = std::mem::take(&mut self.faults.lock().unwrap().before_dlq_change);
        for (collection, key, value) in writes {
            match value {
                Some(value) => self.inner.write(collection, &key, value).await?,
                None => {
                    self.inner.delete(collection, &key).await?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for FlakyStore {
    async fn read(&self, collection: Collection, key: &str) -> StoreResult<Option<Value>> {
        self.inner.read(collection, key).await
    }

    async fn read_all(&self, collection: Collection) -> StoreResult<Vec<(String, Value)>> {
        self.inner.read_all(collection).await
    }

    async fn write(&self, collection: Collection, key: &str, value: Value) -> StoreResult<()> {
        self.inner.write(collection, key, value).await
    }

    async fn update<'a>(
        &self,
        collection: Collection,
        key: &str,
        mutate: UpdateFn<'a>,
    ) -> StoreResult<Option<Value>> {
        match collection {
            Collection::Jobs => self.check_job_update(key)?,
            Collection::DeadLetters => self.interleave().await?,
            _ => {}
        }
        self.inner.update(collection, key, mutate).await
    }

    async fn delete(&self, collection: Collection, key: &str) -> StoreResult<bool> {
        if collection == Collection::DeadLetters {
            self.interleave().await?;
        }
        self.inner.delete(collection, key).await
    }
}
