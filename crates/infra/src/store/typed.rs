//! Typed view over one collection.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use super::{Collection, Mutation, RecordStore, StoreError, StoreResult};

/// Serde-typed access to the records of one collection.
pub struct Records<T> {
    store: Arc<dyn RecordStore>,
    collection: Collection,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Records<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            collection: self.collection,
            _marker: PhantomData,
        }
    }
}

impl<T> core::fmt::Debug for Records<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Records")
            .field("collection", &self.collection)
            .finish_non_exhaustive()
    }
}

impl<T> Records<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    pub fn new(store: Arc<dyn RecordStore>, collection: Collection) -> Self {
        Self {
            store,
            collection,
            _marker: PhantomData,
        }
    }

    pub fn collection(&self) -> Collection {
        self.collection
    }

    fn decode(collection: Collection, key: &str, value: serde_json::Value) -> StoreResult<T> {
        serde_json::from_value(value).map_err(|e| StoreError::corrupt(collection, key, e))
    }

    fn encode(collection: Collection, key: &str, record: &T) -> StoreResult<serde_json::Value> {
        serde_json::to_value(record).map_err(|e| StoreError::corrupt(collection, key, e))
    }

    pub async fn get(&self, key: &str) -> StoreResult<Option<T>> {
        match self.store.read(self.collection, key).await? {
            Some(value) => Self::decode(self.collection, key, value).map(Some),
            None => Ok(None),
        }
    }

    /// Every decodable record, in key order.
    ///
    /// A record that does not decode is logged and skipped so one bad file
    /// cannot stall scans; `get` still reports it as corrupt.
    pub async fn all(&self) -> StoreResult<Vec<T>> {
        let collection = self.collection;
        Ok(self
            .store
            .read_all(collection)
            .await?
            .into_iter()
            .filter_map(|(key, value)| match Self::decode(collection, &key, value) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(collection = %collection, key = %key, error = %e, "skipping undecodable record");
                    None
                }
            })
            .collect())
    }

    /// All records matching `predicate`, in key order.
    pub async fn list(&self, predicate: impl Fn(&T) -> bool) -> StoreResult<Vec<T>> {
        let mut records = self.all().await?;
        records.retain(|record| predicate(record));
        Ok(records)
    }

    pub async fn put(&self, key: &str, record: &T) -> StoreResult<()> {
        let value = Self::encode(self.collection, key, record)?;
        self.store.write(self.collection, key, value).await
    }

    pub async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.store.delete(self.collection, key).await
    }

    /// Atomic read-modify-write of one record.
    ///
    /// `f` sees the current record and returns the mutation plus a result
    /// for the caller. An `Err` from `f` leaves the record untouched and is
    /// returned as-is.
    pub async fn update<R, E, F>(&self, key: &str, f: F) -> Result<R, E>
    where
        F: FnOnce(Option<T>) -> Result<(Mutation<T>, R), E> + Send,
        R: Send,
        E: From<StoreError> + Send,
    {
        let collection = self.collection;
        let mut outcome: Option<Result<R, E>> = None;
        let slot = &mut outcome;

        self.store
            .update(
                collection,
                key,
                Box::new(move |raw| {
                    let current = raw
                        .map(|value| Self::decode(collection, key, value))
                        .transpose()?;
                    match f(current) {
                        Ok((mutation, result)) => {
                            let mutation =
                                mutation.try_map(|record| Self::encode(collection, key, &record))?;
                            *slot = Some(Ok(result));
                            Ok(mutation)
                        }
                        Err(e) => {
                            *slot = Some(Err(e));
                            Ok(Mutation::Keep)
                        }
                    }
                }),
            )
            .await?;

        outcome.unwrap_or_else(|| {
            Err(StoreError::unavailable(format!(
                "update of {collection}/{key} completed without running the mutation"
            ))
            .into())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Counter {
        n: u32,
    }

    #[derive(Debug, PartialEq)]
    enum TestError {
        Store(StoreError),
        TooBig,
    }

    impl From<StoreError> for TestError {
        fn from(e: StoreError) -> Self {
            TestError::Store(e)
        }
    }

    fn records() -> Records<Counter> {
        Records::new(MemoryStore::arc(), Collection::Config)
    }

    #[tokio::test]
    async fn update_returns_closure_result() {
        let records = records();
        records.put("c", &Counter { n: 1 }).await.unwrap();

        let previous = records
            .update("c", |current| {
                let current = current.unwrap();
                Ok::<_, TestError>((Mutation::Put(Counter { n: current.n + 1 }), current.n))
            })
            .await
            .unwrap();

        assert_eq!(previous, 1);
        assert_eq!(records.get("c").await.unwrap(), Some(Counter { n: 2 }));
    }

    #[tokio::test]
    async fn closure_error_keeps_record() {
        let records = records();
        records.put("c", &Counter { n: 9 }).await.unwrap();

        let result = records
            .update("c", |_| Err::<(Mutation<Counter>, ()), _>(TestError::TooBig))
            .await;

        assert_eq!(result, Err(TestError::TooBig));
        assert_eq!(records.get("c").await.unwrap(), Some(Counter { n: 9 }));
    }

    #[tokio::test]
    async fn list_filters_in_key_order() {
        let records = records();
        for (key, n) in [("b", 2), ("a", 1), ("c", 3)] {
            records.put(key, &Counter { n }).await.unwrap();
        }

        let odd = records.list(|c| c.n % 2 == 1).await.unwrap();
        assert_eq!(odd, vec![Counter { n: 1 }, Counter { n: 3 }]);
    }

    #[tokio::test]
    async fn undecodable_record_is_corrupt() {
        let store = MemoryStore::arc();
        store
            .write(Collection::Config, "c", serde_json::json!("nope"))
            .await
            .unwrap();
        let records: Records<Counter> = Records::new(store, Collection::Config);

        assert!(matches!(records.get("c").await, Err(StoreError::Corrupt { .. })));
    }

    #[tokio::test]
    async fn scans_skip_undecodable_records() {
        let store = MemoryStore::arc();
        store
            .write(Collection::Config, "bad", serde_json::json!({"n": "many"}))
            .await
            .unwrap();
        let records: Records<Counter> = Records::new(store, Collection::Config);
        records.put("good", &Counter { n: 4 }).await.unwrap();

        assert_eq!(records.all().await.unwrap(), vec![Counter { n: 4 }]);
        assert_eq!(records.list(|c| c.n > 0).await.unwrap().len(), 1);
        assert!(records.get("bad").await.is_err());
    }
}
