//! In-memory record store for tests/dev.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use super::{
    Collection, RecordStore, StoreError, StoreResult, UpdateFn, apply_mutation, validate_key,
};

type Table = BTreeMap<String, Value>;

/// Process-local store. Updates are serialized by a single lock.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<Collection, Table>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

fn poisoned() -> StoreError {
    StoreError::unavailable("memory store lock poisoned")
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn read(&self, collection: Collection, key: &str) -> StoreResult<Option<Value>> {
        validate_key(key)?;
        let collections = self.collections.read().map_err(|_| poisoned())?;
        Ok(collections
            .get(&collection)
            .and_then(|table| table.get(key))
            .cloned())
    }

    async fn read_all(&self, collection: Collection) -> StoreResult<Vec<(String, Value)>> {
        let collections = self.collections.read().map_err(|_| poisoned())?;
        Ok(collections
            .get(&collection)
            .map(|table| {
                table
                    .iter()
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn write(&self, collection: Collection, key: &str, value: Value) -> StoreResult<()> {
        validate_key(key)?;
        let mut collections = self.collections.write().map_err(|_| poisoned())?;
        collections
            .entry(collection)
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn update<'a>(
        &self,
        collection: Collection,
        key: &str,
        mutate: UpdateFn<'a>,
    ) -> StoreResult<Option<Value>> {
        validate_key(key)?;
        let mut collections = self.collections.write().map_err(|_| poisoned())?;
        let table = collections.entry(collection).or_default();

        let current = table.get(key).cloned();
        let mutation = mutate(current.clone())?;
        let next = apply_mutation(current, mutation);

        match &next {
            Some(value) => {
                table.insert(key.to_string(), value.clone());
            }
            None => {
                table.remove(key);
            }
        }
        Ok(next)
    }

    async fn delete(&self, collection: Collection, key: &str) -> StoreResult<bool> {
        validate_key(key)?;
        let mut collections = self.collections.write().map_err(|_| poisoned())?;
        Ok(collections
            .get_mut(&collection)
            .and_then(|table| table.remove(key))
            .is_some())
    }
}
