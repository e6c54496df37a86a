//! Persisted queue configuration.

use std::sync::Arc;

use tracing::info;

use jobq_core::{ConfigKey, QueueConfig};

use crate::error::QueueResult;
use crate::store::{Collection, Mutation, RecordStore, Records};

/// Key of the single config record.
pub const CONFIG_KEY: &str = "queue";

/// Loads and updates the `QueueConfig` record.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    records: Records<QueueConfig>,
}

impl ConfigStore {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            records: Records::new(store, Collection::Config),
        }
    }

    /// Stored config, or the defaults when nothing was saved yet.
    pub async fn load(&self) -> QueueResult<QueueConfig> {
        Ok(self.records.get(CONFIG_KEY).await?.unwrap_or_default())
    }

    /// Parse, validate and persist one value. Nothing is written when the
    /// key or value is rejected.
    pub async fn set(&self, key: ConfigKey, raw: &str) -> QueueResult<QueueConfig> {
        let config = self
            .records
            .update(CONFIG_KEY, |current| -> QueueResult<_> {
                let next = current.unwrap_or_default().with_value(key, raw)?;
                Ok((Mutation::Put(next.clone()), next))
            })
            .await?;

        info!(key = %key, value = %config.value(key), "config updated");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use jobq_core::DomainError;
    use crate::error::QueueError;

    #[tokio::test]
    async fn missing_config_loads_defaults() {
        let config = ConfigStore::new(MemoryStore::arc());
        assert_eq!(config.load().await.unwrap(), QueueConfig::default());
    }

    #[tokio::test]
    async fn set_persists_and_is_idempotent() {
        let store = MemoryStore::arc();
        let config = ConfigStore::new(store.clone());

        let once = config.set(ConfigKey::MaxRetries, "5").await.unwrap();
        let after_once = store.read(Collection::Config, CONFIG_KEY).await.unwrap();
        let twice = config.set(ConfigKey::MaxRetries, "5").await.unwrap();
        let after_twice = store.read(Collection::Config, CONFIG_KEY).await.unwrap();

        assert_eq!(once, twice);
        assert_eq!(after_once, after_twice);
        assert_eq!(config.load().await.unwrap().max_retries, 5);
    }

    #[tokio::test]
    async fn rejected_value_is_not_written() {
        let store = MemoryStore::arc();
        let config = ConfigStore::new(store.clone());

        let err = config.set(ConfigKey::BackoffBase, "1").await.unwrap_err();
        assert!(matches!(err, QueueError::Domain(DomainError::Validation(_))));
        assert!(store.read(Collection::Config, CONFIG_KEY).await.unwrap().is_none());
    }
}
