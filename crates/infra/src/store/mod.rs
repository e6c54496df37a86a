//! Durable keyed record storage.
//!
//! ## Design
//!
//! - Records are JSON documents grouped in named collections
//! - `update` is the only coordination primitive: the closure runs with
//!   exclusive access to one key, across tasks and across processes
//! - Backends are interchangeable behind `Arc<dyn RecordStore>`
//!
//! ## Backends
//!
//! - `MemoryStore`: in-process map (tests/dev)
//! - `FileStore`: one JSON file per key, lock files for exclusion
//! - `SqliteStore`: single table, `BEGIN IMMEDIATE` transactions (feature `sqlite`)

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub mod file;
pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;
#[cfg(test)]
pub(crate) mod testing;
pub mod typed;

pub use file::FileStore;
pub use memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;
pub use typed::Records;

/// Default window for obtaining exclusive access to a key.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest accepted record key.
pub const MAX_KEY_LEN: usize = 128;

/// Named record collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
    Jobs,
    DeadLetters,
    Workers,
    Config,
}

impl Collection {
    pub const ALL: [Collection; 4] = [
        Collection::Jobs,
        Collection::DeadLetters,
        Collection::Workers,
        Collection::Config,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Jobs => "jobs",
            Collection::DeadLetters => "dead_letters",
            Collection::Workers => "workers",
            Collection::Config => "config",
        }
    }
}

impl core::fmt::Display for Collection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an `update` closure decided to do with the record.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation<T = Value> {
    /// Leave the record as it is (or absent).
    Keep,
    /// Store this value.
    Put(T),
    /// Delete the record.
    Remove,
}

impl<T> Mutation<T> {
    pub fn try_map<U, E>(self, f: impl FnOnce(T) -> Result<U, E>) -> Result<Mutation<U>, E> {
        Ok(match self {
            Mutation::Keep => Mutation::Keep,
            Mutation::Put(value) => Mutation::Put(f(value)?),
            Mutation::Remove => Mutation::Remove,
        })
    }
}

/// Closure applied by `RecordStore::update` under the key's exclusive lock.
pub type UpdateFn<'a> = Box<dyn FnOnce(Option<Value>) -> StoreResult<Mutation> + Send + 'a>;

pub type StoreResult<T> = Result<T, StoreError>;

/// Storage error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Exclusive access was not obtained in time.
    #[error("timed out after {waited:?} waiting for lock on {key}")]
    LockTimeout { key: String, waited: Duration },

    /// The backend could not be reached or failed an I/O operation.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A stored record could not be decoded (or a value could not be encoded).
    #[error("corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },

    /// The key is not usable as a record key.
    #[error("invalid record key {0:?}")]
    InvalidKey(String),
}

impl StoreError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn corrupt(collection: Collection, key: &str, reason: impl core::fmt::Display) -> Self {
        Self::Corrupt {
            key: format!("{collection}/{key}"),
            reason: reason.to_string(),
        }
    }

    /// Lock contention and backend hiccups are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::LockTimeout { .. } | Self::Unavailable(_))
    }
}

/// Keyed JSON collections with atomic per-key read-modify-write.
#[async_trait]
pub trait RecordStore: Send + Sync + core::fmt::Debug {
    /// Read one record.
    async fn read(&self, collection: Collection, key: &str) -> StoreResult<Option<Value>>;

    /// Read a whole collection as `(key, record)` pairs, ordered by key.
    ///
    /// Records that cannot be parsed are logged and left out.
    async fn read_all(&self, collection: Collection) -> StoreResult<Vec<(String, Value)>>;

    /// Unconditionally store a record.
    async fn write(&self, collection: Collection, key: &str, value: Value) -> StoreResult<()>;

    /// Apply `mutate` to the current record with exclusive access to `key`.
    ///
    /// Returns the record as stored afterwards.
    async fn update<'a>(
        &self,
        collection: Collection,
        key: &str,
        mutate: UpdateFn<'a>,
    ) -> StoreResult<Option<Value>>;

    /// Remove a record. Returns whether it existed.
    async fn delete(&self, collection: Collection, key: &str) -> StoreResult<bool>;
}

/// Reject keys that are unsafe as file names or table keys.
pub fn validate_key(key: &str) -> StoreResult<()> {
    let valid = !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

/// Resolve a mutation against the previous record.
pub(crate) fn apply_mutation(previous: Option<Value>, mutation: Mutation) -> Option<Value> {
    match mutation {
        Mutation::Keep => previous,
        Mutation::Put(value) => Some(value),
        Mutation::Remove => None,
    }
}
