//! File-per-record store.
//!
//! Layout: `<root>/<collection>/<key>.json`. Exclusive access to a key is a
//! lock file `<key>.lock` created with `O_EXCL`; writes go to a hidden temp
//! file that is renamed over the record, so readers never see a torn write.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    Collection, DEFAULT_LOCK_TIMEOUT, RecordStore, StoreError, StoreResult, UpdateFn,
    apply_mutation, validate_key,
};

/// Delay between lock attempts.
pub const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Lock files older than this are assumed to belong to a crashed holder.
pub const DEFAULT_STALE_LOCK_AFTER: Duration = Duration::from_secs(30);

const RECORD_EXT: &str = "json";
const LOCK_EXT: &str = "lock";

#[derive(Debug, Clone)]
pub struct FileStoreOptions {
    pub lock_timeout: Duration,
    pub stale_lock_after: Duration,
}

impl Default for FileStoreOptions {
    fn default() -> Self {
        Self {
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            stale_lock_after: DEFAULT_STALE_LOCK_AFTER,
        }
    }
}

/// Record store backed by a directory tree. Safe to share between processes.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
    options: FileStoreOptions,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        Self::open_with(root, FileStoreOptions::default()).await
    }

    pub async fn open_with(root: impl Into<PathBuf>, options: FileStoreOptions) -> StoreResult<Self> {
        let root = root.into();
        for collection in Collection::ALL {
            let dir = root.join(collection.as_str());
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| io_error("create directory", &dir, e))?;
        }
        debug!(root = %root.display(), "file store opened");
        Ok(Self { root, options })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir(&self, collection: Collection) -> PathBuf {
        self.root.join(collection.as_str())
    }

    fn record_path(&self, collection: Collection, key: &str) -> PathBuf {
        self.dir(collection).join(format!("{key}.{RECORD_EXT}"))
    }

    fn lock_path(&self, collection: Collection, key: &str) -> PathBuf {
        self.dir(collection).join(format!("{key}.{LOCK_EXT}"))
    }

    /// Spin on `O_EXCL` creation of the lock file until it succeeds or the
    /// lock window elapses.
    async fn lock(&self, collection: Collection, key: &str) -> StoreResult<KeyLock> {
        let path = self.lock_path(collection, key);
        let started = Instant::now();

        loop {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(mut file) => {
                    // Holder pid is informational only.
                    let _ = file
                        .write_all(std::process::id().to_string().as_bytes())
                        .await;
                    return Ok(KeyLock { path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    self.break_if_stale(&path).await;
                }
                Err(e) => return Err(io_error("create lock", &path, e)),
            }

            if started.elapsed() >= self.options.lock_timeout {
                return Err(StoreError::LockTimeout {
                    key: format!("{collection}/{key}"),
                    waited: started.elapsed(),
                });
            }
            tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
        }
    }

    async fn break_if_stale(&self, path: &Path) {
        let Ok(metadata) = tokio::fs::metadata(path).await else {
            return;
        };
        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok());
        if age.is_some_and(|age| age >= self.options.stale_lock_after) {
            warn!(lock = %path.display(), age = ?age, "breaking stale lock");
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(lock = %path.display(), error = %e, "failed to break stale lock"),
            }
        }
    }

    async fn read_record(&self, collection: Collection, key: &str) -> StoreResult<Option<Value>> {
        let path = self.record_path(collection, key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error("read", &path, e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::corrupt(collection, key, e))
    }

    /// Write to a hidden temp file in the same directory, then rename.
    async fn write_record(&self, collection: Collection, key: &str, value: &Value) -> StoreResult<()> {
        let bytes = serde_json::to_vec_pretty(value).map_err(|e| StoreError::corrupt(collection, key, e))?;
        let tmp = self
            .dir(collection)
            .join(format!(".{key}.{}.tmp", Uuid::now_v7().simple()));

        if let Err(e) = tokio::fs::write(&tmp, &bytes).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_error("write", &tmp, e));
        }

        let path = self.record_path(collection, key);
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_error("rename", &path, e));
        }
        Ok(())
    }

    async fn remove_record(&self, collection: Collection, key: &str) -> StoreResult<bool> {
        let path = self.record_path(collection, key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error("remove", &path, e)),
        }
    }
}

/// Held lock file; removed on drop.
#[derive(Debug)]
struct KeyLock {
    path: PathBuf,
}

impl Drop for KeyLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!(lock = %self.path.display(), error = %e, "failed to release lock");
            }
        }
    }
}

fn io_error(op: &str, path: &Path, e: std::io::Error) -> StoreError {
    StoreError::unavailable(format!("{op} {}: {e}", path.display()))
}

#[async_trait]
impl RecordStore for FileStore {
    async fn read(&self, collection: Collection, key: &str) -> StoreResult<Option<Value>> {
        validate_key(key)?;
        self.read_record(collection, key).await
    }

    async fn read_all(&self, collection: Collection) -> StoreResult<Vec<(String, Value)>> {
        let dir = self.dir(collection);
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| io_error("list", &dir, e))?;

        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error("list", &dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            if validate_key(key).is_ok() {
                keys.push(key.to_string());
            }
        }
        keys.sort();

        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            match self.read_record(collection, &key).await {
                Ok(Some(value)) => records.push((key, value)),
                // Deleted between listing and reading.
                Ok(None) => {}
                Err(e @ StoreError::Corrupt { .. }) => {
                    warn!(collection = %collection, key = %key, error = %e, "skipping unreadable record");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }

    async fn write(&self, collection: Collection, key: &str, value: Value) -> StoreResult<()> {
        validate_key(key)?;
        let _lock = self.lock(collection, key).await?;
        self.write_record(collection, key, &value).await
    }

    async fn update<'a>(
        &self,
        collection: Collection,
        key: &str,
        mutate: UpdateFn<'a>,
    ) -> StoreResult<Option<Value>> {
        validate_key(key)?;
        let _lock = self.lock(collection, key).await?;

        let current = self.read_record(collection, key).await?;
        let existed = current.is_some();
        let mutation = mutate(current.clone())?;
        let unchanged = matches!(mutation, super::Mutation::Keep);
        let next = apply_mutation(current, mutation);

        if !unchanged {
            match &next {
                Some(value) => self.write_record(collection, key, value).await?,
                None if existed => {
                    self.remove_record(collection, key).await?;
                }
                None => {}
            }
        }
        Ok(next)
    }

    async fn delete(&self, collection: Collection, key: &str) -> StoreResult<bool> {
        validate_key(key)?;
        let _lock = self.lock(collection, key).await?;
        self.remove_record(collection, key).await
    }
}
