//! SQLite-backed record store.
//!
//! All collections share one `records` table. Updates run inside a
//! `BEGIN IMMEDIATE` transaction so the write lock is taken before the read,
//! and SQLite's busy timeout doubles as the lock window.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, SqliteConnection};
use tracing::{debug, warn};

use super::{
    Collection, DEFAULT_LOCK_TIMEOUT, RecordStore, StoreError, StoreResult, UpdateFn,
    apply_mutation, validate_key,
};

const SQLITE_BUSY: i64 = 5;
const SQLITE_LOCKED: i64 = 6;

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    lock_timeout: Duration,
}

impl SqliteStore {
    /// Open (creating if needed) the database file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::open_with(path, DEFAULT_LOCK_TIMEOUT).await
    }

    pub async fn open_with(path: impl AsRef<Path>, lock_timeout: Duration) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                StoreError::unavailable(format!("create directory {}: {e}", parent.display()))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(lock_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .acquire_timeout(lock_timeout)
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("open database", e))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                collection  TEXT NOT NULL,
                key         TEXT NOT NULL,
                value       TEXT NOT NULL,
                PRIMARY KEY (collection, key)
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| map_sqlx_error("create records table", e))?;

        debug!(path = %path.display(), "sqlite store opened");
        Ok(Self { pool, lock_timeout })
    }

    async fn select(
        conn: &mut SqliteConnection,
        collection: Collection,
        key: &str,
    ) -> StoreResult<Option<Value>> {
        let row = sqlx::query("SELECT value FROM records WHERE collection = ?1 AND key = ?2")
            .bind(collection.as_str())
            .bind(key)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("select record", e))?;

        match row {
            Some(row) => {
                let raw: String = row
                    .try_get("value")
                    .map_err(|e| StoreError::corrupt(collection, key, e))?;
                serde_json::from_str(&raw)
                    .map(Some)
                    .map_err(|e| StoreError::corrupt(collection, key, e))
            }
            None => Ok(None),
        }
    }

    async fn upsert(
        conn: &mut SqliteConnection,
        collection: Collection,
        key: &str,
        value: &Value,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO records (collection, key, value)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (collection, key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(collection.as_str())
        .bind(key)
        .bind(value.to_string())
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("upsert record", e))?;
        Ok(())
    }

    async fn remove(conn: &mut SqliteConnection, collection: Collection, key: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM records WHERE collection = ?1 AND key = ?2")
            .bind(collection.as_str())
            .bind(key)
            .execute(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("delete record", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_in_tx(
        conn: &mut SqliteConnection,
        collection: Collection,
        key: &str,
        mutate: UpdateFn<'_>,
    ) -> StoreResult<Option<Value>> {
        let current = Self::select(conn, collection, key).await?;
        let existed = current.is_some();
        let mutation = mutate(current.clone())?;
        let unchanged = matches!(mutation, super::Mutation::Keep);
        let next = apply_mutation(current, mutation);

        if !unchanged {
            match &next {
                Some(value) => Self::upsert(conn, collection, key, value).await?,
                None if existed => {
                    Self::remove(conn, collection, key).await?;
                }
                None => {}
            }
        }
        Ok(next)
    }
}

/// Busy/locked database errors are lock contention; everything else is
/// reported as the backend being unavailable.
fn map_sqlx_error(op: &str, e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::Database(db) => {
            let primary = db
                .code()
                .and_then(|code| code.parse::<i64>().ok())
                .map(|code| code & 0xff);
            if matches!(primary, Some(SQLITE_BUSY) | Some(SQLITE_LOCKED)) {
                return StoreError::LockTimeout {
                    key: op.to_string(),
                    waited: Duration::ZERO,
                };
            }
            StoreError::unavailable(format!("{op}: {e}"))
        }
        sqlx::Error::PoolTimedOut => StoreError::LockTimeout {
            key: op.to_string(),
            waited: Duration::ZERO,
        },
        _ => StoreError::unavailable(format!("{op}: {e}")),
    }
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn read(&self, collection: Collection, key: &str) -> StoreResult<Option<Value>> {
        validate_key(key)?;
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire connection", e))?;
        Self::select(&mut conn, collection, key).await
    }

    async fn read_all(&self, collection: Collection) -> StoreResult<Vec<(String, Value)>> {
        let rows = sqlx::query("SELECT key, value FROM records WHERE collection = ?1 ORDER BY key")
            .bind(collection.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("select records", e))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let key: String = row
                .try_get("key")
                .map_err(|e| StoreError::corrupt(collection, "?", e))?;
            let parsed = row
                .try_get::<String, _>("value")
                .map_err(|e| StoreError::corrupt(collection, &key, e))
                .and_then(|raw| {
                    serde_json::from_str(&raw).map_err(|e| StoreError::corrupt(collection, &key, e))
                });
            match parsed {
                Ok(value) => records.push((key, value)),
                Err(e) => warn!(collection = %collection, key = %key, error = %e, "skipping unreadable record"),
            }
        }
        Ok(records)
    }

    async fn write(&self, collection: Collection, key: &str, value: Value) -> StoreResult<()> {
        validate_key(key)?;
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire connection", e))?;
        Self::upsert(&mut conn, collection, key, &value).await
    }

    async fn update<'a>(
        &self,
        collection: Collection,
        key: &str,
        mutate: UpdateFn<'a>,
    ) -> StoreResult<Option<Value>> {
        validate_key(key)?;

        // Dropping the transaction, including on task abort, rolls it back.
        let mut tx = self
            .pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(|e| match map_sqlx_error("begin transaction", e) {
                StoreError::LockTimeout { .. } => StoreError::LockTimeout {
                    key: format!("{collection}/{key}"),
                    waited: self.lock_timeout,
                },
                other => other,
            })?;

        match Self::update_in_tx(&mut *tx, collection, key, mutate).await {
            Ok(next) => {
                tx.commit()
                    .await
                    .map_err(|e| map_sqlx_error("commit transaction", e))?;
                Ok(next)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(collection = %collection, key = %key, error = %rollback, "failed to roll back transaction");
                }
                Err(e)
            }
        }
    }

    async fn delete(&self, collection: Collection, key: &str) -> StoreResult<bool> {
        validate_key(key)?;
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire connection", e))?;
        Self::remove(&mut conn, collection, key).await
    }
}
