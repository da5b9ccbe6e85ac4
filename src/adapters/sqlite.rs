//! SQLite store shared by the cache and the rate limiter.
//!
//! One database file (`<home>/cache.db`) holds both tables so several
//! processes on one machine share cached responses and rate windows. All
//! statements run on the blocking pool; the connection sits behind a mutex.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use thiserror::Error;

use crate::core::cache::{CacheBackend, CacheError};
use crate::core::rate_limiter::{RateStore, RateStoreError, WindowHit};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_entries (
    key         TEXT PRIMARY KEY,
    value       BLOB NOT NULL,
    expires_at  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cache_entries_expires ON cache_entries(expires_at);

CREATE TABLE IF NOT EXISTS rate_limits (
    key           TEXT PRIMARY KEY,
    timestamps    TEXT NOT NULL DEFAULT '[]',
    last_updated  INTEGER NOT NULL
);
"#;

/// SQLite store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("failed to create store directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("store task failed: {0}")]
    Join(String),
}

impl From<StoreError> for CacheError {
    fn from(e: StoreError) -> Self {
        CacheError::Backend(e.to_string())
    }
}

impl From<StoreError> for RateStoreError {
    fn from(e: StoreError) -> Self {
        RateStoreError::Backend(e.to_string())
    }
}

/// SQLite-backed cache and rate store
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::init(conn)
    }

    /// Private in-memory database
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, rusqlite::Error> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let result = tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?;
        Ok(result?)
    }

    /// Drop expired cache rows
    pub async fn purge_expired(&self) -> Result<u64, StoreError> {
        let now = now_millis();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM cache_entries WHERE expires_at <= ?1", [now])
                .map(|n| n as u64)
        })
        .await
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

#[async_trait]
impl CacheBackend for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let key = key.to_string();
        let now = now_millis();
        let value = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT value FROM cache_entries WHERE key = ?1 AND expires_at > ?2",
                    params![key, now],
                    |row| row.get::<_, Vec<u8>>(0),
                )
                .optional()
            })
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        let key = key.to_string();
        let expires_at = now_millis().saturating_add(millis(ttl));
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO cache_entries (key, value, expires_at) VALUES (?1, ?2, ?3)",
                params![key, value, expires_at],
            )
            .map(|_| ())
        })
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let key = key.to_string();
        let removed = self
            .with_conn(move |conn| conn.execute("DELETE FROM cache_entries WHERE key = ?1", [key]))
            .await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        Ok(CacheBackend::get(self, key).await?.is_some())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        let prefix = prefix.to_string();
        let removed = self
            .with_conn(move |conn| {
                conn.execute(
                    "DELETE FROM cache_entries WHERE substr(key, 1, length(?1)) = ?1",
                    [prefix],
                )
            })
            .await?;
        Ok(removed as u64)
    }
}

#[async_trait]
impl RateStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn hit(&self, key: &str, limit: u32, window: Duration) -> Result<WindowHit, RateStoreError> {
        let key = key.to_string();
        let window_ms = millis(window);
        let now = now_millis();

        let hit = self
            .with_conn(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

                let raw: Option<String> = tx
                    .query_row(
                        "SELECT timestamps FROM rate_limits WHERE key = ?1",
                        [&key],
                        |row| row.get(0),
                    )
                    .optional()?;
                let mut timestamps: Vec<i64> = raw
                    .and_then(|s| serde_json::from_str(&s).ok())
                    .unwrap_or_default();
                timestamps.retain(|t| now - t < window_ms);

                let admitted = (timestamps.len() as u32) < limit;
                if admitted {
                    timestamps.push(now);
                }

                let encoded = serde_json::to_string(&timestamps)
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
                tx.execute(
                    "INSERT OR REPLACE INTO rate_limits (key, timestamps, last_updated) VALUES (?1, ?2, ?3)",
                    params![key, encoded, now],
                )?;
                tx.commit()?;

                Ok(WindowHit {
                    admitted,
                    count: timestamps.len() as u32,
                    oldest_age: timestamps
                        .first()
                        .map(|t| Duration::from_millis((now - t).max(0) as u64)),
                })
            })
            .await?;
        Ok(hit)
    }

    async fn reset(&self, key: &str) -> Result<bool, RateStoreError> {
        let key = key.to_string();
        let removed = self
            .with_conn(move |conn| conn.execute("DELETE FROM rate_limits WHERE key = ?1", [key]))
            .await?;
        Ok(removed > 0)
    }
}
