// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable storage for the pending operation set.
//!
//! The queue writes its whole pending set through [`PersistenceStore::save`]
//! after every mutation and reads it back once with
//! [`PersistenceStore::load`] when the manager is constructed.
//!
//! # Snapshot Writes
//!
//! `save()` replaces the stored set in one transaction (delete + insert), so
//! a crash mid-save leaves either the old snapshot or the new one, never a
//! mix. Row order is the queue's insertion order.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended. Writes are retried with exponential backoff (max 5 attempts)
//! before the error is surfaced.
//!
//! ## Schema
//!
//! ```text
//! pending_operations(
//!     position       INTEGER PRIMARY KEY,   -- insertion order
//!     id             TEXT UNIQUE NOT NULL,
//!     schema_version INTEGER NOT NULL,      -- see codec.rs
//!     record         TEXT NOT NULL,         -- JSON body
//!     updated_at     INTEGER NOT NULL       -- epoch millis
//! )
//! ```

use crate::codec::{self, StoredRecord};
use crate::config::PersistenceConfig;
use crate::error::{is_busy, QueueError, Result};
use crate::operation::Operation;
use parking_lot::Mutex;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Boxed future returned by [`PersistenceStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Durable home of the pending set.
pub trait PersistenceStore: Send + Sync + 'static {
    /// Replace the stored set with `ops`, preserving order.
    fn save(&self, ops: &[Operation]) -> StoreFuture<'_, ()>;

    /// Read back the stored set. Undecodable records are skipped.
    fn load(&self) -> StoreFuture<'_, Vec<Operation>>;

    /// Release resources. Default is a no-op.
    fn close(&self) -> StoreFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts, "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_busy(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::persistence_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_busy(&e) {
                    warn!(
                        operation = operation_name,
                        attempts, "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

/// Encode ops into `(id, record)` rows before any I/O.
fn encode_rows(ops: &[Operation]) -> Result<Vec<(String, StoredRecord)>> {
    ops.iter()
        .map(|op| Ok((op.id().to_string(), codec::encode(op)?)))
        .collect()
}

/// Pending-set storage backed by SQLite.
pub struct SqliteStore {
    pool: SqlitePool,
    path: String,
}

impl SqliteStore {
    /// Open the store described by `config`.
    pub async fn open(config: &PersistenceConfig) -> Result<Self> {
        if config.is_in_memory() {
            Self::in_memory().await
        } else {
            Self::connect(&config.sqlite_path, config.wal_mode).await
        }
    }

    /// Open (or create) a file-backed store with WAL enabled.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        Self::connect(&path_str, true).await
    }

    /// Private in-memory database, alive as long as the store.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| QueueError::Config(format!("Invalid SQLite path: {}", e)))?;

        // One connection that never idles out, or the database vanishes.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::init(pool, ":memory:".to_string()).await
    }

    async fn connect(path_str: &str, wal_mode: bool) -> Result<Self> {
        info!(path = %path_str, "Initializing operation store");

        let journal = if wal_mode {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Delete
        };
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
            .map_err(|e| QueueError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(journal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;

        Self::init(pool, path_str.to_string()).await
    }

    async fn init(pool: SqlitePool, path: String) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pending_operations (
                position INTEGER PRIMARY KEY,
                id TEXT NOT NULL UNIQUE,
                schema_version INTEGER NOT NULL,
                record TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool, path })
    }

    async fn save_rows(&self, rows: Vec<(String, StoredRecord)>) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let pool = &self.pool;
        let rows = &rows;

        execute_with_retry("save_snapshot", || async {
            let mut tx = pool.begin().await?;
            sqlx::query("DELETE FROM pending_operations")
                .execute(&mut *tx)
                .await?;
            for (position, (id, record)) in rows.iter().enumerate() {
                sqlx::query(
                    r#"
                    INSERT INTO pending_operations
                        (position, id, schema_version, record, updated_at)
                    VALUES (?, ?, ?, ?, ?)
                    "#,
                )
                .bind(position as i64)
                .bind(id)
                .bind(record.schema_version as i64)
                .bind(&record.body)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await
        })
        .await?;

        debug!(count = rows.len(), "Saved pending operations");
        Ok(())
    }

    /// Raw stored records in insertion order.
    pub async fn load_records(&self) -> Result<Vec<StoredRecord>> {
        let pool = &self.pool;
        let rows: Vec<(i64, String)> = execute_with_retry("load_snapshot", || async {
            sqlx::query_as(
                "SELECT schema_version, record FROM pending_operations ORDER BY position",
            )
            .fetch_all(pool)
            .await
        })
        .await?;

        Ok(rows
            .into_iter()
            .map(|(schema_version, body)| StoredRecord {
                schema_version: u32::try_from(schema_version).unwrap_or(u32::MAX),
                body,
            })
            .collect())
    }

    /// Append records as-is, without decoding them.
    ///
    /// Used to import a queue persisted by an older build; `id` only has to
    /// be unique within the table.
    pub async fn append_raw(&self, id: &str, record: &StoredRecord) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let pool = &self.pool;

        execute_with_retry("append_raw", || async {
            sqlx::query(
                r#"
                INSERT INTO pending_operations (position, id, schema_version, record, updated_at)
                VALUES ((SELECT COALESCE(MAX(position), -1) + 1 FROM pending_operations), ?, ?, ?, ?)
                "#,
            )
            .bind(id)
            .bind(record.schema_version as i64)
            .bind(&record.body)
            .bind(now)
            .execute(pool)
            .await
        })
        .await?;
        Ok(())
    }

    /// Number of stored rows (for diagnostics).
    pub async fn row_count(&self) -> Result<usize> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM pending_operations")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as usize)
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;

        execute_with_retry("checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await
        })
        .await?;

        debug!("WAL checkpoint complete");
        Ok(())
    }
}

impl PersistenceStore for SqliteStore {
    fn save(&self, ops: &[Operation]) -> StoreFuture<'_, ()> {
        let rows = encode_rows(ops);
        Box::pin(async move { self.save_rows(rows?).await })
    }

    fn load(&self) -> StoreFuture<'_, Vec<Operation>> {
        Box::pin(async move {
            let records = self.load_records().await?;
            let ops = codec::decode_all(&records);
            if !ops.is_empty() {
                info!(count = ops.len(), "Restored pending operations from previous run");
            }
            Ok(ops)
        })
    }

    fn close(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            if self.path != ":memory:" {
                if let Err(e) = self.checkpoint().await {
                    warn!(error = %e, "Failed to checkpoint WAL on close");
                }
            }
            self.pool.close().await;
            info!("Operation store closed");
            Ok(())
        })
    }
}

/// Process-local store. Holds encoded records so the codec path is the same
/// as with SQLite, but nothing survives the process.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<Vec<StoredRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seed with records (e.g. legacy ones).
    pub fn with_records(records: Vec<StoredRecord>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }

    /// Snapshot of the stored records.
    pub fn records(&self) -> Vec<StoredRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl PersistenceStore for MemoryStore {
    fn save(&self, ops: &[Operation]) -> StoreFuture<'_, ()> {
        let encoded: Result<Vec<StoredRecord>> = ops.iter().map(codec::encode).collect();
        Box::pin(async move {
            *self.records.lock() = encoded?;
            Ok(())
        })
    }

    fn load(&self) -> StoreFuture<'_, Vec<Operation>> {
        Box::pin(async move {
            let records = self.records();
            Ok(codec::decode_all(&records))
        })
    }
}
