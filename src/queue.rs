// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable offline queue for unconfirmed local mutations.
//!
//! The queue persists in SQLite alongside the app's domain records and
//! survives process restarts - it is the source of truth for mutations that
//! have not been confirmed by the cloud, not an in-memory buffer.
//!
//! # Coalescing
//!
//! Entries are keyed by (table, record id). A new enqueue for an existing
//! key *replaces* the pending entry: the queue stores only the latest
//! intended mutation for each record, so a burst of edits to one bean
//! costs one upload. Replacing also resets the retry count - the new
//! payload has never been attempted.
//!
//! # Retry budget
//!
//! [`mark_failed`](OfflineQueue::mark_failed) increments the entry's retry
//! count and drops it once the budget (3 by default) is exhausted. Dropped
//! operations are returned to the caller and must be surfaced as a
//! user-visible warning - never silently swallowed.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended (the app shares the file). Writes retry automatically with
//! exponential backoff, capped at 5 attempts.

use crate::config::StorageConfig;
use crate::error::{Result, SyncError};
use crate::metrics;
use crate::model::{now_ms, Table};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior.
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Check if an error is a retryable SQLite busy/locked error.
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED.
pub(crate) async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
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
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
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

/// Open the SQLite pool described by a [`StorageConfig`].
pub(crate) async fn open_pool(config: &StorageConfig) -> Result<SqlitePool> {
    let options = if config.sqlite_path == ":memory:" {
        SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| SyncError::Config(format!("Invalid SQLite path: {}", e)))?
    } else {
        let mut opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", config.sqlite_path))
                .map_err(|e| SyncError::Config(format!("Invalid SQLite path: {}", e)))?
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);
        if config.wal_mode {
            opts = opts.journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
        }
        opts
    };

    // An in-memory database exists per connection; it must not be pooled.
    let max_connections = if config.sqlite_path == ":memory:" { 1 } else { 2 };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Kind of pending mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingOpKind {
    Upsert,
    Delete,
}

impl PendingOpKind {
    fn as_str(&self) -> &'static str {
        match self {
            PendingOpKind::Upsert => "upsert",
            PendingOpKind::Delete => "delete",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "upsert" => Ok(PendingOpKind::Upsert),
            "delete" => Ok(PendingOpKind::Delete),
            other => Err(SyncError::Internal(format!(
                "unknown queue op kind '{}'",
                other
            ))),
        }
    }
}

/// A queued, not-yet-confirmed local mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOperation {
    /// The coalescing key, `"{table}:{record_id}"`.
    pub id: String,
    pub table: Table,
    pub op: PendingOpKind,
    pub record_id: String,
    /// Payload snapshot at enqueue time; `None` for deletes.
    pub payload: Option<Value>,
    /// Enqueue time, epoch millis.
    pub enqueued_at: i64,
    pub retry_count: u32,
}

impl PendingOperation {
    /// The coalescing key for a (table, record id) pair.
    pub fn key(table: Table, record_id: &str) -> String {
        format!("{}:{}", table.as_str(), record_id)
    }
}

/// Outcome of [`OfflineQueue::mark_failed`].
#[derive(Debug, PartialEq)]
pub enum MarkFailedOutcome {
    /// The entry stays queued with an incremented retry count.
    Retained { retries: u32 },
    /// The entry exceeded its retry budget and was removed. Surface this
    /// to the user.
    Dropped(PendingOperation),
}

/// Report from one [`OfflineQueue::process`] drain.
#[derive(Debug, Default)]
pub struct QueueReport {
    /// Entries confirmed and dequeued.
    pub processed: usize,
    /// Entries that failed but remain queued.
    pub failed: usize,
    /// Entries dropped past their retry budget this drain.
    pub dropped: Vec<PendingOperation>,
}

/// Durable, coalescing queue of unconfirmed local mutations.
pub struct OfflineQueue {
    pool: SqlitePool,
    max_retries: u32,
    /// Advisory flag preventing concurrent drains.
    processing: AtomicBool,
}

impl OfflineQueue {
    /// Open (and if needed create) the queue in the given storage.
    pub async fn open(storage: &StorageConfig, max_retries: u32) -> Result<Self> {
        let pool = open_pool(storage).await?;
        Self::with_pool(pool, max_retries).await
    }

    /// Build the queue over an existing pool (shared storage substrate).
    pub async fn with_pool(pool: SqlitePool, max_retries: u32) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_queue (
                id TEXT PRIMARY KEY,
                table_name TEXT NOT NULL,
                op TEXT NOT NULL,
                record_id TEXT NOT NULL,
                payload TEXT,
                enqueued_at INTEGER NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let queue = Self {
            pool,
            max_retries,
            processing: AtomicBool::new(false),
        };

        let depth = queue.len().await?;
        if depth > 0 {
            info!(depth, "Restored pending offline operations");
        }
        metrics::set_queue_depth(depth);

        Ok(queue)
    }

    /// Enqueue a mutation, coalescing with any pending entry for the same
    /// (table, record id).
    pub async fn enqueue(
        &self,
        table: Table,
        op: PendingOpKind,
        record_id: &str,
        payload: Option<Value>,
    ) -> Result<()> {
        let id = PendingOperation::key(table, record_id);
        let payload_text = match &payload {
            Some(value) => Some(serde_json::to_string(value)?),
            None => None,
        };
        let enqueued_at = now_ms();
        let pool = &self.pool;

        execute_with_retry("queue_enqueue", || {
            let id = id.clone();
            let payload_text = payload_text.clone();
            async move {
                sqlx::query(
                    r#"
                    INSERT INTO sync_queue (id, table_name, op, record_id, payload, enqueued_at, retry_count)
                    VALUES (?, ?, ?, ?, ?, ?, 0)
                    ON CONFLICT(id) DO UPDATE SET
                        op = excluded.op,
                        payload = excluded.payload,
                        enqueued_at = excluded.enqueued_at,
                        retry_count = 0
                    "#,
                )
                .bind(id)
                .bind(table.as_str())
                .bind(op.as_str())
                .bind(record_id)
                .bind(payload_text)
                .bind(enqueued_at)
                .execute(pool)
                .await
            }
        })
        .await?;

        debug!(table = %table, record_id, op = op.as_str(), "Enqueued offline mutation");
        metrics::set_queue_depth(self.len().await?);
        Ok(())
    }

    /// Remove a completed entry.
    pub async fn dequeue(&self, id: &str) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("queue_dequeue", || async move {
            sqlx::query("DELETE FROM sync_queue WHERE id = ?")
                .bind(id)
                .execute(pool)
                .await
        })
        .await?;
        Ok(())
    }

    /// Record a failed attempt for an entry.
    ///
    /// Drops the entry once it exceeds the retry budget; the dropped
    /// operation is returned so the caller can warn the user.
    pub async fn mark_failed(&self, id: &str) -> Result<MarkFailedOutcome> {
        let Some(entry) = self.get(id).await? else {
            return Err(SyncError::Internal(format!(
                "mark_failed on unknown queue entry '{}'",
                id
            )));
        };

        let retries = entry.retry_count + 1;
        if retries >= self.max_retries {
            self.dequeue(id).await?;
            warn!(
                table = %entry.table,
                record_id = %entry.record_id,
                retries,
                "Dropping queued mutation after exhausting retry budget"
            );
            metrics::record_queue_dropped(entry.table.as_str());
            let mut dropped = entry;
            dropped.retry_count = retries;
            return Ok(MarkFailedOutcome::Dropped(dropped));
        }

        let pool = &self.pool;
        execute_with_retry("queue_mark_failed", || async move {
            sqlx::query("UPDATE sync_queue SET retry_count = ? WHERE id = ?")
                .bind(retries as i64)
                .bind(id)
                .execute(pool)
                .await
        })
        .await?;

        Ok(MarkFailedOutcome::Retained { retries })
    }

    /// Fetch a single entry.
    pub async fn get(&self, id: &str) -> Result<Option<PendingOperation>> {
        let row: Option<(String, String, String, String, Option<String>, i64, i64)> =
            sqlx::query_as(
                r#"
                SELECT id, table_name, op, record_id, payload, enqueued_at, retry_count
                FROM sync_queue WHERE id = ?
                "#,
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::decode_row).transpose()
    }

    /// All pending entries, FIFO by enqueue time.
    pub async fn pending(&self) -> Result<Vec<PendingOperation>> {
        let rows: Vec<(String, String, String, String, Option<String>, i64, i64)> =
            sqlx::query_as(
                r#"
                SELECT id, table_name, op, record_id, payload, enqueued_at, retry_count
                FROM sync_queue ORDER BY enqueued_at ASC, id ASC
                "#,
            )
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Self::decode_row).collect()
    }

    /// Number of pending entries.
    pub async fn len(&self) -> Result<usize> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sync_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    /// True when nothing is queued.
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Drain the queue through `processor`, FIFO.
    ///
    /// Returns `Ok(None)` when another drain already holds the advisory
    /// busy flag. Entries whose processing fails are retained (or dropped
    /// past their budget - see [`QueueReport::dropped`]); the drain
    /// continues with the remaining entries either way.
    pub async fn process<F, Fut>(&self, mut processor: F) -> Result<Option<QueueReport>>
    where
        F: FnMut(PendingOperation) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        if self
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Queue drain already in progress, skipping");
            return Ok(None);
        }
        let _guard = BusyGuard(&self.processing);

        let entries = self.pending().await?;
        let mut report = QueueReport::default();

        for entry in entries {
            let id = entry.id.clone();
            match processor(entry.clone()).await {
                Ok(()) => {
                    self.dequeue(&id).await?;
                    report.processed += 1;
                }
                Err(e) => {
                    debug!(id = %id, error = %e, "Queue entry processing failed");
                    match self.mark_failed(&id).await? {
                        MarkFailedOutcome::Retained { .. } => report.failed += 1,
                        MarkFailedOutcome::Dropped(op) => report.dropped.push(op),
                    }
                }
            }
        }

        metrics::record_queue_processed(report.processed);
        metrics::set_queue_depth(self.len().await?);

        info!(
            processed = report.processed,
            failed = report.failed,
            dropped = report.dropped.len(),
            "Queue drain complete"
        );

        Ok(Some(report))
    }

    /// Close the pool gracefully.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn decode_row(
        row: (String, String, String, String, Option<String>, i64, i64),
    ) -> Result<PendingOperation> {
        let (id, table_name, op, record_id, payload, enqueued_at, retry_count) = row;
        Ok(PendingOperation {
            id,
            table: Table::parse(&table_name)?,
            op: PendingOpKind::parse(&op)?,
            record_id,
            payload: payload.as_deref().map(serde_json::from_str).transpose()?,
            enqueued_at,
            retry_count: retry_count as u32,
        })
    }
}

/// Clears the advisory busy flag when a drain exits, on any path.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
