// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Watermark persistence.
//!
//! Stores the single `last_sync_time` scalar (epoch millis) marking the
//! last completed reconciliation point. It lives outside the entity tables,
//! is read at sync start, and advances only on (at least partially)
//! successful reconciliation - a fully failed pass must leave it untouched
//! so the next pass retries the same window.
//!
//! A zero watermark means the device has never completed a sync; the first
//! sync gets distinct user-visible treatment.

use crate::config::StorageConfig;
use crate::error::Result;
use crate::metrics;
use crate::queue::{execute_with_retry, open_pool};
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{debug, info};

const WATERMARK_KEY: &str = "last_sync_time";

/// Persistent watermark storage backed by SQLite, with a cached read path.
pub struct WatermarkStore {
    pool: SqlitePool,
    cached: AtomicI64,
}

impl WatermarkStore {
    /// Open (and if needed create) the watermark store.
    pub async fn open(storage: &StorageConfig) -> Result<Self> {
        let pool = open_pool(storage).await?;
        Self::with_pool(pool).await
    }

    /// Build the store over an existing pool (shared storage substrate).
    pub async fn with_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_state (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let row: Option<(i64,)> = sqlx::query_as("SELECT value FROM sync_state WHERE key = ?")
            .bind(WATERMARK_KEY)
            .fetch_optional(&pool)
            .await?;

        let value = row.map(|(v,)| v).unwrap_or(0);
        if value > 0 {
            info!(last_sync_time = value, "Restored watermark");
        }

        Ok(Self {
            pool,
            cached: AtomicI64::new(value),
        })
    }

    /// The current watermark (cached). Zero means never synced.
    pub fn get(&self) -> i64 {
        self.cached.load(Ordering::SeqCst)
    }

    /// True when this device has never completed a sync.
    pub fn is_first_sync(&self) -> bool {
        self.get() == 0
    }

    /// Advance the watermark and persist it.
    ///
    /// Regressions are refused: reconciliation passes may race, and an
    /// older pass must not rewind the mark of a newer one.
    pub async fn advance(&self, to_ms: i64) -> Result<()> {
        let current = self.get();
        if to_ms <= current {
            debug!(current, to_ms, "Skipping watermark regression");
            return Ok(());
        }

        let pool = &self.pool;
        execute_with_retry("watermark_advance", || async move {
            sqlx::query(
                r#"
                INSERT INTO sync_state (key, value) VALUES (?, ?)
                ON CONFLICT(key) DO UPDATE SET value = excluded.value
                "#,
            )
            .bind(WATERMARK_KEY)
            .bind(to_ms)
            .execute(pool)
            .await
        })
        .await?;

        self.cached.store(to_ms, Ordering::SeqCst);
        metrics::record_watermark_advance();
        debug!(last_sync_time = to_ms, "Watermark advanced");
        Ok(())
    }

    /// Close the pool gracefully.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
