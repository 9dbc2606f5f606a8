// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Batched remote I/O primitives.
//!
//! All the engine's cloud traffic funnels through [`SyncOps`]:
//! - id-batch fetches are chunked (25 ids per request by default), run with
//!   bounded concurrency (at most 4 chunks in flight), and retried per chunk
//!   (2 attempts with exponential backoff);
//! - every call runs under a per-call timeout (about 60s for bulk scans,
//!   shorter for point lookups) and a deadline miss is a typed
//!   [`SyncError::Timeout`], never a hang;
//! - partial failure is data, not an error: [`FetchByIds`] carries the rows
//!   that arrived and the ids whose chunks failed, so callers can drop the
//!   failures and retry them on the next pass.

use crate::config::ReconcileConfig;
use crate::error::{Result, SyncError};
use crate::metrics;
use crate::model::{ms_to_iso, now_ms, CloudMeta, CloudRecord, LocalRecord, Table};
use crate::remote::{CloudSettings, RemoteStore};
use crate::resilience::{retry, RetryPolicy};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Result of a chunked id-batch fetch.
///
/// `failed_ids` lists ids whose chunk failed past the retry budget; the
/// records for them are simply absent and will be retried next pass.
#[derive(Debug, Default)]
pub struct FetchByIds {
    pub records: Vec<CloudRecord>,
    pub failed_ids: Vec<String>,
}

impl FetchByIds {
    /// True when every requested chunk succeeded.
    pub fn is_complete(&self) -> bool {
        self.failed_ids.is_empty()
    }
}

/// Tenant-scoped batched remote I/O.
pub struct SyncOps<R: RemoteStore> {
    remote: Arc<R>,
    tenant: String,
    config: ReconcileConfig,
    retry_policy: RetryPolicy,
}

impl<R: RemoteStore> SyncOps<R> {
    /// Create sync operations over a remote backend.
    pub fn new(remote: Arc<R>, tenant: impl Into<String>, config: ReconcileConfig) -> Self {
        let retry_policy = RetryPolicy {
            max_attempts: config.fetch_retries.max(1),
            ..RetryPolicy::for_id_batches()
        };
        Self {
            remote,
            tenant: tenant.into(),
            config,
            retry_policy,
        }
    }

    /// The tenant these operations are scoped to.
    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// Access the underlying remote (for the coordinator's subscribe call).
    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    /// Single max(updated_at) probe for a table, in epoch millis.
    pub async fn fetch_latest_timestamp(&self, table: Table) -> Result<Option<i64>> {
        let iso = with_timeout(
            self.config.point_timeout_duration(),
            "latest_updated_at",
            self.remote.latest_updated_at(&self.tenant, table),
        )
        .await?;
        Ok(iso.as_deref().and_then(crate::model::iso_to_ms))
    }

    /// Metadata-only scan of a table (tombstones included).
    pub async fn fetch_all_metadata(&self, table: Table) -> Result<Vec<CloudMeta>> {
        with_timeout(
            self.config.bulk_timeout_duration(),
            "fetch_metadata",
            self.remote.fetch_metadata(&self.tenant, table),
        )
        .await
    }

    /// Full scan of a table (tombstones included).
    pub async fn fetch_all_records(&self, table: Table) -> Result<Vec<CloudRecord>> {
        with_timeout(
            self.config.bulk_timeout_duration(),
            "fetch_all",
            self.remote.fetch_all(&self.tenant, table),
        )
        .await
    }

    /// Fetch full rows for exactly the given ids.
    ///
    /// Chunked, concurrency-bounded, per-chunk retried. See [`FetchByIds`]
    /// for the partial-failure contract.
    pub async fn fetch_by_ids(&self, table: Table, ids: &[String]) -> Result<FetchByIds> {
        let mut result = FetchByIds::default();
        if ids.is_empty() {
            return Ok(result);
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_fetches.max(1)));
        let point_timeout = self.config.point_timeout_duration();
        let mut join_set: JoinSet<(Vec<String>, Result<Vec<CloudRecord>>)> = JoinSet::new();

        for chunk in ids.chunks(self.config.fetch_chunk_size.max(1)) {
            let chunk: Vec<String> = chunk.to_vec();
            let remote = Arc::clone(&self.remote);
            let tenant = self.tenant.clone();
            let policy = self.retry_policy.clone();
            let semaphore = Arc::clone(&semaphore);
            let attempts = Arc::new(AtomicUsize::new(0));

            join_set.spawn(async move {
                // Closed semaphore is impossible here; treat it as shutdown.
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (chunk, Err(SyncError::Shutdown));
                };

                let counter = Arc::clone(&attempts);
                let fetch_chunk = chunk.clone();
                let outcome = retry(&policy, "fetch_by_ids_chunk", move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let remote = Arc::clone(&remote);
                    let tenant = tenant.clone();
                    let ids = fetch_chunk.clone();
                    async move {
                        with_timeout(
                            point_timeout,
                            "fetch_by_ids",
                            remote.fetch_by_ids(&tenant, table, ids),
                        )
                        .await
                    }
                })
                .await;

                if attempts.load(Ordering::SeqCst) > 1 {
                    metrics::record_fetch_chunk_retry(table.as_str());
                }
                (chunk, outcome)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((_, Ok(rows))) => result.records.extend(rows),
                Ok((chunk, Err(e))) => {
                    warn!(
                        table = %table,
                        chunk_len = chunk.len(),
                        error = %e,
                        "Id-batch chunk failed past retry budget"
                    );
                    metrics::record_fetch_chunk_failed(table.as_str());
                    result.failed_ids.extend(chunk);
                }
                Err(e) => {
                    // Task panicked; we no longer know which chunk it held.
                    return Err(SyncError::Internal(format!(
                        "fetch_by_ids task failed: {}",
                        e
                    )));
                }
            }
        }

        debug!(
            table = %table,
            requested = ids.len(),
            fetched = result.records.len(),
            failed = result.failed_ids.len(),
            "Id-batch fetch complete"
        );

        Ok(result)
    }

    /// Idempotent batched upsert. Always clears tombstones on the touched
    /// rows (resurrection-on-write).
    pub async fn upsert_records(&self, table: Table, records: &[LocalRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let rows: Vec<CloudRecord> = records.iter().map(|r| r.to_cloud(&self.tenant)).collect();
        let count = with_timeout(
            self.config.bulk_timeout_duration(),
            "upsert",
            self.remote.upsert(&self.tenant, table, rows),
        )
        .await?;
        metrics::record_uploaded(table.as_str(), count);
        Ok(count)
    }

    /// Single batched soft-delete update.
    pub async fn mark_deleted(&self, table: Table, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        with_timeout(
            self.config.bulk_timeout_duration(),
            "mark_deleted",
            self.remote
                .mark_deleted(&self.tenant, table, ids.to_vec(), ms_to_iso(now_ms())),
        )
        .await
    }

    /// The tenant's cloud settings document.
    pub async fn fetch_settings(&self) -> Result<Option<CloudSettings>> {
        with_timeout(
            self.config.point_timeout_duration(),
            "fetch_settings",
            self.remote.fetch_settings(&self.tenant),
        )
        .await
    }

    /// Replace the tenant's cloud settings document.
    pub async fn upsert_settings(
        &self,
        payload: serde_json::Value,
        updated_at_ms: i64,
    ) -> Result<()> {
        with_timeout(
            self.config.point_timeout_duration(),
            "upsert_settings",
            self.remote
                .upsert_settings(&self.tenant, payload, ms_to_iso(updated_at_ms)),
        )
        .await
    }
}

/// Run a future under a deadline, mapping a miss to [`SyncError::Timeout`].
async fn with_timeout<T, F>(duration: Duration, operation: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::timeout(operation)),
    }
}
