// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Reconciliation: full bidirectional diff-and-merge.
//!
//! Runs once per (re)connect and on demand. Per table, metadata-first to
//! bound bandwidth:
//!
//! 1. load all local records,
//! 2. fetch remote metadata only (id, updated_at, deleted_at),
//! 3. diff: ids needing a full payload are those locally absent or with a
//!    newer remote mutation,
//! 4. batch-fetch exactly those payloads (chunked, bounded, retried),
//! 5. reassemble the remote list; ids whose payload fetch failed are left
//!    out of this pass entirely (their local counterparts too) and retried
//!    next pass - a null payload is never merged over local data,
//! 6. run the resolver against the persisted watermark,
//! 7. execute: batched remote upsert, batched local write (one
//!    transaction), batched local delete.
//!
//! Tables sync independently and in parallel; one table's failure never
//! aborts its siblings, and failures on primary content tables are
//! reported distinctly from secondary ones. A per-table advisory flag
//! skips (not blocks) a second concurrent pass over the same table.
//!
//! The app-level settings document uses a one-directional rule instead:
//! download when the remote copy is newer than the watermark, upload
//! otherwise - never both in one pass, to avoid an upload-then-download
//! echo.
//!
//! Post-sync: pending payload migrations run on freshly pulled rows, every
//! table's view cache is bulk-reloaded from the local store, one completion
//! event is emitted (first sync flagged, silent when nothing happened), and
//! the watermark advances only when at least one table succeeded.

use crate::cache::ViewCache;
use crate::error::Result;
use crate::events::{SyncEvent, SyncNotifier, SyncSummary};
use crate::metrics;
use crate::migrate::migrate_payload;
use crate::model::{now_ms, CloudRecord, LocalRecord, SettingsDoc, Table};
use crate::ops::SyncOps;
use crate::realtime::translate_method_row;
use crate::remote::RemoteStore;
use crate::resolve::batch_resolve;
use crate::store::LocalStore;
use crate::watermark::WatermarkStore;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Counts from one table's pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct TableStats {
    pub uploaded: usize,
    pub downloaded: usize,
    pub deleted_local: usize,
}

/// Outcome of one table's pass.
#[derive(Debug)]
pub enum TableStatus {
    /// The pass completed; all legs succeeded.
    Synced(TableStats),
    /// At least one leg failed. Partial counts are kept.
    Failed { stats: TableStats, error: String },
    /// Another pass already holds this table's advisory flag.
    Skipped,
}

/// What the settings pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsAction {
    Downloaded,
    Uploaded,
    NoOp,
}

/// Full bidirectional diff-and-merge runner.
pub struct ReconcileManager<L: LocalStore, C: ViewCache, R: RemoteStore> {
    store: Arc<L>,
    cache: Arc<C>,
    ops: Arc<SyncOps<R>>,
    watermark: Arc<WatermarkStore>,
    notifier: SyncNotifier,
    /// Tables with a pass currently in flight.
    in_flight: Mutex<HashSet<Table>>,
}

impl<L: LocalStore, C: ViewCache, R: RemoteStore> ReconcileManager<L, C, R> {
    pub fn new(
        store: Arc<L>,
        cache: Arc<C>,
        ops: Arc<SyncOps<R>>,
        watermark: Arc<WatermarkStore>,
        notifier: SyncNotifier,
    ) -> Self {
        Self {
            store,
            cache,
            ops,
            watermark,
            notifier,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Run a full reconciliation pass over every table plus the settings
    /// document.
    pub async fn run(&self) -> Result<SyncSummary> {
        let start = Instant::now();
        let start_ms = now_ms();
        let last_sync = self.watermark.get();
        let first_sync = self.watermark.is_first_sync();

        info!(last_sync, first_sync, "Starting reconciliation");

        // Fan out across tables; each table is sequential internally.
        let passes = Table::ALL.map(|table| self.sync_table(table, last_sync));
        let outcomes = futures::future::join_all(passes).await;

        let settings_outcome = self.sync_settings(last_sync).await;

        let mut summary = SyncSummary {
            first_sync,
            ..Default::default()
        };
        let mut any_success = false;

        for (table, status) in Table::ALL.iter().zip(outcomes) {
            match status {
                TableStatus::Synced(stats) => {
                    any_success = true;
                    summary.uploaded += stats.uploaded;
                    summary.downloaded += stats.downloaded;
                    summary.deleted_local += stats.deleted_local;
                    metrics::record_table_sync(table.as_str(), true);
                }
                TableStatus::Failed { stats, error } => {
                    summary.uploaded += stats.uploaded;
                    summary.downloaded += stats.downloaded;
                    summary.deleted_local += stats.deleted_local;
                    summary.errors += 1;
                    metrics::record_table_sync(table.as_str(), false);
                    if table.is_primary() {
                        warn!(table = %table, error = %error, "Primary content table failed to sync");
                        summary.failed_primary.push(*table);
                    } else {
                        warn!(table = %table, error = %error, "Secondary table failed to sync");
                        summary.failed_secondary.push(*table);
                    }
                }
                TableStatus::Skipped => {
                    metrics::record_table_sync_skipped(table.as_str());
                }
            }
        }

        match settings_outcome {
            Ok(action) => {
                any_success = true;
                debug!(?action, "Settings document pass complete");
            }
            Err(e) => {
                warn!(error = %e, "Settings document pass failed");
                summary.errors += 1;
            }
        }

        // Bulk reload of every view cache - wholesale, not incremental.
        for table in Table::ALL {
            match self.store.all(table).await {
                Ok(records) => self.cache.set_all(table, records),
                Err(e) => warn!(table = %table, error = %e, "View cache reload failed"),
            }
        }

        // A fully failed run must not advance the mark, or the next pass
        // would silently skip the same window.
        if any_success {
            self.watermark.advance(start_ms).await?;
        } else {
            warn!("Every table failed; watermark not advanced");
        }

        let duration = start.elapsed();
        metrics::record_reconcile_complete(
            summary.uploaded,
            summary.downloaded,
            summary.deleted_local,
            summary.errors,
            duration,
        );

        info!(
            uploaded = summary.uploaded,
            downloaded = summary.downloaded,
            deleted_local = summary.deleted_local,
            errors = summary.errors,
            duration_ms = duration.as_millis() as u64,
            "Reconciliation complete"
        );

        if summary.is_notable() {
            self.notifier.emit(SyncEvent::SyncCompleted(summary.clone()));
        }

        Ok(summary)
    }

    /// Lightweight pass: probe each table's max(updated_at) and run the
    /// full table pass only where the remote is ahead of the watermark.
    ///
    /// Used after foreground transitions, where a full metadata scan of
    /// every table is usually wasted work.
    pub async fn run_light(&self) -> Result<SyncSummary> {
        let last_sync = self.watermark.get();
        let mut stale_tables = Vec::new();

        for table in Table::ALL {
            match self.ops.fetch_latest_timestamp(table).await {
                Ok(Some(latest)) if latest > last_sync => stale_tables.push(table),
                Ok(_) => {}
                Err(e) => {
                    // Probe failure: assume stale, the full pass will tell.
                    warn!(table = %table, error = %e, "Latest-timestamp probe failed");
                    stale_tables.push(table);
                }
            }
        }

        if stale_tables.is_empty() {
            debug!("No table is ahead of the watermark, skipping reconcile");
            return Ok(SyncSummary::default());
        }

        info!(stale = stale_tables.len(), "Light check found stale tables");
        self.run().await
    }

    /// Run one table's metadata-first pass.
    #[instrument(skip(self), fields(table = %table, last_sync))]
    async fn sync_table(&self, table: Table, last_sync: i64) -> TableStatus {
        // Advisory flag: a second concurrent pass for the same table is
        // skipped, not blocked.
        {
            let mut in_flight = self.in_flight.lock().expect("in_flight lock poisoned");
            if !in_flight.insert(table) {
                debug!("Table pass already in flight, skipping");
                return TableStatus::Skipped;
            }
        }
        let _guard = InFlightGuard {
            set: &self.in_flight,
            table,
        };

        match self.sync_table_inner(table, last_sync).await {
            Ok(stats) => TableStatus::Synced(stats),
            Err((stats, error)) => TableStatus::Failed { stats, error },
        }
    }

    async fn sync_table_inner(
        &self,
        table: Table,
        last_sync: i64,
    ) -> std::result::Result<TableStats, (TableStats, String)> {
        let mut stats = TableStats::default();

        // 1. All local records.
        let mut local = self
            .store
            .all(table)
            .await
            .map_err(|e| (stats, e.to_string()))?;

        // 2. Remote metadata only.
        let meta = self
            .ops
            .fetch_all_metadata(table)
            .await
            .map_err(|e| (stats, e.to_string()))?;

        // 3. Which ids need a full payload: locally absent, or remote
        //    mutation newer than the local one. Tombstones carry no
        //    payload worth fetching.
        let local_ts: std::collections::HashMap<&str, i64> = local
            .iter()
            .map(|r| (r.id.as_str(), r.timestamp()))
            .collect();
        let needed: Vec<String> = meta
            .iter()
            .filter(|m| !m.is_tombstoned())
            .filter(|m| match local_ts.get(m.id.as_str()) {
                None => true,
                Some(ts) => m.updated_at_ms() > *ts,
            })
            .map(|m| m.id.clone())
            .collect();

        debug!(
            local = local.len(),
            remote_meta = meta.len(),
            needing_payload = needed.len(),
            "Metadata diff complete"
        );

        // 4. Batch-fetch exactly those payloads.
        let fetched = self
            .ops
            .fetch_by_ids(table, &needed)
            .await
            .map_err(|e| (stats, e.to_string()))?;

        // 5. Reassemble. Ids whose payload fetch failed sit this pass out
        //    on both sides; the next pass retries them.
        let failed: HashSet<&str> = fetched.failed_ids.iter().map(String::as_str).collect();
        if !failed.is_empty() {
            warn!(
                failed = failed.len(),
                "Some payload fetches failed; deferring those ids to the next pass"
            );
            local.retain(|r| !failed.contains(r.id.as_str()));
        }

        let mut remote: Vec<CloudRecord> = Vec::with_capacity(meta.len());
        // Tombstoned rows enter resolution from metadata alone.
        for m in &meta {
            if m.is_tombstoned() && !failed.contains(m.id.as_str()) {
                remote.push(CloudRecord {
                    id: m.id.clone(),
                    tenant_id: self.ops.tenant().to_string(),
                    payload: Value::Null,
                    updated_at: m.updated_at.clone(),
                    deleted_at: m.deleted_at.clone(),
                });
            }
        }
        for row in fetched.records {
            if row.payload.is_null() && !row.is_tombstoned() {
                // Never let a payload-less active row into resolution.
                warn!(id = %row.id, "Fetched row is missing its payload, dropping");
                continue;
            }
            remote.push(row);
        }

        // 6. Resolve against the watermark.
        let plan = batch_resolve(&local, &remote, last_sync);
        debug!(
            to_upload = plan.to_upload.len(),
            to_download = plan.to_download.len(),
            to_delete_local = plan.to_delete_local.len(),
            "Resolution plan ready"
        );

        let mut first_error: Option<String> = None;

        // 7a. Batched remote upsert.
        if !plan.to_upload.is_empty() {
            match self.ops.upsert_records(table, &plan.to_upload).await {
                Ok(count) => stats.uploaded = count,
                Err(e) => first_error = Some(format!("upload: {}", e)),
            }
        }

        // 7b. Batched local write (single transaction), with payload
        //     migrations on the freshly pulled rows.
        if !plan.to_download.is_empty() {
            let mut records = Vec::with_capacity(plan.to_download.len());
            for row in &plan.to_download {
                match decode_download(table, row) {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        warn!(id = %row.id, error = %e, "Undecodable downloaded row, dropping");
                    }
                }
            }
            stats.downloaded = records.len();
            metrics::record_downloaded(table.as_str(), records.len());
            if let Err(e) = self.store.bulk_put(table, records).await {
                stats.downloaded = 0;
                first_error.get_or_insert(format!("download: {}", e));
            }
        }

        // 7c. Batched local delete.
        if !plan.to_delete_local.is_empty() {
            match self
                .store
                .bulk_delete(table, plan.to_delete_local.clone())
                .await
            {
                Ok(removed) => {
                    stats.deleted_local = removed;
                    metrics::record_deleted_local(table.as_str(), removed);
                }
                Err(e) => {
                    first_error.get_or_insert(format!("delete: {}", e));
                }
            }
        }

        match first_error {
            None => Ok(stats),
            Some(error) => Err((stats, error)),
        }
    }

    /// One-directional settings pass: download when the remote copy is
    /// newer than the watermark, upload otherwise. Never both.
    async fn sync_settings(&self, last_sync: i64) -> Result<SettingsAction> {
        let remote = self.ops.fetch_settings().await?;

        if let Some(cloud) = remote {
            let remote_ms = crate::model::iso_to_ms(&cloud.updated_at).unwrap_or(0);
            if remote_ms > last_sync {
                self.store
                    .put_settings(SettingsDoc {
                        payload: cloud.payload,
                        updated_at: remote_ms,
                    })
                    .await?;
                debug!(remote_ms, "Downloaded settings document");
                return Ok(SettingsAction::Downloaded);
            }
        }

        match self.store.get_settings().await? {
            Some(local) => {
                self.ops
                    .upsert_settings(local.payload, local.updated_at)
                    .await?;
                debug!(local_ms = local.updated_at, "Uploaded settings document");
                Ok(SettingsAction::Uploaded)
            }
            None => Ok(SettingsAction::NoOp),
        }
    }
}

/// Decode a downloaded row, applying the method-row translation and any
/// pending payload migrations first.
fn decode_download(table: Table, row: &CloudRecord) -> Result<LocalRecord> {
    let mut row = row.clone();
    if table == Table::Methods {
        row.payload = translate_method_row(&row);
    }
    migrate_payload(table, &mut row.payload);
    LocalRecord::from_cloud(table, &row)
}

/// Releases a table's advisory in-flight flag on any exit path.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<Table>>,
    table: Table,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .expect("in_flight lock poisoned")
            .remove(&self.table);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryViewCache;
    use crate::config::ReconcileConfig;
    use crate::events::SyncEvent;
    use crate::model::{ms_to_iso, CoffeeBean, EntityPayload};
    use crate::remote::MemoryRemote;
    use crate::store::MemoryStore;
    use serde_json::json;
    use tempfile::tempdir;

    struct Fixture {
        remote: Arc<MemoryRemote>,
        store: Arc<MemoryStore>,
        cache: Arc<MemoryViewCache>,
        watermark: Arc<WatermarkStore>,
        notifier: SyncNotifier,
        manager: ReconcileManager<MemoryStore, MemoryViewCache, MemoryRemote>,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let remote = Arc::new(MemoryRemote::new());
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryViewCache::new());
        let storage = crate::config::StorageConfig {
            sqlite_path: dir.path().join("wm.db").to_string_lossy().to_string(),
            wal_mode: true,
        };
        let watermark = Arc::new(WatermarkStore::open(&storage).await.unwrap());
        let notifier = SyncNotifier::new();
        let ops = Arc::new(SyncOps::new(
            Arc::clone(&remote),
            "t1",
            ReconcileConfig::default(),
        ));
        let manager = ReconcileManager::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            ops,
            Arc::clone(&watermark),
            notifier.clone(),
        );
        Fixture {
            remote,
            store,
            cache,
            watermark,
            notifier,
            manager,
            _dir: dir,
        }
    }

    fn local_bean(id: &str, ts: i64) -> LocalRecord {
        LocalRecord::new(EntityPayload::Bean(CoffeeBean {
            id: id.to_string(),
            name: format!("bean {}", id),
            remaining: None,
            capacity: None,
            roast_date: None,
            start_day: None,
            end_day: None,
            is_frozen: None,
            timestamp: ts,
        }))
    }

    fn cloud_bean(id: &str, ts: i64) -> CloudRecord {
        CloudRecord {
            id: id.to_string(),
            tenant_id: "t1".to_string(),
            payload: json!({"id": id, "name": format!("cloud {}", id), "timestamp": ts}),
            updated_at: ms_to_iso(ts),
            deleted_at: None,
        }
    }

    #[tokio::test]
    async fn test_first_sync_uploads_local_only_records() {
        let f = fixture().await;
        f.store.put(Table::Beans, local_bean("b1", 100)).await.unwrap();

        let summary = f.manager.run().await.unwrap();

        assert!(summary.first_sync);
        assert_eq!(summary.uploaded, 1);
        assert_eq!(summary.errors, 0);
        assert!(f.remote.row("t1", Table::Beans, "b1").await.is_some());
        assert!(!f.watermark.is_first_sync());
    }

    #[tokio::test]
    async fn test_downloads_remote_only_records() {
        let f = fixture().await;
        f.remote.seed_row("t1", Table::Beans, cloud_bean("b1", 100)).await;

        let summary = f.manager.run().await.unwrap();

        assert_eq!(summary.downloaded, 1);
        let local = f.store.get(Table::Beans, "b1").await.unwrap().unwrap();
        assert_eq!(local.timestamp(), 100);
        // View cache was bulk-reloaded.
        assert!(f.cache.get(Table::Beans, "b1").is_some());
    }

    #[tokio::test]
    async fn test_tombstone_deletes_local() {
        let f = fixture().await;
        f.store.put(Table::Beans, local_bean("b1", 100)).await.unwrap();
        let mut dead = cloud_bean("b1", 500);
        dead.deleted_at = Some(ms_to_iso(500));
        f.remote.seed_row("t1", Table::Beans, dead).await;

        let summary = f.manager.run().await.unwrap();

        assert_eq!(summary.deleted_local, 1);
        assert!(f.store.get(Table::Beans, "b1").await.unwrap().is_none());
        assert!(f.cache.get(Table::Beans, "b1").is_none());
    }

    #[tokio::test]
    async fn test_resurrection_wins_over_tombstone() {
        let f = fixture().await;
        f.store.put(Table::Beans, local_bean("b1", 900)).await.unwrap();
        let mut dead = cloud_bean("b1", 500);
        dead.deleted_at = Some(ms_to_iso(500));
        f.remote.seed_row("t1", Table::Beans, dead).await;

        let summary = f.manager.run().await.unwrap();

        assert_eq!(summary.uploaded, 1);
        assert_eq!(summary.deleted_local, 0);
        let row = f.remote.row("t1", Table::Beans, "b1").await.unwrap();
        assert!(!row.is_tombstoned());
    }

    #[tokio::test]
    async fn test_lww_converges_both_directions() {
        let f = fixture().await;
        f.store.put(Table::Beans, local_bean("newer-local", 800)).await.unwrap();
        f.store.put(Table::Beans, local_bean("newer-remote", 300)).await.unwrap();
        f.remote
            .seed_row("t1", Table::Beans, cloud_bean("newer-local", 700))
            .await;
        f.remote
            .seed_row("t1", Table::Beans, cloud_bean("newer-remote", 400))
            .await;

        let summary = f.manager.run().await.unwrap();

        assert_eq!(summary.uploaded, 1);
        assert_eq!(summary.downloaded, 1);

        let remote_row = f.remote.row("t1", Table::Beans, "newer-local").await.unwrap();
        assert_eq!(remote_row.updated_at_ms(), 800);
        let local = f.store.get(Table::Beans, "newer-remote").await.unwrap().unwrap();
        assert_eq!(local.timestamp(), 400);
    }

    #[tokio::test]
    async fn test_run_is_idempotent() {
        let f = fixture().await;
        f.store.put(Table::Beans, local_bean("b1", 100)).await.unwrap();
        f.remote.seed_row("t1", Table::Beans, cloud_bean("b2", 200)).await;

        let first = f.manager.run().await.unwrap();
        assert!(!first.is_noop());

        let second = f.manager.run().await.unwrap();
        assert!(second.is_noop(), "second pass should be a no-op: {:?}", second);
    }

    #[tokio::test]
    async fn test_failed_payload_fetch_defers_pair() {
        let f = fixture().await;
        f.store.put(Table::Beans, local_bean("b1", 100)).await.unwrap();
        f.remote.seed_row("t1", Table::Beans, cloud_bean("b1", 900)).await;

        // The metadata scan goes through; both attempts of the single id
        // chunk fail, exhausting its retry budget.
        f.remote.fail_next_op("fetch_by_ids", 2);
        let status = f.manager.sync_table(Table::Beans, 0).await;

        match status {
            TableStatus::Synced(stats) => {
                // The failed pair sat the pass out entirely.
                assert_eq!(stats.uploaded, 0);
                assert_eq!(stats.downloaded, 0);
                assert_eq!(stats.deleted_local, 0);
            }
            other => panic!("expected synced-with-no-work, got {:?}", other),
        }

        // Local copy untouched, remote untouched.
        assert_eq!(
            f.store.get(Table::Beans, "b1").await.unwrap().unwrap().timestamp(),
            100
        );
        assert_eq!(
            f.remote.row("t1", Table::Beans, "b1").await.unwrap().updated_at_ms(),
            900
        );

        // A later pass (fetches now healthy) converges.
        let status = f.manager.sync_table(Table::Beans, 0).await;
        match status {
            TableStatus::Synced(stats) => assert_eq!(stats.downloaded, 1),
            other => panic!("expected synced, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fully_failed_run_does_not_advance_watermark() {
        let f = fixture().await;
        f.store.put(Table::Beans, local_bean("b1", 100)).await.unwrap();
        // Enough failures to sink every table's metadata scan and the
        // settings pass (4 tables + settings + retries).
        f.remote.fail_next_requests(64);

        let summary = f.manager.run().await.unwrap();

        assert!(summary.errors > 0);
        assert!(f.watermark.is_first_sync(), "watermark must not advance");
        assert!(summary.failed_primary.contains(&Table::Beans));
    }

    #[tokio::test]
    async fn test_partial_failure_still_advances_watermark() {
        let f = fixture().await;
        f.store.put(Table::Beans, local_bean("b1", 100)).await.unwrap();
        // One failing request: exactly one table's metadata scan fails,
        // the rest succeed.
        f.remote.fail_next_requests(1);

        let summary = f.manager.run().await.unwrap();

        assert_eq!(summary.errors, 1);
        assert!(!f.watermark.is_first_sync(), "partial success advances");
        assert_eq!(
            summary.failed_primary.len() + summary.failed_secondary.len(),
            1
        );
    }

    #[tokio::test]
    async fn test_notable_run_emits_one_completion_event() {
        let f = fixture().await;
        let mut rx = f.notifier.subscribe();
        f.remote.seed_row("t1", Table::Beans, cloud_bean("b1", 100)).await;

        f.manager.run().await.unwrap();

        match rx.try_recv().unwrap() {
            SyncEvent::SyncCompleted(summary) => {
                assert_eq!(summary.downloaded, 1);
                assert!(summary.first_sync);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(rx.try_recv().is_err(), "exactly one event expected");
    }

    #[tokio::test]
    async fn test_routine_noop_run_stays_silent() {
        let f = fixture().await;
        // Establish a watermark with a notable first sync.
        f.remote.seed_row("t1", Table::Beans, cloud_bean("b1", 100)).await;
        f.manager.run().await.unwrap();

        let mut rx = f.notifier.subscribe();
        let summary = f.manager.run().await.unwrap();

        assert!(summary.is_noop());
        assert!(!summary.first_sync);
        assert!(rx.try_recv().is_err(), "no event for a silent no-op run");
    }

    #[tokio::test]
    async fn test_settings_downloads_when_remote_newer() {
        let f = fixture().await;
        f.watermark.advance(1_000).await.unwrap();
        f.remote
            .upsert_settings("t1", json!({"theme": "dark"}), ms_to_iso(2_000))
            .await
            .unwrap();
        f.store
            .put_settings(SettingsDoc {
                payload: json!({"theme": "light"}),
                updated_at: 500,
            })
            .await
            .unwrap();

        let action = f.manager.sync_settings(1_000).await.unwrap();
        assert_eq!(action, SettingsAction::Downloaded);

        let local = f.store.get_settings().await.unwrap().unwrap();
        assert_eq!(local.payload["theme"], json!("dark"));
        assert_eq!(local.updated_at, 2_000);
    }

    #[tokio::test]
    async fn test_settings_uploads_when_remote_stale() {
        let f = fixture().await;
        f.remote
            .upsert_settings("t1", json!({"theme": "dark"}), ms_to_iso(500))
            .await
            .unwrap();
        f.store
            .put_settings(SettingsDoc {
                payload: json!({"theme": "light"}),
                updated_at: 900,
            })
            .await
            .unwrap();

        let action = f.manager.sync_settings(1_000).await.unwrap();
        assert_eq!(action, SettingsAction::Uploaded);

        let cloud = f.manager.ops.fetch_settings().await.unwrap().unwrap();
        assert_eq!(cloud.payload["theme"], json!("light"));
    }

    #[tokio::test]
    async fn test_settings_noop_when_nothing_anywhere() {
        let f = fixture().await;
        let action = f.manager.sync_settings(0).await.unwrap();
        assert_eq!(action, SettingsAction::NoOp);
    }

    #[tokio::test]
    async fn test_downloaded_legacy_payload_is_migrated() {
        let f = fixture().await;
        // Legacy numeric amounts in the cloud row.
        f.remote
            .seed_row(
                "t1",
                Table::Beans,
                CloudRecord {
                    id: "b1".to_string(),
                    tenant_id: "t1".to_string(),
                    payload: json!({
                        "id": "b1",
                        "name": "legacy",
                        "remaining": 200,
                        "capacity": 250,
                        "timestamp": 100,
                    }),
                    updated_at: ms_to_iso(100),
                    deleted_at: None,
                },
            )
            .await;

        f.manager.run().await.unwrap();

        let local = f.store.get(Table::Beans, "b1").await.unwrap().unwrap();
        match local.payload {
            EntityPayload::Bean(bean) => {
                assert_eq!(bean.remaining.as_deref(), Some("200"));
                assert_eq!(bean.capacity.as_deref(), Some("250"));
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_grouped_method_rows_translate_on_download() {
        let f = fixture().await;
        f.remote
            .seed_row(
                "t1",
                Table::Methods,
                CloudRecord {
                    id: "v60".to_string(),
                    tenant_id: "t1".to_string(),
                    payload: json!({"methods": [{"id": "m1", "name": "standard"}]}),
                    updated_at: ms_to_iso(300),
                    deleted_at: None,
                },
            )
            .await;

        f.manager.run().await.unwrap();

        let local = f.store.get(Table::Methods, "v60").await.unwrap().unwrap();
        match local.payload {
            EntityPayload::Methods(collection) => {
                assert_eq!(collection.equipment_id, "v60");
                assert_eq!(collection.methods.len(), 1);
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_light_skips_when_nothing_newer() {
        let f = fixture().await;
        f.remote.seed_row("t1", Table::Beans, cloud_bean("b1", 100)).await;
        f.manager.run().await.unwrap();

        // Nothing changed remotely since the watermark.
        let summary = f.manager.run_light().await.unwrap();
        assert!(summary.is_noop());
    }

    #[tokio::test]
    async fn test_run_light_syncs_when_remote_ahead() {
        let f = fixture().await;
        f.remote.seed_row("t1", Table::Beans, cloud_bean("b1", 100)).await;
        f.manager.run().await.unwrap();

        // A newer remote row appears after the watermark.
        let newer = now_ms() + 60_000;
        f.remote.seed_row("t1", Table::Beans, cloud_bean("b2", newer)).await;

        let summary = f.manager.run_light().await.unwrap();
        assert_eq!(summary.downloaded, 1);
        assert!(f.store.get(Table::Beans, "b2").await.unwrap().is_some());
    }
}
