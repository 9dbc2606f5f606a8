// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote backend integration trait.
//!
//! Defines what the engine needs from the authoritative cloud store:
//! tenant-scoped upsert-with-conflict-target, filtered selects (active rows,
//! id-in-list, metadata projection), partial update for soft deletes, and a
//! change-feed subscription delivering `{event_type, new, old}` rows per
//! table and tenant.
//!
//! The app wires in the real backend client; [`MemoryRemote`] implements the
//! full contract in memory for tests and standalone use, including the
//! change feed.
//!
//! # Soft deletes
//!
//! The cloud store never hard-deletes: [`RemoteStore::mark_deleted`] sets
//! the `deleted_at` tombstone, and [`RemoteStore::upsert`] always clears it
//! (resurrection-on-write). Deletions therefore reach other devices either
//! as an explicit `Delete` feed event or as an update whose row carries a
//! tombstone - handlers must cope with both.

use crate::error::{Result, SyncError};
use crate::model::{CloudMeta, CloudRecord, Table};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::debug;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type RemoteFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Change-feed event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One change-feed notification.
///
/// `new`/`old` are serialized cloud rows ([`CloudRecord`] shape). Depending
/// on the backend, metadata-only notifications may omit the payload; the
/// realtime handler skips those rather than merging partial data.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub table: Table,
    pub kind: ChangeKind,
    pub new: Option<Value>,
    pub old: Option<Value>,
}

impl ChangeEvent {
    /// The affected record id, from `new` falling back to `old`.
    pub fn record_id(&self) -> Option<&str> {
        self.new
            .as_ref()
            .and_then(|v| v.get("id"))
            .or_else(|| self.old.as_ref().and_then(|v| v.get("id")))
            .and_then(|v| v.as_str())
    }

    /// Decode `new` as a cloud row, if present and well-formed.
    pub fn new_row(&self) -> Option<CloudRecord> {
        self.new
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// A live change-feed subscription.
///
/// Dropping the subscription (or disconnecting the backend) closes the
/// receiver; the realtime task treats a closed feed as an unhealthy channel.
pub struct Subscription {
    pub events: mpsc::Receiver<ChangeEvent>,
}

/// The cloud copy of the app-level settings document.
#[derive(Debug, Clone, PartialEq)]
pub struct CloudSettings {
    pub payload: Value,
    /// ISO-8601 mutation time.
    pub updated_at: String,
}

/// Trait defining what the engine needs from the cloud backend.
///
/// All queries are tenant-scoped. Implementations should translate their
/// native errors into [`SyncError::Remote`] so retry classification works.
pub trait RemoteStore: Send + Sync + 'static {
    /// All rows of a table, tombstoned rows included.
    fn fetch_all(&self, tenant: &str, table: Table) -> RemoteFuture<'_, Vec<CloudRecord>>;

    /// Metadata-only projection (id, updated_at, deleted_at) of a table,
    /// tombstoned rows included.
    fn fetch_metadata(&self, tenant: &str, table: Table) -> RemoteFuture<'_, Vec<CloudMeta>>;

    /// Full rows for the given ids. Implementations return whatever subset
    /// exists; missing ids are simply absent from the result.
    fn fetch_by_ids(
        &self,
        tenant: &str,
        table: Table,
        ids: Vec<String>,
    ) -> RemoteFuture<'_, Vec<CloudRecord>>;

    /// The maximum `updated_at` of a table, if the table is non-empty.
    fn latest_updated_at(&self, tenant: &str, table: Table) -> RemoteFuture<'_, Option<String>>;

    /// Idempotent upsert on (id, tenant). Always clears the tombstone.
    fn upsert(
        &self,
        tenant: &str,
        table: Table,
        rows: Vec<CloudRecord>,
    ) -> RemoteFuture<'_, usize>;

    /// Batched soft delete: sets `deleted_at` on the given ids.
    fn mark_deleted(
        &self,
        tenant: &str,
        table: Table,
        ids: Vec<String>,
        deleted_at: String,
    ) -> RemoteFuture<'_, usize>;

    /// The tenant's settings document, if any.
    fn fetch_settings(&self, tenant: &str) -> RemoteFuture<'_, Option<CloudSettings>>;

    /// Replace the tenant's settings document.
    fn upsert_settings(
        &self,
        tenant: &str,
        payload: Value,
        updated_at: String,
    ) -> RemoteFuture<'_, ()>;

    /// Open the change-feed subscription for a tenant.
    fn subscribe(&self, tenant: &str) -> RemoteFuture<'_, Subscription>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-memory implementation
// ═══════════════════════════════════════════════════════════════════════════════

/// Capacity of the internal feed fan-out channel.
const FEED_CAPACITY: usize = 256;

/// In-memory [`RemoteStore`] for tests and standalone use.
///
/// Mutations made through the trait emit change-feed events to live
/// subscriptions, so realtime behavior can be exercised end to end. Test
/// helpers allow seeding rows silently and injecting failures.
pub struct MemoryRemote {
    rows: RwLock<HashMap<(String, Table), BTreeMap<String, CloudRecord>>>,
    settings: RwLock<HashMap<String, CloudSettings>>,
    feed_tx: broadcast::Sender<ChangeEvent>,
    /// Number of upcoming requests to fail (failure injection).
    fail_next: AtomicUsize,
    /// Targeted failure injection: (operation name, remaining failures).
    fail_op: std::sync::Mutex<Option<(String, usize)>>,
    /// When set, the next subscribe call never completes (timeout testing).
    hang_subscribe: std::sync::atomic::AtomicBool,
}

impl MemoryRemote {
    pub fn new() -> Self {
        let (feed_tx, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            rows: RwLock::new(HashMap::new()),
            settings: RwLock::new(HashMap::new()),
            feed_tx,
            fail_next: AtomicUsize::new(0),
            fail_op: std::sync::Mutex::new(None),
            hang_subscribe: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Make the next subscribe call hang forever (for timeout testing).
    pub fn hang_next_subscribe(&self) {
        self.hang_subscribe.store(true, Ordering::SeqCst);
    }

    /// Make the next `n` requests fail with a retryable remote error.
    pub fn fail_next_requests(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` requests of one specific operation fail, leaving
    /// every other operation healthy.
    pub fn fail_next_op(&self, operation: &str, n: usize) {
        *self.fail_op.lock().expect("fail_op lock poisoned") =
            Some((operation.to_string(), n));
    }

    fn take_failure(&self, operation: &str) -> Result<()> {
        {
            let mut fail_op = self.fail_op.lock().expect("fail_op lock poisoned");
            if let Some((op, remaining)) = fail_op.as_mut() {
                if op == operation && *remaining > 0 {
                    *remaining -= 1;
                    return Err(SyncError::remote(operation, "injected failure"));
                }
            }
        }

        let hit = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if hit {
            Err(SyncError::remote(operation, "injected failure"))
        } else {
            Ok(())
        }
    }

    /// Seed a row directly, without emitting a feed event.
    pub async fn seed_row(&self, tenant: &str, table: Table, row: CloudRecord) {
        let mut rows = self.rows.write().await;
        rows.entry((tenant.to_string(), table))
            .or_default()
            .insert(row.id.clone(), row);
    }

    /// Fetch a row directly (test accessor).
    pub async fn row(&self, tenant: &str, table: Table, id: &str) -> Option<CloudRecord> {
        self.rows
            .read()
            .await
            .get(&(tenant.to_string(), table))
            .and_then(|t| t.get(id))
            .cloned()
    }

    /// Emit an explicit `Delete` feed event (some backends send these
    /// instead of tombstone-bearing updates).
    pub fn emit_delete_event(&self, table: Table, old: Value) {
        let _ = self.feed_tx.send(ChangeEvent {
            table,
            kind: ChangeKind::Delete,
            new: None,
            old: Some(old),
        });
    }

    /// Emit an arbitrary feed event (test helper).
    pub fn emit_event(&self, event: ChangeEvent) {
        let _ = self.feed_tx.send(event);
    }

    fn emit_row_event(&self, table: Table, kind: ChangeKind, row: &CloudRecord) {
        let value = serde_json::to_value(row).unwrap_or(Value::Null);
        let _ = self.feed_tx.send(ChangeEvent {
            table,
            kind,
            new: Some(value),
            old: None,
        });
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteStore for MemoryRemote {
    fn fetch_all(&self, tenant: &str, table: Table) -> RemoteFuture<'_, Vec<CloudRecord>> {
        let tenant = tenant.to_string();
        Box::pin(async move {
            self.take_failure("fetch_all")?;
            Ok(self
                .rows
                .read()
                .await
                .get(&(tenant, table))
                .map(|t| t.values().cloned().collect())
                .unwrap_or_default())
        })
    }

    fn fetch_metadata(&self, tenant: &str, table: Table) -> RemoteFuture<'_, Vec<CloudMeta>> {
        let tenant = tenant.to_string();
        Box::pin(async move {
            self.take_failure("fetch_metadata")?;
            Ok(self
                .rows
                .read()
                .await
                .get(&(tenant, table))
                .map(|t| t.values().map(CloudRecord::meta).collect())
                .unwrap_or_default())
        })
    }

    fn fetch_by_ids(
        &self,
        tenant: &str,
        table: Table,
        ids: Vec<String>,
    ) -> RemoteFuture<'_, Vec<CloudRecord>> {
        let tenant = tenant.to_string();
        Box::pin(async move {
            self.take_failure("fetch_by_ids")?;
            let rows = self.rows.read().await;
            let Some(entries) = rows.get(&(tenant, table)) else {
                return Ok(Vec::new());
            };
            Ok(ids
                .iter()
                .filter_map(|id| entries.get(id).cloned())
                .collect())
        })
    }

    fn latest_updated_at(&self, tenant: &str, table: Table) -> RemoteFuture<'_, Option<String>> {
        let tenant = tenant.to_string();
        Box::pin(async move {
            self.take_failure("latest_updated_at")?;
            Ok(self
                .rows
                .read()
                .await
                .get(&(tenant, table))
                .and_then(|t| t.values().map(|r| r.updated_at.clone()).max()))
        })
    }

    fn upsert(
        &self,
        tenant: &str,
        table: Table,
        mut incoming: Vec<CloudRecord>,
    ) -> RemoteFuture<'_, usize> {
        let tenant = tenant.to_string();
        Box::pin(async move {
            self.take_failure("upsert")?;
            let count = incoming.len();
            let mut rows = self.rows.write().await;
            let entries = rows.entry((tenant.clone(), table)).or_default();
            for row in incoming.iter_mut() {
                // Upserts always resurrect.
                row.deleted_at = None;
                row.tenant_id = tenant.clone();
                let kind = if entries.contains_key(&row.id) {
                    ChangeKind::Update
                } else {
                    ChangeKind::Insert
                };
                entries.insert(row.id.clone(), row.clone());
                self.emit_row_event(table, kind, row);
            }
            debug!(table = %table, count, "MemoryRemote: upserted rows");
            Ok(count)
        })
    }

    fn mark_deleted(
        &self,
        tenant: &str,
        table: Table,
        ids: Vec<String>,
        deleted_at: String,
    ) -> RemoteFuture<'_, usize> {
        let tenant = tenant.to_string();
        Box::pin(async move {
            self.take_failure("mark_deleted")?;
            let mut rows = self.rows.write().await;
            let Some(entries) = rows.get_mut(&(tenant, table)) else {
                return Ok(0);
            };
            let mut marked = 0;
            for id in ids {
                if let Some(row) = entries.get_mut(&id) {
                    row.deleted_at = Some(deleted_at.clone());
                    row.updated_at = deleted_at.clone();
                    marked += 1;
                    let row = row.clone();
                    self.emit_row_event(table, ChangeKind::Update, &row);
                }
            }
            Ok(marked)
        })
    }

    fn fetch_settings(&self, tenant: &str) -> RemoteFuture<'_, Option<CloudSettings>> {
        let tenant = tenant.to_string();
        Box::pin(async move {
            self.take_failure("fetch_settings")?;
            Ok(self.settings.read().await.get(&tenant).cloned())
        })
    }

    fn upsert_settings(
        &self,
        tenant: &str,
        payload: Value,
        updated_at: String,
    ) -> RemoteFuture<'_, ()> {
        let tenant = tenant.to_string();
        Box::pin(async move {
            self.take_failure("upsert_settings")?;
            self.settings.write().await.insert(
                tenant,
                CloudSettings {
                    payload,
                    updated_at,
                },
            );
            Ok(())
        })
    }

    fn subscribe(&self, _tenant: &str) -> RemoteFuture<'_, Subscription> {
        Box::pin(async move {
            if self.hang_subscribe.swap(false, Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            self.take_failure("subscribe")?;
            let mut feed_rx = self.feed_tx.subscribe();
            let (tx, rx) = mpsc::channel(FEED_CAPACITY);
            tokio::spawn(async move {
                while let Ok(event) = feed_rx.recv().await {
                    if tx.send(event).await.is_err() {
                        break; // Subscriber dropped.
                    }
                }
            });
            Ok(Subscription { events: rx })
        })
    }
}
