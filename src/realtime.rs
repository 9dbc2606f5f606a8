// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Realtime path: self-change suppression and inbound change application.
//!
//! Every local write records a short-lived marker for its (table, id); an
//! inbound feed event matching an unexpired marker is our own change echoed
//! back and is discarded. Expired markers are pruned lazily on lookup.
//!
//! Inbound changes that survive suppression go through the conflict
//! resolver:
//! - deletes (explicit `Delete` events or rows carrying a tombstone) apply
//!   only when the remote mutation time is at least the local timestamp -
//!   a newer local edit is never deleted out from under the user;
//! - upserts require the full payload (metadata-only notifications are
//!   skipped), pass through payload migrations and the method-row
//!   translation, and are gated by `should_accept_remote_change`. Accepted
//!   writes hit the local store and the view cache synchronously.

use crate::cache::ViewCache;
use crate::error::Result;
use crate::metrics;
use crate::migrate::migrate_payload;
use crate::model::{CloudRecord, LocalRecord, Table};
use crate::remote::{ChangeEvent, ChangeKind, Subscription};
use crate::resolve::{extract_timestamp, should_accept_remote_change};
use crate::store::LocalStore;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn, Instrument};

// ═══════════════════════════════════════════════════════════════════════════════
// Self-change suppression
// ═══════════════════════════════════════════════════════════════════════════════

/// Short-lived markers recording this device's own writes.
///
/// `mark()` is called on every outbound local write; `is_suppressed()`
/// answers whether an inbound event is our own echo. All markers are
/// cleared on disconnect.
pub struct SelfChangeMarkers {
    ttl: Duration,
    inner: Mutex<HashMap<(Table, String), Instant>>,
}

impl SelfChangeMarkers {
    /// Create a marker set with the given suppression window.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Record a local write to (table, id). Refreshes any existing marker.
    pub fn mark(&self, table: Table, id: &str) {
        let mut inner = self.inner.lock().expect("marker lock poisoned");
        inner.insert((table, id.to_string()), Instant::now() + self.ttl);
    }

    /// Whether an inbound event for (table, id) falls inside an unexpired
    /// marker window. Prunes expired markers as a side effect.
    pub fn is_suppressed(&self, table: Table, id: &str) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("marker lock poisoned");
        inner.retain(|_, expiry| *expiry > now);
        inner.contains_key(&(table, id.to_string()))
    }

    /// Drop all markers (called on disconnect).
    pub fn clear(&self) {
        self.inner.lock().expect("marker lock poisoned").clear();
    }

    /// Number of live markers (expired ones may still be counted until the
    /// next lookup prunes them).
    pub fn len(&self) -> usize {
        self.inner.lock().expect("marker lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Remote change handler
// ═══════════════════════════════════════════════════════════════════════════════

/// What the handler did with an inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Upsert accepted and written locally.
    Applied,
    /// Delete accepted; local record removed.
    Deleted,
    /// Discarded as our own echo.
    Suppressed,
    /// Remote change lost to a newer local edit.
    Stale,
    /// Event unusable (no id, metadata-only payload, undecodable row).
    Skipped,
    /// Delete for a record we never had.
    NoOp,
}

impl Disposition {
    fn as_str(&self) -> &'static str {
        match self {
            Disposition::Applied => "applied",
            Disposition::Deleted => "applied",
            Disposition::Suppressed => "suppressed",
            Disposition::Stale => "stale",
            Disposition::Skipped => "skipped",
            Disposition::NoOp => "skipped",
        }
    }
}

/// Applies inbound change-feed events to the local store and view cache.
pub struct RemoteChangeHandler<L: LocalStore, C: ViewCache> {
    store: Arc<L>,
    cache: Arc<C>,
    markers: Arc<SelfChangeMarkers>,
}

impl<L: LocalStore, C: ViewCache> RemoteChangeHandler<L, C> {
    pub fn new(store: Arc<L>, cache: Arc<C>, markers: Arc<SelfChangeMarkers>) -> Self {
        Self {
            store,
            cache,
            markers,
        }
    }

    /// Apply one inbound event.
    pub async fn apply(&self, event: ChangeEvent) -> Result<Disposition> {
        let table = event.table;

        let Some(id) = event.record_id().map(str::to_string) else {
            warn!(table = %table, "Feed event without a record id, skipping");
            return Ok(Disposition::Skipped);
        };

        if self.markers.is_suppressed(table, &id) {
            debug!(table = %table, id = %id, "Suppressed own echo");
            return Ok(Disposition::Suppressed);
        }

        let new_row = event.new_row();
        let is_delete = event.kind == ChangeKind::Delete
            || new_row.as_ref().map(|r| r.is_tombstoned()).unwrap_or(false);

        if is_delete {
            return self.apply_delete(table, &id, &event, new_row.as_ref()).await;
        }

        // Upserts need the full payload; a metadata-only notification is
        // retried by the next reconciliation pass instead.
        let Some(mut row) = new_row else {
            debug!(table = %table, id = %id, "Metadata-only notification, skipping");
            return Ok(Disposition::Skipped);
        };
        if row.payload.is_null() {
            debug!(table = %table, id = %id, "Payload-less row, skipping");
            return Ok(Disposition::Skipped);
        }

        if table == Table::Methods {
            row.payload = translate_method_row(&row);
        }
        migrate_payload(table, &mut row.payload);

        let local = self.store.get(table, &id).await?;
        let local_ts = local.as_ref().map(|r| r.timestamp());
        let remote_ts = row.updated_at_ms();

        if !should_accept_remote_change(local_ts, remote_ts) {
            debug!(
                table = %table,
                id = %id,
                local_ts = local_ts.unwrap_or(0),
                remote_ts,
                "Remote change is not newer, keeping local"
            );
            return Ok(Disposition::Stale);
        }

        let record = match LocalRecord::from_cloud(table, &row) {
            Ok(record) => record,
            Err(e) => {
                warn!(table = %table, id = %id, error = %e, "Undecodable inbound row, skipping");
                return Ok(Disposition::Skipped);
            }
        };

        self.store.put(table, record.clone()).await?;
        self.cache.upsert(table, record);
        debug!(table = %table, id = %id, remote_ts, "Applied inbound upsert");
        Ok(Disposition::Applied)
    }

    async fn apply_delete(
        &self,
        table: Table,
        id: &str,
        event: &ChangeEvent,
        new_row: Option<&CloudRecord>,
    ) -> Result<Disposition> {
        let Some(local) = self.store.get(table, id).await? else {
            return Ok(Disposition::NoOp);
        };

        // Tombstone-bearing rows carry their own time; explicit Delete
        // events only have the old row to go by. Unknown times resolve to
        // zero, which keeps the local edit.
        let remote_ts = match new_row {
            Some(row) => row.tombstone_ms(),
            None => event
                .old
                .as_ref()
                .map(|old| {
                    let iso = old.get("updated_at").and_then(Value::as_str);
                    extract_timestamp(
                        old.get("payload").unwrap_or(old),
                        iso,
                    )
                })
                .unwrap_or(0),
        };

        if remote_ts >= local.timestamp() {
            self.store.delete(table, id).await?;
            self.cache.remove(table, id);
            debug!(table = %table, id = %id, remote_ts, "Applied inbound delete");
            Ok(Disposition::Deleted)
        } else {
            debug!(
                table = %table,
                id = %id,
                local_ts = local.timestamp(),
                remote_ts,
                "Delete is older than local edit, keeping local"
            );
            Ok(Disposition::Stale)
        }
    }
}

/// Translate the grouped method row into the local payload shape.
///
/// Method rows come keyed by their parent equipment: the row id *is* the
/// equipment id and older backends deliver the method list either bare or
/// without the `equipmentId`/`timestamp` fields. The local shape always
/// carries all three.
pub fn translate_method_row(row: &CloudRecord) -> Value {
    let mut payload = row.payload.clone();

    // Bare list - wrap it first.
    if payload.is_array() {
        payload = serde_json::json!({ "methods": payload });
    }

    if let Some(obj) = payload.as_object_mut() {
        if !obj.contains_key("equipmentId") {
            obj.insert("equipmentId".to_string(), Value::String(row.id.clone()));
        }
        if !obj.contains_key("timestamp") {
            obj.insert(
                "timestamp".to_string(),
                Value::from(row.updated_at_ms()),
            );
        }
        if !obj.contains_key("methods") {
            obj.insert("methods".to_string(), Value::Array(Vec::new()));
        }
    }

    payload
}

// ═══════════════════════════════════════════════════════════════════════════════
// Feed task
// ═══════════════════════════════════════════════════════════════════════════════

/// Run the realtime feed loop until shutdown or the feed closes.
///
/// A closed feed marks the channel unhealthy; the coordinator's foreground
/// check uses that to decide on a teardown/reconnect.
pub async fn run_feed<L: LocalStore, C: ViewCache>(
    mut subscription: Subscription,
    handler: Arc<RemoteChangeHandler<L, C>>,
    mut shutdown_rx: watch::Receiver<bool>,
    channel_healthy: Arc<AtomicBool>,
) {
    let span = tracing::info_span!("realtime_feed");

    async move {
        info!("Realtime feed task started");

        loop {
            tokio::select! {
                biased;

                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping feed task");
                        break;
                    }
                }

                event = subscription.events.recv() => {
                    match event {
                        Some(event) => {
                            let table = event.table;
                            match handler.apply(event).await {
                                Ok(disposition) => {
                                    metrics::record_realtime_event(
                                        table.as_str(),
                                        disposition.as_str(),
                                    );
                                }
                                Err(e) => {
                                    warn!(table = %table, error = %e, "Failed to apply feed event");
                                }
                            }
                        }
                        None => {
                            warn!("Change feed closed, marking channel unhealthy");
                            channel_healthy.store(false, Ordering::SeqCst);
                            break;
                        }
                    }
                }
            }
        }

        info!("Realtime feed task stopped");
    }
    .instrument(span)
    .await
}
