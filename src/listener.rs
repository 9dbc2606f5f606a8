//! Local change listener.
//!
//! Observes the app's local mutation events and routes each one outward:
//! straight through [`SyncOps`] while online, into the durable
//! [`OfflineQueue`] while offline or when the online push fails. Every
//! outbound mutation records a self-change marker first, so the realtime
//! feed's echo of our own write is discarded.

use crate::error::Result;
use crate::model::{LocalRecord, Table};
use crate::ops::SyncOps;
use crate::queue::{OfflineQueue, PendingOpKind};
use crate::realtime::SelfChangeMarkers;
use crate::remote::RemoteStore;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn, Instrument};

/// A mutation observed from the app's local store.
#[derive(Debug, Clone)]
pub enum LocalMutation {
    /// A record was created or updated locally.
    Upsert { record: LocalRecord },
    /// A record was deleted locally.
    Delete { table: Table, record_id: String },
}

impl LocalMutation {
    /// The affected table.
    pub fn table(&self) -> Table {
        match self {
            LocalMutation::Upsert { record } => record.payload.table(),
            LocalMutation::Delete { table, .. } => *table,
        }
    }

    /// The affected record id.
    pub fn record_id(&self) -> &str {
        match self {
            LocalMutation::Upsert { record } => &record.id,
            LocalMutation::Delete { record_id, .. } => record_id,
        }
    }
}

/// Where a mutation ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Pushed to the cloud directly.
    Pushed,
    /// Parked in the offline queue.
    Queued,
}

/// Route one mutation: push while online, queue otherwise.
///
/// A failed online push falls back to the queue rather than losing the
/// mutation; only a queue (storage) failure is an error.
pub async fn dispatch<R: RemoteStore>(
    mutation: LocalMutation,
    ops: &SyncOps<R>,
    queue: &OfflineQueue,
    markers: &SelfChangeMarkers,
    online: bool,
) -> Result<Route> {
    let table = mutation.table();
    let record_id = mutation.record_id().to_string();

    // Mark before the write leaves the device, so a fast echo still hits
    // an existing marker.
    markers.mark(table, &record_id);

    if online {
        let pushed = match &mutation {
            LocalMutation::Upsert { record } => {
                ops.upsert_records(table, std::slice::from_ref(record)).await
            }
            LocalMutation::Delete { .. } => {
                ops.mark_deleted(table, &[record_id.clone()]).await
            }
        };

        match pushed {
            Ok(_) => {
                debug!(table = %table, record_id = %record_id, "Pushed local mutation");
                return Ok(Route::Pushed);
            }
            Err(e) => {
                warn!(
                    table = %table,
                    record_id = %record_id,
                    error = %e,
                    "Online push failed, parking in offline queue"
                );
            }
        }
    }

    match &mutation {
        LocalMutation::Upsert { record } => {
            queue
                .enqueue(
                    table,
                    PendingOpKind::Upsert,
                    &record_id,
                    Some(record.payload.to_value()),
                )
                .await?;
        }
        LocalMutation::Delete { .. } => {
            queue
                .enqueue(table, PendingOpKind::Delete, &record_id, None)
                .await?;
        }
    }

    debug!(table = %table, record_id = %record_id, "Queued local mutation");
    Ok(Route::Queued)
}

/// Run the listener loop until shutdown or the mutation channel closes.
pub async fn run_listener<R: RemoteStore>(
    mut mutations: mpsc::Receiver<LocalMutation>,
    ops: Arc<SyncOps<R>>,
    queue: Arc<OfflineQueue>,
    markers: Arc<SelfChangeMarkers>,
    online_rx: watch::Receiver<bool>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let span = tracing::info_span!("local_listener");

    async move {
        info!("Local change listener started");

        loop {
            tokio::select! {
                biased;

                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping listener");
                        break;
                    }
                }

                mutation = mutations.recv() => {
                    let Some(mutation) = mutation else {
                        debug!("Mutation channel closed, stopping listener");
                        break;
                    };
                    let online = *online_rx.borrow();
                    if let Err(e) =
                        dispatch(mutation, &ops, &queue, &markers, online).await
                    {
                        // Queue storage failure - the mutation is lost from
                        // the pipeline, but the record itself is still in
                        // the local store and will re-upload on the next
                        // reconciliation pass.
                        warn!(error = %e, "Failed to route local mutation");
                    }
                }
            }
        }

        info!("Local change listener stopped");
    }
    .instrument(span)
    .await
}
