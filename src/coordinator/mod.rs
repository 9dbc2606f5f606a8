// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync coordinator.
//!
//! The lifecycle owner tying the engine together:
//! - opens the change-feed subscription (bounded timeout) and spawns the
//!   realtime feed task;
//! - runs the local change listener for the coordinator's whole lifetime,
//!   so offline mutations keep flowing into the queue even while
//!   disconnected;
//! - kicks off reconciliation asynchronously on connect - connecting never
//!   blocks on a full sync;
//! - reacts to network transitions: offline routes writes to the queue,
//!   online triggers a debounced reconnect followed by a queue flush;
//! - re-validates channel health on foreground transitions, tearing down
//!   and reconnecting when the channel went stale, then running a
//!   lightweight reconciliation pass.
//!
//! The coordinator is an explicit instance with clear init/teardown
//! (`connect`/`disconnect`/`shutdown`) rather than a process-wide
//! singleton, so tests can build as many isolated instances as they need.

mod types;

pub use types::SyncState;

use crate::cache::ViewCache;
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::events::{SyncEvent, SyncNotifier, SyncSummary};
use crate::listener::{run_listener, LocalMutation};
use crate::metrics;
use crate::model::{EntityPayload, LocalRecord};
use crate::ops::SyncOps;
use crate::queue::{open_pool, OfflineQueue, PendingOpKind};
use crate::realtime::{run_feed, RemoteChangeHandler, SelfChangeMarkers};
use crate::reconcile::ReconcileManager;
use crate::remote::RemoteStore;
use crate::resilience::Debouncer;
use crate::store::LocalStore;
use crate::watermark::WatermarkStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the local mutation channel.
const MUTATION_CHANNEL_CAPACITY: usize = 256;

/// How long disconnect waits for session tasks to wind down.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// The sync coordinator.
///
/// Owns the engine's moving parts and the `Disconnected → Connecting →
/// Connected → (Error | Disconnected)` state machine. All methods take
/// `&self`; the coordinator is designed to live in an `Arc`.
pub struct SyncCoordinator<L: LocalStore, C: ViewCache, R: RemoteStore> {
    config: SyncConfig,

    state_tx: watch::Sender<SyncState>,
    state_rx: watch::Receiver<SyncState>,

    store: Arc<L>,
    cache: Arc<C>,
    ops: Arc<SyncOps<R>>,
    queue: Arc<OfflineQueue>,
    watermark: Arc<WatermarkStore>,
    markers: Arc<SelfChangeMarkers>,
    notifier: SyncNotifier,
    reconciler: Arc<ReconcileManager<L, C, R>>,

    /// Network state observed by the listener: `true` = push directly,
    /// `false` = park in the queue.
    online_tx: watch::Sender<bool>,

    /// Sender handed to the app's local store hook.
    mutation_tx: mpsc::Sender<LocalMutation>,

    /// Debounces the offline → online reconnect.
    debouncer: Debouncer,

    /// Set false by the feed task when the subscription dies.
    channel_healthy: Arc<AtomicBool>,

    /// Per-session shutdown signal (created on each connect).
    session_shutdown: Mutex<Option<watch::Sender<bool>>>,
    session_handles: Mutex<Vec<JoinHandle<()>>>,

    /// Coordinator-lifetime shutdown (stops the listener task).
    engine_shutdown_tx: watch::Sender<bool>,
    listener_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<L: LocalStore, C: ViewCache, R: RemoteStore> SyncCoordinator<L, C, R> {
    /// Build a coordinator over the app's collaborators.
    ///
    /// Opens the durable queue and watermark (shared SQLite substrate) and
    /// starts the local change listener. The coordinator starts
    /// `Disconnected`; call [`connect()`](Self::connect) to go live.
    pub async fn new(
        config: SyncConfig,
        store: Arc<L>,
        cache: Arc<C>,
        remote: Arc<R>,
    ) -> Result<Self> {
        if config.tenant_id.is_empty() {
            return Err(SyncError::Config("tenant_id must not be empty".to_string()));
        }

        let pool = open_pool(&config.storage).await?;
        let queue = Arc::new(
            OfflineQueue::with_pool(pool.clone(), config.settings.queue.max_retries).await?,
        );
        let watermark = Arc::new(WatermarkStore::with_pool(pool).await?);

        let ops = Arc::new(SyncOps::new(
            remote,
            config.tenant_id.clone(),
            config.settings.reconcile.clone(),
        ));
        let markers = Arc::new(SelfChangeMarkers::new(
            config.settings.realtime.suppression_ttl_duration(),
        ));
        let notifier = SyncNotifier::new();
        let reconciler = Arc::new(ReconcileManager::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            Arc::clone(&ops),
            Arc::clone(&watermark),
            notifier.clone(),
        ));

        let (state_tx, state_rx) = watch::channel(SyncState::Disconnected);
        let (online_tx, online_rx) = watch::channel(true);
        let (engine_shutdown_tx, engine_shutdown_rx) = watch::channel(false);
        let (mutation_tx, mutation_rx) = mpsc::channel(MUTATION_CHANNEL_CAPACITY);

        // The listener outlives connect/disconnect cycles: mutations made
        // while disconnected still have to reach the queue.
        let listener_handle = tokio::spawn(run_listener(
            mutation_rx,
            Arc::clone(&ops),
            Arc::clone(&queue),
            Arc::clone(&markers),
            online_rx,
            engine_shutdown_rx,
        ));

        let debouncer = Debouncer::new(config.settings.realtime.reconnect_debounce_duration());

        info!(
            tenant_id = %config.tenant_id,
            device_id = %config.device_id,
            "Sync coordinator created"
        );

        Ok(Self {
            config,
            state_tx,
            state_rx,
            store,
            cache,
            ops,
            queue,
            watermark,
            markers,
            notifier,
            reconciler,
            online_tx,
            mutation_tx,
            debouncer,
            channel_healthy: Arc::new(AtomicBool::new(false)),
            session_shutdown: Mutex::new(None),
            session_handles: Mutex::new(Vec::new()),
            engine_shutdown_tx,
            listener_handle: Mutex::new(Some(listener_handle)),
        })
    }

    /// Current coordinator state.
    pub fn state(&self) -> SyncState {
        *self.state_rx.borrow()
    }

    /// Watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<SyncState> {
        self.state_rx.clone()
    }

    /// Whether the device is currently treated as online.
    pub fn is_online(&self) -> bool {
        *self.online_tx.borrow()
    }

    /// The sender the app's local store hook pushes mutations into.
    pub fn mutation_sender(&self) -> mpsc::Sender<LocalMutation> {
        self.mutation_tx.clone()
    }

    /// Subscribe to engine events.
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<SyncEvent> {
        self.notifier.subscribe()
    }

    /// The offline queue (for depth inspection).
    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    fn set_state(&self, state: SyncState) {
        let _ = self.state_tx.send(state);
        metrics::set_sync_state(&state.to_string());
        self.notifier.emit(SyncEvent::StateChanged(state));
    }

    /// Connect: open the change-feed subscription (bounded timeout), wire
    /// the realtime task, and kick off queue flush + reconciliation in the
    /// background.
    pub async fn connect(&self) -> Result<()> {
        let current = self.state();
        if !matches!(current, SyncState::Disconnected | SyncState::Error) {
            return Err(SyncError::InvalidState {
                expected: "Disconnected or Error".to_string(),
                actual: current.to_string(),
            });
        }

        info!(tenant_id = %self.config.tenant_id, "Connecting");
        self.set_state(SyncState::Connecting);

        if self.config.settings.realtime.enabled {
            let subscribe_timeout = self.config.settings.realtime.subscribe_timeout_duration();
            let subscription = match tokio::time::timeout(
                subscribe_timeout,
                self.ops.remote().subscribe(&self.config.tenant_id),
            )
            .await
            {
                Ok(Ok(subscription)) => subscription,
                Ok(Err(e)) => {
                    warn!(error = %e, "Change-feed subscription failed");
                    self.set_state(SyncState::Error);
                    return Err(e);
                }
                Err(_) => {
                    warn!(
                        timeout_ms = subscribe_timeout.as_millis() as u64,
                        "Change-feed subscription timed out"
                    );
                    self.set_state(SyncState::Error);
                    return Err(SyncError::SubscribeTimeout);
                }
            };

            self.channel_healthy.store(true, Ordering::SeqCst);

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let handler = Arc::new(RemoteChangeHandler::new(
                Arc::clone(&self.store),
                Arc::clone(&self.cache),
                Arc::clone(&self.markers),
            ));
            let handle = tokio::spawn(run_feed(
                subscription,
                handler,
                shutdown_rx,
                Arc::clone(&self.channel_healthy),
            ));

            *self.session_shutdown.lock().await = Some(shutdown_tx);
            self.session_handles.lock().await.push(handle);
        }

        let _ = self.online_tx.send(true);
        self.set_state(SyncState::Connected);

        // Flush the queue first so queued deletes land their tombstones
        // before reconciliation diffs the table, then reconcile. Neither
        // blocks the connect.
        let reconciler = Arc::clone(&self.reconciler);
        let queue = Arc::clone(&self.queue);
        let ops = Arc::clone(&self.ops);
        let notifier = self.notifier.clone();
        let handle = tokio::spawn(async move {
            flush_queue(&queue, &ops, &notifier).await;
            if let Err(e) = reconciler.run().await {
                warn!(error = %e, "Post-connect reconciliation failed");
            }
        });
        self.session_handles.lock().await.push(handle);

        info!("Connected");
        Ok(())
    }

    /// Disconnect: stop the realtime task, clear self-change markers, and
    /// drop to `Disconnected`.
    ///
    /// Safe mid-sync: an in-flight reconciliation is not force-aborted;
    /// it finishes against the (idempotent) remote and its session handle
    /// is simply left to wind down.
    pub async fn disconnect(&self) {
        info!("Disconnecting");

        if let Some(shutdown_tx) = self.session_shutdown.lock().await.take() {
            let _ = shutdown_tx.send(true);
        }

        let handles: Vec<_> = std::mem::take(&mut *self.session_handles.lock().await);
        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "Session task completed"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Session task panicked"),
                Err(_) => warn!(task = i + 1, "Session task still winding down, detaching"),
            }
        }

        self.markers.clear();
        self.channel_healthy.store(false, Ordering::SeqCst);
        let _ = self.online_tx.send(false);
        self.set_state(SyncState::Disconnected);
        info!("Disconnected");
    }

    /// Report a network transition.
    ///
    /// Offline routes subsequent writes into the queue immediately (and
    /// cancels any pending reconnect). Online schedules a debounced
    /// reconnect - flapping connectivity collapses into one attempt - whose
    /// post-connect task flushes the queue.
    pub async fn set_online(self: &Arc<Self>, online: bool) {
        let was_online = self.is_online();
        let _ = self.online_tx.send(online);

        if !online {
            info!("Network offline; mutations route to the offline queue");
            self.debouncer.cancel().await;
            return;
        }

        if was_online
            && self.state() == SyncState::Connected
            && self.channel_healthy.load(Ordering::SeqCst)
        {
            debug!("Already online and healthy");
            return;
        }

        info!("Network online; scheduling debounced reconnect");
        let coordinator = Arc::clone(self);
        self.debouncer
            .call(move || async move {
                coordinator.reconnect().await;
            })
            .await;
    }

    /// Foreground transition: re-validate channel health, reconnect if the
    /// channel went stale, then run a lightweight reconciliation pass.
    pub async fn handle_foreground(&self) {
        if self.state() != SyncState::Connected {
            debug!(state = %self.state(), "Foregrounded while not connected, ignoring");
            return;
        }

        if !self.channel_healthy.load(Ordering::SeqCst) {
            warn!("Foreground check found a stale channel; reconnecting");
            self.disconnect().await;
            if let Err(e) = self.connect().await {
                warn!(error = %e, "Foreground reconnect failed");
                return;
            }
            // connect() already kicked off a full pass.
            return;
        }

        let reconciler = Arc::clone(&self.reconciler);
        let handle = tokio::spawn(async move {
            if let Err(e) = reconciler.run_light().await {
                warn!(error = %e, "Foreground reconciliation failed");
            }
        });
        self.session_handles.lock().await.push(handle);
    }

    /// Manually trigger a full reconciliation pass and wait for it.
    pub async fn reconcile_now(&self) -> Result<SyncSummary> {
        self.reconciler.run().await
    }

    /// Drain the offline queue now (normally done after reconnect).
    pub async fn flush_queue(&self) {
        flush_queue(&self.queue, &self.ops, &self.notifier).await;
    }

    /// Full teardown: disconnect, stop the listener, close storage.
    pub async fn shutdown(&self) {
        self.disconnect().await;
        self.debouncer.cancel().await;

        let _ = self.engine_shutdown_tx.send(true);
        if let Some(handle) = self.listener_handle.lock().await.take() {
            if tokio::time::timeout(DRAIN_TIMEOUT, handle).await.is_err() {
                warn!("Listener task did not stop in time");
            }
        }

        self.queue.close().await;
        self.watermark.close().await;
        info!("Sync coordinator shut down");
    }

    async fn reconnect(&self) {
        if matches!(self.state(), SyncState::Connected | SyncState::Connecting) {
            self.disconnect().await;
        }
        if let Err(e) = self.connect().await {
            warn!(error = %e, "Reconnect failed");
        }
    }
}

/// Drain the offline queue through the sync operations.
///
/// Each pending upsert re-decodes its payload snapshot and uploads it; each
/// pending delete soft-deletes remotely. Drops past the retry budget are
/// surfaced as [`SyncEvent::QueueOperationDropped`].
async fn flush_queue<R: RemoteStore>(
    queue: &OfflineQueue,
    ops: &SyncOps<R>,
    notifier: &SyncNotifier,
) {
    let outcome = queue
        .process(|op| async move {
            match op.op {
                PendingOpKind::Upsert => {
                    let payload = op.payload.ok_or_else(|| {
                        SyncError::Internal(format!("queued upsert '{}' has no payload", op.id))
                    })?;
                    let entity = EntityPayload::from_value(op.table, payload)?;
                    ops.upsert_records(op.table, &[LocalRecord::new(entity)])
                        .await?;
                    Ok(())
                }
                PendingOpKind::Delete => {
                    ops.mark_deleted(op.table, &[op.record_id.clone()]).await?;
                    Ok(())
                }
            }
        })
        .await;

    match outcome {
        Ok(Some(report)) => {
            for dropped in report.dropped {
                notifier.emit(SyncEvent::QueueOperationDropped {
                    table: dropped.table,
                    record_id: dropped.record_id.clone(),
                    retries: dropped.retry_count,
                });
            }
        }
        Ok(None) => debug!("Queue drain already in progress"),
        Err(e) => warn!(error = %e, "Queue drain failed"),
    }
}
