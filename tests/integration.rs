// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integration tests for the sync engine.
//!
//! Run against the in-memory remote (full collaborator contract including
//! the change feed), so no external services are required.
//!
//! # Test Organization
//! - `lifecycle_*` - coordinator connect/offline/reconnect flows
//! - `devices_*` - multi-device convergence through the shared remote
//! - `reconcile_*` - end-to-end diff-and-merge behavior
//! - `events_*` - user-visible event discipline

mod common;

use brew_sync::model::Table;
use brew_sync::{
    LocalMutation, LocalStore, MemoryRemote, MemoryStore, MemoryViewCache, SyncConfig,
    SyncCoordinator, SyncEvent, SyncState,
};
use common::{bean_record, cloud_bean, methods_record, note_record, tombstone};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

type Coordinator = SyncCoordinator<MemoryStore, MemoryViewCache, MemoryRemote>;

struct Device {
    store: Arc<MemoryStore>,
    cache: Arc<MemoryViewCache>,
    coordinator: Arc<Coordinator>,
}

/// Build a device (own local store, cache, and durable storage) against a
/// shared remote.
async fn device(remote: &Arc<MemoryRemote>, dir: &TempDir, name: &str) -> Device {
    let mut config = SyncConfig {
        tenant_id: "t1".to_string(),
        device_id: name.to_string(),
        ..Default::default()
    };
    config.storage.sqlite_path = dir
        .path()
        .join(format!("{}.db", name))
        .to_string_lossy()
        .to_string();
    config.settings.realtime.reconnect_debounce = "30ms".to_string();

    let store = Arc::new(MemoryStore::new());
    let cache = Arc::new(MemoryViewCache::new());
    let coordinator = Arc::new(
        SyncCoordinator::new(
            config,
            Arc::clone(&store),
            Arc::clone(&cache),
            Arc::clone(remote),
        )
        .await
        .unwrap(),
    );
    Device {
        store,
        cache,
        coordinator,
    }
}

/// Poll a condition until it holds or the deadline passes.
async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..300 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within deadline");
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn lifecycle_offline_edits_converge_on_reconnect() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(MemoryRemote::new());
    let d = device(&remote, &dir, "phone").await;

    // Start offline: edits park in the durable queue.
    d.coordinator.set_online(false).await;
    d.store
        .put(Table::Beans, bean_record("b1", 100))
        .await
        .unwrap();
    d.coordinator
        .mutation_sender()
        .send(LocalMutation::Upsert {
            record: bean_record("b1", 100),
        })
        .await
        .unwrap();

    eventually(|| async { d.coordinator.queue().len().await.unwrap() == 1 }).await;
    assert!(remote.row("t1", Table::Beans, "b1").await.is_none());

    // Going online reconnects (debounced), flushes the queue, reconciles.
    d.coordinator.set_online(true).await;

    eventually(|| async { remote.row("t1", Table::Beans, "b1").await.is_some() }).await;
    eventually(|| async { d.coordinator.queue().is_empty().await.unwrap() }).await;
    assert_eq!(d.coordinator.state(), SyncState::Connected);

    d.coordinator.shutdown().await;
}

#[tokio::test]
async fn lifecycle_disconnect_mid_sync_is_safe() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(MemoryRemote::new());
    for i in 0..80 {
        remote
            .seed_row("t1", Table::Beans, cloud_bean(&format!("b{}", i), 100 + i))
            .await;
    }
    let d = device(&remote, &dir, "phone").await;

    // Disconnect immediately after connect, while the kicked-off initial
    // reconciliation may still be in flight.
    d.coordinator.connect().await.unwrap();
    d.coordinator.disconnect().await;
    assert_eq!(d.coordinator.state(), SyncState::Disconnected);

    // Reconnecting afterwards converges normally.
    d.coordinator.connect().await.unwrap();
    eventually(|| async { d.store.len(Table::Beans).await == 80 }).await;

    d.coordinator.shutdown().await;
}

// =============================================================================
// Multi-device convergence
// =============================================================================

#[tokio::test]
async fn devices_converge_via_realtime_feed() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(MemoryRemote::new());
    let a = device(&remote, &dir, "phone-a").await;
    let b = device(&remote, &dir, "phone-b").await;

    a.coordinator.connect().await.unwrap();
    b.coordinator.connect().await.unwrap();

    // Device A creates a bean; B receives it over the feed.
    let record = bean_record("shared", 100);
    a.store.put(Table::Beans, record.clone()).await.unwrap();
    a.coordinator
        .mutation_sender()
        .send(LocalMutation::Upsert { record })
        .await
        .unwrap();

    eventually(|| async { b.store.get(Table::Beans, "shared").await.unwrap().is_some() }).await;
    // B's view cache was updated synchronously with the accepted write.
    assert!(b.cache.get(Table::Beans, "shared").is_some());

    // A's own echo was suppressed: its local copy is untouched (still the
    // exact record it wrote, not a round-tripped cloud version).
    let local_a = a.store.get(Table::Beans, "shared").await.unwrap().unwrap();
    assert_eq!(local_a.timestamp(), 100);

    a.coordinator.shutdown().await;
    b.coordinator.shutdown().await;
}

#[tokio::test]
async fn devices_last_write_wins_on_conflict() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(MemoryRemote::new());
    let a = device(&remote, &dir, "phone-a").await;
    let b = device(&remote, &dir, "phone-b").await;

    a.coordinator.connect().await.unwrap();
    b.coordinator.connect().await.unwrap();

    // Both devices edit the same bean; B's edit is later. Wait for A's
    // push to land before B pushes, so the upsert order is deterministic.
    a.store
        .put(Table::Beans, bean_record("contested", 500))
        .await
        .unwrap();
    a.coordinator
        .mutation_sender()
        .send(LocalMutation::Upsert {
            record: bean_record("contested", 500),
        })
        .await
        .unwrap();
    eventually(|| async { remote.row("t1", Table::Beans, "contested").await.is_some() }).await;

    b.store
        .put(Table::Beans, bean_record("contested", 800))
        .await
        .unwrap();
    b.coordinator
        .mutation_sender()
        .send(LocalMutation::Upsert {
            record: bean_record("contested", 800),
        })
        .await
        .unwrap();

    // The cloud converges on the later write.
    eventually(|| async {
        remote
            .row("t1", Table::Beans, "contested")
            .await
            .map(|r| r.updated_at_ms() == 800)
            .unwrap_or(false)
    })
    .await;

    // Device A sees B's newer version; its own older edit lost.
    eventually(|| async {
        a.store
            .get(Table::Beans, "contested")
            .await
            .unwrap()
            .map(|r| r.timestamp() == 800)
            .unwrap_or(false)
    })
    .await;

    a.coordinator.shutdown().await;
    b.coordinator.shutdown().await;
}

#[tokio::test]
async fn devices_delete_propagates_as_tombstone() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(MemoryRemote::new());
    let a = device(&remote, &dir, "phone-a").await;
    let b = device(&remote, &dir, "phone-b").await;

    // Seed the record everywhere.
    remote.seed_row("t1", Table::Beans, cloud_bean("doomed", 100)).await;
    a.coordinator.connect().await.unwrap();
    b.coordinator.connect().await.unwrap();
    eventually(|| async { a.store.get(Table::Beans, "doomed").await.unwrap().is_some() }).await;
    eventually(|| async { b.store.get(Table::Beans, "doomed").await.unwrap().is_some() }).await;

    // A deletes; B receives the tombstone-bearing update.
    a.store.delete(Table::Beans, "doomed").await.unwrap();
    a.coordinator
        .mutation_sender()
        .send(LocalMutation::Delete {
            table: Table::Beans,
            record_id: "doomed".to_string(),
        })
        .await
        .unwrap();

    eventually(|| async { b.store.get(Table::Beans, "doomed").await.unwrap().is_none() }).await;

    // The cloud row still exists, tombstoned - never hard-deleted.
    let row = remote.row("t1", Table::Beans, "doomed").await.unwrap();
    assert!(row.is_tombstoned());

    a.coordinator.shutdown().await;
    b.coordinator.shutdown().await;
}

// =============================================================================
// Reconciliation
// =============================================================================

#[tokio::test]
async fn reconcile_mixed_state_converges() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(MemoryRemote::new());
    let d = device(&remote, &dir, "phone").await;

    // Local-only (below any watermark), a stale local copy, a newer local
    // copy, a tombstone to honor, and a tombstone to resurrect.
    d.store.put(Table::Beans, bean_record("only-local", 50)).await.unwrap();
    d.store.put(Table::Beans, bean_record("newer-remote", 300)).await.unwrap();
    d.store.put(Table::Beans, bean_record("newer-local", 800)).await.unwrap();
    d.store.put(Table::Beans, bean_record("deleted-remotely", 400)).await.unwrap();
    d.store.put(Table::Beans, bean_record("resurrected", 900)).await.unwrap();

    remote.seed_row("t1", Table::Beans, cloud_bean("newer-remote", 700)).await;
    remote.seed_row("t1", Table::Beans, cloud_bean("newer-local", 600)).await;
    remote.seed_row("t1", Table::Beans, cloud_bean("only-remote", 200)).await;
    remote.seed_row("t1", Table::Beans, tombstone("deleted-remotely", 500)).await;
    remote.seed_row("t1", Table::Beans, tombstone("resurrected", 500)).await;
    remote.seed_row("t1", Table::Beans, tombstone("never-seen", 100)).await;

    let summary = d.coordinator.reconcile_now().await.unwrap();

    // only-local, newer-local, resurrected
    assert_eq!(summary.uploaded, 3);
    // newer-remote, only-remote
    assert_eq!(summary.downloaded, 2);
    // deleted-remotely
    assert_eq!(summary.deleted_local, 1);
    assert_eq!(summary.errors, 0);

    assert!(d.store.get(Table::Beans, "deleted-remotely").await.unwrap().is_none());
    assert!(d.store.get(Table::Beans, "never-seen").await.unwrap().is_none());
    assert_eq!(
        d.store.get(Table::Beans, "newer-remote").await.unwrap().unwrap().timestamp(),
        700
    );
    assert!(!remote.row("t1", Table::Beans, "resurrected").await.unwrap().is_tombstoned());
    assert_eq!(
        remote.row("t1", Table::Beans, "newer-local").await.unwrap().updated_at_ms(),
        800
    );

    // A second pass is a fixed point.
    let again = d.coordinator.reconcile_now().await.unwrap();
    assert!(again.is_noop());

    d.coordinator.shutdown().await;
}

#[tokio::test]
async fn reconcile_note_edit_time_beats_creation_time() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(MemoryRemote::new());
    let d = device(&remote, &dir, "phone").await;

    // The local note was created first but edited later than the remote
    // copy; the edit time must win the comparison.
    d.store
        .put(Table::BrewNotes, note_record("n1", 100, Some(900)))
        .await
        .unwrap();
    let remote_note = {
        let mut row = cloud_bean("n1", 500);
        row.payload = serde_json::json!({
            "id": "n1",
            "timestamp": 500,
            "rating": 3.0,
        });
        row
    };
    remote.seed_row("t1", Table::BrewNotes, remote_note).await;

    let summary = d.coordinator.reconcile_now().await.unwrap();
    assert_eq!(summary.uploaded, 1);
    assert_eq!(summary.downloaded, 0);
    assert_eq!(
        remote.row("t1", Table::BrewNotes, "n1").await.unwrap().updated_at_ms(),
        900
    );

    d.coordinator.shutdown().await;
}

#[tokio::test]
async fn reconcile_grouped_methods_round_trip() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(MemoryRemote::new());
    let d = device(&remote, &dir, "phone").await;

    d.store
        .put(Table::Methods, methods_record("v60", 100))
        .await
        .unwrap();

    d.coordinator.reconcile_now().await.unwrap();

    // One cloud row per equipment, keyed by the equipment id.
    let row = remote.row("t1", Table::Methods, "v60").await.unwrap();
    assert_eq!(row.payload["equipmentId"], serde_json::json!("v60"));
    assert_eq!(row.payload["methods"][0]["name"], serde_json::json!("standard"));

    d.coordinator.shutdown().await;
}

// =============================================================================
// Events
// =============================================================================

#[tokio::test]
async fn events_first_sync_carries_distinct_flag() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(MemoryRemote::new());
    remote.seed_row("t1", Table::Beans, cloud_bean("b1", 100)).await;
    let d = device(&remote, &dir, "phone").await;

    let mut events = d.coordinator.subscribe_events();
    d.coordinator.reconcile_now().await.unwrap();

    let mut first_sync_seen = false;
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::SyncCompleted(summary) = event {
            assert!(summary.first_sync);
            assert_eq!(summary.downloaded, 1);
            first_sync_seen = true;
        }
    }
    assert!(first_sync_seen);

    // Later runs are routine; a no-op one stays silent.
    let mut events = d.coordinator.subscribe_events();
    d.coordinator.reconcile_now().await.unwrap();
    assert!(matches!(
        events.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Empty)
    ));

    d.coordinator.shutdown().await;
}

#[tokio::test]
async fn events_sync_summary_reports_partial_failures() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(MemoryRemote::new());
    let d = device(&remote, &dir, "phone").await;
    d.store.put(Table::Beans, bean_record("b1", 100)).await.unwrap();

    // Exactly one metadata scan fails; the other tables proceed.
    remote.fail_next_requests(1);
    let summary = d.coordinator.reconcile_now().await.unwrap();

    assert_eq!(summary.errors, 1);
    assert_eq!(
        summary.failed_primary.len() + summary.failed_secondary.len(),
        1
    );

    // The failed table retries on the next pass and converges.
    let summary = d.coordinator.reconcile_now().await.unwrap();
    assert_eq!(summary.errors, 0);
    assert!(remote.row("t1", Table::Beans, "b1").await.is_some());

    d.coordinator.shutdown().await;
}
