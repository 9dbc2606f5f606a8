//! # Brew Sync
//!
//! An offline-first, multi-device sync engine for the brew journal: keeps a
//! per-device local record store consistent with a single authoritative
//! cloud store across intermittent connectivity, concurrent edits from
//! multiple devices, and partial failures.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            SyncCoordinator                              │
//! │                                                                         │
//! │  local mutation ──► LocalChangeListener ──┬─► SyncOps ───► cloud store  │
//! │                                           │   (online)                  │
//! │                                           └─► OfflineQueue (offline,    │
//! │                                               durable, coalescing)      │
//! │                                                                         │
//! │  change feed ──► RemoteChangeHandler ──► ConflictResolver ──► local     │
//! │  (realtime)      (echo suppression)      (LWW, ties→local)    store +   │
//! │                                                               ViewCache │
//! │                                                                         │
//! │  ┌────────────────────┐          ┌──────────────────────────┐           │
//! │  │ ReconcileManager   │          │ WatermarkStore (SQLite)  │           │
//! │  │ (metadata-first    │◄────────►│ last_sync_time           │           │
//! │  │  diff-and-merge)   │          └──────────────────────────┘           │
//! │  └────────────────────┘                                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Two-Path Synchronization
//!
//! 1. **Realtime path**: the change-feed subscription applies inbound rows
//!    through the conflict resolver as they happen, with self-change echo
//!    suppression.
//! 2. **Reconciliation path**: a full bidirectional diff-and-merge at
//!    connect time and on demand, metadata-first to bound bandwidth. This
//!    catches everything the realtime path missed.
//!
//! Deletion is tombstone-based end to end: the cloud store never
//! hard-deletes a row, and a record edited after its tombstone is
//! resurrected rather than lost.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use brew_sync::{MemoryRemote, MemoryStore, MemoryViewCache, SyncConfig, SyncCoordinator};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> brew_sync::Result<()> {
//!     let config = SyncConfig {
//!         tenant_id: "tenant-1".into(),
//!         device_id: "phone-a".into(),
//!         ..Default::default()
//!     };
//!
//!     let coordinator = SyncCoordinator::new(
//!         config,
//!         Arc::new(MemoryStore::new()),
//!         Arc::new(MemoryViewCache::new()),
//!         Arc::new(MemoryRemote::new()),
//!     )
//!     .await?;
//!
//!     coordinator.connect().await?;
//!     // ... app runs; mutations flow through coordinator.mutation_sender()
//!     coordinator.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod listener;
pub mod metrics;
pub mod migrate;
pub mod model;
pub mod ops;
pub mod queue;
pub mod realtime;
pub mod reconcile;
pub mod remote;
pub mod resilience;
pub mod resolve;
pub mod store;
pub mod watermark;

// Re-exports for convenience
pub use cache::{MemoryViewCache, ViewCache};
pub use config::SyncConfig;
pub use coordinator::{SyncCoordinator, SyncState};
pub use error::{Result, SyncError};
pub use events::{SyncEvent, SyncNotifier, SyncSummary};
pub use listener::LocalMutation;
pub use model::{CloudRecord, EntityPayload, LocalRecord, Table};
pub use queue::{OfflineQueue, PendingOpKind, PendingOperation};
pub use remote::{ChangeEvent, ChangeKind, MemoryRemote, RemoteStore};
pub use resolve::{batch_resolve, ResolvePlan};
pub use store::{LocalStore, MemoryStore};
