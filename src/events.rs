//! Typed sync events for UI collaborators.
//!
//! The engine exposes an explicit observer channel instead of an ambient
//! event bus: collaborators call [`SyncNotifier::subscribe`] and receive
//! [`SyncEvent`]s over a tokio broadcast channel.
//!
//! Event discipline (user-visible behavior):
//! - one `SyncCompleted` per reconciliation run, with upload/download/delete
//!   counts and failed-table lists;
//! - the very first sync (zero watermark) carries a distinct flag;
//! - routine no-op background runs emit nothing;
//! - a queue entry abandoned after its retry budget always emits
//!   `QueueOperationDropped` - never silently swallowed.

use crate::coordinator::SyncState;
use crate::model::Table;
use tokio::sync::broadcast;

/// Capacity of the broadcast channel. Slow subscribers that fall further
/// behind than this lose oldest events (broadcast semantics).
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Summary of one reconciliation run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncSummary {
    /// Records pushed to the cloud.
    pub uploaded: usize,
    /// Records pulled into the local store.
    pub downloaded: usize,
    /// Local records removed by remote tombstones.
    pub deleted_local: usize,
    /// Total per-table errors encountered.
    pub errors: usize,
    /// Primary content tables that failed this run.
    pub failed_primary: Vec<Table>,
    /// Secondary tables that failed this run.
    pub failed_secondary: Vec<Table>,
    /// True when this run started from a zero watermark.
    pub first_sync: bool,
}

impl SyncSummary {
    /// True when the run moved no data and hit no errors - such runs stay
    /// silent unless they are the first sync.
    pub fn is_noop(&self) -> bool {
        self.uploaded == 0
            && self.downloaded == 0
            && self.deleted_local == 0
            && self.errors == 0
    }

    /// Whether this summary should be surfaced to the user.
    pub fn is_notable(&self) -> bool {
        self.first_sync || !self.is_noop()
    }
}

/// Events emitted by the engine.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// The coordinator changed lifecycle state.
    StateChanged(SyncState),

    /// A reconciliation run completed (only notable runs are emitted).
    SyncCompleted(SyncSummary),

    /// A queued mutation was dropped after exhausting its retry budget.
    ///
    /// User-visible warning: the local edit exists but never reached the
    /// cloud and will not be retried.
    QueueOperationDropped {
        table: Table,
        record_id: String,
        retries: u32,
    },
}

/// Broadcast hub for [`SyncEvent`]s.
#[derive(Clone)]
pub struct SyncNotifier {
    tx: broadcast::Sender<SyncEvent>,
}

impl SyncNotifier {
    /// Create a new notifier.
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Subscribe to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    /// Emit an event. A send with no live subscribers is not an error.
    pub fn emit(&self, event: SyncEvent) {
        let _ = self.tx.send(event);
    }

    /// Number of live subscribers (for diagnostics).
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for SyncNotifier {
    fn default() -> Self {
        Self::new()
    }
}
