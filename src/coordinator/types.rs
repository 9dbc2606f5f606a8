//! Coordinator state types.
//!
//! Defines the state machine for the sync coordinator lifecycle.
//!
//! # State Transitions
//!
//! ```text
//!                connect()
//! Disconnected ────────────────→ Connecting
//!       ↑                            │
//!       │ disconnect()               │ (subscription open)
//!       │                            ↓
//!       └──────────────────────── Connected
//!       ↑                            │
//!       │                            │ (subscribe timeout /
//!       │        connect()           │  channel failure)
//!       └──────── Error ←────────────┘
//! ```
//!
//! # State Descriptions
//!
//! - **Disconnected**: No subscription. Local mutations route to the
//!   offline queue.
//! - **Connecting**: `connect()` called, opening the change-feed
//!   subscription under its bounded timeout.
//! - **Connected**: Feed live, listeners wired, reconciliation kicked off.
//! - **Error**: Connect failed or the channel died. `connect()` again to
//!   retry.

/// State of the sync coordinator.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No connection to the cloud. Offline path only.
    Disconnected,

    /// Opening the change-feed subscription.
    ///
    /// Transitions to `Connected` when the subscription opens, or `Error`
    /// if it fails or times out.
    Connecting,

    /// Normal operation: realtime feed live, reconciliation running.
    Connected,

    /// Connect failed or the live channel broke.
    ///
    /// Recoverable: a later `connect()` retries from here.
    Error,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncState::Disconnected => write!(f, "Disconnected"),
            SyncState::Connecting => write!(f, "Connecting"),
            SyncState::Connected => write!(f, "Connected"),
            SyncState::Error => write!(f, "Error"),
        }
    }
}
