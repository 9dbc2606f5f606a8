// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the sync engine.
//!
//! Errors are categorized by their source (remote backend, local SQLite,
//! malformed feed data, etc.) and include context to help with debugging.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Remote` | Yes | Backend request failed (network, 5xx, transient) |
//! | `Timeout` | Yes | A bounded remote call exceeded its deadline |
//! | `SubscribeTimeout` | Yes | Change-feed subscription did not open in time |
//! | `Storage` | No | Local SQLite errors (needs operator attention) |
//! | `Decode` | No | Payload failed to (de)serialize |
//! | `Protocol` | No | Malformed change-feed event / unknown table name |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Coordinator state machine violation |
//! | `Shutdown` | No | Engine is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Use [`SyncError::is_retryable()`] to determine if an operation should be
//! retried with backoff. Retryable errors indicate transient network or
//! availability issues. Non-retryable errors indicate bugs, configuration
//! problems, or corrupt data.

use thiserror::Error;

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors that can occur during synchronization.
///
/// Each variant includes context about where the error occurred.
/// Use [`is_retryable()`](Self::is_retryable) to check if the operation
/// should be retried.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Remote backend request failure.
    ///
    /// Occurs when talking to the cloud store (fetch, upsert, soft delete).
    /// Typically retryable (network blips, transient server errors).
    #[error("Remote error ({operation}): {message}")]
    Remote { operation: String, message: String },

    /// A bounded remote call exceeded its deadline.
    ///
    /// Every network call runs under a per-call timeout; exceeding it
    /// yields this typed failure instead of a hang. Retryable.
    #[error("Timeout during {operation}")]
    Timeout { operation: String },

    /// Change-feed subscription did not open within the connect timeout.
    ///
    /// Treated as a connect failure by the coordinator. Retryable.
    #[error("Change-feed subscription timed out")]
    SubscribeTimeout,

    /// SQLite error in the offline queue or watermark store.
    ///
    /// Not retryable - indicates local database issues that need attention.
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Payload (de)serialization failure.
    ///
    /// Not retryable - the payload is malformed at the source. Callers
    /// drop the offending record rather than writing it over local state.
    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// Malformed change-feed event or unrecognized table identifier.
    ///
    /// Not retryable - the event is malformed at the source.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid or missing configuration.
    ///
    /// Not retryable - fix the configuration and restart.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Coordinator state machine violation.
    ///
    /// Occurs when an operation is attempted in the wrong state
    /// (e.g., calling `connect()` on an already-connected coordinator).
    /// Not retryable - indicates a bug in the caller.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    ///
    /// Returned when operations are attempted during disconnect.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    ///
    /// Catch-all for errors that shouldn't happen.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Create a remote error with operation context.
    pub fn remote(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Remote {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Remote { .. } => true,
            Self::Timeout { .. } => true,
            Self::SubscribeTimeout => true,
            Self::Storage(_) => false, // Local DB issues need attention
            Self::Decode(_) => false,  // Malformed payload
            Self::Protocol(_) => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}
