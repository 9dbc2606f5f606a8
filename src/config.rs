//! Configuration for the sync engine.
//!
//! All tunables for the coordinator, realtime path, reconciliation, and the
//! offline queue. Configuration is passed to
//! [`SyncCoordinator::new()`](crate::coordinator::SyncCoordinator) and can be
//! constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use brew_sync::config::SyncConfig;
//!
//! let config = SyncConfig {
//!     tenant_id: "tenant-1".into(),
//!     device_id: "phone-a".into(),
//!     ..Default::default()
//! };
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! SyncConfig
//! ├── tenant_id: String            # Cloud tenant scope
//! ├── device_id: String            # This device's identity (logging)
//! ├── settings: SyncSettings
//! │   ├── realtime: RealtimeConfig   # feed subscription, echo suppression
//! │   ├── reconcile: ReconcileConfig # chunking, concurrency, timeouts
//! │   └── queue: QueueConfig         # retry budget
//! └── storage: StorageConfig       # SQLite for queue + watermark
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `SyncCoordinator::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Cloud tenant this device syncs under. Every remote query is scoped
    /// to it.
    pub tenant_id: String,

    /// This device's identity, used for logging and diagnostics.
    pub device_id: String,

    /// Tunable parameters for the sync logic.
    #[serde(default)]
    pub settings: SyncSettings,

    /// Durable storage settings (offline queue + watermark).
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tenant_id: "local.dev.tenant".to_string(),
            device_id: "local.dev.device".to_string(),
            settings: SyncSettings::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Create a minimal config for testing (in-memory storage).
    pub fn for_testing(tenant_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            device_id: "test-device".to_string(),
            settings: SyncSettings::default(),
            storage: StorageConfig::in_memory(),
        }
    }
}

/// General settings for the sync logic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncSettings {
    #[serde(default)]
    pub realtime: RealtimeConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub queue: QueueConfig,
}

// ═══════════════════════════════════════════════════════════════════════════════
// RealtimeConfig: change-feed subscription settings
// ═══════════════════════════════════════════════════════════════════════════════

/// Realtime (change-feed) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Whether the realtime path is enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How long to wait for the subscription to open before treating the
    /// connect as failed, as a duration string (e.g., "10s").
    #[serde(default = "default_subscribe_timeout")]
    pub subscribe_timeout: String,

    /// Self-change suppression window: inbound events for a (table, id)
    /// we wrote within this window are discarded as echo.
    #[serde(default = "default_suppression_ttl")]
    pub suppression_ttl: String,

    /// Debounce before reconnecting after an offline → online transition.
    #[serde(default = "default_reconnect_debounce")]
    pub reconnect_debounce: String,
}

fn default_subscribe_timeout() -> String {
    "10s".to_string()
}

fn default_suppression_ttl() -> String {
    "5s".to_string()
}

fn default_reconnect_debounce() -> String {
    "2s".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            subscribe_timeout: "10s".to_string(),
            suppression_ttl: "5s".to_string(),
            reconnect_debounce: "2s".to_string(),
        }
    }
}

impl RealtimeConfig {
    /// Parse the subscribe_timeout string to a Duration.
    pub fn subscribe_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.subscribe_timeout).unwrap_or(Duration::from_secs(10))
    }

    /// Parse the suppression_ttl string to a Duration.
    pub fn suppression_ttl_duration(&self) -> Duration {
        humantime::parse_duration(&self.suppression_ttl).unwrap_or(Duration::from_secs(5))
    }

    /// Parse the reconnect_debounce string to a Duration.
    pub fn reconnect_debounce_duration(&self) -> Duration {
        humantime::parse_duration(&self.reconnect_debounce).unwrap_or(Duration::from_secs(2))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReconcileConfig: diff-and-merge settings
// ═══════════════════════════════════════════════════════════════════════════════

/// Reconciliation (full diff-and-merge) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Ids per batched fetch request.
    #[serde(default = "default_fetch_chunk_size")]
    pub fetch_chunk_size: usize,

    /// Maximum id-batch fetches in flight at once.
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,

    /// Retry attempts per id-batch fetch (exponential backoff between).
    #[serde(default = "default_fetch_retries")]
    pub fetch_retries: usize,

    /// Timeout for bulk operations (metadata scans, batched upserts).
    #[serde(default = "default_bulk_timeout")]
    pub bulk_timeout: String,

    /// Timeout for point lookups (latest-timestamp probe, settings doc).
    #[serde(default = "default_point_timeout")]
    pub point_timeout: String,
}

fn default_fetch_chunk_size() -> usize {
    25
}

fn default_max_concurrent_fetches() -> usize {
    4
}

fn default_fetch_retries() -> usize {
    2
}

fn default_bulk_timeout() -> String {
    "60s".to_string()
}

fn default_point_timeout() -> String {
    "10s".to_string()
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            fetch_chunk_size: 25,
            max_concurrent_fetches: 4,
            fetch_retries: 2,
            bulk_timeout: "60s".to_string(),
            point_timeout: "10s".to_string(),
        }
    }
}

impl ReconcileConfig {
    /// Parse the bulk_timeout string to a Duration.
    pub fn bulk_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.bulk_timeout).unwrap_or(Duration::from_secs(60))
    }

    /// Parse the point_timeout string to a Duration.
    pub fn point_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.point_timeout).unwrap_or(Duration::from_secs(10))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// QueueConfig: offline queue settings
// ═══════════════════════════════════════════════════════════════════════════════

/// Offline queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Attempts before a pending operation is dropped (and the drop
    /// surfaced as a user-visible warning).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    3
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StorageConfig: queue + watermark persistence
// ═══════════════════════════════════════════════════════════════════════════════

/// Durable storage configuration.
///
/// The offline queue and the watermark live in the same SQLite substrate as
/// the app's domain records, surviving process restarts. The queue is the
/// source of truth for unconfirmed mutations, not an in-memory buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database.
    pub sqlite_path: String,

    /// Whether to use WAL mode (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "brew_sync.db".to_string(),
            wal_mode: true,
        }
    }
}

impl StorageConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
