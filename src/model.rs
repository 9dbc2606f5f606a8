// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Core data model: synced tables, typed entity payloads, and the local and
//! cloud record shapes the engine moves between.
//!
//! # Timestamps
//!
//! Local records carry epoch-millisecond timestamps; cloud rows carry
//! ISO-8601 strings. The engine interoperates between the two via
//! [`iso_to_ms`]/[`ms_to_iso`] and the resolver's timestamp extraction.
//!
//! # Payloads
//!
//! Entity payloads are a closed sum type ([`EntityPayload`]) with per-variant
//! serde. The wire form of each variant is its inner struct serialized in
//! `camelCase`; the table a row belongs to identifies the variant, so the
//! enum itself never appears on the wire.

use crate::error::{Result, SyncError};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ═══════════════════════════════════════════════════════════════════════════════
// Table registry
// ═══════════════════════════════════════════════════════════════════════════════

/// The entity collections kept in sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    /// Coffee bean inventory.
    Beans,
    /// Brewing notes (the journal itself).
    BrewNotes,
    /// User-defined brewers.
    Equipment,
    /// Brew methods, grouped by the equipment they belong to.
    ///
    /// This is the one collection with a structurally different remote
    /// shape: one cloud row per equipment id, payload carrying the full
    /// method list. See [`crate::realtime`] for the translation step.
    Methods,
}

impl Table {
    /// All synced tables, in reconciliation fan-out order.
    pub const ALL: [Table; 4] = [
        Table::Beans,
        Table::BrewNotes,
        Table::Equipment,
        Table::Methods,
    ];

    /// The cloud-side table identifier.
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Beans => "coffee_beans",
            Table::BrewNotes => "brewing_notes",
            Table::Equipment => "custom_equipments",
            Table::Methods => "custom_methods",
        }
    }

    /// Parse a cloud-side table identifier.
    ///
    /// Unknown names are a [`SyncError::Protocol`] error - change-feed
    /// events for tables we do not sync are malformed from our point of
    /// view and must not be silently misrouted.
    pub fn parse(name: &str) -> Result<Table> {
        match name {
            "coffee_beans" => Ok(Table::Beans),
            "brewing_notes" => Ok(Table::BrewNotes),
            "custom_equipments" => Ok(Table::Equipment),
            "custom_methods" => Ok(Table::Methods),
            other => Err(SyncError::Protocol(format!("unknown table '{}'", other))),
        }
    }

    /// Whether this is a primary content table.
    ///
    /// Failures on primary tables (the user's actual data) are reported
    /// distinctly from secondary ones in the sync summary.
    pub fn is_primary(&self) -> bool {
        matches!(self, Table::Beans | Table::BrewNotes)
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Entity payloads
// ═══════════════════════════════════════════════════════════════════════════════

/// A coffee bean in the inventory.
///
/// `remaining` and `capacity` are gram amounts stored as strings (the wire
/// format inherited from the app); legacy rows may still carry numbers and
/// are normalized by [`crate::migrate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoffeeBean {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roast_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_day: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_day: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_frozen: Option<bool>,
    /// Logical mutation time, epoch millis.
    pub timestamp: i64,
}

/// A brewing note.
///
/// Notes are the one entity class whose mutation time diverges from
/// creation time: `timestamp` is when the brew happened, `updated_at` (when
/// present) is the last edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrewNote {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bean_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equipment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// When the brew happened, epoch millis.
    pub timestamp: i64,
    /// Last edit time, epoch millis. Preferred over `timestamp` when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}

/// A user-defined brewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomEquipment {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub animation_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_valve: Option<bool>,
    pub timestamp: i64,
}

/// A single brew method (recipe) belonging to an equipment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrewMethod {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// All brew methods for one equipment, stored as a single record keyed by
/// the equipment id (the grouped-by-parent-key shape).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodCollection {
    pub equipment_id: String,
    #[serde(default)]
    pub methods: Vec<BrewMethod>,
    pub timestamp: i64,
}

/// Closed set of entity payloads, one variant per synced table.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityPayload {
    Bean(CoffeeBean),
    Note(BrewNote),
    Equipment(CustomEquipment),
    Methods(MethodCollection),
}

impl EntityPayload {
    /// The table this payload belongs to.
    pub fn table(&self) -> Table {
        match self {
            EntityPayload::Bean(_) => Table::Beans,
            EntityPayload::Note(_) => Table::BrewNotes,
            EntityPayload::Equipment(_) => Table::Equipment,
            EntityPayload::Methods(_) => Table::Methods,
        }
    }

    /// The record id within its collection.
    pub fn record_id(&self) -> &str {
        match self {
            EntityPayload::Bean(b) => &b.id,
            EntityPayload::Note(n) => &n.id,
            EntityPayload::Equipment(e) => &e.id,
            EntityPayload::Methods(m) => &m.equipment_id,
        }
    }

    /// Logical mutation time in epoch millis.
    ///
    /// Prefers the distinct edit time where the entity has one.
    pub fn updated_at_ms(&self) -> i64 {
        match self {
            EntityPayload::Bean(b) => b.timestamp,
            EntityPayload::Note(n) => n.updated_at.unwrap_or(n.timestamp),
            EntityPayload::Equipment(e) => e.timestamp,
            EntityPayload::Methods(m) => m.timestamp,
        }
    }

    /// Serialize to the wire payload form.
    pub fn to_value(&self) -> Value {
        // Serialization of these structs cannot fail.
        match self {
            EntityPayload::Bean(b) => serde_json::to_value(b).unwrap_or(Value::Null),
            EntityPayload::Note(n) => serde_json::to_value(n).unwrap_or(Value::Null),
            EntityPayload::Equipment(e) => serde_json::to_value(e).unwrap_or(Value::Null),
            EntityPayload::Methods(m) => serde_json::to_value(m).unwrap_or(Value::Null),
        }
    }

    /// Decode a wire payload for the given table.
    ///
    /// A null or structurally invalid payload is a typed error so callers
    /// can drop the row instead of writing it over valid local state.
    pub fn from_value(table: Table, value: Value) -> Result<EntityPayload> {
        if value.is_null() {
            return Err(SyncError::Protocol(format!(
                "null payload for table '{}'",
                table
            )));
        }
        let payload = match table {
            Table::Beans => EntityPayload::Bean(serde_json::from_value(value)?),
            Table::BrewNotes => EntityPayload::Note(serde_json::from_value(value)?),
            Table::Equipment => EntityPayload::Equipment(serde_json::from_value(value)?),
            Table::Methods => EntityPayload::Methods(serde_json::from_value(value)?),
        };
        Ok(payload)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Records
// ═══════════════════════════════════════════════════════════════════════════════

/// A record in the device-local store.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalRecord {
    pub id: String,
    pub payload: EntityPayload,
}

impl LocalRecord {
    /// Wrap a payload, taking the id from it.
    pub fn new(payload: EntityPayload) -> Self {
        Self {
            id: payload.record_id().to_string(),
            payload,
        }
    }

    /// Logical mutation time in epoch millis.
    pub fn timestamp(&self) -> i64 {
        self.payload.updated_at_ms()
    }

    /// Decode a cloud row into a local record.
    pub fn from_cloud(table: Table, row: &CloudRecord) -> Result<LocalRecord> {
        let payload = EntityPayload::from_value(table, row.payload.clone())?;
        Ok(LocalRecord {
            id: row.id.clone(),
            payload,
        })
    }

    /// Build the cloud row for this record. The row is always active:
    /// uploads clear any existing tombstone.
    pub fn to_cloud(&self, tenant_id: &str) -> CloudRecord {
        CloudRecord {
            id: self.id.clone(),
            tenant_id: tenant_id.to_string(),
            payload: self.payload.to_value(),
            updated_at: ms_to_iso(self.timestamp()),
            deleted_at: None,
        }
    }
}

/// A row in the authoritative cloud store.
///
/// Cloud rows are never hard-deleted: `deleted_at` is the tombstone marker
/// and tombstoned rows keep occupying their id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudRecord {
    pub id: String,
    pub tenant_id: String,
    pub payload: Value,
    /// ISO-8601 mutation time.
    pub updated_at: String,
    /// ISO-8601 tombstone time; `None` means the row is active.
    pub deleted_at: Option<String>,
}

impl CloudRecord {
    /// Whether this row is a tombstone.
    pub fn is_tombstoned(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Mutation time in epoch millis (payload fields preferred, then the
    /// row's `updated_at` column - see [`crate::resolve::extract_timestamp`]).
    pub fn updated_at_ms(&self) -> i64 {
        crate::resolve::extract_timestamp(&self.payload, Some(&self.updated_at))
    }

    /// Tombstone time in epoch millis; falls back to the mutation time when
    /// `deleted_at` is unparseable.
    pub fn tombstone_ms(&self) -> i64 {
        self.deleted_at
            .as_deref()
            .and_then(iso_to_ms)
            .unwrap_or_else(|| self.updated_at_ms())
    }

    /// The metadata-only projection of this row.
    pub fn meta(&self) -> CloudMeta {
        CloudMeta {
            id: self.id.clone(),
            updated_at: self.updated_at.clone(),
            deleted_at: self.deleted_at.clone(),
        }
    }
}

/// Metadata-only projection of a cloud row (id, updated_at, deleted_at).
///
/// Reconciliation fetches this first to bound bandwidth, then pulls full
/// payloads only for the ids that actually need them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudMeta {
    pub id: String,
    pub updated_at: String,
    pub deleted_at: Option<String>,
}

impl CloudMeta {
    pub fn is_tombstoned(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn updated_at_ms(&self) -> i64 {
        iso_to_ms(&self.updated_at).unwrap_or(0)
    }
}

/// The app-level settings document (a singleton, not an entity table).
///
/// Synced by a simpler one-directional rule: download when the remote copy
/// is newer than the watermark, upload otherwise - never both in one pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsDoc {
    pub payload: Value,
    /// Epoch millis.
    pub updated_at: i64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Timestamp conversion
// ═══════════════════════════════════════════════════════════════════════════════

/// Parse an ISO-8601 timestamp into epoch millis.
pub fn iso_to_ms(iso: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(iso)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

/// Format epoch millis as an ISO-8601 (RFC 3339, UTC) timestamp.
///
/// Out-of-range inputs clamp to the epoch.
pub fn ms_to_iso(ms: i64) -> String {
    match DateTime::<Utc>::from_timestamp_millis(ms) {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
        None => "1970-01-01T00:00:00.000Z".to_string(),
    }
}

/// Current wall-clock time in epoch millis.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
