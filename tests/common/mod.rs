//! Shared builders for integration and property tests.

#![allow(dead_code)] // Not every test binary uses every builder.

use brew_sync::model::{ms_to_iso, BrewMethod, BrewNote, CoffeeBean, MethodCollection};
use brew_sync::{CloudRecord, EntityPayload, LocalRecord};
use serde_json::json;

/// A local bean record with the given id and mutation time.
pub fn bean_record(id: &str, ts: i64) -> LocalRecord {
    LocalRecord::new(EntityPayload::Bean(CoffeeBean {
        id: id.to_string(),
        name: format!("bean {}", id),
        remaining: Some("200".to_string()),
        capacity: Some("250".to_string()),
        roast_date: Some("2026-07-01".to_string()),
        start_day: Some(7),
        end_day: Some(30),
        is_frozen: Some(false),
        timestamp: ts,
    }))
}

/// A local brewing note with distinct creation and edit times.
pub fn note_record(id: &str, created: i64, edited: Option<i64>) -> LocalRecord {
    LocalRecord::new(EntityPayload::Note(BrewNote {
        id: id.to_string(),
        bean_id: Some("b1".to_string()),
        equipment: Some("v60".to_string()),
        method: Some("standard".to_string()),
        rating: Some(4.0),
        notes: Some("floral".to_string()),
        timestamp: created,
        updated_at: edited,
    }))
}

/// A local method collection for one equipment.
pub fn methods_record(equipment_id: &str, ts: i64) -> LocalRecord {
    LocalRecord::new(EntityPayload::Methods(MethodCollection {
        equipment_id: equipment_id.to_string(),
        methods: vec![BrewMethod {
            id: "m1".to_string(),
            name: "standard".to_string(),
            params: Some(json!({"water": "225g"})),
        }],
        timestamp: ts,
    }))
}

/// An active cloud bean row.
pub fn cloud_bean(id: &str, ts: i64) -> CloudRecord {
    CloudRecord {
        id: id.to_string(),
        tenant_id: "t1".to_string(),
        payload: json!({
            "id": id,
            "name": format!("bean {}", id),
            "timestamp": ts,
        }),
        updated_at: ms_to_iso(ts),
        deleted_at: None,
    }
}

/// A tombstoned cloud row.
pub fn tombstone(id: &str, deleted_ms: i64) -> CloudRecord {
    let mut row = cloud_bean(id, deleted_ms);
    row.deleted_at = Some(ms_to_iso(deleted_ms));
    row
}
