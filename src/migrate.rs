//! Per-record payload format migrations.
//!
//! Older app versions wrote payload shapes the current model no longer
//! produces. Freshly pulled rows pass through [`migrate_payload`] before
//! decoding, so legacy data from long-offline devices keeps syncing:
//!
//! - beans: `remaining`/`capacity` written as numbers instead of gram
//!   strings;
//! - brewing notes: `rating` written as a string;
//! - method collections: a bare method array instead of the keyed object,
//!   and method entries without an `id` (older clients keyed methods by
//!   name).
//!
//! Migrations are idempotent: migrating an already-current payload changes
//! nothing.

use crate::model::Table;
use serde_json::Value;

/// Normalize a legacy payload in place. Returns whether anything changed.
pub fn migrate_payload(table: Table, payload: &mut Value) -> bool {
    match table {
        Table::Beans => migrate_bean(payload),
        Table::BrewNotes => migrate_note(payload),
        Table::Equipment => false,
        Table::Methods => migrate_methods(payload),
    }
}

fn migrate_bean(payload: &mut Value) -> bool {
    let mut changed = false;
    for field in ["remaining", "capacity"] {
        if let Some(value) = payload.get_mut(field) {
            if let Some(n) = value.as_f64() {
                // Integral grams print without a trailing ".0".
                let text = if n.fract() == 0.0 {
                    format!("{}", n as i64)
                } else {
                    format!("{}", n)
                };
                *value = Value::String(text);
                changed = true;
            }
        }
    }
    changed
}

fn migrate_note(payload: &mut Value) -> bool {
    let Some(rating) = payload.get_mut("rating") else {
        return false;
    };
    let Some(text) = rating.as_str() else {
        return false;
    };
    match text.parse::<f64>() {
        Ok(n) => {
            *rating = serde_json::Number::from_f64(n)
                .map(Value::Number)
                .unwrap_or(Value::Null);
            true
        }
        Err(_) => false,
    }
}

fn migrate_methods(payload: &mut Value) -> bool {
    let mut changed = false;

    // Bare-array legacy shape: the method list stored directly.
    if payload.is_array() {
        let methods = payload.take();
        *payload = serde_json::json!({ "methods": methods });
        changed = true;
    }

    if let Some(methods) = payload.get_mut("methods").and_then(|m| m.as_array_mut()) {
        for method in methods {
            let Some(obj) = method.as_object_mut() else {
                continue;
            };
            let missing_id = !obj.contains_key("id")
                || obj.get("id").map(|v| v.is_null()).unwrap_or(false);
            if missing_id {
                if let Some(name) = obj.get("name").and_then(|n| n.as_str()) {
                    let name = name.to_string();
                    obj.insert("id".to_string(), Value::String(name));
                    changed = true;
                }
            }
        }
    }

    changed
}
