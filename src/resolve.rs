// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Last-write-wins conflict resolution. Pure functions, no I/O.
//!
//! # Decision table (`batch_resolve`)
//!
//! | Local | Remote | Condition | Outcome |
//! |-------|--------|-----------|---------|
//! | yes | absent | always (even below the watermark) | upload |
//! | yes | tombstone | local newer than tombstone | upload (resurrect) |
//! | yes | tombstone | otherwise | delete local |
//! | yes | active | both modified since watermark | LWW, ties keep local |
//! | yes | active | only one side modified | that side wins |
//! | yes | active | neither modified, remote strictly newer | download |
//! | absent | active | - | download |
//! | absent | tombstone | - | ignored |
//!
//! The "local with no remote counterpart always uploads" rule is a
//! deliberate safety bias: a missing cloud row is never proof the cloud
//! deleted it, only an explicit tombstone is. The "neither modified"
//! fallback guards against a zeroed or corrupted watermark; it can only
//! trigger a download, never an upload or a delete.
//!
//! Callers must filter out fetched-but-missing payloads before calling
//! [`batch_resolve`] - a null payload is never merged over local data.

use crate::model::{iso_to_ms, CloudRecord, LocalRecord};
use serde_json::Value;
use std::collections::HashMap;

/// Which side of a conflict wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    Local,
    Remote,
}

/// Extract a mutation timestamp (epoch millis) from a record payload.
///
/// Preference order:
/// 1. an explicit `updatedAt` payload field,
/// 2. the `timestamp` payload field,
/// 3. the cloud row's ISO-8601 `updated_at` column,
/// 4. zero.
///
/// Numeric fields may arrive as numbers, numeric strings, or ISO-8601
/// strings; all three forms are accepted.
pub fn extract_timestamp(payload: &Value, updated_at_iso: Option<&str>) -> i64 {
    if let Some(ms) = payload.get("updatedAt").and_then(value_ms) {
        return ms;
    }
    if let Some(ms) = payload.get("timestamp").and_then(value_ms) {
        return ms;
    }
    updated_at_iso.and_then(iso_to_ms).unwrap_or(0)
}

/// Coerce a JSON value into epoch millis.
fn value_ms(value: &Value) -> Option<i64> {
    if let Some(ms) = value.as_i64() {
        return Some(ms);
    }
    if let Some(f) = value.as_f64() {
        return Some(f as i64);
    }
    if let Some(s) = value.as_str() {
        if let Ok(ms) = s.parse::<i64>() {
            return Some(ms);
        }
        return iso_to_ms(s);
    }
    None
}

/// Pick a winner between two mutation timestamps. Local wins ties.
pub fn resolve(local_ts: i64, remote_ts: i64) -> Winner {
    if remote_ts > local_ts {
        Winner::Remote
    } else {
        Winner::Local
    }
}

/// Whether an inbound remote change should replace local state.
///
/// True when there is no local record, or the remote mutation is strictly
/// newer than the local one.
pub fn should_accept_remote_change(local_ts: Option<i64>, remote_ts: i64) -> bool {
    match local_ts {
        None => true,
        Some(local) => remote_ts > local,
    }
}

/// The partition produced by [`batch_resolve`].
///
/// Every local id and every remote id lands in exactly one bucket or is
/// left untouched (already converged).
#[derive(Debug, Default, Clone)]
pub struct ResolvePlan {
    /// Local records the cloud is missing or holds stale/tombstoned copies of.
    pub to_upload: Vec<LocalRecord>,
    /// Cloud rows that should replace (or create) local state.
    pub to_download: Vec<CloudRecord>,
    /// Local record ids superseded by a remote tombstone.
    pub to_delete_local: Vec<String>,
}

impl ResolvePlan {
    /// True when the plan contains no work.
    pub fn is_noop(&self) -> bool {
        self.to_upload.is_empty() && self.to_download.is_empty() && self.to_delete_local.is_empty()
    }
}

/// Diff a table's local records against its cloud rows.
///
/// `last_sync` is the persisted watermark (epoch millis); zero means the
/// device has never completed a sync. See the module docs for the full
/// decision table.
pub fn batch_resolve(
    local: &[LocalRecord],
    remote: &[CloudRecord],
    last_sync: i64,
) -> ResolvePlan {
    let mut plan = ResolvePlan::default();
    let remote_by_id: HashMap<&str, &CloudRecord> =
        remote.iter().map(|r| (r.id.as_str(), r)).collect();

    for record in local {
        match remote_by_id.get(record.id.as_str()) {
            // No cloud row: always re-upload. Absence is not a tombstone.
            None => plan.to_upload.push(record.clone()),

            Some(row) if row.is_tombstoned() => {
                if record.timestamp() > row.tombstone_ms() {
                    // Edited after the delete: resurrect.
                    plan.to_upload.push(record.clone());
                } else {
                    plan.to_delete_local.push(record.id.clone());
                }
            }

            Some(row) => {
                let local_ts = record.timestamp();
                let remote_ts = row.updated_at_ms();
                let local_modified = local_ts > last_sync;
                let remote_modified = remote_ts > last_sync;

                match (local_modified, remote_modified) {
                    (true, true) => match local_ts.cmp(&remote_ts) {
                        std::cmp::Ordering::Less => plan.to_download.push((*row).clone()),
                        std::cmp::Ordering::Greater => plan.to_upload.push(record.clone()),
                        // Tie: local is kept, nothing moves.
                        std::cmp::Ordering::Equal => {}
                    },
                    (true, false) => plan.to_upload.push(record.clone()),
                    (false, true) => plan.to_download.push((*row).clone()),
                    // Watermark says neither changed; trust raw timestamps
                    // anyway in case the watermark is stale or zeroed.
                    (false, false) => {
                        if remote_ts > local_ts {
                            plan.to_download.push((*row).clone());
                        }
                    }
                }
            }
        }
    }

    let local_ids: HashMap<&str, ()> = local.iter().map(|r| (r.id.as_str(), ())).collect();
    for row in remote {
        if local_ids.contains_key(row.id.as_str()) {
            continue;
        }
        // Remote-only tombstones have nothing to delete locally.
        if !row.is_tombstoned() {
            plan.to_download.push(row.clone());
        }
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ms_to_iso, CoffeeBean, EntityPayload};
    use serde_json::json;

    fn local_bean(id: &str, ts: i64) -> LocalRecord {
        LocalRecord::new(EntityPayload::Bean(CoffeeBean {
            id: id.to_string(),
            name: format!("bean {}", id),
            remaining: None,
            capacity: None,
            roast_date: None,
            start_day: None,
            end_day: None,
            is_frozen: None,
            timestamp: ts,
        }))
    }

    fn cloud_bean(id: &str, ts: i64) -> CloudRecord {
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

    fn tombstone(id: &str, deleted_ms: i64) -> CloudRecord {
        let mut row = cloud_bean(id, deleted_ms);
        row.deleted_at = Some(ms_to_iso(deleted_ms));
        row
    }

    // ─────────────────────────────────────────────────────────────────────
    // extract_timestamp
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn test_extract_prefers_updated_at_field() {
        let payload = json!({"updatedAt": 900, "timestamp": 100});
        assert_eq!(extract_timestamp(&payload, Some(&ms_to_iso(50))), 900);
    }

    #[test]
    fn test_extract_falls_back_to_timestamp() {
        let payload = json!({"timestamp": 100});
        assert_eq!(extract_timestamp(&payload, Some(&ms_to_iso(50))), 100);
    }

    #[test]
    fn test_extract_falls_back_to_iso_column() {
        let payload = json!({"name": "x"});
        assert_eq!(extract_timestamp(&payload, Some(&ms_to_iso(50))), 50);
    }

    #[test]
    fn test_extract_defaults_to_zero() {
        assert_eq!(extract_timestamp(&json!({}), None), 0);
        assert_eq!(extract_timestamp(&json!({}), Some("garbage")), 0);
    }

    #[test]
    fn test_extract_accepts_numeric_string() {
        let payload = json!({"updatedAt": "1234"});
        assert_eq!(extract_timestamp(&payload, None), 1234);
    }

    #[test]
    fn test_extract_accepts_iso_string_field() {
        let iso = ms_to_iso(777);
        let payload = json!({ "updatedAt": iso });
        assert_eq!(extract_timestamp(&payload, None), 777);
    }

    #[test]
    fn test_extract_accepts_float() {
        let payload = json!({"timestamp": 1234.0});
        assert_eq!(extract_timestamp(&payload, None), 1234);
    }

    // ─────────────────────────────────────────────────────────────────────
    // resolve / should_accept_remote_change
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn test_resolve_strictly_greater_wins() {
        assert_eq!(resolve(100, 200), Winner::Remote);
        assert_eq!(resolve(200, 100), Winner::Local);
    }

    #[test]
    fn test_resolve_tie_favors_local() {
        assert_eq!(resolve(100, 100), Winner::Local);
        assert_eq!(resolve(0, 0), Winner::Local);
    }

    #[test]
    fn test_should_accept_when_local_absent() {
        assert!(should_accept_remote_change(None, 0));
        assert!(should_accept_remote_change(None, 999));
    }

    #[test]
    fn test_should_accept_strictly_newer_only() {
        assert!(should_accept_remote_change(Some(100), 101));
        assert!(!should_accept_remote_change(Some(100), 100));
        assert!(!should_accept_remote_change(Some(100), 99));
    }

    // ─────────────────────────────────────────────────────────────────────
    // batch_resolve
    // ─────────────────────────────────────────────────────────────────────

    /// Scenario A: local-only record below the watermark still uploads.
    #[test]
    fn test_local_only_always_uploads() {
        let local = vec![local_bean("b1", 100)];
        let plan = batch_resolve(&local, &[], 0);
        assert_eq!(plan.to_upload.len(), 1);
        assert_eq!(plan.to_upload[0].id, "b1");
        assert!(plan.to_delete_local.is_empty());

        // Even with a watermark far past the local timestamp.
        let plan = batch_resolve(&local, &[], 5_000);
        assert_eq!(plan.to_upload.len(), 1);
        assert!(plan.to_delete_local.is_empty());
    }

    /// Scenario B: a remote-only tombstone is ignored entirely.
    #[test]
    fn test_remote_only_tombstone_ignored() {
        let plan = batch_resolve(&[], &[tombstone("b1", 500)], 0);
        assert!(plan.is_noop());
    }

    /// Scenario C: remote strictly newer, both modified since watermark.
    #[test]
    fn test_remote_newer_downloads() {
        let local = vec![local_bean("b1", 300)];
        let remote = vec![cloud_bean("b1", 400)];
        let plan = batch_resolve(&local, &remote, 0);
        assert_eq!(plan.to_download.len(), 1);
        assert_eq!(plan.to_download[0].id, "b1");
        assert!(plan.to_upload.is_empty());
    }

    #[test]
    fn test_local_newer_uploads() {
        let local = vec![local_bean("b1", 400)];
        let remote = vec![cloud_bean("b1", 300)];
        let plan = batch_resolve(&local, &remote, 0);
        assert_eq!(plan.to_upload.len(), 1);
        assert!(plan.to_download.is_empty());
    }

    #[test]
    fn test_both_modified_tie_keeps_local_untouched() {
        let local = vec![local_bean("b1", 400)];
        let remote = vec![cloud_bean("b1", 400)];
        let plan = batch_resolve(&local, &remote, 0);
        assert!(plan.is_noop());
    }

    #[test]
    fn test_only_local_modified_wins_unconditionally() {
        // Remote timestamp is *higher* but predates the watermark; local
        // changed since. Local wins.
        let local = vec![local_bean("b1", 600)];
        let remote = vec![cloud_bean("b1", 500)];
        let plan = batch_resolve(&local, &remote, 550);
        assert_eq!(plan.to_upload.len(), 1);
        assert!(plan.to_download.is_empty());
    }

    #[test]
    fn test_only_remote_modified_wins_unconditionally() {
        let local = vec![local_bean("b1", 500)];
        let remote = vec![cloud_bean("b1", 600)];
        let plan = batch_resolve(&local, &remote, 550);
        assert_eq!(plan.to_download.len(), 1);
        assert!(plan.to_upload.is_empty());
    }

    #[test]
    fn test_neither_modified_fallback_downloads_newer_remote() {
        // Watermark claims nothing changed, but the remote row is strictly
        // newer - the stale-watermark guard downloads it.
        let local = vec![local_bean("b1", 100)];
        let remote = vec![cloud_bean("b1", 200)];
        let plan = batch_resolve(&local, &remote, 1_000);
        assert_eq!(plan.to_download.len(), 1);
    }

    #[test]
    fn test_neither_modified_equal_or_older_remote_keeps_local() {
        let local = vec![local_bean("b1", 200)];
        let plan = batch_resolve(&local, &[cloud_bean("b1", 200)], 1_000);
        assert!(plan.is_noop());

        let plan = batch_resolve(&local, &[cloud_bean("b1", 100)], 1_000);
        assert!(plan.is_noop());
    }

    #[test]
    fn test_resurrection_local_newer_than_tombstone() {
        let local = vec![local_bean("b1", 600)];
        let remote = vec![tombstone("b1", 500)];
        let plan = batch_resolve(&local, &remote, 0);
        assert_eq!(plan.to_upload.len(), 1);
        assert!(plan.to_delete_local.is_empty());
    }

    #[test]
    fn test_tombstone_wins_when_not_older() {
        let local = vec![local_bean("b1", 500)];
        let remote = vec![tombstone("b1", 500)];
        let plan = batch_resolve(&local, &remote, 0);
        assert_eq!(plan.to_delete_local, vec!["b1".to_string()]);
        assert!(plan.to_upload.is_empty());

        let local = vec![local_bean("b1", 400)];
        let plan = batch_resolve(&local, &[tombstone("b1", 500)], 0);
        assert_eq!(plan.to_delete_local, vec!["b1".to_string()]);
    }

    #[test]
    fn test_remote_only_active_downloads() {
        let plan = batch_resolve(&[], &[cloud_bean("b2", 700)], 0);
        assert_eq!(plan.to_download.len(), 1);
        assert_eq!(plan.to_download[0].id, "b2");
    }

    #[test]
    fn test_partition_is_total() {
        let local = vec![
            local_bean("only-local", 100),
            local_bean("tombstoned", 100),
            local_bean("resurrected", 900),
            local_bean("newer-remote", 300),
            local_bean("newer-local", 800),
            local_bean("converged", 500),
        ];
        let remote = vec![
            tombstone("tombstoned", 500),
            tombstone("resurrected", 500),
            cloud_bean("newer-remote", 400),
            cloud_bean("newer-local", 700),
            cloud_bean("converged", 500),
            cloud_bean("only-remote", 600),
            tombstone("gone-everywhere", 100),
        ];
        let plan = batch_resolve(&local, &remote, 0);

        let uploads: Vec<&str> = plan.to_upload.iter().map(|r| r.id.as_str()).collect();
        let downloads: Vec<&str> = plan.to_download.iter().map(|r| r.id.as_str()).collect();

        assert!(uploads.contains(&"only-local"));
        assert!(uploads.contains(&"resurrected"));
        assert!(uploads.contains(&"newer-local"));
        assert!(downloads.contains(&"newer-remote"));
        assert!(downloads.contains(&"only-remote"));
        assert_eq!(plan.to_delete_local, vec!["tombstoned".to_string()]);

        // Each id appears in at most one bucket.
        assert_eq!(uploads.len(), 3);
        assert_eq!(downloads.len(), 2);
    }

    /// Applying the plan and re-resolving yields an empty plan.
    #[test]
    fn test_fixed_point_after_merge() {
        let local = vec![
            local_bean("only-local", 100),
            local_bean("newer-remote", 300),
            local_bean("newer-local", 800),
            local_bean("tombstoned", 100),
        ];
        let remote = vec![
            cloud_bean("newer-remote", 400),
            cloud_bean("newer-local", 700),
            tombstone("tombstoned", 500),
            cloud_bean("only-remote", 600),
        ];
        let plan = batch_resolve(&local, &remote, 0);

        // Simulate the merge.
        let mut merged_local: Vec<LocalRecord> = local.clone();
        merged_local.retain(|r| !plan.to_delete_local.contains(&r.id));
        for row in &plan.to_download {
            merged_local.retain(|r| r.id != row.id);
            merged_local.push(LocalRecord::from_cloud(crate::model::Table::Beans, row).unwrap());
        }
        let mut merged_remote: Vec<CloudRecord> = remote.clone();
        for rec in &plan.to_upload {
            merged_remote.retain(|r| r.id != rec.id);
            merged_remote.push(rec.to_cloud("t1"));
        }

        let again = batch_resolve(&merged_local, &merged_remote, 0);
        assert!(again.is_noop(), "expected fixed point, got {:?}", again);
    }
}
