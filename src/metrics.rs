//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Reconciliation outcomes and durations
//! - Upload/download/delete volumes per table
//! - Offline queue depth and dropped operations
//! - Realtime event dispositions (applied / suppressed / stale / skipped)
//! - Id-batch fetch retries and failures
//! - Coordinator state
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `brewsync_` and follow Prometheus
//! conventions: counters end in `_total`, gauges represent current state,
//! histograms track distributions (durations, sizes).

use ::metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record records uploaded to the cloud for a table.
pub fn record_uploaded(table: &str, count: usize) {
    counter!("brewsync_records_uploaded_total", "table" => table.to_string())
        .increment(count as u64);
}

/// Record records downloaded into the local store for a table.
pub fn record_downloaded(table: &str, count: usize) {
    counter!("brewsync_records_downloaded_total", "table" => table.to_string())
        .increment(count as u64);
}

/// Record local records deleted by remote tombstones for a table.
pub fn record_deleted_local(table: &str, count: usize) {
    counter!("brewsync_records_deleted_local_total", "table" => table.to_string())
        .increment(count as u64);
}

/// Record a per-table reconciliation outcome.
pub fn record_table_sync(table: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("brewsync_table_syncs_total", "table" => table.to_string(), "status" => status)
        .increment(1);
}

/// Record a completed reconciliation run.
pub fn record_reconcile_complete(
    uploaded: usize,
    downloaded: usize,
    deleted_local: usize,
    errors: usize,
    duration: Duration,
) {
    counter!("brewsync_reconcile_runs_total").increment(1);
    counter!("brewsync_reconcile_errors_total").increment(errors as u64);
    histogram!("brewsync_reconcile_duration_seconds").record(duration.as_secs_f64());
    histogram!("brewsync_reconcile_uploaded").record(uploaded as f64);
    histogram!("brewsync_reconcile_downloaded").record(downloaded as f64);
    histogram!("brewsync_reconcile_deleted_local").record(deleted_local as f64);
}

/// Record a skipped per-table pass (another pass already in flight).
pub fn record_table_sync_skipped(table: &str) {
    counter!("brewsync_table_syncs_skipped_total", "table" => table.to_string()).increment(1);
}

/// Set the current offline queue depth.
pub fn set_queue_depth(depth: usize) {
    gauge!("brewsync_queue_depth").set(depth as f64);
}

/// Record queue entries processed in a drain.
pub fn record_queue_processed(count: usize) {
    counter!("brewsync_queue_processed_total").increment(count as u64);
}

/// Record a queued operation dropped after exhausting its retry budget.
pub fn record_queue_dropped(table: &str) {
    counter!("brewsync_queue_dropped_total", "table" => table.to_string()).increment(1);
}

/// Record the disposition of an inbound realtime event.
///
/// `outcome` is one of: "applied", "suppressed", "stale", "skipped".
pub fn record_realtime_event(table: &str, outcome: &str) {
    counter!(
        "brewsync_realtime_events_total",
        "table" => table.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a retried id-batch fetch chunk.
pub fn record_fetch_chunk_retry(table: &str) {
    counter!("brewsync_fetch_chunk_retries_total", "table" => table.to_string()).increment(1);
}

/// Record an id-batch fetch chunk that failed past its retry budget.
pub fn record_fetch_chunk_failed(table: &str) {
    counter!("brewsync_fetch_chunk_failures_total", "table" => table.to_string()).increment(1);
}

/// Set the coordinator state gauge (one labeled gauge per state).
pub fn set_sync_state(state: &str) {
    gauge!("brewsync_coordinator_state", "state" => state.to_string()).set(1.0);
}

/// Record a watermark advance.
pub fn record_watermark_advance() {
    counter!("brewsync_watermark_advances_total").increment(1);
}
