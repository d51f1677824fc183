//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Capture loop throughput and outcomes
//! - Destination write outcomes (applied vs skipped)
//! - Checkpoint persistence
//! - Capture lag
//! - Store connections and feed reads
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `relay_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! Nothing is exported unless the host installs a `metrics` recorder.
//!
//! # Usage
//!
//! ```rust,no_run
//! use changefeed_relay::metrics;
//! use std::time::Duration;
//!
//! metrics::record_events_received("legacy-to-atlas", 1);
//! metrics::record_apply_latency("legacy-to-atlas", Duration::from_millis(3));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Capture Loop Metrics
// =============================================================================

/// Record events received from the feed.
pub fn record_events_received(relay: &str, count: usize) {
    counter!("relay_events_received_total", "relay" => relay.to_string()).increment(count as u64);
}

/// Record an event whose apply failed (left unacknowledged).
pub fn record_event_failed(relay: &str) {
    counter!("relay_events_failed_total", "relay" => relay.to_string()).increment(1);
}

/// Record an event that was acknowledged without being applied (non-insert).
pub fn record_event_ignored(relay: &str, operation: &str) {
    counter!(
        "relay_events_ignored_total",
        "relay" => relay.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record apply latency (writer call including retries).
pub fn record_apply_latency(relay: &str, duration: Duration) {
    histogram!("relay_apply_duration_seconds", "relay" => relay.to_string())
        .record(duration.as_secs_f64());
}

/// Record capture lag in milliseconds (event position vs wall clock).
pub fn record_capture_lag_ms(relay: &str, lag_ms: u64) {
    gauge!("relay_capture_lag_ms", "relay" => relay.to_string()).set(lag_ms as f64);
}

/// Gauge for capture loop state.
pub fn set_capture_state(relay: &str, state: &str) {
    // Encode state as numeric for alerting
    let value = match state {
        "Starting" => 0.0,
        "Streaming" => 1.0,
        "Draining" => 2.0,
        "Closed" => 3.0,
        _ => -1.0,
    };
    gauge!("relay_capture_state", "relay" => relay.to_string()).set(value);
}

/// Record why a capture run stopped.
pub fn record_run_stopped(relay: &str, reason: &str) {
    counter!(
        "relay_runs_stopped_total",
        "relay" => relay.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

// =============================================================================
// Writer Metrics
// =============================================================================

/// Record a destination write outcome (`applied`, `skipped_already_present`,
/// `skipped_concurrent_insert`, `failed`).
pub fn record_write(marker: &str, outcome: &str) {
    counter!(
        "relay_writes_total",
        "marker" => marker.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// =============================================================================
// Checkpoint Metrics
// =============================================================================

/// Record a checkpoint save.
pub fn record_checkpoint_save(relay: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "relay_checkpoint_saves_total",
        "relay" => relay.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record an event applied while the checkpoint is held.
pub fn record_checkpoint_held(relay: &str) {
    counter!("relay_checkpoint_held_events_total", "relay" => relay.to_string()).increment(1);
}

/// Record SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn sqlite_retries_total(operation: &str) {
    counter!("relay_sqlite_retries_total", "operation" => operation.to_string()).increment(1);
}

// =============================================================================
// Store Metrics
// =============================================================================

/// Record a retried operation (any store call under `resilience::retry`).
pub fn record_retry(operation: &str) {
    counter!("relay_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Record a store connection attempt.
pub fn record_store_connection(store: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "relay_store_connections_total",
        "store" => store.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record a feed read (XREAD or equivalent).
pub fn record_feed_read(store: &str, entries: usize, duration: Duration) {
    counter!("relay_feed_reads_total", "store" => store.to_string()).increment(1);
    if entries > 0 {
        counter!("relay_feed_entries_read_total", "store" => store.to_string())
            .increment(entries as u64);
    }
    histogram!("relay_feed_read_duration_seconds", "store" => store.to_string())
        .record(duration.as_secs_f64());
}

/// Record a feed entry that couldn't be parsed and was skipped.
pub fn record_feed_parse_error(store: &str) {
    counter!("relay_feed_parse_errors_total", "store" => store.to_string()).increment(1);
}

/// Record a feed entry excluded by the subscription filter.
pub fn record_feed_filtered(store: &str) {
    counter!("relay_feed_filtered_total", "store" => store.to_string()).increment(1);
}
