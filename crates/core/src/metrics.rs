//! Metrics definitions for the sync engine.
//!
//! Metrics are collected using the `metrics` crate and can be exported
//! to Prometheus via `metrics-exporter-prometheus`.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Instant;

/// Initialize all metric descriptions.
/// Call this once at startup before any metrics are recorded.
pub fn init_metrics() {
    describe_counter!(
        "transactions_persisted_total",
        "Transactions written to the store, by write path"
    );
    describe_counter!(
        "key_blocks_persisted_total",
        "Key blocks written to the store"
    );
    describe_counter!(
        "reorgs_detected_total",
        "Chain reorganizations detected"
    );
    describe_counter!(
        "transactions_removed_total",
        "Transactions deleted by reorg recovery or revalidation"
    );
    describe_counter!(
        "plugin_batches_total",
        "Plugin batch deliveries, by plugin and outcome"
    );
    describe_counter!(
        "plugin_dead_letters_total",
        "Transactions recorded as failed for a plugin"
    );
    describe_counter!(
        "live_duplicates_dropped_total",
        "Live transactions dropped by the dedup window"
    );
    describe_counter!(
        "transactions_created_events_total",
        "Transaction-created events emitted"
    );
    describe_gauge!("sync_height", "Sync frontiers and chain tip, by kind");
    describe_gauge!("sync_bulk_mode", "1 while the backward indexer runs in bulk mode");
    describe_histogram!(
        "sync_tick_duration_seconds",
        "Duration of one backward sync tick in seconds"
    );
}

/// Record persisted transactions.
///
/// # Arguments
/// * `path` - Write path ("bulk", "upsert" or "fallback")
/// * `count` - Number of rows
pub fn record_transactions_persisted(path: &'static str, count: u64) {
    counter!("transactions_persisted_total", "path" => path).increment(count);
}

/// Record persisted key blocks.
pub fn record_key_blocks_persisted(count: u64) {
    counter!("key_blocks_persisted_total").increment(count);
}

/// Record a chain reorganization detection.
pub fn record_reorg_detected() {
    counter!("reorgs_detected_total").increment(1);
}

/// Record transactions removed from the store.
pub fn record_transactions_removed(count: u64) {
    counter!("transactions_removed_total").increment(count);
}

/// Record one plugin batch delivery.
pub fn record_plugin_batch(plugin: &str, outcome: &'static str) {
    counter!("plugin_batches_total", "plugin" => plugin.to_string(), "outcome" => outcome)
        .increment(1);
}

/// Record dead letters written for a plugin.
pub fn record_dead_letters(plugin: &str, count: u64) {
    counter!("plugin_dead_letters_total", "plugin" => plugin.to_string()).increment(count);
}

/// Record a live transaction dropped as a duplicate.
pub fn record_live_duplicate() {
    counter!("live_duplicates_dropped_total").increment(1);
}

/// Record a transaction-created event.
pub fn record_created_event() {
    counter!("transactions_created_events_total").increment(1);
}

/// Publish a frontier or tip height.
///
/// # Arguments
/// * `kind` - "tip", "backward", "live" or "indexer_head"
pub fn set_sync_height(kind: &'static str, height: u64) {
    gauge!("sync_height", "kind" => kind).set(height as f64);
}

/// Publish the current backward mode.
pub fn set_bulk_mode(bulk: bool) {
    gauge!("sync_bulk_mode").set(if bulk { 1.0 } else { 0.0 });
}

/// A timer that records the tick duration when dropped.
pub struct TickTimer {
    start: Instant,
}

impl TickTimer {
    /// Start a new tick timer.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for TickTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TickTimer {
    fn drop(&mut self) {
        histogram!("sync_tick_duration_seconds").record(self.start.elapsed().as_secs_f64());
    }
}
