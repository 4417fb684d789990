//! Catalog metrics.
//!
//! Counters for partition publishing and combination. The crate only emits
//! through the `metrics` facade; installing a recorder/exporter is up to the
//! host application.

use metrics::{counter, describe_counter};

// ============================================================================
// Partition Store Metrics
// ============================================================================

/// Partitions published (new manifest written).
pub const PARTITION_WRITES: &str = "tessera_partition_writes_total";

/// Writes skipped because the content fingerprint was unchanged.
pub const PARTITION_WRITES_UNCHANGED: &str = "tessera_partition_writes_unchanged_total";

/// Data objects removed by prune.
pub const PARTITION_OBJECTS_PRUNED: &str = "tessera_partition_objects_pruned_total";

// ============================================================================
// Combine Metrics
// ============================================================================

/// Rows emitted by combination.
pub const COMBINE_ROWS: &str = "tessera_combine_rows_total";

// ============================================================================
// Metric Registration
// ============================================================================

/// Registers all catalog metric descriptions.
///
/// Call this once at application startup after initializing the metrics recorder.
pub fn register_metrics() {
    describe_counter!(PARTITION_WRITES, "Total partitions published");
    describe_counter!(
        PARTITION_WRITES_UNCHANGED,
        "Total partition writes skipped because content was unchanged"
    );
    describe_counter!(PARTITION_OBJECTS_PRUNED, "Total unreferenced data objects deleted");
    describe_counter!(COMBINE_ROWS, "Total rows produced by combination");
}

/// Records a published partition.
pub fn record_partition_write(dataset: &str) {
    counter!(PARTITION_WRITES, "dataset" => dataset.to_string()).increment(1);
}

/// Records a write that found identical content already published.
pub fn record_partition_unchanged(dataset: &str) {
    counter!(PARTITION_WRITES_UNCHANGED, "dataset" => dataset.to_string()).increment(1);
}

/// Records pruned data objects.
pub fn record_pruned(dataset: &str, objects: u64) {
    counter!(PARTITION_OBJECTS_PRUNED, "dataset" => dataset.to_string()).increment(objects);
}

/// Records rows emitted by one combination.
pub fn record_combine_rows(rows: u64) {
    counter!(COMBINE_ROWS).increment(rows);
}
