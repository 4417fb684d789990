//! Pre-built test fixtures for common test scenarios.
//!
//! Provides factory functions to create monthly partitions with sensible defaults.

use std::sync::Arc;

use chrono::NaiveDate;

use tessera_catalog::{
    Column, ColumnarPartition, FingerprintRegistry, PartitionStore, StoreConfig,
};
use tessera_core::PartitionKey;

use crate::storage::TracingMemoryBackend;

/// Test context with a store and registry over one tracing backend.
#[derive(Debug, Clone)]
pub struct TestContext {
    /// Shared storage backend.
    pub storage: Arc<TracingMemoryBackend>,
    /// Partition store under the `test` prefix.
    pub store: PartitionStore,
    /// Registry over the same store.
    pub registry: FingerprintRegistry,
}

impl TestContext {
    /// Creates a new test context over an empty backend.
    pub fn new() -> Self {
        Self::with_backend(TracingMemoryBackend::new())
    }

    /// Creates a context over the given backend.
    pub fn with_backend(backend: TracingMemoryBackend) -> Self {
        let storage = Arc::new(backend);
        let store = PartitionStore::new(storage.clone(), StoreConfig::with_prefix("test"));
        Self {
            storage,
            registry: FingerprintRegistry::new(store.clone()),
            store,
        }
    }

    /// Storage prefix of a dataset in this context.
    pub fn dataset_prefix(&self, dataset: &str) -> String {
        self.store.config().join(&format!("{dataset}/"))
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// A partition key; panics on invalid input.
pub fn month(year: i32, month: u32) -> PartitionKey {
    PartitionKey::new(year, month).expect("valid month")
}

/// A date; panics on invalid input.
pub fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).expect("valid date")
}

/// One row per cell on the first day of `key`, every row holding `value`.
pub fn daily_partition(
    key: PartitionKey,
    cells: &[&str],
    column: &str,
    value: f64,
) -> ColumnarPartition {
    ColumnarPartition::new(vec![
        Column::grid_ids(cells.iter().copied()),
        Column::dates(cells.iter().map(|_| key.first_day())),
        Column::numeric(column, vec![Some(value); cells.len()]),
    ])
    .expect("valid partition")
}

/// A full month: every cell on every day of `key`, valued by `value(cell, day)`.
pub fn full_month_partition(
    key: PartitionKey,
    cells: &[&str],
    column: &str,
    value: impl Fn(usize, u32) -> Option<f64>,
) -> ColumnarPartition {
    let mut ids = Vec::new();
    let mut dates = Vec::new();
    let mut values = Vec::new();
    for (cell_idx, cell) in cells.iter().enumerate() {
        for day in key.dates() {
            ids.push((*cell).to_string());
            dates.push(day);
            values.push(value(cell_idx, chrono::Datelike::day(&day)));
        }
    }
    ColumnarPartition::new(vec![
        Column::grid_ids(ids),
        Column::dates(dates),
        Column::numeric(column, values),
    ])
    .expect("valid partition")
}

/// A date-invariant partition with one categorical column.
pub fn static_partition(cells: &[&str], column: &str, values: &[&str]) -> ColumnarPartition {
    assert_eq!(cells.len(), values.len(), "one value per cell");
    ColumnarPartition::new(vec![
        Column::grid_ids(cells.iter().copied()),
        Column::categorical(column, values.iter().map(|v| Some(*v))),
    ])
    .expect("valid partition")
}
