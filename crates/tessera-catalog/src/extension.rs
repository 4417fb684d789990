//! Appending derived columns to an already combined month.
//!
//! Downstream stages (imputation, feature generation) compute a few columns
//! per row. Rather than recombining every source, their output is merged
//! into the stored combined dataset by row identity.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::column::{Column, ColumnarPartition};
use crate::dataset::CombinedDataset;
use crate::error::{CatalogError, Result};
use crate::fingerprint::{fingerprint_partition, Fingerprint};

/// How extension columns that already exist in the base are handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapMode {
    /// An existing column name is a schema conflict; existing data is never touched.
    #[default]
    Reject,
    /// The extension's values replace the existing column in place.
    Overwrite,
}

/// Columns to merge into a combined dataset, with their provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnExtension {
    /// Identity columns plus the new value columns.
    pub partition: ColumnarPartition,
    /// Fingerprints to merge into the result's provenance.
    pub provenance: BTreeMap<String, Fingerprint>,
}

impl ColumnExtension {
    /// An extension produced by a named stage; provenance is the stage name
    /// mapped to the fingerprint of the produced columns.
    pub fn from_stage(stage: impl Into<String>, partition: ColumnarPartition) -> Self {
        let fingerprint = fingerprint_partition(&partition);
        Self {
            partition,
            provenance: BTreeMap::from([(stage.into(), fingerprint)]),
        }
    }

    /// An extension taken from another combined dataset.
    #[must_use]
    pub fn from_combined(dataset: CombinedDataset) -> Self {
        Self {
            partition: dataset.partition,
            provenance: dataset.contributing_fingerprints,
        }
    }
}

/// Merges new columns into existing combined datasets.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtensionManager {
    mode: OverlapMode,
}

impl ExtensionManager {
    /// Creates a manager with the given overlap handling.
    #[must_use]
    pub const fn new(mode: OverlapMode) -> Self {
        Self { mode }
    }

    /// Merges `extension` into `existing`.
    ///
    /// Rows and existing columns of `existing` keep their order and values;
    /// new columns are appended, null for rows the extension does not cover.
    /// The provenance of the result is the union of both inputs; on a shared
    /// name the extension's fingerprint wins.
    ///
    /// # Errors
    ///
    /// - `RowMismatch` if the extension has a row identity `existing` lacks,
    ///   or the two disagree on whether rows carry a date.
    /// - `SchemaConflict` if a new column already exists (in `Reject` mode)
    ///   or changes type (in `Overwrite` mode).
    #[tracing::instrument(skip_all, fields(month = %existing.key, mode = ?self.mode))]
    pub fn extend(
        &self,
        existing: &CombinedDataset,
        extension: ColumnExtension,
    ) -> Result<CombinedDataset> {
        let base = &existing.partition;
        let incoming = &extension.partition;
        if base.is_static() != incoming.is_static() {
            return Err(CatalogError::mismatch(
                "extension and base disagree on whether rows carry a date",
            ));
        }

        let base_rows: HashMap<_, usize> = base
            .row_ids()
            .into_iter()
            .enumerate()
            .map(|(row, id)| (id, row))
            .collect();

        // For each base row, the extension row that fills it.
        let mut fill: Vec<Option<usize>> = vec![None; base.num_rows()];
        for (row, id) in incoming.row_ids().into_iter().enumerate() {
            let Some(&target) = base_rows.get(&id) else {
                return Err(CatalogError::mismatch(format!(
                    "extension row {id} does not exist in combined {}",
                    existing.key
                )));
            };
            fill[target] = Some(row);
        }

        let mut columns: Vec<Column> = base.columns().to_vec();
        let mut added = 0;
        for column in incoming.value_columns() {
            let aligned = Column::new(column.name(), column.data().gather(&fill));
            match columns.iter().position(|c| c.name() == column.name()) {
                None => {
                    columns.push(aligned);
                    added += 1;
                }
                Some(_) if self.mode == OverlapMode::Reject => {
                    return Err(CatalogError::conflict(format!(
                        "column '{}' already exists in combined {}",
                        column.name(),
                        existing.key
                    )));
                }
                Some(idx) => {
                    if columns[idx].column_type() != column.column_type() {
                        return Err(CatalogError::conflict(format!(
                            "column '{}' would change type from {} to {}",
                            column.name(),
                            columns[idx].column_type(),
                            column.column_type()
                        )));
                    }
                    columns[idx] = aligned;
                }
            }
        }

        let mut provenance = existing.contributing_fingerprints.clone();
        provenance.extend(extension.provenance);

        let partition = ColumnarPartition::new(columns)?;
        tracing::debug!(added, rows = partition.num_rows(), "extended combined dataset");
        Ok(CombinedDataset::new(existing.key, partition, provenance))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::ColumnData;
    use chrono::NaiveDate;
    use tessera_core::PartitionKey;

    fn key() -> PartitionKey {
        PartitionKey::new(2024, 3).unwrap()
    }

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
    }

    fn existing() -> CombinedDataset {
        let partition = ColumnarPartition::new(vec![
            Column::grid_ids(["g1", "g1", "g2"]),
            Column::dates([d(1), d(2), d(1)]),
            Column::numeric("aod", vec![Some(0.1), None, Some(0.3)]),
        ])
        .unwrap();
        let fp = fingerprint_partition(&partition);
        CombinedDataset::new(key(), partition, BTreeMap::from([("aod".to_string(), fp)]))
    }

    fn features(rows: &[(&str, u32, f64)], column: &str) -> ColumnarPartition {
        ColumnarPartition::new(vec![
            Column::grid_ids(rows.iter().map(|r| r.0)),
            Column::dates(rows.iter().map(|r| d(r.1))),
            Column::numeric(column, rows.iter().map(|r| Some(r.2)).collect()),
        ])
        .unwrap()
    }

    #[test]
    fn appends_by_identity_and_preserves_existing() {
        let base = existing();
        // Subset, in a different order than the base.
        let ext = ColumnExtension::from_stage(
            "features",
            features(&[("g2", 1, 3.0), ("g1", 1, 1.0)], "aod_ma3"),
        );

        let out = ExtensionManager::default().extend(&base, ext).unwrap();

        assert_eq!(&out.partition.columns()[..3], base.partition.columns());
        assert_eq!(
            out.partition.column("aod_ma3").unwrap().data(),
            &ColumnData::Numeric(vec![Some(1.0), None, Some(3.0)])
        );
        assert_eq!(
            out.contributing_fingerprints.keys().collect::<Vec<_>>(),
            vec!["aod", "features"]
        );
    }

    #[test]
    fn unknown_row_is_mismatch() {
        let ext = ColumnExtension::from_stage("features", features(&[("g9", 1, 1.0)], "x"));
        let err = ExtensionManager::default().extend(&existing(), ext).unwrap_err();
        assert!(matches!(err, CatalogError::RowMismatch { .. }));
    }

    #[test]
    fn existing_column_rejected_by_default() {
        let ext = ColumnExtension::from_stage("impute", features(&[("g1", 2, 0.2)], "aod"));
        let err = ExtensionManager::default().extend(&existing(), ext).unwrap_err();
        assert!(matches!(err, CatalogError::SchemaConflict { .. }));
    }

    #[test]
    fn overwrite_replaces_in_place() {
        let ext = ColumnExtension::from_stage(
            "impute",
            features(&[("g1", 1, 0.1), ("g1", 2, 0.2), ("g2", 1, 0.3)], "aod"),
        );
        let out = ExtensionManager::new(OverlapMode::Overwrite)
            .extend(&existing(), ext)
            .unwrap();

        assert_eq!(out.partition.columns().len(), 3);
        assert_eq!(
            out.partition.column("aod").unwrap().data(),
            &ColumnData::Numeric(vec![Some(0.1), Some(0.2), Some(0.3)])
        );
        assert_eq!(out.partition.row_ids(), existing().partition.row_ids());
    }

    #[test]
    fn static_extension_of_daily_base_is_mismatch() {
        let ext = ColumnExtension::from_stage(
            "grid",
            ColumnarPartition::new(vec![Column::grid_ids(["g1"])]).unwrap(),
        );
        let err = ExtensionManager::default().extend(&existing(), ext).unwrap_err();
        assert!(matches!(err, CatalogError::RowMismatch { .. }));
    }
}
