//! Row-aligned combination of several source partitions for one month.
//!
//! The output row set is the full outer join of every time-varying source on
//! `(grid_id, date)`, sorted by that identity. Each source contributes its
//! value columns; rows a source lacks are null. Static sources (no `date`
//! column) are joined on `grid_id` alone, so their single row per cell is
//! repeated on every date of that cell.
//!
//! Output column order is `grid_id`, `date`, then each source in name order
//! with its columns in native order. Because sources are keyed by name and
//! rows are sorted, the output does not depend on the order sources were
//! supplied in.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tessera_core::PartitionKey;

use crate::column::{Column, ColumnarPartition, RowId, DATE, GRID_ID};
use crate::config::{CombineConfig, OverlapPolicy, SourceKind, SourceSpec};
use crate::dataset::CombinedDataset;
use crate::error::{CatalogError, Result};
use crate::fingerprint::fingerprint_partition;
use crate::metrics;

/// One output value column and where it comes from.
#[derive(Debug, Clone)]
struct PlannedColumn {
    source: String,
    input: String,
    output: String,
}

/// Combines source partitions according to a [`CombineConfig`].
///
/// Sources absent from the config are combined with default policies
/// (reject overlaps, keep column names).
#[derive(Debug, Clone, Default)]
pub struct CombineEngine {
    config: CombineConfig,
}

impl CombineEngine {
    /// Creates an engine.
    #[must_use]
    pub const fn new(config: CombineConfig) -> Self {
        Self { config }
    }

    /// The engine configuration.
    #[must_use]
    pub const fn config(&self) -> &CombineConfig {
        &self.config
    }

    fn spec(&self, name: &str) -> SourceSpec {
        self.config
            .source(name)
            .cloned()
            .unwrap_or_else(|| SourceSpec::time_varying(name))
    }

    /// Combines the given sources for `key`.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` if no sources are given, a name repeats, or no
    ///   source is time-varying.
    /// - `SchemaConflict` for undeclared column overlaps, or a source whose
    ///   shape contradicts its configured kind.
    pub fn combine(
        &self,
        key: PartitionKey,
        sources: impl IntoIterator<Item = (String, ColumnarPartition)>,
    ) -> Result<CombinedDataset> {
        let mut by_name = BTreeMap::new();
        for (name, partition) in sources {
            if by_name.insert(name.clone(), partition).is_some() {
                return Err(CatalogError::invalid(format!("source '{name}' given twice")));
            }
        }
        if by_name.is_empty() {
            return Err(CatalogError::invalid(format!("nothing to combine for {key}")));
        }
        self.check_shapes(&by_name)?;
        let plan = self.plan(&by_name)?;

        if by_name.values().all(ColumnarPartition::is_static) {
            return Err(CatalogError::invalid(format!(
                "combining {key} needs at least one time-varying source"
            )));
        }

        // Static rows without a time-varying match have no date and are dropped.
        let identities: Vec<RowId> = by_name
            .values()
            .filter(|p| !p.is_static())
            .flat_map(ColumnarPartition::row_ids)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut gather: BTreeMap<&str, Vec<Option<usize>>> = BTreeMap::new();
        for (name, partition) in &by_name {
            let lookup: HashMap<RowId, usize> = partition
                .row_ids()
                .into_iter()
                .enumerate()
                .map(|(row, id)| (id, row))
                .collect();
            let is_static = partition.is_static();
            let indices = identities
                .iter()
                .map(|id| {
                    if is_static {
                        lookup
                            .get(&RowId {
                                grid_id: id.grid_id.clone(),
                                date: None,
                            })
                            .copied()
                    } else {
                        lookup.get(id).copied()
                    }
                })
                .collect();
            gather.insert(name.as_str(), indices);
        }

        let mut columns = Vec::with_capacity(plan.len() + 2);
        columns.push(Column::grid_ids(identities.iter().map(|id| id.grid_id.clone())));
        columns.push(Column::dates(identities.iter().filter_map(|id| id.date)));
        for planned in &plan {
            let source = &by_name[&planned.source];
            let indices = &gather[planned.source.as_str()];
            let data = source
                .column(&planned.input)
                .map(|c| c.data().gather(indices))
                .ok_or_else(|| {
                    CatalogError::conflict(format!(
                        "column '{}' vanished from source '{}'",
                        planned.input, planned.source
                    ))
                })?;
            columns.push(Column::new(planned.output.clone(), data));
        }

        let partition = ColumnarPartition::new(columns)?;
        let contributing_fingerprints = by_name
            .iter()
            .map(|(name, p)| (name.clone(), fingerprint_partition(p)))
            .collect();

        tracing::info!(
            month = %key,
            sources = by_name.len(),
            rows = partition.num_rows(),
            columns = partition.columns().len(),
            "combined sources"
        );
        metrics::record_combine_rows(partition.num_rows() as u64);

        Ok(CombinedDataset::new(key, partition, contributing_fingerprints))
    }

    /// The columns a combination of `sources` is expected to produce.
    ///
    /// # Errors
    ///
    /// Returns `SchemaConflict` if the sources cannot be combined.
    pub fn expected_columns(
        &self,
        sources: &BTreeMap<String, ColumnarPartition>,
    ) -> Result<Vec<String>> {
        let mut names = vec![GRID_ID.to_string(), DATE.to_string()];
        names.extend(self.plan(sources)?.into_iter().map(|c| c.output));
        Ok(names)
    }

    /// Checks a combined month against expected columns and the configured
    /// grid size.
    ///
    /// # Errors
    ///
    /// Returns `Validation` describing the first failed check.
    pub fn validate(&self, combined: &CombinedDataset, expected_columns: &[String]) -> Result<()> {
        validate_combined(combined, expected_columns, self.config.expected_grid_cells)
    }

    fn check_shapes(&self, sources: &BTreeMap<String, ColumnarPartition>) -> Result<()> {
        for (name, partition) in sources {
            let Some(spec) = self.config.source(name) else {
                continue;
            };
            match (spec.kind, partition.is_static()) {
                (SourceKind::Static, false) => {
                    return Err(CatalogError::conflict(format!(
                        "static source '{name}' has a '{DATE}' column"
                    )))
                }
                (SourceKind::TimeVarying, true) => {
                    return Err(CatalogError::conflict(format!(
                        "time-varying source '{name}' has no '{DATE}' column"
                    )))
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn plan(&self, sources: &BTreeMap<String, ColumnarPartition>) -> Result<Vec<PlannedColumn>> {
        let mut planned = Vec::new();
        for (name, partition) in sources {
            let spec = self.spec(name);
            for column in partition.value_columns() {
                planned.push((
                    spec.overlap,
                    PlannedColumn {
                        source: name.clone(),
                        input: column.name().to_string(),
                        output: spec.output_column(column.name()),
                    },
                ));
            }
        }

        let mut owners: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (idx, (_, column)) in planned.iter().enumerate() {
            owners.entry(column.output.as_str()).or_default().push(idx);
        }

        let mut dropped = BTreeSet::new();
        for (output, idxs) in owners.iter().filter(|(_, idxs)| idxs.len() > 1) {
            let overriding: Vec<usize> = idxs
                .iter()
                .copied()
                .filter(|&i| planned[i].0 == OverlapPolicy::Override)
                .collect();
            if overriding.len() != 1 {
                let names: Vec<&str> = idxs.iter().map(|&i| planned[i].1.source.as_str()).collect();
                return Err(CatalogError::conflict(format!(
                    "column '{output}' is provided by sources {names:?}; declare exactly one as overriding"
                )));
            }
            dropped.extend(idxs.iter().copied().filter(|i| *i != overriding[0]));
        }

        Ok(planned
            .into_iter()
            .enumerate()
            .filter(|(idx, _)| !dropped.contains(idx))
            .map(|(_, (_, column))| column)
            .collect())
    }
}

/// Checks that a combined month has every expected column and, when
/// `expected_grid_cells` is set, exactly `cells x days_in_month` rows.
///
/// # Errors
///
/// Returns `Validation` describing the first failed check.
pub fn validate_combined(
    combined: &CombinedDataset,
    expected_columns: &[String],
    expected_grid_cells: Option<usize>,
) -> Result<()> {
    let schema = combined.partition.schema();
    if let Some(missing) = expected_columns.iter().find(|c| schema.get(c).is_none()) {
        return Err(CatalogError::Validation {
            message: format!("combined {} is missing column '{missing}'", combined.key),
        });
    }

    if let Some(cells) = expected_grid_cells {
        let expected = cells * combined.key.days_in_month() as usize;
        let actual = combined.partition.num_rows();
        if actual != expected {
            return Err(CatalogError::Validation {
                message: format!(
                    "combined {} has {actual} rows, expected {expected} ({cells} cells x {} days)",
                    combined.key,
                    combined.key.days_in_month()
                ),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::ColumnData;
    use chrono::NaiveDate;

    fn key() -> PartitionKey {
        PartitionKey::new(2024, 3).unwrap()
    }

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
    }

    fn tv(cells: &[&str], column: &str, value: f64) -> ColumnarPartition {
        ColumnarPartition::new(vec![
            Column::grid_ids(cells.iter().copied()),
            Column::dates(cells.iter().map(|_| d(1))),
            Column::numeric(column, vec![Some(value); cells.len()]),
        ])
        .unwrap()
    }

    fn numeric<'a>(combined: &'a CombinedDataset, name: &str) -> &'a [Option<f64>] {
        match combined.partition.column(name).unwrap().data() {
            ColumnData::Numeric(v) => v.as_slice(),
            other => panic!("expected numeric, got {other:?}"),
        }
    }

    #[test]
    fn outer_join_fills_nulls() {
        let engine = CombineEngine::default();
        let combined = engine
            .combine(
                key(),
                [
                    ("a".to_string(), tv(&["g1", "g2"], "x", 1.0)),
                    ("b".to_string(), tv(&["g2", "g3"], "y", 2.0)),
                ],
            )
            .unwrap();

        assert_eq!(combined.partition.num_rows(), 3);
        assert_eq!(numeric(&combined, "x"), &[Some(1.0), Some(1.0), None]);
        assert_eq!(numeric(&combined, "y"), &[None, Some(2.0), Some(2.0)]);
        assert_eq!(combined.contributing_fingerprints.len(), 2);
    }

    #[test]
    fn undeclared_overlap_is_schema_conflict() {
        let engine = CombineEngine::default();
        let err = engine
            .combine(
                key(),
                [
                    ("a".to_string(), tv(&["g1"], "x", 1.0)),
                    ("b".to_string(), tv(&["g1"], "x", 2.0)),
                ],
            )
            .unwrap_err();
        assert!(matches!(err, CatalogError::SchemaConflict { .. }));
    }

    #[test]
    fn overriding_source_replaces_column() {
        let engine = CombineEngine::new(CombineConfig::new(vec![
            SourceSpec::time_varying("a"),
            SourceSpec::time_varying("b").with_overlap(OverlapPolicy::Override),
        ]));
        let combined = engine
            .combine(
                key(),
                [
                    ("a".to_string(), tv(&["g1", "g2"], "x", 1.0)),
                    ("b".to_string(), tv(&["g1"], "x", 2.0)),
                ],
            )
            .unwrap();
        assert_eq!(numeric(&combined, "x"), &[Some(2.0), None]);
    }

    #[test]
    fn two_overriders_conflict() {
        let engine = CombineEngine::new(CombineConfig::new(vec![
            SourceSpec::time_varying("a").with_overlap(OverlapPolicy::Override),
            SourceSpec::time_varying("b").with_overlap(OverlapPolicy::Override),
        ]));
        let err = engine
            .combine(
                key(),
                [
                    ("a".to_string(), tv(&["g1"], "x", 1.0)),
                    ("b".to_string(), tv(&["g1"], "x", 2.0)),
                ],
            )
            .unwrap_err();
        assert!(matches!(err, CatalogError::SchemaConflict { .. }));
    }

    #[test]
    fn prefixed_columns_do_not_collide() {
        let engine = CombineEngine::new(CombineConfig::new(vec![
            SourceSpec::time_varying("a").prefixed(),
            SourceSpec::time_varying("b").prefixed(),
        ]));
        let combined = engine
            .combine(
                key(),
                [
                    ("a".to_string(), tv(&["g1"], "x", 1.0)),
                    ("b".to_string(), tv(&["g1"], "x", 2.0)),
                ],
            )
            .unwrap();
        assert_eq!(numeric(&combined, "a__x"), &[Some(1.0)]);
        assert_eq!(numeric(&combined, "b__x"), &[Some(2.0)]);
    }

    #[test]
    fn static_only_is_invalid() {
        let grid = ColumnarPartition::new(vec![Column::grid_ids(["g1"])]).unwrap();
        let err = CombineEngine::default()
            .combine(key(), [("grid".to_string(), grid)])
            .unwrap_err();
        assert!(matches!(err, CatalogError::InvalidInput { .. }));
    }

    #[test]
    fn configured_kind_must_match_shape() {
        let engine = CombineEngine::new(CombineConfig::new(vec![SourceSpec::static_source("grid")]));
        let err = engine
            .combine(key(), [("grid".to_string(), tv(&["g1"], "x", 1.0))])
            .unwrap_err();
        assert!(matches!(err, CatalogError::SchemaConflict { .. }));
    }

    #[test]
    fn validation_checks_columns_and_rows() {
        let engine = CombineEngine::new(CombineConfig::default().with_expected_grid_cells(2));
        let sources = BTreeMap::from([("a".to_string(), tv(&["g1", "g2"], "x", 1.0))]);
        let combined = engine.combine(key(), sources.clone()).unwrap();
        let expected = engine.expected_columns(&sources).unwrap();
        assert_eq!(expected, vec!["grid_id", "date", "x"]);

        // Two cells on one day of a 31-day month.
        let err = engine.validate(&combined, &expected).unwrap_err();
        assert!(matches!(err, CatalogError::Validation { .. }));

        let err = validate_combined(&combined, &["missing".to_string()], None).unwrap_err();
        assert!(matches!(err, CatalogError::Validation { .. }));
        assert!(validate_combined(&combined, &expected, None).is_ok());
    }
}
