//! Column-oriented monthly partitions.
//!
//! A [`ColumnarPartition`] is an ordered list of equally long, named, typed
//! columns. Every partition carries a `grid_id` identifier column; partitions
//! of time-varying sources also carry a `date` column. The pair
//! `(grid_id, date)` (or `grid_id` alone for date-invariant sources) is the
//! row identity and is unique within a partition.
//!
//! Partitions are immutable values: operations that "change" a partition
//! build a new one.

use std::collections::HashSet;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{CatalogError, Result};

/// Name of the grid cell identity column.
pub const GRID_ID: &str = "grid_id";

/// Name of the observation date identity column.
pub const DATE: &str = "date";

/// Returns true if `name` is one of the row identity columns.
#[must_use]
pub fn is_identity_column(name: &str) -> bool {
    name == GRID_ID || name == DATE
}

/// Semantic type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    /// 64-bit floating point measurement.
    Numeric,
    /// Free-form label drawn from a small vocabulary.
    Categorical,
    /// Calendar date.
    Date,
    /// Opaque identifier (grid cell, station).
    Identifier,
}

impl ColumnType {
    /// Stable lowercase label, used in Parquet field metadata and fingerprints.
    #[must_use]
    pub const fn as_label(self) -> &'static str {
        match self {
            Self::Numeric => "numeric",
            Self::Categorical => "categorical",
            Self::Date => "date",
            Self::Identifier => "identifier",
        }
    }

    /// Parses a label produced by [`ColumnType::as_label`].
    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "numeric" => Some(Self::Numeric),
            "categorical" => Some(Self::Categorical),
            "date" => Some(Self::Date),
            "identifier" => Some(Self::Identifier),
            _ => None,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Typed, nullable values of one column.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    /// Numeric values.
    Numeric(Vec<Option<f64>>),
    /// Categorical values.
    Categorical(Vec<Option<String>>),
    /// Date values.
    Date(Vec<Option<NaiveDate>>),
    /// Identifier values.
    Identifier(Vec<Option<String>>),
}

impl ColumnData {
    /// The semantic type of the values.
    #[must_use]
    pub const fn column_type(&self) -> ColumnType {
        match self {
            Self::Numeric(_) => ColumnType::Numeric,
            Self::Categorical(_) => ColumnType::Categorical,
            Self::Date(_) => ColumnType::Date,
            Self::Identifier(_) => ColumnType::Identifier,
        }
    }

    /// Number of values.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Numeric(v) => v.len(),
            Self::Categorical(v) | Self::Identifier(v) => v.len(),
            Self::Date(v) => v.len(),
        }
    }

    /// Returns true if the column has no values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if the value at `row` is null (or out of range).
    #[must_use]
    pub fn is_null(&self, row: usize) -> bool {
        match self {
            Self::Numeric(v) => v.get(row).map_or(true, Option::is_none),
            Self::Categorical(v) | Self::Identifier(v) => v.get(row).map_or(true, Option::is_none),
            Self::Date(v) => v.get(row).map_or(true, Option::is_none),
        }
    }

    /// An all-null column of the given type.
    #[must_use]
    pub fn nulls(column_type: ColumnType, len: usize) -> Self {
        match column_type {
            ColumnType::Numeric => Self::Numeric(vec![None; len]),
            ColumnType::Categorical => Self::Categorical(vec![None; len]),
            ColumnType::Date => Self::Date(vec![None; len]),
            ColumnType::Identifier => Self::Identifier(vec![None; len]),
        }
    }

    /// Builds a new column by picking rows by index; `None` produces a null.
    #[must_use]
    pub fn gather(&self, indices: &[Option<usize>]) -> Self {
        fn pick<T: Clone>(values: &[Option<T>], indices: &[Option<usize>]) -> Vec<Option<T>> {
            indices
                .iter()
                .map(|idx| idx.and_then(|i| values.get(i).cloned().flatten()))
                .collect()
        }

        match self {
            Self::Numeric(v) => Self::Numeric(pick(v, indices)),
            Self::Categorical(v) => Self::Categorical(pick(v, indices)),
            Self::Date(v) => Self::Date(pick(v, indices)),
            Self::Identifier(v) => Self::Identifier(pick(v, indices)),
        }
    }
}

/// A named column.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    name: String,
    data: ColumnData,
}

impl Column {
    /// Creates a column from typed data.
    pub fn new(name: impl Into<String>, data: ColumnData) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    /// A numeric column.
    pub fn numeric(name: impl Into<String>, values: Vec<Option<f64>>) -> Self {
        Self::new(name, ColumnData::Numeric(values))
    }

    /// A categorical column.
    pub fn categorical<S: Into<String>>(
        name: impl Into<String>,
        values: impl IntoIterator<Item = Option<S>>,
    ) -> Self {
        Self::new(
            name,
            ColumnData::Categorical(values.into_iter().map(|v| v.map(Into::into)).collect()),
        )
    }

    /// A date column.
    pub fn date(name: impl Into<String>, values: Vec<Option<NaiveDate>>) -> Self {
        Self::new(name, ColumnData::Date(values))
    }

    /// An identifier column.
    pub fn identifier<S: Into<String>>(
        name: impl Into<String>,
        values: impl IntoIterator<Item = Option<S>>,
    ) -> Self {
        Self::new(
            name,
            ColumnData::Identifier(values.into_iter().map(|v| v.map(Into::into)).collect()),
        )
    }

    /// The `grid_id` identity column from non-null ids.
    pub fn grid_ids<S: Into<String>>(ids: impl IntoIterator<Item = S>) -> Self {
        Self::identifier(GRID_ID, ids.into_iter().map(Some))
    }

    /// The `date` identity column from non-null dates.
    pub fn dates(dates: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self::date(DATE, dates.into_iter().map(Some).collect())
    }

    /// Column name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Column values.
    #[must_use]
    pub const fn data(&self) -> &ColumnData {
        &self.data
    }

    /// Semantic type.
    #[must_use]
    pub const fn column_type(&self) -> ColumnType {
        self.data.column_type()
    }

    /// Number of values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the column has no values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns the same values under a different name.
    #[must_use]
    pub fn renamed(self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: self.data,
        }
    }
}

/// Name and type of one column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// Semantic type.
    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

/// Ordered column definitions of a partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    columns: Vec<ColumnDef>,
}

impl Schema {
    /// Column definitions in partition order.
    #[must_use]
    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    /// Looks up a column definition by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Column names in partition order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}

/// The identity of one row: grid cell plus date (absent for static rows).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowId {
    /// Grid cell identifier.
    pub grid_id: String,
    /// Observation date; `None` for date-invariant partitions.
    pub date: Option<NaiveDate>,
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.date {
            Some(date) => write!(f, "({}, {date})", self.grid_id),
            None => write!(f, "({})", self.grid_id),
        }
    }
}

/// An immutable, validated set of equally long named columns.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnarPartition {
    columns: Vec<Column>,
    num_rows: usize,
}

impl ColumnarPartition {
    /// Validates and builds a partition.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` if column lengths differ, a name repeats, or the
    ///   `grid_id` column is missing or has the wrong type.
    /// - `RowMismatch` if an identity value is null or a row identity repeats.
    pub fn new(columns: Vec<Column>) -> Result<Self> {
        let num_rows = columns.first().map_or(0, Column::len);

        let mut names = HashSet::with_capacity(columns.len());
        for column in &columns {
            if column.name.is_empty() {
                return Err(CatalogError::invalid("column name cannot be empty"));
            }
            if !names.insert(column.name.as_str()) {
                return Err(CatalogError::invalid(format!(
                    "duplicate column '{}'",
                    column.name
                )));
            }
            if column.len() != num_rows {
                return Err(CatalogError::invalid(format!(
                    "column '{}' has {} values, expected {num_rows}",
                    column.name,
                    column.len()
                )));
            }
        }

        let partition = Self { columns, num_rows };
        match partition.column(GRID_ID).map(Column::data) {
            Some(ColumnData::Identifier(_)) => {}
            Some(other) => {
                return Err(CatalogError::invalid(format!(
                    "'{GRID_ID}' must be an identifier column, found {}",
                    other.column_type()
                )))
            }
            None => return Err(CatalogError::invalid(format!("missing '{GRID_ID}' column"))),
        }
        match partition.column(DATE).map(Column::data) {
            None | Some(ColumnData::Date(_)) => {}
            Some(other) => {
                return Err(CatalogError::invalid(format!(
                    "'{DATE}' must be a date column, found {}",
                    other.column_type()
                )))
            }
        }

        let ids = partition.try_row_ids()?;
        let mut seen = HashSet::with_capacity(ids.len());
        for id in &ids {
            if !seen.insert(id) {
                return Err(CatalogError::mismatch(format!("duplicate row identity {id}")));
            }
        }

        Ok(partition)
    }

    /// Number of rows.
    #[must_use]
    pub const fn num_rows(&self) -> usize {
        self.num_rows
    }

    /// All columns in order.
    #[must_use]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Consumes the partition, returning its columns.
    #[must_use]
    pub fn into_columns(self) -> Vec<Column> {
        self.columns
    }

    /// Looks up a column by name.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Columns other than the row identity columns, in order.
    pub fn value_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| !is_identity_column(&c.name))
    }

    /// Column names and types in order.
    #[must_use]
    pub fn schema(&self) -> Schema {
        Schema {
            columns: self
                .columns
                .iter()
                .map(|c| ColumnDef {
                    name: c.name.clone(),
                    column_type: c.column_type(),
                })
                .collect(),
        }
    }

    /// Returns true if the partition has no `date` column (date-invariant).
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.column(DATE).is_none()
    }

    /// Row identities in row order.
    #[must_use]
    pub fn row_ids(&self) -> Vec<RowId> {
        // Validated at construction, so identity columns are present and non-null.
        self.try_row_ids().unwrap_or_default()
    }

    /// Dates referenced by the partition, if it is time-varying.
    pub fn dates(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        let values: &[Option<NaiveDate>] = match self.column(DATE).map(Column::data) {
            Some(ColumnData::Date(v)) => v,
            _ => &[],
        };
        values.iter().flatten().copied()
    }

    fn try_row_ids(&self) -> Result<Vec<RowId>> {
        let Some(ColumnData::Identifier(grid)) = self.column(GRID_ID).map(Column::data) else {
            return Err(CatalogError::invalid(format!("missing '{GRID_ID}' column")));
        };
        let dates = match self.column(DATE).map(Column::data) {
            Some(ColumnData::Date(d)) => Some(d),
            _ => None,
        };

        grid.iter()
            .enumerate()
            .map(|(row, id)| {
                let grid_id = id
                    .clone()
                    .ok_or_else(|| CatalogError::mismatch(format!("null '{GRID_ID}' at row {row}")))?;
                let date = match dates {
                    Some(d) => Some(d[row].ok_or_else(|| {
                        CatalogError::mismatch(format!("null '{DATE}' at row {row}"))
                    })?),
                    None => None,
                };
                Ok(RowId { grid_id, date })
            })
            .collect()
    }
}
