//! Content fingerprints of columnar partitions.
//!
//! A fingerprint digests the *logical* content of a partition, not its file
//! bytes: Parquet encoders are free to reorder pages or change compression
//! without changing what the data means.
//!
//! The canonical encoding hashed by SHA-256 is:
//!
//! 1. A version tag.
//! 2. The columns sorted by name, each with its semantic type.
//! 3. The row count.
//! 4. For each column (same order), the values of every row with rows
//!    ordered by row identity. Each value is tagged null or present;
//!    floats are hashed by bit pattern with `-0.0` folded into `0.0` and
//!    every NaN folded into one canonical NaN.
//!
//! Column order and row order in the source therefore do not affect the
//! result.

use std::fmt;

use chrono::Datelike;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::column::{ColumnData, ColumnarPartition};

/// Version tag mixed into every fingerprint. Bump if the encoding changes.
const ENCODING_VERSION: &[u8] = b"tessera-fingerprint-v1";

/// Prefix naming the digest algorithm.
const ALGORITHM_PREFIX: &str = "sha256:";

/// A deterministic content digest, rendered as `sha256:<hex>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wraps an existing `sha256:<hex>` string.
    ///
    /// Returns `None` if the string is not in that form.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let hex = value.strip_prefix(ALGORITHM_PREFIX)?;
        (hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()))
            .then(|| Self(value.to_string()))
    }

    /// The full `sha256:<hex>` form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The hex digest without the algorithm prefix; used in object names.
    #[must_use]
    pub fn hex(&self) -> &str {
        self.0.strip_prefix(ALGORITHM_PREFIX).unwrap_or(&self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn put_len(hasher: &mut Sha256, len: usize) {
    hasher.update((len as u64).to_le_bytes());
}

fn put_str(hasher: &mut Sha256, value: &str) {
    put_len(hasher, value.len());
    hasher.update(value.as_bytes());
}

fn canonical_f64_bits(value: f64) -> u64 {
    if value.is_nan() {
        f64::NAN.to_bits()
    } else if value == 0.0 {
        0.0_f64.to_bits()
    } else {
        value.to_bits()
    }
}

fn put_value<T>(hasher: &mut Sha256, value: Option<&T>, encode: impl FnOnce(&mut Sha256, &T)) {
    match value {
        None => hasher.update([0_u8]),
        Some(v) => {
            hasher.update([1_u8]);
            encode(hasher, v);
        }
    }
}

/// Computes the fingerprint of a partition's logical content.
#[must_use]
pub fn fingerprint_partition(partition: &ColumnarPartition) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(ENCODING_VERSION);

    let mut columns: Vec<_> = partition.columns().iter().collect();
    columns.sort_by(|a, b| a.name().cmp(b.name()));

    put_len(&mut hasher, columns.len());
    for column in &columns {
        put_str(&mut hasher, column.name());
        put_str(&mut hasher, column.column_type().as_label());
    }

    let ids = partition.row_ids();
    let mut order: Vec<usize> = (0..ids.len()).collect();
    order.sort_by(|&a, &b| ids[a].cmp(&ids[b]));
    put_len(&mut hasher, order.len());

    for column in &columns {
        match column.data() {
            ColumnData::Numeric(values) => {
                for &row in &order {
                    put_value(&mut hasher, values[row].as_ref(), |h, v| {
                        h.update(canonical_f64_bits(*v).to_le_bytes());
                    });
                }
            }
            ColumnData::Categorical(values) | ColumnData::Identifier(values) => {
                for &row in &order {
                    put_value(&mut hasher, values[row].as_ref(), |h, v| put_str(h, v));
                }
            }
            ColumnData::Date(values) => {
                for &row in &order {
                    put_value(&mut hasher, values[row].as_ref(), |h, v| {
                        h.update(v.num_days_from_ce().to_le_bytes());
                    });
                }
            }
        }
    }

    Fingerprint(format!("{ALGORITHM_PREFIX}{}", hex::encode(hasher.finalize())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::Column;
    use chrono::NaiveDate;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
    }

    fn partition(rows: &[(&str, u32, Option<f64>)]) -> ColumnarPartition {
        ColumnarPartition::new(vec![
            Column::grid_ids(rows.iter().map(|r| r.0)),
            Column::dates(rows.iter().map(|r| d(r.1))),
            Column::numeric("pm25", rows.iter().map(|r| r.2).collect()),
        ])
        .unwrap()
    }

    #[test]
    fn fingerprint_has_expected_shape() {
        let fp = fingerprint_partition(&partition(&[("g1", 1, Some(12.0))]));
        assert!(fp.as_str().starts_with("sha256:"));
        assert_eq!(fp.hex().len(), 64);
        assert_eq!(Fingerprint::parse(fp.as_str()), Some(fp));
    }

    #[test]
    fn row_order_does_not_matter() {
        let a = partition(&[("g1", 1, Some(1.0)), ("g2", 1, None)]);
        let b = partition(&[("g2", 1, None), ("g1", 1, Some(1.0))]);
        assert_eq!(fingerprint_partition(&a), fingerprint_partition(&b));
    }

    #[test]
    fn column_order_does_not_matter() {
        let a = ColumnarPartition::new(vec![
            Column::grid_ids(["g1"]),
            Column::numeric("a", vec![Some(1.0)]),
            Column::numeric("b", vec![Some(2.0)]),
        ])
        .unwrap();
        let b = ColumnarPartition::new(vec![
            Column::numeric("b", vec![Some(2.0)]),
            Column::grid_ids(["g1"]),
            Column::numeric("a", vec![Some(1.0)]),
        ])
        .unwrap();
        assert_eq!(fingerprint_partition(&a), fingerprint_partition(&b));
    }

    #[test]
    fn value_changes_change_fingerprint() {
        let a = partition(&[("g1", 1, Some(1.0))]);
        let b = partition(&[("g1", 1, Some(1.5))]);
        let c = partition(&[("g1", 1, None)]);
        assert_ne!(fingerprint_partition(&a), fingerprint_partition(&b));
        assert_ne!(fingerprint_partition(&a), fingerprint_partition(&c));
    }

    #[test]
    fn signed_zero_and_nan_are_normalized() {
        let pos = partition(&[("g1", 1, Some(0.0))]);
        let neg = partition(&[("g1", 1, Some(-0.0))]);
        assert_eq!(fingerprint_partition(&pos), fingerprint_partition(&neg));

        let nan_a = partition(&[("g1", 1, Some(f64::NAN))]);
        let nan_b = partition(&[("g1", 1, Some(-f64::NAN))]);
        assert_eq!(fingerprint_partition(&nan_a), fingerprint_partition(&nan_b));
    }

    #[test]
    fn column_type_is_part_of_fingerprint() {
        let cat = ColumnarPartition::new(vec![
            Column::grid_ids(["g1"]),
            Column::categorical("x", [Some("a")]),
        ])
        .unwrap();
        let ident = ColumnarPartition::new(vec![
            Column::grid_ids(["g1"]),
            Column::identifier("x", [Some("a")]),
        ])
        .unwrap();
        assert_ne!(fingerprint_partition(&cat), fingerprint_partition(&ident));
    }

    #[test]
    fn parse_rejects_other_forms() {
        assert!(Fingerprint::parse("md5:abc").is_none());
        assert!(Fingerprint::parse("sha256:xyz").is_none());
    }
}
