//! Integration tests for combination and extension semantics.
//!
//! # Properties Tested
//!
//! 1. **Join correctness**: the output row set is the union of source identities
//! 2. **Static broadcast**: date-invariant rows repeat on every date of their cell
//! 3. **Determinism**: input order never changes output rows or fingerprint
//! 4. **Extension preservation**: existing columns and rows are untouched

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use proptest::prelude::*;

use tessera_catalog::{
    Column, ColumnData, ColumnExtension, ColumnarPartition, CombineConfig, CombineEngine,
    ExtensionManager, SourceSpec,
};
use tessera_core::PartitionKey;
use tessera_test_utils::{date, month, static_partition};

fn march() -> PartitionKey {
    month(2024, 3)
}

fn partition(rows: &[(&str, NaiveDate)], column: &str, values: Vec<Option<f64>>) -> ColumnarPartition {
    ColumnarPartition::new(vec![
        Column::grid_ids(rows.iter().map(|r| r.0)),
        Column::dates(rows.iter().map(|r| r.1)),
        Column::numeric(column, values),
    ])
    .unwrap()
}

fn numeric<'a>(p: &'a ColumnarPartition, name: &str) -> &'a [Option<f64>] {
    match p.column(name).expect("column present").data() {
        ColumnData::Numeric(v) => v.as_slice(),
        other => panic!("expected numeric column, got {other:?}"),
    }
}

fn categorical<'a>(p: &'a ColumnarPartition, name: &str) -> &'a [Option<String>] {
    match p.column(name).expect("column present").data() {
        ColumnData::Categorical(v) => v.as_slice(),
        other => panic!("expected categorical column, got {other:?}"),
    }
}

#[test]
fn outer_join_covers_union_of_identities() {
    let d1 = date(2024, 3, 1);
    let a = partition(&[("g1", d1), ("g2", d1)], "a_val", vec![Some(1.0), Some(2.0)]);
    let b = partition(&[("g2", d1), ("g3", d1)], "b_val", vec![Some(20.0), Some(30.0)]);

    let combined = CombineEngine::default()
        .combine(march(), [("a".to_string(), a), ("b".to_string(), b)])
        .unwrap();

    let ids: Vec<String> = combined
        .partition
        .row_ids()
        .into_iter()
        .map(|id| id.grid_id)
        .collect();
    assert_eq!(ids, vec!["g1", "g2", "g3"]);
    assert_eq!(numeric(&combined.partition, "a_val"), &[Some(1.0), Some(2.0), None]);
    assert_eq!(numeric(&combined.partition, "b_val"), &[None, Some(20.0), Some(30.0)]);
}

#[test]
fn static_source_broadcasts_across_dates() {
    let (d1, d2) = (date(2024, 3, 1), date(2024, 3, 2));
    let daily = partition(&[("g1", d1), ("g1", d2)], "aod", vec![Some(0.1), Some(0.2)]);
    let grid = static_partition(&["g1", "g9"], "region", &["north", "south"]);

    let engine = CombineEngine::new(CombineConfig::new(vec![
        SourceSpec::time_varying("aod"),
        SourceSpec::static_source("grid"),
    ]));
    let combined = engine
        .combine(march(), [("grid".to_string(), grid), ("aod".to_string(), daily)])
        .unwrap();

    assert_eq!(combined.partition.num_rows(), 2);
    assert_eq!(
        categorical(&combined.partition, "region"),
        &[Some("north".to_string()), Some("north".to_string())]
    );
}

#[test]
fn combining_twice_is_idempotent() {
    let d1 = date(2024, 3, 1);
    let sources = || {
        [
            ("a".to_string(), partition(&[("g1", d1)], "x", vec![Some(1.0)])),
            ("b".to_string(), partition(&[("g2", d1)], "y", vec![None])),
        ]
    };
    let engine = CombineEngine::default();
    let first = engine.combine(march(), sources()).unwrap();
    let second = engine.combine(march(), sources()).unwrap();

    assert_eq!(first.fingerprint(), second.fingerprint());
    assert_eq!(first, second);
}

#[test]
fn extension_keeps_existing_columns_byte_identical() {
    let (d1, d2) = (date(2024, 3, 1), date(2024, 3, 2));
    let base = CombineEngine::default()
        .combine(
            march(),
            [(
                "aod".to_string(),
                partition(&[("g1", d1), ("g1", d2), ("g2", d1)], "aod", vec![Some(0.1), None, Some(0.3)]),
            )],
        )
        .unwrap();

    let derived = partition(&[("g1", d2), ("g2", d1)], "aod_filled", vec![Some(0.2), Some(0.3)]);
    let extended = ExtensionManager::default()
        .extend(&base, ColumnExtension::from_stage("impute", derived))
        .unwrap();

    let before = base.partition.columns();
    assert_eq!(&extended.partition.columns()[..before.len()], before);
    assert_eq!(extended.partition.row_ids(), base.partition.row_ids());
    assert_eq!(
        numeric(&extended.partition, "aod_filled"),
        &[None, Some(0.2), Some(0.3)]
    );
    assert!(extended.contributing_fingerprints.contains_key("aod"));
    assert!(extended.contributing_fingerprints.contains_key("impute"));
}

// ============================================================================
// Property tests
// ============================================================================

const CELLS: [&str; 6] = ["g1", "g2", "g3", "g4", "g5", "g6"];

/// A time-varying partition over a random subset of (cell, day) in March 2024.
fn arb_source(column: &'static str) -> impl Strategy<Value = ColumnarPartition> {
    prop::collection::btree_set((0usize..CELLS.len(), 1u32..=5), 0..15).prop_flat_map(move |rows| {
        let n = rows.len();
        prop::collection::vec(prop::option::of(-100.0f64..100.0), n).prop_map(move |values| {
            let rows: Vec<(&str, NaiveDate)> = rows
                .iter()
                .map(|&(cell, day)| (CELLS[cell], date(2024, 3, day)))
                .collect();
            partition(&rows, column, values)
        })
    })
}

proptest! {
    #[test]
    fn combine_is_independent_of_input_order(
        a in arb_source("a_val"),
        b in arb_source("b_val"),
        c in arb_source("c_val"),
        rotation in 0usize..3,
    ) {
        let mut inputs = vec![
            ("a".to_string(), a.clone()),
            ("b".to_string(), b.clone()),
            ("c".to_string(), c.clone()),
        ];
        let engine = CombineEngine::default();
        let reference = engine.combine(march(), inputs.clone()).unwrap();

        inputs.rotate_left(rotation);
        inputs.reverse();
        let permuted = engine.combine(march(), inputs).unwrap();

        prop_assert_eq!(&reference, &permuted);
        prop_assert_eq!(reference.fingerprint(), permuted.fingerprint());

        // Output rows are exactly the union of input identities, in sorted order.
        let expected: BTreeSet<_> = [&a, &b, &c]
            .iter()
            .flat_map(|p| p.row_ids())
            .collect();
        let actual = reference.partition.row_ids();
        prop_assert_eq!(actual.clone(), expected.into_iter().collect::<Vec<_>>());
    }

    #[test]
    fn extension_with_own_subset_preserves_base(
        a in arb_source("a_val"),
        keep_every in 1usize..4,
    ) {
        let base = CombineEngine::default()
            .combine(march(), BTreeMap::from([("a".to_string(), a)]))
            .unwrap();

        let ids = base.partition.row_ids();
        let picked: Vec<_> = ids.iter().step_by(keep_every).collect();
        let rows: Vec<(&str, NaiveDate)> = picked
            .iter()
            .map(|id| (id.grid_id.as_str(), id.date.unwrap()))
            .collect();
        let derived = partition(&rows, "derived", vec![Some(1.0); rows.len()]);

        let extended = ExtensionManager::default()
            .extend(&base, ColumnExtension::from_stage("features", derived))
            .unwrap();

        let before = base.partition.columns();
        prop_assert_eq!(&extended.partition.columns()[..before.len()], before);
        prop_assert_eq!(extended.partition.num_rows(), base.partition.num_rows());
    }
}
