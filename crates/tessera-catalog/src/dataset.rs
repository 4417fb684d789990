//! Combined datasets: a partition plus the fingerprints it was built from.

use std::collections::BTreeMap;

use tessera_core::PartitionKey;

use crate::column::ColumnarPartition;
use crate::fingerprint::{fingerprint_partition, Fingerprint};

/// A month of row-aligned data assembled from several sources.
///
/// The dataset is only valid while every entry of
/// `contributing_fingerprints` still matches the current fingerprint of that
/// source; see [`SourceResolver::is_current`](crate::resolver::SourceResolver::is_current).
#[derive(Debug, Clone, PartialEq)]
pub struct CombinedDataset {
    /// The month.
    pub key: PartitionKey,
    /// The row-aligned columns.
    pub partition: ColumnarPartition,
    /// Source (or producing stage) name to the fingerprint that was used.
    pub contributing_fingerprints: BTreeMap<String, Fingerprint>,
}

impl CombinedDataset {
    /// Wraps a partition with its provenance.
    #[must_use]
    pub fn new(
        key: PartitionKey,
        partition: ColumnarPartition,
        contributing_fingerprints: BTreeMap<String, Fingerprint>,
    ) -> Self {
        Self {
            key,
            partition,
            contributing_fingerprints,
        }
    }

    /// Fingerprint of the combined content (provenance excluded).
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        fingerprint_partition(&self.partition)
    }
}
