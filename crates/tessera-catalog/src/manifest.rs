//! Partition manifests and the storage layout they live in.
//!
//! Each `(dataset, month)` unit is a directory holding immutable,
//! content-addressed data objects and one manifest that names the current
//! one. Publishing a new version is a single conditional write of the
//! manifest, so readers see either the old or the new partition.
//!
//! # Storage Layout
//!
//! ```text
//! {prefix}/
//! ├── {dataset}/year=YYYY/month=MM/
//! │   ├── manifest.json                # commit point
//! │   └── data/{fingerprint-hex}.parquet
//! ├── _acks/consumer={c}/dataset={d}/year=YYYY/month=MM.json
//! ├── _stages/stage={s}/year=YYYY/month=MM/{ulid}.json
//! └── _models/{model_id}/...
//! ```
//!
//! The data of a unit is not a single `month=MM/data` object. It lives under
//! the `month=MM/data/` directory, named by the hex of its fingerprint, and
//! several versions may sit there until [`prune`] removes the unreferenced
//! ones. External readers must resolve the current object through
//! `manifest.json` (its `dataPath` field) rather than globbing `data/`.
//!
//! [`prune`]: crate::PartitionStore::prune

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tessera_core::PartitionKey;

use crate::column::ColumnDef;
use crate::error::{CatalogError, Result};
use crate::fingerprint::Fingerprint;

/// Current manifest schema version.
pub const MANIFEST_VERSION: u32 = 1;

/// Path helpers for the partition layout. All paths are relative to the
/// store prefix.
pub mod paths {
    use tessera_core::PartitionKey;

    /// Manifest object name inside a partition directory.
    pub const MANIFEST_FILE: &str = "manifest.json";

    /// Reserved top-level prefix for consumer acknowledgements.
    pub const ACKS_PREFIX: &str = "_acks";

    /// Reserved top-level prefix for model artifacts.
    pub const MODELS_PREFIX: &str = "_models";

    /// Directory of all months of a dataset.
    #[must_use]
    pub fn dataset_dir(dataset: &str) -> String {
        format!("{dataset}/")
    }

    /// Directory of one `(dataset, month)` unit.
    #[must_use]
    pub fn partition_dir(dataset: &str, key: PartitionKey) -> String {
        format!("{dataset}/{}", key.hive_path())
    }

    /// Manifest of one `(dataset, month)` unit.
    #[must_use]
    pub fn manifest(dataset: &str, key: PartitionKey) -> String {
        format!("{}/{MANIFEST_FILE}", partition_dir(dataset, key))
    }

    /// Directory of the data objects of one unit.
    #[must_use]
    pub fn data_dir(dataset: &str, key: PartitionKey) -> String {
        format!("{}/data/", partition_dir(dataset, key))
    }

    /// Content-addressed data object of one unit.
    #[must_use]
    pub fn data_object(dataset: &str, key: PartitionKey, fingerprint_hex: &str) -> String {
        format!("{}{fingerprint_hex}.parquet", data_dir(dataset, key))
    }

    /// Acknowledgement of one unit by one consumer.
    #[must_use]
    pub fn ack(consumer: &str, dataset: &str, key: PartitionKey) -> String {
        format!(
            "{ACKS_PREFIX}/consumer={consumer}/dataset={dataset}/year={:04}/month={:02}.json",
            key.year(),
            key.month()
        )
    }
}

/// Checks a dataset, consumer or model name is safe to embed in a path.
///
/// # Errors
///
/// Returns `InvalidInput` for empty names, names starting with `_`
/// (reserved), or names containing `/`, `=` or whitespace.
pub fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(CatalogError::invalid(format!("{kind} name cannot be empty")));
    }
    if name.starts_with('_') || name.starts_with('.') {
        return Err(CatalogError::invalid(format!(
            "{kind} name '{name}' uses a reserved leading character"
        )));
    }
    if name
        .chars()
        .any(|c| c == '/' || c == '=' || c.is_whitespace())
    {
        return Err(CatalogError::invalid(format!(
            "{kind} name '{name}' contains a path separator, '=' or whitespace"
        )));
    }
    Ok(())
}

/// The durable record of the current version of one `(dataset, month)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionManifest {
    /// Manifest schema version.
    pub version: u32,
    /// Dataset name.
    pub dataset: String,
    /// Partition year.
    pub year: i32,
    /// Partition month (1-12).
    pub month: u32,
    /// Fingerprint of the data object's logical content.
    pub fingerprint: Fingerprint,
    /// Number of rows.
    pub row_count: u64,
    /// When this version was published.
    pub produced_at: DateTime<Utc>,
    /// Data object path, relative to the store prefix.
    pub data_path: String,
    /// Column definitions in partition order.
    pub columns: Vec<ColumnDef>,
    /// For combined datasets: fingerprints of the contributing sources.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub contributing_fingerprints: BTreeMap<String, Fingerprint>,
}

impl PartitionManifest {
    /// The partition key this manifest describes.
    ///
    /// # Errors
    ///
    /// Returns `Serialization` if the stored year/month are out of range.
    pub fn key(&self) -> Result<PartitionKey> {
        PartitionKey::new(self.year, self.month).map_err(|e| CatalogError::Serialization {
            message: format!("manifest for '{}' has invalid month: {e}", self.dataset),
        })
    }

    /// Summary entry used by fingerprint bookkeeping.
    ///
    /// # Errors
    ///
    /// Returns `Serialization` if the stored year/month are out of range.
    pub fn entry(&self) -> Result<SourceManifestEntry> {
        Ok(SourceManifestEntry {
            source_name: self.dataset.clone(),
            key: self.key()?,
            fingerprint: self.fingerprint.clone(),
            produced_at: self.produced_at,
            row_count: self.row_count,
        })
    }

    /// Parses a manifest object.
    ///
    /// # Errors
    ///
    /// Returns `Serialization` if the bytes are not a valid manifest.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Serializes the manifest.
    ///
    /// # Errors
    ///
    /// Returns `Serialization` if encoding fails.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}

/// One `(source, month)` fingerprint record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceManifestEntry {
    /// Dataset name.
    pub source_name: String,
    /// Month.
    pub key: PartitionKey,
    /// Content fingerprint.
    pub fingerprint: Fingerprint,
    /// When the partition was published.
    pub produced_at: DateTime<Utc>,
    /// Number of rows.
    pub row_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths() {
        let key = PartitionKey::new(2024, 3).unwrap();
        assert_eq!(paths::manifest("era5", key), "era5/year=2024/month=03/manifest.json");
        assert_eq!(
            paths::data_object("era5", key, "ab12"),
            "era5/year=2024/month=03/data/ab12.parquet"
        );
        assert_eq!(
            paths::ack("combine", "era5", key),
            "_acks/consumer=combine/dataset=era5/year=2024/month=03.json"
        );
    }

    #[test]
    fn names_are_validated() {
        assert!(validate_name("dataset", "era5").is_ok());
        assert!(validate_name("dataset", "").is_err());
        assert!(validate_name("dataset", "_acks").is_err());
        assert!(validate_name("dataset", "a/b").is_err());
        assert!(validate_name("dataset", "year=2024").is_err());
    }

    #[test]
    fn manifest_json_uses_camel_case() {
        let manifest = PartitionManifest {
            version: MANIFEST_VERSION,
            dataset: "era5".into(),
            year: 2024,
            month: 3,
            fingerprint: Fingerprint::parse(&format!("sha256:{}", "0".repeat(64))).unwrap(),
            row_count: 10,
            produced_at: Utc::now(),
            data_path: "era5/year=2024/month=03/data/x.parquet".into(),
            columns: vec![],
            contributing_fingerprints: BTreeMap::new(),
        };
        let json = String::from_utf8(manifest.to_json().unwrap()).unwrap();
        assert!(json.contains("\"rowCount\": 10"));
        assert!(!json.contains("contributingFingerprints"));
        assert_eq!(PartitionManifest::from_json(json.as_bytes()).unwrap(), manifest);
        assert_eq!(manifest.entry().unwrap().key, PartitionKey::new(2024, 3).unwrap());
    }
}
