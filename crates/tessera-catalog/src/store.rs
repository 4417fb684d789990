//! The partition store: durable, atomically published monthly partitions.
//!
//! ## Write protocol
//!
//! 1. Compute the content fingerprint. If the current manifest already
//!    carries it (and the same provenance), stop: the write is a no-op.
//! 2. Upload the Parquet data object to `data/{fingerprint}.parquet`. The
//!    name is content-addressed, so an existing object is reused.
//! 3. Publish the manifest with a conditional write against the version
//!    read in step 1.
//!
//! Readers resolve the manifest first and then the data object it names, so
//! an interrupted write (crash, cancellation) leaves at most an unreferenced
//! data object behind, which [`PartitionStore::prune`] removes.
//!
//! Writers to the same `(dataset, month)` are serialized by an in-process
//! keyed lock; the manifest precondition catches writers in other processes.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use tracing::Instrument;

use tessera_core::observability::partition_span;
use tessera_core::{KeyedLocks, PartitionKey, StorageBackend, WritePrecondition, WriteResult};

use crate::column::ColumnarPartition;
use crate::config::StoreConfig;
use crate::dataset::CombinedDataset;
use crate::error::{CatalogError, Result};
use crate::fingerprint::{fingerprint_partition, Fingerprint};
use crate::manifest::{paths, validate_name, PartitionManifest, MANIFEST_VERSION};
use crate::metrics;
use crate::parquet_util;

/// Result of [`PartitionStore::write`].
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// A new version was published.
    Written {
        /// Fingerprint of the published content.
        fingerprint: Fingerprint,
        /// The manifest that was published.
        manifest: Box<PartitionManifest>,
    },
    /// Identical content was already published; nothing was written.
    Unchanged {
        /// Fingerprint of the (unchanged) content.
        fingerprint: Fingerprint,
    },
}

impl WriteOutcome {
    /// Fingerprint of the content now visible.
    #[must_use]
    pub fn fingerprint(&self) -> &Fingerprint {
        match self {
            Self::Written { fingerprint, .. } | Self::Unchanged { fingerprint } => fingerprint,
        }
    }

    /// Returns true if a new version was published.
    #[must_use]
    pub const fn is_written(&self) -> bool {
        matches!(self, Self::Written { .. })
    }
}

/// Reads and writes monthly partitions under a hive-style layout.
///
/// Cloning is cheap; clones share the backend and the write locks.
#[derive(Clone)]
pub struct PartitionStore {
    backend: Arc<dyn StorageBackend>,
    config: StoreConfig,
    locks: KeyedLocks,
}

impl fmt::Debug for PartitionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PartitionStore {
    /// Creates a store over `backend`.
    pub fn new(backend: Arc<dyn StorageBackend>, config: StoreConfig) -> Self {
        Self {
            backend,
            config,
            locks: KeyedLocks::new(),
        }
    }

    /// The underlying storage backend.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// The store configuration.
    #[must_use]
    pub const fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Persists a partition for `(dataset, key)` atomically.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` for a bad dataset name or dates outside the month.
    /// - `CasFailed` if another process published concurrently (transient).
    /// - `Storage` for backend failures (transient).
    pub async fn write(
        &self,
        key: PartitionKey,
        dataset: &str,
        partition: &ColumnarPartition,
    ) -> Result<WriteOutcome> {
        self.publish(key, dataset, partition, &BTreeMap::new()).await
    }

    /// Persists a combined dataset, recording its provenance in the manifest.
    ///
    /// # Errors
    ///
    /// Same as [`PartitionStore::write`].
    pub async fn write_combined(
        &self,
        dataset: &str,
        combined: &CombinedDataset,
    ) -> Result<WriteOutcome> {
        self.publish(
            combined.key,
            dataset,
            &combined.partition,
            &combined.contributing_fingerprints,
        )
        .await
    }

    async fn publish(
        &self,
        key: PartitionKey,
        dataset: &str,
        partition: &ColumnarPartition,
        provenance: &BTreeMap<String, Fingerprint>,
    ) -> Result<WriteOutcome> {
        validate_name("dataset", dataset)?;
        if let Some(outside) = partition.dates().find(|d| !key.contains(*d)) {
            return Err(CatalogError::invalid(format!(
                "{dataset} partition for {key} contains date {outside} from another month"
            )));
        }

        let fingerprint = fingerprint_partition(partition);
        let span = partition_span("write", dataset, key);

        async move {
            let _guard = self.locks.lock(&paths::partition_dir(dataset, key)).await;

            let current = self.load_manifest(dataset, key).await?;
            if let Some((manifest, _)) = &current {
                if manifest.fingerprint == fingerprint
                    && &manifest.contributing_fingerprints == provenance
                {
                    tracing::debug!(%fingerprint, "content unchanged, skipping write");
                    metrics::record_partition_unchanged(dataset);
                    return Ok(WriteOutcome::Unchanged { fingerprint });
                }
            }

            let data_rel = paths::data_object(dataset, key, fingerprint.hex());
            let data_path = self.config.join(&data_rel);
            let reuse = current
                .as_ref()
                .is_some_and(|(m, _)| m.data_path == data_rel)
                || self.backend.head(&data_path).await?.is_some();
            if !reuse {
                let bytes = parquet_util::write_partition(partition)?;
                // A concurrent writer may have uploaded the same content; either copy is fine.
                self.backend
                    .put(&data_path, bytes, WritePrecondition::DoesNotExist)
                    .await?;
            }

            let manifest = PartitionManifest {
                version: MANIFEST_VERSION,
                dataset: dataset.to_string(),
                year: key.year(),
                month: key.month(),
                fingerprint: fingerprint.clone(),
                row_count: partition.num_rows() as u64,
                produced_at: Utc::now(),
                data_path: data_rel,
                columns: partition.schema().columns().to_vec(),
                contributing_fingerprints: provenance.clone(),
            };
            let precondition = match current {
                Some((_, version)) => WritePrecondition::MatchesVersion(version),
                None => WritePrecondition::DoesNotExist,
            };

            let manifest_path = self.config.join(&paths::manifest(dataset, key));
            match self
                .backend
                .put(&manifest_path, Bytes::from(manifest.to_json()?), precondition)
                .await?
            {
                WriteResult::Success { .. } => {
                    tracing::info!(%fingerprint, rows = manifest.row_count, "published partition");
                    metrics::record_partition_write(dataset);
                    Ok(WriteOutcome::Written {
                        fingerprint,
                        manifest: Box::new(manifest),
                    })
                }
                WriteResult::PreconditionFailed { current_version } => {
                    tracing::warn!(%current_version, "manifest changed during write");
                    Err(CatalogError::CasFailed {
                        message: format!(
                            "{dataset} {key} manifest changed concurrently (now version {current_version})"
                        ),
                    })
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Loads the current manifest and its object version, if any.
    async fn load_manifest(
        &self,
        dataset: &str,
        key: PartitionKey,
    ) -> Result<Option<(PartitionManifest, String)>> {
        let path = self.config.join(&paths::manifest(dataset, key));
        let Some(meta) = self.backend.head(&path).await? else {
            return Ok(None);
        };
        let bytes = match self.backend.get(&path).await {
            Ok(bytes) => bytes,
            // Deleted between head and get.
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some((PartitionManifest::from_json(&bytes)?, meta.version)))
    }

    /// Returns the current manifest of `(dataset, key)`, if published.
    ///
    /// Reads only the manifest object, never the data.
    ///
    /// # Errors
    ///
    /// Returns `Storage` or `Serialization` errors from the backend.
    pub async fn manifest(
        &self,
        key: PartitionKey,
        dataset: &str,
    ) -> Result<Option<PartitionManifest>> {
        validate_name("dataset", dataset)?;
        Ok(self.load_manifest(dataset, key).await?.map(|(m, _)| m))
    }

    /// Returns true if `(dataset, key)` has a published partition.
    ///
    /// # Errors
    ///
    /// Returns `Storage` errors from the backend.
    pub async fn exists(&self, key: PartitionKey, dataset: &str) -> Result<bool> {
        validate_name("dataset", dataset)?;
        let path = self.config.join(&paths::manifest(dataset, key));
        Ok(self.backend.head(&path).await?.is_some())
    }

    /// Reads the current partition of `(dataset, key)`.
    ///
    /// # Errors
    ///
    /// - `NotFound` if nothing has been published for the month.
    /// - `Parquet`/`Validation` if the stored data is unreadable or
    ///   disagrees with its manifest.
    #[tracing::instrument(skip(self), fields(month = %key))]
    pub async fn read(&self, key: PartitionKey, dataset: &str) -> Result<ColumnarPartition> {
        Ok(self.read_with_manifest(key, dataset).await?.0)
    }

    /// Reads a combined dataset together with its recorded provenance.
    ///
    /// # Errors
    ///
    /// Same as [`PartitionStore::read`].
    pub async fn read_combined(&self, key: PartitionKey, dataset: &str) -> Result<CombinedDataset> {
        let (partition, manifest) = self.read_with_manifest(key, dataset).await?;
        Ok(CombinedDataset::new(
            key,
            partition,
            manifest.contributing_fingerprints,
        ))
    }

    async fn read_with_manifest(
        &self,
        key: PartitionKey,
        dataset: &str,
    ) -> Result<(ColumnarPartition, PartitionManifest)> {
        let manifest = self
            .manifest(key, dataset)
            .await?
            .ok_or_else(|| CatalogError::NotFound {
                message: format!("no {dataset} partition for {key}"),
            })?;

        let bytes = self.backend.get(&self.config.join(&manifest.data_path)).await?;
        let partition = parquet_util::read_partition(&bytes)?;
        if partition.num_rows() as u64 != manifest.row_count {
            return Err(CatalogError::Validation {
                message: format!(
                    "{dataset} {key}: manifest says {} rows, data has {}",
                    manifest.row_count,
                    partition.num_rows()
                ),
            });
        }
        Ok((partition, manifest))
    }

    /// Lists the months published for `dataset`, in ascending order.
    ///
    /// # Errors
    ///
    /// Returns `Storage` errors from the backend.
    pub async fn list(&self, dataset: &str) -> Result<Vec<PartitionKey>> {
        validate_name("dataset", dataset)?;
        let dir = self.config.join(&paths::dataset_dir(dataset));
        let suffix = format!("/{}", paths::MANIFEST_FILE);

        let mut keys: Vec<PartitionKey> = self
            .backend
            .list(&dir)
            .await?
            .iter()
            .filter_map(|meta| {
                let hive = meta.path.strip_prefix(&dir)?.strip_suffix(&suffix)?;
                PartitionKey::parse_hive_path(hive).ok()
            })
            .collect();
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }

    /// Deletes data objects of `(dataset, key)` not referenced by its manifest.
    ///
    /// Returns the number of objects deleted.
    ///
    /// # Errors
    ///
    /// Returns `Storage` errors from the backend.
    pub async fn prune(&self, key: PartitionKey, dataset: &str) -> Result<usize> {
        validate_name("dataset", dataset)?;
        let _guard = self.locks.lock(&paths::partition_dir(dataset, key)).await;

        let keep = self
            .load_manifest(dataset, key)
            .await?
            .map(|(m, _)| self.config.join(&m.data_path));
        let data_dir = self.config.join(&paths::data_dir(dataset, key));

        let mut deleted = 0;
        for meta in self.backend.list(&data_dir).await? {
            if keep.as_deref() != Some(meta.path.as_str()) {
                self.backend.delete(&meta.path).await?;
                deleted += 1;
            }
        }
        if deleted > 0 {
            tracing::info!(dataset, month = %key, deleted, "pruned unreferenced data objects");
            metrics::record_pruned(dataset, deleted as u64);
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::Column;
    use chrono::NaiveDate;
    use tessera_core::MemoryBackend;

    fn march() -> PartitionKey {
        PartitionKey::new(2024, 3).unwrap()
    }

    fn partition(values: &[Option<f64>]) -> ColumnarPartition {
        let d = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        ColumnarPartition::new(vec![
            Column::grid_ids((0..values.len()).map(|i| format!("g{i}"))),
            Column::dates(std::iter::repeat(d).take(values.len())),
            Column::numeric("aod", values.to_vec()),
        ])
        .unwrap()
    }

    fn store() -> (MemoryBackend, PartitionStore) {
        let backend = MemoryBackend::new();
        let store = PartitionStore::new(Arc::new(backend.clone()), StoreConfig::with_prefix("lake"));
        (backend, store)
    }

    #[tokio::test]
    async fn write_then_read() {
        let (_, store) = store();
        let p = partition(&[Some(1.0), None]);

        let outcome = store.write(march(), "aod", &p).await.unwrap();
        assert!(outcome.is_written());
        assert_eq!(store.read(march(), "aod").await.unwrap(), p);
        assert!(store.exists(march(), "aod").await.unwrap());
    }

    #[tokio::test]
    async fn identical_rewrite_is_unchanged() {
        let (backend, store) = store();
        let p = partition(&[Some(1.0)]);

        let first = store.write(march(), "aod", &p).await.unwrap();
        let objects = backend.len();
        let second = store.write(march(), "aod", &p).await.unwrap();

        assert!(matches!(second, WriteOutcome::Unchanged { .. }));
        assert_eq!(first.fingerprint(), second.fingerprint());
        assert_eq!(backend.len(), objects);
    }

    #[tokio::test]
    async fn new_content_supersedes_and_prune_cleans_up() {
        let (_, store) = store();
        store.write(march(), "aod", &partition(&[Some(1.0)])).await.unwrap();
        let newer = partition(&[Some(2.0)]);
        store.write(march(), "aod", &newer).await.unwrap();

        assert_eq!(store.read(march(), "aod").await.unwrap(), newer);
        assert_eq!(store.prune(march(), "aod").await.unwrap(), 1);
        assert_eq!(store.prune(march(), "aod").await.unwrap(), 0);
        assert_eq!(store.read(march(), "aod").await.unwrap(), newer);
    }

    #[tokio::test]
    async fn read_missing_is_not_found() {
        let (_, store) = store();
        let err = store.read(march(), "aod").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(store.manifest(march(), "aod").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_is_ordered_by_month() {
        let (_, store) = store();
        for (year, month) in [(2024, 11), (2023, 12), (2024, 2)] {
            let key = PartitionKey::new(year, month).unwrap();
            let d = key.first_day();
            let p = ColumnarPartition::new(vec![Column::grid_ids(["g1"]), Column::dates([d])])
                .unwrap();
            store.write(key, "aod", &p).await.unwrap();
        }
        // Another dataset sharing the name prefix must not leak in.
        store
            .write(march(), "aod_daily", &partition(&[Some(1.0)]))
            .await
            .unwrap();

        let months: Vec<String> = store
            .list("aod")
            .await
            .unwrap()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(months, vec!["2023-12", "2024-02", "2024-11"]);
    }

    #[tokio::test]
    async fn rejects_dates_outside_month() {
        let (_, store) = store();
        let april = PartitionKey::new(2024, 4).unwrap();
        let err = store
            .write(april, "aod", &partition(&[Some(1.0)]))
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn provenance_change_republishes_manifest() {
        let (_, store) = store();
        let p = partition(&[Some(1.0)]);
        let fp = fingerprint_partition(&p);

        store.write(march(), "combined", &p).await.unwrap();
        let combined = CombinedDataset::new(march(), p, BTreeMap::from([("aod".to_string(), fp)]));
        let outcome = store.write_combined("combined", &combined).await.unwrap();
        assert!(outcome.is_written());

        let read = store.read_combined(march(), "combined").await.unwrap();
        assert_eq!(read, combined);
    }
}
