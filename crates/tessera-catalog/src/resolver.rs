//! Resolution of the configured combine inputs for one month.
//!
//! The resolver decides *which* partition of each configured source feeds a
//! month: the month itself, an earlier month (copy-latest fallback), or
//! nothing (optional source). It also answers whether a stored combined
//! dataset is still current, using manifests only.

use std::collections::BTreeMap;

use tessera_core::PartitionKey;

use crate::column::ColumnarPartition;
use crate::config::{CombineConfig, MissingDataPolicy, SourceSpec};
use crate::dataset::CombinedDataset;
use crate::error::{CatalogError, Result};
use crate::fingerprint::Fingerprint;
use crate::store::PartitionStore;

/// The inputs chosen for one month.
#[derive(Debug, Clone, Default)]
pub struct ResolvedSources {
    /// Source name to partition.
    pub partitions: BTreeMap<String, ColumnarPartition>,
    /// Source name to the month the partition was read from.
    pub origins: BTreeMap<String, PartitionKey>,
}

/// Reads configured sources from a [`PartitionStore`].
#[derive(Debug, Clone)]
pub struct SourceResolver {
    store: PartitionStore,
    config: CombineConfig,
}

impl SourceResolver {
    /// Creates a resolver.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the config is inconsistent.
    pub fn new(store: PartitionStore, config: CombineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { store, config })
    }

    /// The combine configuration.
    #[must_use]
    pub const fn config(&self) -> &CombineConfig {
        &self.config
    }

    /// Finds the month to read `spec` from, or `None` if it is absent.
    async fn locate(&self, spec: &SourceSpec, key: PartitionKey) -> Result<Option<PartitionKey>> {
        if self.store.exists(key, &spec.name).await? {
            return Ok(Some(key));
        }
        match spec.missing_data {
            MissingDataPolicy::Fail => Ok(None),
            MissingDataPolicy::CopyLatestAvailableBefore => {
                let earlier = self
                    .store
                    .list(&spec.name)
                    .await?
                    .into_iter()
                    .filter(|k| *k < key)
                    .max();
                if let Some(from) = earlier {
                    tracing::info!(source = %spec.name, month = %key, %from, "using latest earlier month");
                }
                Ok(earlier)
            }
        }
    }

    fn absent(spec: &SourceSpec, key: PartitionKey) -> Result<()> {
        if spec.required {
            tracing::warn!(source = %spec.name, month = %key, "required source missing");
            Err(CatalogError::MissingSource {
                source_name: spec.name.clone(),
                key,
            })
        } else {
            tracing::debug!(source = %spec.name, month = %key, "optional source absent, omitted");
            Ok(())
        }
    }

    /// Reads every configured source for `key`.
    ///
    /// # Errors
    ///
    /// Returns `MissingSource` for the first required source with nothing to
    /// read, or store errors.
    pub async fn resolve(&self, key: PartitionKey) -> Result<ResolvedSources> {
        let mut resolved = ResolvedSources::default();
        for spec in &self.config.sources {
            let Some(from) = self.locate(spec, key).await? else {
                Self::absent(spec, key)?;
                continue;
            };
            let partition = self.store.read(from, &spec.name).await?;
            resolved.partitions.insert(spec.name.clone(), partition);
            resolved.origins.insert(spec.name.clone(), from);
        }
        Ok(resolved)
    }

    /// Current fingerprints of the sources that would feed `key`, read from
    /// manifests only.
    ///
    /// # Errors
    ///
    /// Same as [`SourceResolver::resolve`].
    pub async fn current_fingerprints(
        &self,
        key: PartitionKey,
    ) -> Result<BTreeMap<String, Fingerprint>> {
        let mut fingerprints = BTreeMap::new();
        for spec in &self.config.sources {
            let manifest = match self.locate(spec, key).await? {
                Some(from) => self.store.manifest(from, &spec.name).await?,
                None => None,
            };
            match manifest {
                Some(m) => {
                    fingerprints.insert(spec.name.clone(), m.fingerprint);
                }
                None => Self::absent(spec, key)?,
            }
        }
        Ok(fingerprints)
    }

    /// Returns true if every source recorded in `combined`'s provenance
    /// still has the recorded fingerprint, and no source appeared or
    /// disappeared.
    ///
    /// # Errors
    ///
    /// Same as [`SourceResolver::resolve`].
    pub async fn is_current(&self, combined: &CombinedDataset) -> Result<bool> {
        let current = self.current_fingerprints(combined.key).await?;
        let recorded: BTreeMap<&String, &Fingerprint> = combined
            .contributing_fingerprints
            .iter()
            .filter(|(name, _)| self.config.source(name).is_some())
            .collect();
        let current: BTreeMap<&String, &Fingerprint> = current.iter().collect();
        Ok(recorded == current)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::column::Column;
    use crate::combine::CombineEngine;
    use crate::config::StoreConfig;
    use tessera_core::MemoryBackend;

    fn key(month: u32) -> PartitionKey {
        PartitionKey::new(2024, month).unwrap()
    }

    fn daily(key: PartitionKey, value: f64) -> ColumnarPartition {
        ColumnarPartition::new(vec![
            Column::grid_ids(["g1"]),
            Column::dates([key.first_day()]),
            Column::numeric("aod", vec![Some(value)]),
        ])
        .unwrap()
    }

    fn land_cover(class: &str) -> ColumnarPartition {
        ColumnarPartition::new(vec![
            Column::grid_ids(["g1"]),
            Column::categorical("class", [Some(class)]),
        ])
        .unwrap()
    }

    fn store() -> PartitionStore {
        PartitionStore::new(Arc::new(MemoryBackend::new()), StoreConfig::default())
    }

    fn config() -> CombineConfig {
        CombineConfig::new(vec![
            SourceSpec::time_varying("aod"),
            SourceSpec::static_source("land_cover")
                .with_missing_data(MissingDataPolicy::CopyLatestAvailableBefore),
            SourceSpec::time_varying("stations").optional(),
        ])
    }

    #[tokio::test]
    async fn falls_back_to_latest_earlier_month() {
        let store = store();
        store.write(key(3), "aod", &daily(key(3), 0.2)).await.unwrap();
        store.write(key(1), "land_cover", &land_cover("old")).await.unwrap();
        store.write(key(2), "land_cover", &land_cover("new")).await.unwrap();
        store.write(key(4), "land_cover", &land_cover("future")).await.unwrap();

        let resolver = SourceResolver::new(store, config()).unwrap();
        let resolved = resolver.resolve(key(3)).await.unwrap();

        assert_eq!(resolved.origins["land_cover"], key(2));
        assert_eq!(resolved.partitions["land_cover"], land_cover("new"));
        assert!(!resolved.partitions.contains_key("stations"));
    }

    #[tokio::test]
    async fn missing_required_source_fails() {
        let store = store();
        store.write(key(4), "aod", &daily(key(4), 0.2)).await.unwrap();

        let resolver = SourceResolver::new(store, config()).unwrap();
        let err = resolver.resolve(key(4)).await.unwrap_err();
        assert!(matches!(
            err,
            CatalogError::MissingSource { ref source_name, .. } if source_name == "land_cover"
        ));
    }

    #[tokio::test]
    async fn staleness_tracks_source_changes() {
        let store = store();
        store.write(key(3), "aod", &daily(key(3), 0.2)).await.unwrap();
        store.write(key(3), "land_cover", &land_cover("urban")).await.unwrap();

        let resolver = SourceResolver::new(store.clone(), config()).unwrap();
        let resolved = resolver.resolve(key(3)).await.unwrap();
        let combined = CombineEngine::new(config())
            .combine(key(3), resolved.partitions)
            .unwrap();
        assert!(resolver.is_current(&combined).await.unwrap());

        store.write(key(3), "aod", &daily(key(3), 0.3)).await.unwrap();
        assert!(!resolver.is_current(&combined).await.unwrap());
    }
}
