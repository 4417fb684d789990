//! Fingerprint bookkeeping: which content each consumer has already processed.
//!
//! The current fingerprint of a partition is cached in its manifest, so
//! [`FingerprintRegistry::fingerprint_of`] and
//! [`FingerprintRegistry::has_changed`] read one small JSON object and never
//! touch partition data. Consumers (pipeline stages) record an
//! acknowledgement after they successfully process a partition; a later
//! `has_changed` compares against that acknowledgement.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tessera_core::{PartitionKey, WritePrecondition};

use crate::error::{CatalogError, Result};
use crate::fingerprint::{fingerprint_partition, Fingerprint};
use crate::manifest::{paths, validate_name, SourceManifestEntry};
use crate::store::PartitionStore;

/// A consumer's record of the content it last processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Acknowledgement {
    /// Consumer name (usually a stage name).
    pub consumer: String,
    /// Dataset that was consumed.
    pub dataset: String,
    /// Month that was consumed.
    pub key: PartitionKey,
    /// Fingerprint that was consumed.
    pub fingerprint: Fingerprint,
    /// When the acknowledgement was recorded.
    pub recorded_at: DateTime<Utc>,
}

/// Computes, caches and acknowledges partition fingerprints.
#[derive(Debug, Clone)]
pub struct FingerprintRegistry {
    store: PartitionStore,
}

impl FingerprintRegistry {
    /// Creates a registry over the same storage as `store`.
    #[must_use]
    pub const fn new(store: PartitionStore) -> Self {
        Self { store }
    }

    /// The store this registry reads manifests from.
    #[must_use]
    pub const fn store(&self) -> &PartitionStore {
        &self.store
    }

    /// Returns the fingerprint of the current partition of `(dataset, key)`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if nothing has been published for the month.
    pub async fn fingerprint_of(&self, key: PartitionKey, dataset: &str) -> Result<Fingerprint> {
        Ok(self.entry(key, dataset).await?.fingerprint)
    }

    /// Returns the manifest entry `(source, month, fingerprint, produced_at, rows)`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if nothing has been published for the month.
    pub async fn entry(&self, key: PartitionKey, dataset: &str) -> Result<SourceManifestEntry> {
        self.store
            .manifest(key, dataset)
            .await?
            .ok_or_else(|| CatalogError::NotFound {
                message: format!("no {dataset} partition for {key}"),
            })?
            .entry()
    }

    /// Returns the acknowledgement `consumer` recorded for `(dataset, key)`.
    ///
    /// # Errors
    ///
    /// Returns `Storage` or `Serialization` errors.
    pub async fn acknowledged(
        &self,
        key: PartitionKey,
        dataset: &str,
        consumer: &str,
    ) -> Result<Option<Acknowledgement>> {
        validate_name("consumer", consumer)?;
        validate_name("dataset", dataset)?;
        let path = self.ack_path(key, dataset, consumer);
        match self.store.backend().get(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns true if the current content of `(dataset, key)` differs from
    /// what `consumer` last acknowledged (or it never acknowledged anything).
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the partition itself does not exist: absence is
    /// not "changed", callers must branch on it.
    #[tracing::instrument(skip(self), fields(month = %key))]
    pub async fn has_changed(
        &self,
        key: PartitionKey,
        dataset: &str,
        consumer: &str,
    ) -> Result<bool> {
        let current = self.fingerprint_of(key, dataset).await?;
        let changed = self
            .acknowledged(key, dataset, consumer)
            .await?
            .map_or(true, |ack| ack.fingerprint != current);
        tracing::debug!(changed, %current, "compared against acknowledgement");
        Ok(changed)
    }

    /// Records that `consumer` processed `(dataset, key)` at `fingerprint`.
    ///
    /// # Errors
    ///
    /// Returns `Storage` errors from the backend.
    pub async fn record(
        &self,
        key: PartitionKey,
        dataset: &str,
        consumer: &str,
        fingerprint: &Fingerprint,
    ) -> Result<()> {
        validate_name("consumer", consumer)?;
        validate_name("dataset", dataset)?;
        let ack = Acknowledgement {
            consumer: consumer.to_string(),
            dataset: dataset.to_string(),
            key,
            fingerprint: fingerprint.clone(),
            recorded_at: Utc::now(),
        };
        let bytes = Bytes::from(serde_json::to_vec(&ack)?);
        self.store
            .backend()
            .put(
                &self.ack_path(key, dataset, consumer),
                bytes,
                WritePrecondition::None,
            )
            .await?;
        tracing::debug!(consumer, dataset, month = %key, %fingerprint, "recorded acknowledgement");
        Ok(())
    }

    /// Recomputes the fingerprint from the stored data and compares it with
    /// the cached manifest value.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the partition does not exist, or read errors.
    pub async fn verify(&self, key: PartitionKey, dataset: &str) -> Result<bool> {
        let cached = self.fingerprint_of(key, dataset).await?;
        let partition = self.store.read(key, dataset).await?;
        let actual = fingerprint_partition(&partition);
        if actual != cached {
            tracing::warn!(dataset, month = %key, %cached, %actual, "fingerprint mismatch");
        }
        Ok(actual == cached)
    }

    fn ack_path(&self, key: PartitionKey, dataset: &str, consumer: &str) -> String {
        self.store.config().join(&paths::ack(consumer, dataset, key))
    }
}
