//! Storage for trained model artifacts.
//!
//! Stages outside the core (imputation training, regression) persist model
//! bytes plus evaluation metrics and later load the latest version. Each
//! save writes an immutable artifact object and then repoints `latest.json`
//! at it, so a reader never loads a half-written model.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use tessera_core::{PartitionKey, StorageBackend, WritePrecondition};

use crate::config::StoreConfig;
use crate::error::{CatalogError, Result};
use crate::manifest::{paths, validate_name};

/// Metadata of one saved model artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelArtifactMeta {
    /// Model identifier.
    pub model_id: String,
    /// Month of data the model was trained for.
    pub key: PartitionKey,
    /// Artifact object path, relative to the store prefix.
    pub artifact_path: String,
    /// Size of the artifact in bytes.
    pub size: u64,
    /// Evaluation metrics reported by the trainer. Always finite.
    pub metrics: BTreeMap<String, f64>,
    /// When the artifact was saved.
    pub saved_at: DateTime<Utc>,
}

/// A loaded model: its metadata and raw bytes.
#[derive(Debug, Clone)]
pub struct ModelHandle {
    /// Artifact metadata.
    pub meta: ModelArtifactMeta,
    /// Serialized model.
    pub bytes: Bytes,
}

/// Persists and loads model artifacts.
#[async_trait]
pub trait ModelArtifactStore: Send + Sync {
    /// Saves a new version of `model_id`; the latest save wins.
    ///
    /// Non-finite metric values are rejected with `InvalidInput` before
    /// anything is written.
    async fn save(
        &self,
        model_id: &str,
        key: PartitionKey,
        bytes: Bytes,
        metrics: BTreeMap<String, f64>,
    ) -> Result<ModelArtifactMeta>;

    /// Loads the latest version of `model_id`.
    ///
    /// Returns `NotFound` if the model was never saved.
    async fn load(&self, model_id: &str) -> Result<ModelHandle>;
}

/// [`ModelArtifactStore`] over a [`StorageBackend`].
#[derive(Clone)]
pub struct StorageModelStore {
    backend: Arc<dyn StorageBackend>,
    config: StoreConfig,
}

impl fmt::Debug for StorageModelStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageModelStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl StorageModelStore {
    /// Creates a model store.
    pub fn new(backend: Arc<dyn StorageBackend>, config: StoreConfig) -> Self {
        Self { backend, config }
    }

    fn model_dir(&self, model_id: &str) -> String {
        self.config
            .join(&format!("{}/{model_id}", paths::MODELS_PREFIX))
    }
}

#[async_trait]
impl ModelArtifactStore for StorageModelStore {
    async fn save(
        &self,
        model_id: &str,
        key: PartitionKey,
        bytes: Bytes,
        metrics: BTreeMap<String, f64>,
    ) -> Result<ModelArtifactMeta> {
        validate_name("model", model_id)?;
        if let Some((name, value)) = metrics.iter().find(|(_, v)| !v.is_finite()) {
            return Err(CatalogError::invalid(format!(
                "model '{model_id}' metric '{name}' is not finite: {value}"
            )));
        }
        let artifact_rel = format!("{}/{model_id}/{}.bin", paths::MODELS_PREFIX, Ulid::new());
        let size = bytes.len() as u64;

        self.backend
            .put(
                &self.config.join(&artifact_rel),
                bytes,
                WritePrecondition::DoesNotExist,
            )
            .await?;

        let meta = ModelArtifactMeta {
            model_id: model_id.to_string(),
            key,
            artifact_path: artifact_rel,
            size,
            metrics,
            saved_at: Utc::now(),
        };
        self.backend
            .put(
                &format!("{}/latest.json", self.model_dir(model_id)),
                Bytes::from(serde_json::to_vec_pretty(&meta)?),
                WritePrecondition::None,
            )
            .await?;

        tracing::info!(model_id, month = %key, size, "saved model artifact");
        Ok(meta)
    }

    async fn load(&self, model_id: &str) -> Result<ModelHandle> {
        validate_name("model", model_id)?;
        let latest = format!("{}/latest.json", self.model_dir(model_id));
        let meta: ModelArtifactMeta = match self.backend.get(&latest).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.is_not_found() => {
                return Err(CatalogError::NotFound {
                    message: format!("model '{model_id}' has no saved artifact"),
                })
            }
            Err(e) => return Err(e.into()),
        };
        let bytes = self.backend.get(&self.config.join(&meta.artifact_path)).await?;
        Ok(ModelHandle { meta, bytes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::MemoryBackend;

    #[tokio::test]
    async fn latest_save_wins() {
        let store = StorageModelStore::new(Arc::new(MemoryBackend::new()), StoreConfig::default());
        let key = PartitionKey::new(2024, 3).unwrap();

        store
            .save("imputer", key, Bytes::from("v1"), BTreeMap::new())
            .await
            .unwrap();
        let meta = store
            .save(
                "imputer",
                key,
                Bytes::from("v2"),
                BTreeMap::from([("r2".to_string(), 0.81)]),
            )
            .await
            .unwrap();

        let handle = store.load("imputer").await.unwrap();
        assert_eq!(handle.bytes, Bytes::from("v2"));
        assert_eq!(handle.meta, meta);
        assert!(handle.meta.artifact_path.starts_with("_models/imputer/"));
    }

    #[tokio::test]
    async fn unknown_model_is_not_found() {
        let store = StorageModelStore::new(Arc::new(MemoryBackend::new()), StoreConfig::default());
        assert!(store.load("nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn non_finite_metric_is_rejected_before_any_write() {
        let backend = Arc::new(MemoryBackend::new());
        let store = StorageModelStore::new(backend.clone(), StoreConfig::default());
        let key = PartitionKey::new(2024, 3).unwrap();
        store
            .save("imputer", key, Bytes::from("v1"), BTreeMap::from([("r2".to_string(), 0.5)]))
            .await
            .unwrap();
        let objects = backend.len();

        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let err = store
                .save(
                    "imputer",
                    key,
                    Bytes::from("v2"),
                    BTreeMap::from([("r2".to_string(), bad)]),
                )
                .await
                .unwrap_err();
            assert!(matches!(err, CatalogError::InvalidInput { .. }));
        }

        assert_eq!(backend.len(), objects);
        let handle = store.load("imputer").await.unwrap();
        assert_eq!(handle.bytes, Bytes::from("v1"));
        assert_eq!(handle.meta.metrics["r2"], 0.5);
    }
}
