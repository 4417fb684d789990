//! Append-only history of stage records.
//!
//! Every transition of every stage run is appended, never rewritten, so the
//! log answers "what happened to stage S for month M" and drives both the
//! skip decision and replay of failed months.
//!
//! ## Storage Layout
//!
//! ```text
//! {prefix}/_stages/stage={stage}/year=YYYY/month=MM/{ulid}.json
//! ```
//!
//! ULIDs come from a monotonic generator, so listing order is append order.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use ulid::Generator;

use tessera_catalog::manifest::validate_name;
use tessera_catalog::StoreConfig;
use tessera_core::{PartitionKey, StorageBackend, WritePrecondition};

use crate::error::{Error, Result};
use crate::stage::{StageRecord, StageStatus};

/// Prefix of the stage log under the store root.
pub const STAGES_PREFIX: &str = "_stages";

/// Durable, append-only record of stage transitions.
#[async_trait]
pub trait StageLog: Send + Sync {
    /// Appends one record.
    async fn append(&self, record: &StageRecord) -> Result<()>;

    /// All records for `(stage, key)`, oldest first.
    async fn history(&self, stage: &str, key: PartitionKey) -> Result<Vec<StageRecord>>;

    /// The newest record for `(stage, key)`.
    async fn latest(&self, stage: &str, key: PartitionKey) -> Result<Option<StageRecord>> {
        Ok(self.history(stage, key).await?.pop())
    }

    /// The newest `Succeeded` record for `(stage, key)`.
    async fn last_succeeded(
        &self,
        stage: &str,
        key: PartitionKey,
    ) -> Result<Option<StageRecord>> {
        Ok(self
            .history(stage, key)
            .await?
            .into_iter()
            .rev()
            .find(|r| r.status == StageStatus::Succeeded))
    }
}

/// In-memory stage log for tests and single-process runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStageLog {
    records: Arc<RwLock<HashMap<(String, PartitionKey), Vec<StageRecord>>>>,
}

impl InMemoryStageLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record across stages and months.
    #[must_use]
    pub fn all(&self) -> Vec<StageRecord> {
        let Ok(records) = self.records.read() else {
            return Vec::new();
        };
        let mut all: Vec<StageRecord> = records.values().flatten().cloned().collect();
        all.sort_by(|a, b| {
            (a.key, &a.stage_name, a.recorded_at).cmp(&(b.key, &b.stage_name, b.recorded_at))
        });
        all
    }
}

#[async_trait]
impl StageLog for InMemoryStageLog {
    async fn append(&self, record: &StageRecord) -> Result<()> {
        let mut records = self
            .records
            .write()
            .map_err(|_| Error::Core(tessera_core::Error::internal("stage log lock poisoned")))?;
        records
            .entry((record.stage_name.clone(), record.key))
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn history(&self, stage: &str, key: PartitionKey) -> Result<Vec<StageRecord>> {
        let records = self
            .records
            .read()
            .map_err(|_| Error::Core(tessera_core::Error::internal("stage log lock poisoned")))?;
        Ok(records
            .get(&(stage.to_string(), key))
            .cloned()
            .unwrap_or_default())
    }
}

/// Stage log persisted as one JSON object per record.
pub struct StorageStageLog {
    backend: Arc<dyn StorageBackend>,
    config: StoreConfig,
    ids: Mutex<Generator>,
}

impl fmt::Debug for StorageStageLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageStageLog")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl StorageStageLog {
    /// Creates a log rooted at `config.prefix`.
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>, config: StoreConfig) -> Self {
        Self {
            backend,
            config,
            ids: Mutex::new(Generator::new()),
        }
    }

    fn dir(&self, stage: &str, key: PartitionKey) -> String {
        self.config.join(&format!(
            "{STAGES_PREFIX}/stage={stage}/{}/",
            key.hive_path()
        ))
    }

    fn next_id(&self) -> Result<ulid::Ulid> {
        let mut ids = self
            .ids
            .lock()
            .map_err(|_| Error::Core(tessera_core::Error::internal("ulid generator poisoned")))?;
        ids.generate()
            .map_err(|e| Error::Core(tessera_core::Error::internal(e.to_string())))
    }
}

#[async_trait]
impl StageLog for StorageStageLog {
    async fn append(&self, record: &StageRecord) -> Result<()> {
        validate_name("stage", &record.stage_name)?;
        let path = format!(
            "{}{}.json",
            self.dir(&record.stage_name, record.key),
            self.next_id()?
        );
        let bytes = Bytes::from(serde_json::to_vec(record)?);
        let result = self
            .backend
            .put(&path, bytes, WritePrecondition::DoesNotExist)
            .await?;
        if !result.is_success() {
            return Err(Error::Core(tessera_core::Error::internal(format!(
                "stage record id collision at {path}"
            ))));
        }
        Ok(())
    }

    async fn history(&self, stage: &str, key: PartitionKey) -> Result<Vec<StageRecord>> {
        validate_name("stage", stage)?;
        let mut entries = self.backend.list(&self.dir(stage, key)).await?;
        entries.retain(|m| m.path.ends_with(".json"));
        entries.sort_by(|a, b| a.path.cmp(&b.path));

        let mut history = Vec::with_capacity(entries.len());
        for entry in entries {
            let bytes = self.backend.get(&entry.path).await?;
            history.push(serde_json::from_slice(&bytes)?);
        }
        Ok(history)
    }
}
