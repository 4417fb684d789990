//! Stage processors.
//!
//! A processor is the pluggable body of a stage: it reads whatever it needs
//! through the [`StageContext`] and returns the partition to publish. The
//! orchestrator owns everything around it (skip decision, retries, deadline,
//! publishing, bookkeeping).

use std::collections::BTreeMap;

use async_trait::async_trait;

use tessera_catalog::{
    CatalogError, ColumnExtension, ColumnarPartition, CombineConfig, CombineEngine,
    CombinedDataset, ExtensionManager, Fingerprint, FingerprintRegistry, OverlapMode,
    PartitionStore, SourceResolver,
};
use tessera_core::PartitionKey;

use crate::error::{Error, Result};
use crate::pipeline::StageDefinition;

/// Everything one attempt of a stage may use.
#[derive(Debug, Clone)]
pub struct StageContext {
    /// The stage name (also the consumer name for acknowledgements).
    pub stage: String,
    /// The month being processed.
    pub key: PartitionKey,
    /// Declared input datasets.
    pub inputs: Vec<String>,
    /// Declared output dataset.
    pub output: String,
    /// Store holding inputs and receiving the output.
    pub store: PartitionStore,
    /// Registry over the same store.
    pub registry: FingerprintRegistry,
    /// Attempt number, starting at 1 (0 while evaluating the skip condition).
    pub attempt: u32,
}

/// What a stage produces for one month.
#[derive(Debug, Clone)]
pub enum StageOutput {
    /// A plain partition.
    Partition(ColumnarPartition),
    /// A combined dataset; its provenance is recorded in the manifest.
    Combined(CombinedDataset),
}

impl From<ColumnarPartition> for StageOutput {
    fn from(partition: ColumnarPartition) -> Self {
        Self::Partition(partition)
    }
}

impl From<CombinedDataset> for StageOutput {
    fn from(dataset: CombinedDataset) -> Self {
        Self::Combined(dataset)
    }
}

/// The body of a stage.
#[async_trait]
pub trait StageProcessor: Send + Sync {
    /// Fingerprints of the inputs this run would consume, keyed by input
    /// name.
    ///
    /// The default reads each declared input for the same month and fails
    /// with `MissingSource` when one has not been produced.
    async fn input_fingerprints(
        &self,
        ctx: &StageContext,
    ) -> Result<BTreeMap<String, Fingerprint>> {
        declared_input_fingerprints(ctx).await
    }

    /// Produces the stage output for `ctx.key`.
    async fn process(&self, ctx: &StageContext) -> Result<StageOutput>;
}

/// Current fingerprints of every declared input of `ctx` for `ctx.key`.
///
/// # Errors
///
/// `MissingSource` for an input with no partition this month, or store errors.
pub async fn declared_input_fingerprints(
    ctx: &StageContext,
) -> Result<BTreeMap<String, Fingerprint>> {
    let mut fingerprints = BTreeMap::new();
    for input in &ctx.inputs {
        match ctx.registry.fingerprint_of(ctx.key, input).await {
            Ok(fp) => {
                fingerprints.insert(input.clone(), fp);
            }
            Err(err) if err.is_not_found() => {
                return Err(CatalogError::MissingSource {
                    source_name: input.clone(),
                    key: ctx.key,
                }
                .into())
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(fingerprints)
}

// ============================================================================
// Collect
// ============================================================================

/// An external producer of one source's monthly extract.
#[async_trait]
pub trait SourceCollector: Send + Sync {
    /// Produces the partition for exactly one month.
    async fn produce(&self, key: PartitionKey) -> Result<ColumnarPartition>;
}

/// Stores whatever a [`SourceCollector`] produces.
#[derive(Debug)]
pub struct CollectStage<C> {
    collector: C,
}

impl<C: SourceCollector> CollectStage<C> {
    /// Wraps a collector.
    pub const fn new(collector: C) -> Self {
        Self { collector }
    }
}

#[async_trait]
impl<C: SourceCollector> StageProcessor for CollectStage<C> {
    async fn process(&self, ctx: &StageContext) -> Result<StageOutput> {
        let partition = self.collector.produce(ctx.key).await?;
        tracing::debug!(rows = partition.num_rows(), source = %ctx.output, "collected");
        Ok(StageOutput::Partition(partition))
    }
}

// ============================================================================
// Combine
// ============================================================================

/// Resolves the configured sources, combines them and validates the result.
#[derive(Debug, Clone)]
pub struct CombineStage {
    config: CombineConfig,
    engine: CombineEngine,
}

impl CombineStage {
    /// Creates a combine stage.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the configuration is unusable.
    pub fn new(config: CombineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            engine: CombineEngine::new(config.clone()),
            config,
        })
    }

    /// A stage definition whose inputs are the configured sources.
    #[must_use]
    pub fn definition(&self, name: impl Into<String>, output: impl Into<String>) -> StageDefinition {
        StageDefinition::new(name, output)
            .with_inputs(self.config.sources.iter().map(|s| s.name.clone()))
    }

    fn resolver(&self, store: &PartitionStore) -> Result<SourceResolver> {
        Ok(SourceResolver::new(store.clone(), self.config.clone())?)
    }
}

#[async_trait]
impl StageProcessor for CombineStage {
    /// Fingerprints of the partitions that would actually be read, including
    /// fallbacks to earlier months and omitting absent optional sources.
    async fn input_fingerprints(
        &self,
        ctx: &StageContext,
    ) -> Result<BTreeMap<String, Fingerprint>> {
        Ok(self
            .resolver(&ctx.store)?
            .current_fingerprints(ctx.key)
            .await?)
    }

    async fn process(&self, ctx: &StageContext) -> Result<StageOutput> {
        let resolved = self.resolver(&ctx.store)?.resolve(ctx.key).await?;
        for (source, origin) in &resolved.origins {
            if *origin != ctx.key {
                tracing::info!(%source, from = %origin, month = %ctx.key, "using earlier month");
            }
        }
        let expected = self.engine.expected_columns(&resolved.partitions)?;
        let combined = self.engine.combine(ctx.key, resolved.partitions)?;
        self.engine.validate(&combined, &expected)?;
        Ok(StageOutput::Combined(combined))
    }
}

// ============================================================================
// Extend
// ============================================================================

/// Derives new columns for a combined month (imputation, feature generation).
#[async_trait]
pub trait ColumnGenerator: Send + Sync {
    /// Computes columns keyed by the base dataset's row identities.
    async fn generate(&self, key: PartitionKey, base: &CombinedDataset)
        -> Result<ColumnarPartition>;
}

/// Reads a combined dataset, derives columns and merges them in.
#[derive(Debug)]
pub struct ExtendStage<G> {
    base: String,
    generator: G,
    manager: ExtensionManager,
}

impl<G: ColumnGenerator> ExtendStage<G> {
    /// Extends `base` with the generator's columns, rejecting overlaps.
    pub fn new(base: impl Into<String>, generator: G) -> Self {
        Self::with_mode(base, generator, OverlapMode::Reject)
    }

    /// Extends `base` using the given overlap mode.
    pub fn with_mode(base: impl Into<String>, generator: G, mode: OverlapMode) -> Self {
        Self {
            base: base.into(),
            generator,
            manager: ExtensionManager::new(mode),
        }
    }

    /// A stage definition reading the base dataset.
    #[must_use]
    pub fn definition(&self, name: impl Into<String>, output: impl Into<String>) -> StageDefinition {
        StageDefinition::new(name, output).with_inputs([self.base.clone()])
    }
}

#[async_trait]
impl<G: ColumnGenerator> StageProcessor for ExtendStage<G> {
    async fn process(&self, ctx: &StageContext) -> Result<StageOutput> {
        let base = match ctx.store.read_combined(ctx.key, &self.base).await {
            Ok(base) => base,
            Err(err) if err.is_not_found() => {
                return Err(CatalogError::MissingSource {
                    source_name: self.base.clone(),
                    key: ctx.key,
                }
                .into())
            }
            Err(err) => return Err(err.into()),
        };
        let columns = self.generator.generate(ctx.key, &base).await?;
        let extended = self
            .manager
            .extend(&base, ColumnExtension::from_stage(ctx.stage.clone(), columns))?;
        Ok(StageOutput::Combined(extended))
    }
}

/// Rejects an output that belongs to a different month than the context.
pub(crate) fn check_output_month(ctx: &StageContext, output: &StageOutput) -> Result<()> {
    if let StageOutput::Combined(dataset) = output {
        if dataset.key != ctx.key {
            return Err(Error::logical(format!(
                "stage '{}' returned {} while processing {}",
                ctx.stage, dataset.key, ctx.key
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use tessera_catalog::{Column, SourceSpec, StoreConfig};
    use tessera_core::MemoryBackend;

    fn march() -> PartitionKey {
        PartitionKey::new(2024, 3).unwrap()
    }

    fn context(store: &PartitionStore, inputs: &[&str], output: &str) -> StageContext {
        StageContext {
            stage: "test_stage".into(),
            key: march(),
            inputs: inputs.iter().map(ToString::to_string).collect(),
            output: output.into(),
            store: store.clone(),
            registry: FingerprintRegistry::new(store.clone()),
            attempt: 1,
        }
    }

    fn store() -> PartitionStore {
        PartitionStore::new(Arc::new(MemoryBackend::new()), StoreConfig::with_prefix("lake"))
    }

    fn daily(column: &str, cells: &[&str], value: f64) -> ColumnarPartition {
        let day = march().first_day();
        ColumnarPartition::new(vec![
            Column::grid_ids(cells.iter().copied()),
            Column::dates(cells.iter().map(|_| day)),
            Column::numeric(column, cells.iter().map(|_| Some(value)).collect()),
        ])
        .unwrap()
    }

    struct Fixed(ColumnarPartition);

    #[async_trait]
    impl SourceCollector for Fixed {
        async fn produce(&self, _key: PartitionKey) -> Result<ColumnarPartition> {
            Ok(self.0.clone())
        }
    }

    struct Doubler;

    #[async_trait]
    impl ColumnGenerator for Doubler {
        async fn generate(
            &self,
            _key: PartitionKey,
            base: &CombinedDataset,
        ) -> Result<ColumnarPartition> {
            let p = &base.partition;
            let aod = p.column("aod").ok_or_else(|| Error::logical("no aod"))?;
            let doubled = match aod.data() {
                tessera_catalog::ColumnData::Numeric(v) => {
                    v.iter().map(|x| x.map(|x| x * 2.0)).collect()
                }
                _ => return Err(Error::logical("aod not numeric")),
            };
            Ok(ColumnarPartition::new(vec![
                p.column("grid_id").cloned().ok_or_else(|| Error::logical("no grid"))?,
                p.column("date").cloned().ok_or_else(|| Error::logical("no date"))?,
                Column::numeric("aod_x2", doubled),
            ])?)
        }
    }

    #[tokio::test]
    async fn missing_declared_input_is_missing_source() {
        let store = store();
        let ctx = context(&store, &["aod"], "combined");
        let err = declared_input_fingerprints(&ctx).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Catalog(CatalogError::MissingSource { ref source_name, .. }) if source_name == "aod"
        ));
    }

    #[tokio::test]
    async fn collect_stage_returns_the_collected_partition() {
        let store = store();
        let partition = daily("aod", &["g1"], 0.3);
        let stage = CollectStage::new(Fixed(partition.clone()));
        let ctx = context(&store, &[], "aod");
        assert!(stage.input_fingerprints(&ctx).await.unwrap().is_empty());
        match stage.process(&ctx).await.unwrap() {
            StageOutput::Partition(p) => assert_eq!(p, partition),
            StageOutput::Combined(_) => panic!("expected a plain partition"),
        }
    }

    #[tokio::test]
    async fn combine_stage_joins_configured_sources() {
        let store = store();
        store.write(march(), "aod", &daily("aod", &["g1", "g2"], 0.3)).await.unwrap();
        store.write(march(), "pm25", &daily("pm25", &["g2", "g3"], 12.0)).await.unwrap();

        let stage = CombineStage::new(CombineConfig::new(vec![
            SourceSpec::time_varying("aod"),
            SourceSpec::time_varying("pm25"),
        ]))
        .unwrap();
        let definition = stage.definition("combine", "combined");
        assert_eq!(definition.inputs, vec!["aod".to_string(), "pm25".into()]);

        let ctx = context(&store, &["aod", "pm25"], "combined");
        let inputs = stage.input_fingerprints(&ctx).await.unwrap();
        assert_eq!(inputs.len(), 2);

        let StageOutput::Combined(combined) = stage.process(&ctx).await.unwrap() else {
            panic!("expected a combined dataset");
        };
        assert_eq!(combined.partition.num_rows(), 3);
        assert_eq!(combined.contributing_fingerprints.len(), 2);
        assert_eq!(combined.contributing_fingerprints["aod"], inputs["aod"]);
    }

    #[tokio::test]
    async fn extend_stage_appends_generated_columns() {
        let store = store();
        store.write(march(), "aod", &daily("aod", &["g1", "g2"], 0.5)).await.unwrap();
        let combine = CombineStage::new(CombineConfig::new(vec![SourceSpec::time_varying("aod")]))
            .unwrap();
        let StageOutput::Combined(base) = combine
            .process(&context(&store, &["aod"], "combined"))
            .await
            .unwrap()
        else {
            panic!("expected a combined dataset");
        };
        store.write_combined("combined", &base).await.unwrap();

        let stage = ExtendStage::new("combined", Doubler);
        assert_eq!(stage.definition("features", "featured").inputs, vec!["combined".to_string()]);
        let ctx = context(&store, &["combined"], "featured");
        let StageOutput::Combined(extended) = stage.process(&ctx).await.unwrap() else {
            panic!("expected a combined dataset");
        };
        assert_eq!(extended.partition.column("aod"), base.partition.column("aod"));
        assert!(extended.partition.column("aod_x2").is_some());
        assert!(extended.contributing_fingerprints.contains_key("aod"));
        assert!(extended.contributing_fingerprints.contains_key("test_stage"));
    }

    #[tokio::test]
    async fn extend_stage_without_base_is_missing_source() {
        let store = store();
        let stage = ExtendStage::new("combined", Doubler);
        let err = stage
            .process(&context(&store, &["combined"], "featured"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Catalog(CatalogError::MissingSource { .. })));
    }
}
