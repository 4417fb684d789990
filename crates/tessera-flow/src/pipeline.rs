//! Pipeline definitions.
//!
//! A pipeline is a set of named stages, each declaring the datasets it reads
//! and the one dataset it writes, all for the same month. Dependencies are
//! derived from those declarations: a stage depends on whichever stage
//! produces one of its inputs. Inputs nobody produces are external datasets
//! deposited by collectors outside the pipeline.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use tessera_catalog::manifest::validate_name;

use crate::dag::StageGraph;
use crate::error::{Error, Result};
use crate::processor::StageProcessor;

/// Declaration of one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDefinition {
    /// Unique stage name; also the consumer name for acknowledgements.
    pub name: String,
    /// Datasets read for the same month.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Dataset written for the month.
    pub output: String,
}

impl StageDefinition {
    /// Creates a stage with no inputs.
    pub fn new(name: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            output: output.into(),
        }
    }

    /// Adds declared inputs.
    #[must_use]
    pub fn with_inputs<S: Into<String>>(mut self, inputs: impl IntoIterator<Item = S>) -> Self {
        self.inputs.extend(inputs.into_iter().map(Into::into));
        self
    }
}

/// A stage definition with its processor.
#[derive(Clone)]
pub(crate) struct RegisteredStage {
    pub(crate) definition: StageDefinition,
    pub(crate) processor: Arc<dyn StageProcessor>,
}

/// A validated, ordered set of stages.
#[derive(Clone)]
pub struct Pipeline {
    stages: HashMap<String, RegisteredStage>,
    order: Vec<String>,
    graph: StageGraph,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline").field("order", &self.order).finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Starts building a pipeline.
    #[must_use]
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Stage names in execution order.
    #[must_use]
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns true if the pipeline has no stages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// The definition of `stage`.
    #[must_use]
    pub fn definition(&self, stage: &str) -> Option<&StageDefinition> {
        self.stages.get(stage).map(|s| &s.definition)
    }

    /// The stage producing `dataset`, if any.
    #[must_use]
    pub fn producer_of(&self, dataset: &str) -> Option<&str> {
        self.order
            .iter()
            .find(|name| {
                self.stages
                    .get(name.as_str())
                    .is_some_and(|s| s.definition.output == dataset)
            })
            .map(String::as_str)
    }

    /// Stages that `stage` directly depends on, in execution order.
    ///
    /// # Errors
    ///
    /// Returns `StageNotFound` for an unknown stage.
    pub fn upstream(&self, stage: &str) -> Result<Vec<String>> {
        if !self.stages.contains_key(stage) {
            return Err(Error::StageNotFound {
                stage: stage.to_string(),
            });
        }
        self.graph.upstream(stage)
    }

    pub(crate) fn stage(&self, stage: &str) -> Result<&RegisteredStage> {
        self.stages.get(stage).ok_or_else(|| Error::StageNotFound {
            stage: stage.to_string(),
        })
    }
}

/// Builder for [`Pipeline`].
#[derive(Default)]
pub struct PipelineBuilder {
    stages: Vec<RegisteredStage>,
}

impl PipelineBuilder {
    /// Adds a stage.
    #[must_use]
    pub fn stage(self, definition: StageDefinition, processor: impl StageProcessor + 'static) -> Self {
        self.shared_stage(definition, Arc::new(processor))
    }

    /// Adds a stage whose processor is shared with other owners.
    #[must_use]
    pub fn shared_stage(
        mut self,
        definition: StageDefinition,
        processor: Arc<dyn StageProcessor>,
    ) -> Self {
        self.stages.push(RegisteredStage {
            definition,
            processor,
        });
        self
    }

    /// Validates the declarations and orders the stages.
    ///
    /// # Errors
    ///
    /// - `Catalog(InvalidInput)` for unusable stage or dataset names.
    /// - `DuplicateStage` / `DuplicateOutput` for repeated names or outputs.
    /// - `CycleDetected` if declarations depend on each other circularly,
    ///   including a stage reading its own output.
    pub fn build(self) -> Result<Pipeline> {
        let mut producers: HashMap<String, String> = HashMap::new();
        let mut stages: HashMap<String, RegisteredStage> = HashMap::new();
        let mut graph = StageGraph::new();

        for stage in &self.stages {
            let def = &stage.definition;
            validate_name("stage", &def.name)?;
            validate_name("dataset", &def.output)?;
            for input in &def.inputs {
                validate_name("dataset", input)?;
            }
            if stages.contains_key(&def.name) {
                return Err(Error::DuplicateStage {
                    stage: def.name.clone(),
                });
            }
            if let Some(first) = producers.get(&def.output) {
                return Err(Error::DuplicateOutput {
                    output: def.output.clone(),
                    first: first.clone(),
                    second: def.name.clone(),
                });
            }
            producers.insert(def.output.clone(), def.name.clone());
            stages.insert(def.name.clone(), stage.clone());
            graph.add_node(&def.name);
        }

        for stage in &self.stages {
            let def = &stage.definition;
            let consumer = graph.add_node(&def.name);
            let inputs: BTreeSet<&String> = def.inputs.iter().collect();
            for input in inputs {
                if let Some(producer) = producers.get(input) {
                    let producer = graph.add_node(producer);
                    graph.add_edge(producer, consumer)?;
                }
            }
        }

        let order = graph.toposort()?;
        tracing::debug!(?order, "pipeline ordered");
        Ok(Pipeline {
            stages,
            order,
            graph,
        })
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::processor::{StageContext, StageOutput};

    struct Unused;

    #[async_trait]
    impl StageProcessor for Unused {
        async fn process(&self, _ctx: &StageContext) -> Result<StageOutput> {
            Err(Error::logical("not invoked in these tests"))
        }
    }

    fn def(name: &str, inputs: &[&str], output: &str) -> StageDefinition {
        StageDefinition::new(name, output).with_inputs(inputs.iter().copied())
    }

    #[test]
    fn stages_are_ordered_by_their_declared_inputs() {
        let pipeline = Pipeline::builder()
            .stage(def("features", &["imputed"], "featured"), Unused)
            .stage(def("impute", &["combined"], "imputed"), Unused)
            .stage(def("combine", &["aod", "stations"], "combined"), Unused)
            .stage(def("collect_aod", &[], "aod"), Unused)
            .build()
            .unwrap();

        assert_eq!(pipeline.order(), ["collect_aod", "combine", "impute", "features"]);
        assert_eq!(pipeline.upstream("combine").unwrap(), vec!["collect_aod".to_string()]);
        assert!(pipeline.upstream("collect_aod").unwrap().is_empty());
        assert_eq!(pipeline.producer_of("combined"), Some("combine"));
        assert_eq!(pipeline.producer_of("stations"), None);
        assert_eq!(pipeline.len(), 4);
    }

    #[test]
    fn ordering_is_stable_across_builds() {
        let build = || {
            Pipeline::builder()
                .stage(def("collect_b", &[], "b"), Unused)
                .stage(def("collect_a", &[], "a"), Unused)
                .stage(def("combine", &["a", "b"], "combined"), Unused)
                .build()
                .unwrap()
        };
        assert_eq!(build().order(), build().order());
        assert_eq!(build().order(), ["collect_b", "collect_a", "combine"]);
    }

    #[test]
    fn cycles_are_rejected() {
        let result = Pipeline::builder()
            .stage(def("a", &["y"], "x"), Unused)
            .stage(def("b", &["x"], "y"), Unused)
            .build();
        assert!(matches!(result, Err(Error::CycleDetected { .. })));
    }

    #[test]
    fn reading_own_output_is_a_cycle() {
        let result = Pipeline::builder()
            .stage(def("extend", &["combined"], "combined"), Unused)
            .build();
        match result {
            Err(Error::CycleDetected { cycle }) => assert_eq!(cycle, vec!["extend".to_string()]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn duplicates_are_rejected() {
        let dup_name = Pipeline::builder()
            .stage(def("collect", &[], "a"), Unused)
            .stage(def("collect", &[], "b"), Unused)
            .build();
        assert!(matches!(dup_name, Err(Error::DuplicateStage { .. })));

        let dup_output = Pipeline::builder()
            .stage(def("collect_a", &[], "a"), Unused)
            .stage(def("collect_b", &[], "a"), Unused)
            .build();
        match dup_output {
            Err(Error::DuplicateOutput { first, second, .. }) => {
                assert_eq!(first, "collect_a");
                assert_eq!(second, "collect_b");
            }
            other => panic!("expected duplicate output, got {other:?}"),
        }
    }

    #[test]
    fn reserved_names_are_rejected() {
        let result = Pipeline::builder().stage(def("_internal", &[], "a"), Unused).build();
        assert!(matches!(result, Err(Error::Catalog(_))));
    }

    #[test]
    fn unknown_stage_has_no_upstream() {
        let pipeline = Pipeline::builder().build().unwrap();
        assert!(pipeline.is_empty());
        assert!(matches!(
            pipeline.upstream("nope"),
            Err(Error::StageNotFound { .. })
        ));
    }
}
