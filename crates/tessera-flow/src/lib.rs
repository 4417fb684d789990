//! # tessera-flow
//!
//! Stage orchestration for monthly partitions.
//!
//! - **Pipeline**: stages declare same-month inputs and one output; the
//!   dependency DAG and a deterministic order are derived from that
//! - **Skip-if-unchanged**: a stage re-runs for a month only when an input
//!   fingerprint moved since its last success
//! - **Retries**: transient failures and deadline overruns are retried with
//!   bounded exponential backoff; logical failures fail immediately
//! - **Failure isolation**: months are independent, a failed month never
//!   blocks the others, and the [`RunReport`] names the months to replay
//!
//! ## Example
//!
//! ```rust,ignore
//! use tessera_flow::prelude::*;
//!
//! let combine = CombineStage::new(combine_config)?;
//! let pipeline = Pipeline::builder()
//!     .stage(StageDefinition::new("collect_aod", "aod"), CollectStage::new(aod_collector))
//!     .stage(combine.definition("combine", "combined"), combine)
//!     .build()?;
//!
//! let orchestrator = StageOrchestrator::new(
//!     pipeline,
//!     store,
//!     Arc::new(StorageStageLog::new(backend, StoreConfig::with_prefix("lake"))),
//!     OrchestratorConfig::default(),
//! );
//! let report = orchestrator.run_all(PartitionKey::range_inclusive(start, end)).await;
//! for month in report.failed_months() {
//!     tracing::warn!(%month, "needs replay");
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

// Internal modules - not exposed in public API.
pub(crate) mod dag;

pub mod config;
pub mod error;
pub mod log;
pub mod metrics;
pub mod orchestrator;
pub mod pipeline;
pub mod processor;
pub mod report;
pub mod stage;

pub use config::{OrchestratorConfig, RetryPolicy};
pub use error::{Error, Result};
pub use log::{InMemoryStageLog, StageLog, StorageStageLog};
pub use orchestrator::{ShutdownHandle, StageOrchestrator};
pub use pipeline::{Pipeline, PipelineBuilder, StageDefinition};
pub use processor::{
    declared_input_fingerprints, CollectStage, ColumnGenerator, CombineStage, ExtendStage,
    SourceCollector, StageContext, StageOutput, StageProcessor,
};
pub use report::{MonthError, RunReport};
pub use stage::{StageError, StageErrorCategory, StageRecord, StageStatus};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{OrchestratorConfig, RetryPolicy};
    pub use crate::log::{InMemoryStageLog, StageLog, StorageStageLog};
    pub use crate::orchestrator::StageOrchestrator;
    pub use crate::pipeline::{Pipeline, StageDefinition};
    pub use crate::processor::{
        CollectStage, ColumnGenerator, CombineStage, ExtendStage, SourceCollector,
        StageProcessor,
    };
    pub use crate::stage::{StageRecord, StageStatus};
}
