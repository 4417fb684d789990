//! Error types for stage orchestration.

use std::time::Duration;

use tessera_catalog::CatalogError;
use tessera_core::PartitionKey;

/// The result type used throughout tessera-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while planning or running stages.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A cycle was detected in the stage dependency graph.
    #[error("cycle detected in stage graph: {cycle:?}")]
    CycleDetected {
        /// Stages involved in the cycle.
        cycle: Vec<String>,
    },

    /// A DAG node was not found (internal graph operation error).
    #[error("DAG node not found: {node}")]
    DagNodeNotFound {
        /// The node identifier (index or value).
        node: String,
    },

    /// Two stages were registered under the same name.
    #[error("duplicate stage: {stage}")]
    DuplicateStage {
        /// The repeated stage name.
        stage: String,
    },

    /// Two stages declare the same output dataset.
    #[error("dataset '{output}' is produced by both '{first}' and '{second}'")]
    DuplicateOutput {
        /// The contested output dataset.
        output: String,
        /// The stage registered first.
        first: String,
        /// The stage registered second.
        second: String,
    },

    /// A stage was not found in the pipeline.
    #[error("stage not found: {stage}")]
    StageNotFound {
        /// The unknown stage name.
        stage: String,
    },

    /// An invalid state transition was attempted.
    #[error("invalid state transition: {from} -> {to} ({reason})")]
    InvalidStateTransition {
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
        /// The reason the transition is invalid.
        reason: String,
    },

    /// A stage attempt exceeded its deadline.
    #[error("stage '{stage}' for {key} timed out after {after:?}")]
    Timeout {
        /// The stage name.
        stage: String,
        /// The month being processed.
        key: PartitionKey,
        /// The deadline that was exceeded.
        after: Duration,
    },

    /// A stage attempt was cancelled by shutdown.
    #[error("stage '{stage}' for {key} cancelled")]
    Cancelled {
        /// The stage name.
        stage: String,
        /// The month being processed.
        key: PartitionKey,
    },

    /// A stage did not run because a stage it depends on failed.
    #[error("upstream stage '{upstream}' failed")]
    UpstreamFailed {
        /// The failed upstream stage.
        upstream: String,
    },

    /// A stage processor or collector reported a failure of its own.
    #[error("stage processing failed: {message}")]
    Processor {
        /// Description of the failure.
        message: String,
        /// Whether retrying may succeed.
        transient: bool,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An error from the catalog (store, registry, combine, extension).
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// An error from tessera-core.
    #[error("core error: {0}")]
    Core(#[from] tessera_core::Error),
}

impl Error {
    /// Creates a processor error that is worth retrying, such as a network
    /// failure while collecting.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Processor {
            message: message.into(),
            transient: true,
        }
    }

    /// Creates a processor error that retrying cannot fix.
    #[must_use]
    pub fn logical(message: impl Into<String>) -> Self {
        Self::Processor {
            message: message.into(),
            transient: false,
        }
    }

    /// Returns true if retrying the same attempt may succeed.
    ///
    /// Timeouts and I/O failures are transient; schema conflicts, row
    /// mismatches, missing sources and cancellation are not.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Processor { transient, .. } => *transient,
            Self::Catalog(err) => err.is_transient(),
            Self::Core(err) => err.is_transient(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}
