//! Stage lifecycle per `(stage, month)`.
//!
//! This module provides:
//! - `StageStatus`: the state machine for one execution of a stage on a month
//! - `StageRecord`: an immutable snapshot appended to the stage log on every transition
//! - `StageError`: the captured failure of a run, with its retry category
//!
//! ```text
//! Pending ──► Running ──► Succeeded
//!    │           └──────► Failed
//!    ├──► Skipped          (inputs unchanged since the last success)
//!    └──► Failed           (inputs unavailable, upstream failed, cancelled)
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use tessera_catalog::Fingerprint;
use tessera_core::PartitionKey;

use crate::error::{Error, Result};

/// Status of one stage execution for one month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Scheduled; the skip condition has not been evaluated yet.
    Pending,
    /// The stage processor is executing.
    Running,
    /// Completed and its output was published.
    Succeeded,
    /// Not executed because its inputs are unchanged.
    Skipped,
    /// Failed after exhausting retries, or could not start.
    Failed,
}

impl StageStatus {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped | Self::Failed)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub const fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Pending => matches!(target, Self::Running | Self::Skipped | Self::Failed),
            Self::Running => matches!(target, Self::Succeeded | Self::Failed),
            Self::Succeeded | Self::Skipped | Self::Failed => false,
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Why a stage failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageErrorCategory {
    /// Network, storage or deadline failure that outlived the retry budget.
    Transient,
    /// Violated input contract: schema conflict, row mismatch, missing source.
    Logical,
    /// Shut down before completing.
    Cancelled,
    /// A stage this one depends on failed for the same month.
    Upstream,
}

/// Captured failure detail of a stage run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageError {
    /// Error category.
    pub category: StageErrorCategory,
    /// Error message.
    pub message: String,
}

impl From<&Error> for StageError {
    fn from(err: &Error) -> Self {
        let category = match err {
            Error::Cancelled { .. } => StageErrorCategory::Cancelled,
            Error::UpstreamFailed { .. } => StageErrorCategory::Upstream,
            err if err.is_transient() => StageErrorCategory::Transient,
            _ => StageErrorCategory::Logical,
        };
        Self {
            category,
            message: err.to_string(),
        }
    }
}

/// One entry of the append-only stage log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageRecord {
    /// Groups the records of one execution.
    pub run_id: Ulid,
    /// The stage name.
    pub stage_name: String,
    /// The month.
    pub key: PartitionKey,
    /// Status after this transition.
    pub status: StageStatus,
    /// Fingerprints of the declared inputs this run evaluated.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub input_fingerprints: BTreeMap<String, Fingerprint>,
    /// Storage location of the published output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_location: Option<String>,
    /// Fingerprint of the published output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_fingerprint: Option<Fingerprint>,
    /// Failure detail when `status` is `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<StageError>,
    /// Attempts made so far (0 before the processor is first invoked).
    pub attempt: u32,
    /// When this transition happened.
    pub recorded_at: DateTime<Utc>,
}

impl StageRecord {
    /// Starts a new execution in `Pending`.
    #[must_use]
    pub fn pending(stage_name: impl Into<String>, key: PartitionKey) -> Self {
        Self {
            run_id: Ulid::new(),
            stage_name: stage_name.into(),
            key,
            status: StageStatus::Pending,
            input_fingerprints: BTreeMap::new(),
            output_location: None,
            output_fingerprint: None,
            last_error: None,
            attempt: 0,
            recorded_at: Utc::now(),
        }
    }

    /// Transitions to a new state.
    ///
    /// # Errors
    ///
    /// Returns `InvalidStateTransition` if the state machine forbids it.
    #[tracing::instrument(
        skip(self),
        fields(stage = %self.stage_name, month = %self.key, from = %self.status, to = %target)
    )]
    pub fn transition_to(&mut self, target: StageStatus) -> Result<()> {
        if !self.status.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                from: self.status.to_string(),
                to: target.to_string(),
                reason: if self.status.is_terminal() {
                    "run already finished".to_string()
                } else {
                    format!("not reachable from {}", self.status)
                },
            });
        }
        self.status = target;
        self.recorded_at = Utc::now();
        Ok(())
    }

    /// Transitions to `Failed`, capturing `err`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidStateTransition` from a terminal state.
    pub fn fail(&mut self, err: &Error) -> Result<()> {
        self.transition_to(StageStatus::Failed)?;
        self.last_error = Some(StageError::from(err));
        Ok(())
    }
}
