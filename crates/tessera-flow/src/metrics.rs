//! Orchestration metrics.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `tessera_stage_transitions_total` | Counter | `stage`, `from_state`, `to_state` | Stage state transitions |
//! | `tessera_stage_retries_total` | Counter | `stage` | Attempts retried after a transient failure |
//! | `tessera_stage_duration_seconds` | Histogram | `stage`, `state` | Time from Running to a terminal state |
//!
//! Metrics go through the `metrics` facade; the host installs an exporter.

use std::time::Duration;

use metrics::{counter, describe_counter, describe_histogram, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: stage state transitions.
    pub const STAGE_TRANSITIONS_TOTAL: &str = "tessera_stage_transitions_total";
    /// Counter: retried attempts.
    pub const STAGE_RETRIES_TOTAL: &str = "tessera_stage_retries_total";
    /// Histogram: stage execution duration in seconds.
    pub const STAGE_DURATION_SECONDS: &str = "tessera_stage_duration_seconds";
}

/// Label keys used across metrics.
pub mod labels {
    /// Stage name.
    pub const STAGE: &str = "stage";
    /// Final state of an execution.
    pub const STATE: &str = "state";
    /// Previous state (for transitions).
    pub const FROM_STATE: &str = "from_state";
    /// Target state (for transitions).
    pub const TO_STATE: &str = "to_state";
}

/// Registers all flow metric descriptions.
pub fn register_metrics() {
    describe_counter!(names::STAGE_TRANSITIONS_TOTAL, "Total stage state transitions");
    describe_counter!(names::STAGE_RETRIES_TOTAL, "Total stage attempts retried");
    describe_histogram!(
        names::STAGE_DURATION_SECONDS,
        metrics::Unit::Seconds,
        "Stage execution duration"
    );
}

/// Records orchestration metrics with consistent labels.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowMetrics;

impl FlowMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Records a stage state transition. `from` is `"none"` for a new run.
    pub fn record_transition(self, stage: &str, from: &str, to: &str) {
        counter!(
            names::STAGE_TRANSITIONS_TOTAL,
            labels::STAGE => stage.to_string(),
            labels::FROM_STATE => from.to_string(),
            labels::TO_STATE => to.to_string(),
        )
        .increment(1);
    }

    /// Records a retry after a transient failure.
    pub fn record_retry(self, stage: &str) {
        counter!(names::STAGE_RETRIES_TOTAL, labels::STAGE => stage.to_string()).increment(1);
    }

    /// Records how long an execution ran before reaching `state`.
    pub fn observe_duration(self, stage: &str, state: &str, duration: Duration) {
        histogram!(
            names::STAGE_DURATION_SECONDS,
            labels::STAGE => stage.to_string(),
            labels::STATE => state.to_string(),
        )
        .record(duration.as_secs_f64());
    }
}
