//! Aggregated outcome of a multi-month run.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use tessera_core::PartitionKey;

use crate::stage::{StageRecord, StageStatus};

/// A month whose bookkeeping failed before stage outcomes could be recorded
/// (for example the stage log itself was unreachable).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthError {
    /// The month.
    pub key: PartitionKey,
    /// What went wrong.
    pub message: String,
}

/// Final record of every `(stage, month)` unit of a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    /// Terminal records, ordered by month then pipeline order.
    pub records: Vec<StageRecord>,
    /// Months that could not be processed at all.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<MonthError>,
}

impl RunReport {
    pub(crate) fn push_month(&mut self, records: Vec<StageRecord>) {
        self.records.extend(records);
    }

    pub(crate) fn push_error(&mut self, key: PartitionKey, message: String) {
        self.errors.push(MonthError { key, message });
    }

    pub(crate) fn finish(mut self) -> Self {
        // Stable: keeps pipeline order within a month.
        self.records.sort_by_key(|r| r.key);
        self.errors.sort_by_key(|e| e.key);
        self
    }

    /// Records with the given status.
    pub fn with_status(&self, status: StageStatus) -> impl Iterator<Item = &StageRecord> {
        self.records.iter().filter(move |r| r.status == status)
    }

    /// Number of records with the given status.
    #[must_use]
    pub fn count(&self, status: StageStatus) -> usize {
        self.with_status(status).count()
    }

    /// The terminal record of `stage` for `key`.
    #[must_use]
    pub fn outcome(&self, stage: &str, key: PartitionKey) -> Option<&StageRecord> {
        self.records
            .iter()
            .find(|r| r.key == key && r.stage_name == stage)
    }

    /// Months with at least one failed stage or a bookkeeping error, in
    /// ascending order. These are the months to replay.
    #[must_use]
    pub fn failed_months(&self) -> Vec<PartitionKey> {
        self.with_status(StageStatus::Failed)
            .map(|r| r.key)
            .chain(self.errors.iter().map(|e| e.key))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Returns true if nothing failed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.errors.is_empty() && self.count(StageStatus::Failed) == 0
    }
}
