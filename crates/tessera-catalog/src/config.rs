//! Configuration for the partition store and the combine step.
//!
//! All configuration is plain data passed at construction time. Structs are
//! serde-deserializable so a host binary can load them from any format.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{CatalogError, Result};

/// Where the store keeps its objects inside the storage backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path prefix (no leading or trailing slash). Empty means the backend root.
    pub prefix: String,
}

impl StoreConfig {
    /// Creates a config rooted at `prefix`.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into().trim_matches('/').to_string(),
        }
    }

    /// Joins `path` under the configured prefix.
    #[must_use]
    pub fn join(&self, path: &str) -> String {
        if self.prefix.is_empty() {
            path.to_string()
        } else {
            format!("{}/{path}", self.prefix)
        }
    }
}

/// Whether a source varies by date within the month.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// One row per grid cell and date.
    #[default]
    TimeVarying,
    /// One row per grid cell, broadcast across every date.
    Static,
}

/// What to do when a source has no partition for the requested month.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingDataPolicy {
    /// Absence fails the month (if required) or omits the source (if optional).
    #[default]
    Fail,
    /// Use the latest partition strictly before the requested month.
    CopyLatestAvailableBefore,
}

/// How a source's value columns interact with same-named columns of others.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Same-named columns are a schema conflict.
    #[default]
    Reject,
    /// This source's columns replace same-named columns of other sources.
    Override,
}

/// One input of the combine step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpec {
    /// Dataset name in the partition store.
    pub name: String,
    /// Shape of the source.
    #[serde(default)]
    pub kind: SourceKind,
    /// Whether absence of the month fails the combination.
    #[serde(default = "default_required")]
    pub required: bool,
    /// Fallback when the month is absent.
    #[serde(default)]
    pub missing_data: MissingDataPolicy,
    /// Column overlap handling.
    #[serde(default)]
    pub overlap: OverlapPolicy,
    /// Rename value columns to `<source>__<column>`.
    #[serde(default)]
    pub prefix_columns: bool,
}

const fn default_required() -> bool {
    true
}

impl SourceSpec {
    /// A required time-varying source with default policies.
    pub fn time_varying(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: SourceKind::TimeVarying,
            required: true,
            missing_data: MissingDataPolicy::Fail,
            overlap: OverlapPolicy::Reject,
            prefix_columns: false,
        }
    }

    /// A required static (date-invariant) source with default policies.
    pub fn static_source(name: impl Into<String>) -> Self {
        Self {
            kind: SourceKind::Static,
            ..Self::time_varying(name)
        }
    }

    /// Marks the source optional.
    #[must_use]
    pub const fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Sets the missing-data policy.
    #[must_use]
    pub const fn with_missing_data(mut self, policy: MissingDataPolicy) -> Self {
        self.missing_data = policy;
        self
    }

    /// Sets the overlap policy.
    #[must_use]
    pub const fn with_overlap(mut self, overlap: OverlapPolicy) -> Self {
        self.overlap = overlap;
        self
    }

    /// Enables `<source>__<column>` renaming.
    #[must_use]
    pub const fn prefixed(mut self) -> Self {
        self.prefix_columns = true;
        self
    }

    /// The output name of a value column from this source.
    #[must_use]
    pub fn output_column(&self, column: &str) -> String {
        if self.prefix_columns {
            format!("{}__{column}", self.name)
        } else {
            column.to_string()
        }
    }
}

/// Configuration of one combine step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombineConfig {
    /// Inputs, by dataset name.
    pub sources: Vec<SourceSpec>,
    /// When set, a combined month must have `grid cells x days` rows.
    #[serde(default)]
    pub expected_grid_cells: Option<usize>,
}

impl CombineConfig {
    /// Creates a config for the given sources.
    #[must_use]
    pub fn new(sources: Vec<SourceSpec>) -> Self {
        Self {
            sources,
            expected_grid_cells: None,
        }
    }

    /// Requires `cells x days` rows in every combined month.
    #[must_use]
    pub const fn with_expected_grid_cells(mut self, cells: usize) -> Self {
        self.expected_grid_cells = Some(cells);
        self
    }

    /// Looks up a source by name.
    #[must_use]
    pub fn source(&self, name: &str) -> Option<&SourceSpec> {
        self.sources.iter().find(|s| s.name == name)
    }

    /// Checks the config is internally consistent.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if there are no sources, a name repeats, no
    /// source is time-varying, or a time-varying source uses the
    /// copy-latest fallback (an earlier month's dates never align).
    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(CatalogError::invalid("combine config has no sources"));
        }
        let mut names = HashSet::new();
        for source in &self.sources {
            if source.name.is_empty() {
                return Err(CatalogError::invalid("source name cannot be empty"));
            }
            if !names.insert(source.name.as_str()) {
                return Err(CatalogError::invalid(format!(
                    "source '{}' configured twice",
                    source.name
                )));
            }
            if source.kind == SourceKind::TimeVarying
                && source.missing_data == MissingDataPolicy::CopyLatestAvailableBefore
            {
                return Err(CatalogError::invalid(format!(
                    "time-varying source '{}' cannot copy an earlier month",
                    source.name
                )));
            }
        }
        if !self
            .sources
            .iter()
            .any(|s| s.kind == SourceKind::TimeVarying)
        {
            return Err(CatalogError::invalid(
                "combine config needs at least one time-varying source",
            ));
        }
        Ok(())
    }
}
