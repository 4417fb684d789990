//! Error types for tessera-catalog operations.
//!
//! The variants mirror the failure taxonomy the pipeline branches on:
//! absence (`NotFound`, `MissingSource`), violated input contracts
//! (`SchemaConflict`, `RowMismatch`, `Validation`), and transient I/O
//! (`Storage`, `CasFailed`).

use thiserror::Error;

use tessera_core::PartitionKey;

/// Result type alias for catalog operations.
pub type Result<T> = std::result::Result<T, CatalogError>;

/// Errors that can occur during catalog operations.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
    },

    /// Serialization/deserialization failed.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// Parquet encoding or decoding failed.
    #[error("parquet error: {message}")]
    Parquet {
        /// Description of the Parquet failure.
        message: String,
    },

    /// CAS (Compare-And-Swap) operation failed due to concurrent modification.
    #[error("CAS failed: {message}")]
    CasFailed {
        /// Description of the CAS failure.
        message: String,
    },

    /// Requested partition or object does not exist.
    #[error("not found: {message}")]
    NotFound {
        /// Description of what was not found.
        message: String,
    },

    /// Two inputs claim the same column, or a column has an unexpected shape.
    #[error("schema conflict: {message}")]
    SchemaConflict {
        /// Description of the conflict.
        message: String,
    },

    /// Row identities of two partitions are not compatible.
    #[error("row mismatch: {message}")]
    RowMismatch {
        /// Description of the mismatch.
        message: String,
    },

    /// A required source has no partition for the month.
    #[error("missing source '{source_name}' for {key}")]
    MissingSource {
        /// The configured source name.
        source_name: String,
        /// The month that was requested.
        key: PartitionKey,
    },

    /// A combined output failed its post-combination checks.
    #[error("validation failed: {message}")]
    Validation {
        /// Description of the failed check.
        message: String,
    },

    /// Invalid input was provided.
    #[error("invalid input: {message}")]
    InvalidInput {
        /// Description of the invalid input.
        message: String,
    },
}

impl CatalogError {
    /// Returns true if retrying the same operation may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Storage { .. } | Self::CasFailed { .. })
    }

    /// Returns true if this error reports an absent partition or object.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub(crate) fn conflict(message: impl Into<String>) -> Self {
        Self::SchemaConflict {
            message: message.into(),
        }
    }

    pub(crate) fn mismatch(message: impl Into<String>) -> Self {
        Self::RowMismatch {
            message: message.into(),
        }
    }
}

impl From<tessera_core::Error> for CatalogError {
    fn from(err: tessera_core::Error) -> Self {
        use tessera_core::Error as CoreError;
        match err {
            CoreError::NotFound(message) => Self::NotFound { message },
            CoreError::PreconditionFailed { message } => Self::CasFailed { message },
            CoreError::Serialization { message } => Self::Serialization { message },
            CoreError::InvalidInput(message) => Self::InvalidInput { message },
            err @ (CoreError::Storage { .. } | CoreError::Internal { .. }) => Self::Storage {
                message: err.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for CatalogError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}
