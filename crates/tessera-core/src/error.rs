//! Error types and result aliases for tessera.
//!
//! This module defines the shared error types used across all tessera components.
//! Errors are structured for programmatic handling: callers branch on the variant
//! (absence vs. conflict vs. transient I/O), never on the message.

/// The result type used throughout tessera.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tessera core operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A storage operation failed.
    ///
    /// Storage failures are treated as transient: network hiccups, throttling
    /// and partially failed uploads are expected to succeed on retry.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// A path or object was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A precondition for the operation was not met (concurrent modification).
    #[error("precondition failed: {message}")]
    PreconditionFailed {
        /// Description of the failed precondition.
        message: String,
    },

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source cause.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if retrying the same operation may succeed.
    ///
    /// Storage failures and lost CAS races are transient; absence, bad input
    /// and codec failures are not.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Storage { .. } | Self::PreconditionFailed { .. })
    }

    /// Returns true if this error reports a missing object.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn storage_error_with_source() {
        let source = std::io::Error::new(std::io::ErrorKind::TimedOut, "socket timed out");
        let err = Error::storage_with_source("failed to upload object", source);
        assert!(err.to_string().contains("storage error"));
        assert!(StdError::source(&err).is_some());
        assert!(err.is_transient());
    }

    #[test]
    fn not_found_is_not_transient() {
        let err = Error::NotFound("s5p_no2/year=2024/month=03".into());
        assert!(err.is_not_found());
        assert!(!err.is_transient());
    }

    #[test]
    fn precondition_failure_is_transient() {
        let err = Error::PreconditionFailed {
            message: "manifest version moved".into(),
        };
        assert!(err.is_transient());
    }
}
