//! Observability infrastructure for tessera.
//!
//! Structured logging with consistent spans. Every partition-level operation
//! runs inside a span carrying the dataset and month; every stage execution
//! carries the stage name and month so log lines from concurrent months can
//! be told apart.

use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::partition::PartitionKey;

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `tessera_catalog=debug`)
///
/// # Example
///
/// ```rust
/// use tessera_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        // try_init: a host application may already own the global subscriber.
        let _ = match format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .try_init(),
            LogFormat::Pretty => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().pretty())
                .try_init(),
        };
    });
}

/// Creates a span for a partition-level operation.
///
/// # Example
///
/// ```rust
/// use tessera_core::observability::partition_span;
/// use tessera_core::PartitionKey;
///
/// let key = PartitionKey::new(2024, 3).expect("valid");
/// let span = partition_span("write", "era5", key);
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn partition_span(operation: &str, dataset: &str, key: PartitionKey) -> Span {
    tracing::info_span!(
        "partition",
        op = operation,
        dataset = dataset,
        month = %key,
    )
}

/// Creates a span for one stage execution on one month.
#[must_use]
pub fn stage_span(stage: &str, key: PartitionKey, attempt: u32) -> Span {
    tracing::info_span!("stage", stage = stage, month = %key, attempt = attempt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Json);
    }

    #[test]
    fn span_helpers_create_spans() {
        let key = PartitionKey::new(2024, 3).expect("valid");
        let span = partition_span("write", "era5", key);
        let _guard = span.enter();
        tracing::info!("partition message");

        let span = stage_span("combine", key, 1);
        let _guard = span.enter();
        tracing::info!("stage message");
    }
}
