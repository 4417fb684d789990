//! Shared test utilities for tessera integration tests.
//!
//! This crate provides:
//! - [`TracingMemoryBackend`]: In-memory storage with operation recording and failure injection
//! - [`TestContext`]: A store and registry over a tracing backend
//! - Factory functions for monthly partitions
//!
//! # Example
//!
//! ```rust,ignore
//! use tessera_test_utils::{TestContext, daily_partition, month};
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let ctx = TestContext::new();
//!     let key = month(2024, 3);
//!     ctx.store.write(key, "aod", &daily_partition(key, &["g1"], "aod", 0.1)).await?;
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod fixtures;
pub mod storage;

pub use fixtures::*;
pub use storage::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("tessera=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
