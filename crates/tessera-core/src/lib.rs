//! # tessera-core
//!
//! Core abstractions for the tessera monthly ingestion and combination engine.
//!
//! This crate provides the foundational types and traits used across all tessera components:
//!
//! - **Partition Keys**: The `(year, month)` sharding unit shared by every dataset
//! - **Storage Traits**: Abstract object storage with conditional writes
//! - **Keyed Locks**: Write serialization scoped to one `(dataset, month)` unit
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Logging initialization and span helpers
//!
//! ## Crate Boundary
//!
//! `tessera-core` is the **only** crate allowed to define shared primitives.
//! The catalog (data plane) and flow (orchestration) crates depend on it,
//! never on each other's internals.
//!
//! ## Example
//!
//! ```rust
//! use tessera_core::prelude::*;
//!
//! let key = PartitionKey::new(2024, 3).expect("valid month");
//! assert_eq!(key.hive_path(), "year=2024/month=03");
//! assert_eq!(key.next(), PartitionKey::new(2024, 4).expect("valid month"));
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod lock;
pub mod observability;
pub mod partition;
pub mod storage;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use tessera_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::lock::KeyedLocks;
    pub use crate::partition::{PartitionKey, PartitionKeyParseError};
    pub use crate::storage::{
        LocalFsBackend, MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult,
    };
}

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result};
pub use lock::{backoff_delay, KeyedGuard, KeyedLocks};
pub use observability::{init_logging, partition_span, stage_span, LogFormat};
pub use partition::{PartitionKey, PartitionKeyParseError};
pub use storage::{
    LocalFsBackend, MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult,
};
