//! # tessera-catalog
//!
//! The data plane of tessera: monthly columnar partitions and everything
//! that reads, writes, fingerprints, combines and extends them.
//!
//! - **Columnar model**: [`ColumnarPartition`] with a `(grid_id, date)` row identity
//! - **Partition store**: atomic, content-addressed Parquet partitions with a manifest commit point
//! - **Fingerprint registry**: logical content digests and per-consumer acknowledgements
//! - **Combine engine**: full outer join of heterogeneous sources with static broadcast
//! - **Extension manager**: append derived columns without recomputing upstream data
//! - **Model artifacts**: latest-wins storage for trained models
//!
//! ## Storage Layout
//!
//! ```text
//! {prefix}/
//! ├── {dataset}/year=YYYY/month=MM/
//! │   ├── manifest.json                # commit point: fingerprint, rows, produced_at
//! │   └── data/{fingerprint}.parquet   # immutable data objects
//! ├── _acks/                           # consumer acknowledgements
//! └── _models/                         # model artifacts
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use tessera_catalog::prelude::*;
//!
//! let store = PartitionStore::new(backend, StoreConfig::default());
//! store.write(key, "era5", &partition).await?;
//!
//! let registry = FingerprintRegistry::new(store.clone());
//! if registry.has_changed(key, "era5", "combine").await? {
//!     // recombine
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod column;
pub mod combine;
pub mod config;
pub mod dataset;
pub mod error;
pub mod extension;
pub mod fingerprint;
pub mod manifest;
pub mod metrics;
pub mod model;
pub mod parquet_util;
pub mod registry;
pub mod resolver;
pub mod store;

// Re-export main types at crate root
pub use column::{Column, ColumnData, ColumnDef, ColumnType, ColumnarPartition, RowId, Schema};
pub use combine::{validate_combined, CombineEngine};
pub use config::{
    CombineConfig, MissingDataPolicy, OverlapPolicy, SourceKind, SourceSpec, StoreConfig,
};
pub use dataset::CombinedDataset;
pub use error::{CatalogError, Result};
pub use extension::{ColumnExtension, ExtensionManager, OverlapMode};
pub use fingerprint::{fingerprint_partition, Fingerprint};
pub use manifest::{PartitionManifest, SourceManifestEntry};
pub use model::{ModelArtifactMeta, ModelArtifactStore, ModelHandle, StorageModelStore};
pub use registry::{Acknowledgement, FingerprintRegistry};
pub use resolver::{ResolvedSources, SourceResolver};
pub use store::{PartitionStore, WriteOutcome};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::column::{Column, ColumnarPartition};
    pub use crate::combine::CombineEngine;
    pub use crate::config::{CombineConfig, SourceSpec, StoreConfig};
    pub use crate::dataset::CombinedDataset;
    pub use crate::extension::{ColumnExtension, ExtensionManager};
    pub use crate::registry::FingerprintRegistry;
    pub use crate::store::PartitionStore;
}
