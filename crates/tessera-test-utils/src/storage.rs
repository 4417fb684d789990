//! Test storage with operation tracing and failure injection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use tessera_core::error::{Error, Result};
use tessera_core::storage::{
    MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult,
};

/// Record of a storage operation for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageOp {
    /// Get operation.
    Get {
        /// Path that was read.
        path: String,
    },
    /// Head operation (metadata only).
    Head {
        /// Path that was checked.
        path: String,
    },
    /// Put operation.
    Put {
        /// Path that was written.
        path: String,
        /// Size of data written.
        size: usize,
        /// Precondition used.
        precondition: WritePrecondition,
    },
    /// Delete operation.
    Delete {
        /// Path that was deleted.
        path: String,
    },
    /// List operation.
    List {
        /// Prefix that was listed.
        prefix: String,
    },
}

impl StorageOp {
    /// Returns true for operations that modify storage.
    pub fn is_write(&self) -> bool {
        matches!(self, Self::Put { .. } | Self::Delete { .. })
    }

    /// The path or prefix the operation addressed.
    pub fn path(&self) -> &str {
        match self {
            Self::Get { path }
            | Self::Head { path }
            | Self::Put { path, .. }
            | Self::Delete { path } => path,
            Self::List { prefix } => prefix,
        }
    }
}

/// In-memory storage backend with operation tracing.
///
/// Records all operations for later assertion in tests. Injected failures
/// surface as `Error::Storage`, i.e. transient errors the orchestrator retries.
#[derive(Debug, Clone, Default)]
pub struct TracingMemoryBackend {
    inner: MemoryBackend,
    operations: Arc<Mutex<Vec<StorageOp>>>,
    fail_paths: Arc<Mutex<Vec<String>>>,
    fail_write_paths: Arc<Mutex<Vec<String>>>,
    fail_counts: Arc<Mutex<HashMap<String, u32>>>,
    latency: Option<Duration>,
}

impl TracingMemoryBackend {
    /// Creates a new empty tracing storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates storage with simulated latency on every operation.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Returns all recorded operations.
    pub fn operations(&self) -> Vec<StorageOp> {
        self.operations.lock().expect("lock").clone()
    }

    /// Returns recorded writes (puts and deletes) whose path starts with `prefix`.
    pub fn writes_under(&self, prefix: &str) -> Vec<StorageOp> {
        self.operations()
            .into_iter()
            .filter(|op| op.is_write() && op.path().starts_with(prefix))
            .collect()
    }

    /// Clears recorded operations.
    pub fn clear_operations(&self) {
        self.operations.lock().expect("lock").clear();
    }

    /// Fails every operation on paths starting with `prefix`.
    pub fn inject_failure(&self, prefix: impl Into<String>) {
        self.fail_paths.lock().expect("lock").push(prefix.into());
    }

    /// Fails puts and deletes (but not reads) on paths starting with `prefix`.
    pub fn inject_write_failure(&self, prefix: impl Into<String>) {
        self.fail_write_paths.lock().expect("lock").push(prefix.into());
    }

    /// Fails the next `times` operations on paths starting with `prefix`.
    pub fn inject_transient_failures(&self, prefix: impl Into<String>, times: u32) {
        self.fail_counts
            .lock()
            .expect("lock")
            .insert(prefix.into(), times);
    }

    /// Clears all injected failures.
    pub fn clear_failures(&self) {
        self.fail_paths.lock().expect("lock").clear();
        self.fail_write_paths.lock().expect("lock").clear();
        self.fail_counts.lock().expect("lock").clear();
    }

    /// Returns all stored paths, sorted.
    pub async fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .inner
            .list("")
            .await
            .expect("memory list")
            .into_iter()
            .map(|m| m.path)
            .collect();
        paths.sort();
        paths
    }

    fn record(&self, op: StorageOp) {
        self.operations.lock().expect("lock").push(op);
    }

    fn check_failure(&self, path: &str) -> Result<()> {
        if self
            .fail_paths
            .lock()
            .expect("lock")
            .iter()
            .any(|p| path.starts_with(p.as_str()))
        {
            return Err(Error::storage(format!("injected failure for path: {path}")));
        }

        let mut counts = self.fail_counts.lock().expect("lock");
        if let Some(remaining) = counts
            .iter_mut()
            .find(|(p, n)| path.starts_with(p.as_str()) && **n > 0)
            .map(|(_, n)| n)
        {
            *remaining -= 1;
            return Err(Error::storage(format!(
                "injected transient failure for path: {path}"
            )));
        }
        Ok(())
    }

    fn check_write_failure(&self, path: &str) -> Result<()> {
        if self
            .fail_write_paths
            .lock()
            .expect("lock")
            .iter()
            .any(|p| path.starts_with(p.as_str()))
        {
            return Err(Error::storage(format!("injected write failure for path: {path}")));
        }
        self.check_failure(path)
    }

    async fn maybe_delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait::async_trait]
impl StorageBackend for TracingMemoryBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        self.maybe_delay().await;
        self.check_failure(path)?;
        self.record(StorageOp::Get {
            path: path.to_string(),
        });
        self.inner.get(path).await
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        self.maybe_delay().await;
        self.check_write_failure(path)?;
        self.record(StorageOp::Put {
            path: path.to_string(),
            size: data.len(),
            precondition: precondition.clone(),
        });
        self.inner.put(path, data, precondition).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.maybe_delay().await;
        self.check_write_failure(path)?;
        self.record(StorageOp::Delete {
            path: path.to_string(),
        });
        self.inner.delete(path).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        self.maybe_delay().await;
        self.check_failure(prefix)?;
        self.record(StorageOp::List {
            prefix: prefix.to_string(),
        });
        self.inner.list(prefix).await
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        self.maybe_delay().await;
        self.check_failure(path)?;
        self.record(StorageOp::Head {
            path: path.to_string(),
        });
        self.inner.head(path).await
    }
}
