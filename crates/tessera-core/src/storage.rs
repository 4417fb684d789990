//! Storage backend abstraction for object storage (cloud buckets, local disk, memory).
//!
//! This module defines the core storage contract that all backends must implement:
//! - Conditional writes with preconditions (the basis of atomic publish)
//! - Object metadata including `last_modified` and an opaque version token
//! - Prefix listing for partition discovery
//!
//! ## Atomicity
//!
//! A successful `put` makes the full object visible at once; readers never
//! observe a partially written object. Multi-object updates (data + manifest)
//! are made atomic one level up by publishing the manifest last.
//!
//! ## Version Tokens
//!
//! The version token is an opaque `String` so that different backends can use
//! their native notion (object generation, `ETag`, modification time).

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use ulid::Ulid;

use crate::error::{Error, Result};
use crate::lock::KeyedLocks;

/// Precondition for conditional writes (CAS operations).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritePrecondition {
    /// Write only if object does not exist.
    DoesNotExist,
    /// Write only if object's version matches the given token.
    MatchesVersion(String),
    /// Write unconditionally.
    None,
}

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    /// Write succeeded, returns new version token.
    Success {
        /// The new version token after the write.
        version: String,
    },
    /// Precondition failed, returns current version token.
    PreconditionFailed {
        /// The current version that caused the precondition to fail.
        current_version: String,
    },
}

impl WriteResult {
    /// Returns true if the write was applied.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Metadata about a stored object.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    /// Object path (key).
    pub path: String,
    /// Object size in bytes.
    pub size: u64,
    /// Opaque object version token for CAS operations.
    pub version: String,
    /// Last modification timestamp.
    pub last_modified: Option<DateTime<Utc>>,
}

/// Storage backend trait for object storage.
///
/// All storage backends implement this trait. The contract is designed for
/// cloud object storage semantics and must support concurrent callers.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Reads entire object.
    ///
    /// Returns `Error::NotFound` if object doesn't exist.
    async fn get(&self, path: &str) -> Result<Bytes>;

    /// Writes with optional precondition.
    ///
    /// Returns `WriteResult::PreconditionFailed` if precondition not met.
    /// Never returns error for precondition failure - that's a normal result.
    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult>;

    /// Deletes an object.
    ///
    /// Succeeds even if object doesn't exist (idempotent).
    async fn delete(&self, path: &str) -> Result<()>;

    /// Lists objects with the given prefix.
    ///
    /// Returns empty vec if no objects match. Results are in arbitrary order;
    /// callers requiring deterministic order must sort.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;

    /// Gets object metadata without reading content.
    ///
    /// Returns `None` if object doesn't exist.
    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>>;
}

/// In-memory storage backend for testing.
///
/// Thread-safe via `RwLock`. Not suitable for production.
/// Uses numeric versions internally (stored as strings) to mimic object generations.
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    objects: Arc<RwLock<HashMap<String, StoredObject>>>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    version: i64,
    last_modified: DateTime<Utc>,
}

impl StoredObject {
    fn meta(&self, path: &str) -> ObjectMeta {
        ObjectMeta {
            path: path.to_string(),
            size: self.data.len() as u64,
            version: self.version.to_string(),
            last_modified: Some(self.last_modified),
        }
    }
}

fn poisoned() -> Error {
    Error::Internal {
        message: "lock poisoned".into(),
    }
}

impl MemoryBackend {
    /// Creates a new empty memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.read().map(|o| o.len()).unwrap_or(0)
    }

    /// Returns true if no objects are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let objects = self.objects.read().map_err(|_| poisoned())?;

        objects
            .get(path)
            .map(|o| o.data.clone())
            .ok_or_else(|| Error::NotFound(format!("object not found: {path}")))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let mut objects = self.objects.write().map_err(|_| poisoned())?;

        let current = objects.get(path);

        match precondition {
            WritePrecondition::DoesNotExist => {
                if let Some(obj) = current {
                    return Ok(WriteResult::PreconditionFailed {
                        current_version: obj.version.to_string(),
                    });
                }
            }
            WritePrecondition::MatchesVersion(expected) => {
                let expected_num: i64 = expected.parse().unwrap_or(-1);
                match current {
                    Some(obj) if obj.version != expected_num => {
                        return Ok(WriteResult::PreconditionFailed {
                            current_version: obj.version.to_string(),
                        });
                    }
                    None => {
                        return Ok(WriteResult::PreconditionFailed {
                            current_version: "0".to_string(),
                        });
                    }
                    _ => {}
                }
            }
            WritePrecondition::None => {}
        }

        let new_version = current.map_or(1, |o| o.version + 1);
        objects.insert(
            path.to_string(),
            StoredObject {
                data,
                version: new_version,
                last_modified: Utc::now(),
            },
        );
        drop(objects);

        Ok(WriteResult::Success {
            version: new_version.to_string(),
        })
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.objects.write().map_err(|_| poisoned())?.remove(path);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let objects = self.objects.read().map_err(|_| poisoned())?;

        Ok(objects
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(path, obj)| obj.meta(path))
            .collect())
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let objects = self.objects.read().map_err(|_| poisoned())?;
        Ok(objects.get(path).map(|obj| obj.meta(path)))
    }
}

/// Local filesystem backend rooted at a directory.
///
/// Objects are written to a hidden temporary file next to their destination
/// and then renamed into place, so a reader either sees the previous object or
/// the complete new one. Conditional writes to the same object are serialized
/// within the process; writes to different objects proceed in parallel. The
/// version token is the modification time in nanoseconds.
#[derive(Debug, Clone)]
pub struct LocalFsBackend {
    root: PathBuf,
    locks: KeyedLocks,
}

/// Suffix of in-flight temporary files; never listed.
const TEMP_SUFFIX: &str = ".tmp";

impl LocalFsBackend {
    /// Creates a backend rooted at `root`. The directory is created lazily.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: KeyedLocks::new(),
        }
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        if path.is_empty()
            || path.starts_with('/')
            || path.split('/').any(|segment| segment == ".." || segment == ".")
        {
            return Err(Error::InvalidInput(format!(
                "object path must be relative and normalized: {path}"
            )));
        }
        Ok(self.root.join(path))
    }

    async fn meta_for(&self, path: &str, full: &Path) -> Result<Option<ObjectMeta>> {
        match tokio::fs::metadata(full).await {
            Ok(meta) if meta.is_file() => {
                let modified = meta.modified().ok();
                let version = modified
                    .and_then(|m| m.duration_since(UNIX_EPOCH).ok())
                    .map_or(0, |d| d.as_nanos());
                Ok(Some(ObjectMeta {
                    path: path.to_string(),
                    size: meta.len(),
                    version: version.to_string(),
                    last_modified: modified.map(DateTime::<Utc>::from),
                }))
            }
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::storage_with_source(
                format!("failed to stat {path}"),
                e,
            )),
        }
    }
}

#[async_trait]
impl StorageBackend for LocalFsBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let full = self.resolve(path)?;
        match tokio::fs::read(&full).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("object not found: {path}")))
            }
            Err(e) => Err(Error::storage_with_source(
                format!("failed to read {path}"),
                e,
            )),
        }
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let full = self.resolve(path)?;
        let _guard = self.locks.lock(path).await;

        let current = self.meta_for(path, &full).await?;
        match (&precondition, &current) {
            (WritePrecondition::DoesNotExist, Some(meta)) => {
                return Ok(WriteResult::PreconditionFailed {
                    current_version: meta.version.clone(),
                });
            }
            (WritePrecondition::MatchesVersion(expected), Some(meta))
                if &meta.version != expected =>
            {
                return Ok(WriteResult::PreconditionFailed {
                    current_version: meta.version.clone(),
                });
            }
            (WritePrecondition::MatchesVersion(_), None) => {
                return Ok(WriteResult::PreconditionFailed {
                    current_version: "0".to_string(),
                });
            }
            _ => {}
        }

        let parent = full
            .parent()
            .ok_or_else(|| Error::InvalidInput(format!("object path has no parent: {path}")))?;
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::storage_with_source(format!("failed to create dir for {path}"), e))?;

        let file_name = full
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::InvalidInput(format!("object path has no file name: {path}")))?;
        let staging = parent.join(format!(".{file_name}.{}{TEMP_SUFFIX}", Ulid::new()));

        if let Err(e) = tokio::fs::write(&staging, &data).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(Error::storage_with_source(
                format!("failed to stage {path}"),
                e,
            ));
        }
        if let Err(e) = tokio::fs::rename(&staging, &full).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(Error::storage_with_source(
                format!("failed to publish {path}"),
                e,
            ));
        }

        let version = self
            .meta_for(path, &full)
            .await?
            .map(|m| m.version)
            .ok_or_else(|| Error::storage(format!("object vanished after write: {path}")))?;
        Ok(WriteResult::Success { version })
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full = self.resolve(path)?;
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::storage_with_source(
                format!("failed to delete {path}"),
                e,
            )),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        // Walk from the deepest directory named by the prefix.
        let dir_part = prefix.rsplit_once('/').map_or("", |(dir, _)| dir);
        let start = if dir_part.is_empty() {
            self.root.clone()
        } else {
            self.resolve(dir_part)?
        };

        let mut found = BTreeMap::new();
        let mut stack = vec![(start, dir_part.to_string())];
        while let Some((dir, rel)) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(Error::storage_with_source(
                        format!("failed to list {}", dir.display()),
                        e,
                    ))
                }
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| Error::storage_with_source("failed to read dir entry", e))?
            {
                let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                let child_rel = if rel.is_empty() {
                    name.clone()
                } else {
                    format!("{rel}/{name}")
                };
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| Error::storage_with_source("failed to stat dir entry", e))?;
                if file_type.is_dir() {
                    stack.push((entry.path(), child_rel));
                } else if !(name.starts_with('.') && name.ends_with(TEMP_SUFFIX))
                    && child_rel.starts_with(prefix)
                {
                    if let Some(meta) = self.meta_for(&child_rel, &entry.path()).await? {
                        found.insert(child_rel, meta);
                    }
                }
            }
        }

        Ok(found.into_values().collect())
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let full = self.resolve(path)?;
        self.meta_for(path, &full).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_backend_roundtrip() {
        let backend = MemoryBackend::new();
        let data = Bytes::from("hello world");

        let result = backend
            .put("test/file.txt", data.clone(), WritePrecondition::None)
            .await
            .expect("put should succeed");

        assert!(matches!(result, WriteResult::Success { ref version } if version == "1"));

        let retrieved = backend.get("test/file.txt").await.expect("get");
        assert_eq!(retrieved, data);
    }

    #[tokio::test]
    async fn memory_get_missing_is_not_found() {
        let backend = MemoryBackend::new();
        let err = backend.get("missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn memory_precondition_does_not_exist() {
        let backend = MemoryBackend::new();

        let result = backend
            .put("new.txt", Bytes::from("data"), WritePrecondition::DoesNotExist)
            .await
            .expect("should succeed");
        assert!(result.is_success());

        let result = backend
            .put("new.txt", Bytes::from("data2"), WritePrecondition::DoesNotExist)
            .await
            .expect("should succeed");
        assert!(matches!(result, WriteResult::PreconditionFailed { .. }));
    }

    #[tokio::test]
    async fn memory_precondition_matches_version() {
        let backend = MemoryBackend::new();

        let first_version = match backend
            .put("gen.txt", Bytes::from("v1"), WritePrecondition::None)
            .await
            .expect("should succeed")
        {
            WriteResult::Success { version } => version,
            WriteResult::PreconditionFailed { .. } => panic!("expected success"),
        };

        let result = backend
            .put(
                "gen.txt",
                Bytes::from("v2"),
                WritePrecondition::MatchesVersion(first_version.clone()),
            )
            .await
            .expect("should succeed");
        assert!(result.is_success());

        let result = backend
            .put(
                "gen.txt",
                Bytes::from("v3"),
                WritePrecondition::MatchesVersion(first_version),
            )
            .await
            .expect("should succeed");
        assert!(matches!(result, WriteResult::PreconditionFailed { .. }));
        assert_eq!(backend.get("gen.txt").await.unwrap(), Bytes::from("v2"));
    }

    #[tokio::test]
    async fn memory_list_with_prefix() {
        let backend = MemoryBackend::new();
        for path in ["a/1.txt", "a/2.txt", "b/1.txt"] {
            backend
                .put(path, Bytes::from("x"), WritePrecondition::None)
                .await
                .unwrap();
        }

        assert_eq!(backend.list("a/").await.unwrap().len(), 2);
        assert_eq!(backend.list("b/").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn memory_delete_is_idempotent() {
        let backend = MemoryBackend::new();
        backend
            .put("del.txt", Bytes::from("data"), WritePrecondition::None)
            .await
            .unwrap();
        backend.delete("del.txt").await.unwrap();
        backend.delete("del.txt").await.unwrap();
        assert!(backend.head("del.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn local_fs_roundtrip_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalFsBackend::new(dir.path());

        backend
            .put(
                "era5/year=2024/month=03/manifest.json",
                Bytes::from("{}"),
                WritePrecondition::DoesNotExist,
            )
            .await
            .unwrap();
        backend
            .put(
                "era5/year=2024/month=04/manifest.json",
                Bytes::from("{}"),
                WritePrecondition::None,
            )
            .await
            .unwrap();

        let listed = backend.list("era5/").await.unwrap();
        let paths: Vec<_> = listed.iter().map(|m| m.path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "era5/year=2024/month=03/manifest.json",
                "era5/year=2024/month=04/manifest.json",
            ]
        );
        assert_eq!(
            backend
                .get("era5/year=2024/month=03/manifest.json")
                .await
                .unwrap(),
            Bytes::from("{}")
        );
    }

    #[tokio::test]
    async fn local_fs_precondition_does_not_exist() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalFsBackend::new(dir.path());

        let first = backend
            .put("x/obj", Bytes::from("1"), WritePrecondition::DoesNotExist)
            .await
            .unwrap();
        assert!(first.is_success());
        let second = backend
            .put("x/obj", Bytes::from("2"), WritePrecondition::DoesNotExist)
            .await
            .unwrap();
        assert!(!second.is_success());
        assert_eq!(backend.get("x/obj").await.unwrap(), Bytes::from("1"));
    }

    #[tokio::test]
    async fn local_fs_rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalFsBackend::new(dir.path());
        let err = backend.get("../outside").await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn local_fs_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalFsBackend::new(dir.path());
        assert!(backend.get("nope").await.unwrap_err().is_not_found());
        assert!(backend.head("nope").await.unwrap().is_none());
        assert!(backend.list("nope/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn local_fs_put_waits_only_on_its_own_object() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalFsBackend::new(dir.path());
        let held = "era5/year=2024/month=03/manifest.json";
        let guard = backend.locks.lock(held).await;

        let other = tokio::time::timeout(
            std::time::Duration::from_millis(500),
            backend.put(
                "aod/year=2024/month=04/manifest.json",
                Bytes::from("{}"),
                WritePrecondition::None,
            ),
        )
        .await;
        assert!(other.unwrap().unwrap().is_success());

        let writer = backend.clone();
        let same = tokio::spawn(async move {
            writer
                .put(held, Bytes::from("{}"), WritePrecondition::None)
                .await
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!same.is_finished());

        drop(guard);
        assert!(same.await.unwrap().unwrap().is_success());
    }
}
