//! Storage backend abstraction for object storage (GCS, S3, local).
//!
//! This module defines the storage contract every backend implements:
//! - Conditional writes with preconditions (the basis for CAS documents and locks)
//! - Object metadata including an opaque version token
//! - Prefix listing
//!
//! The object-store operations the orchestrator needs on top of that contract,
//! `exists` and `move`, are provided as free functions ([`exists`],
//! [`move_object`]) so every backend gets them with the same semantics.
//!
//! ## Multi-Cloud Compatibility
//!
//! The version token is an opaque `String`: GCS generations, S3 `ETag`s and
//! Azure `ETag`s all fit without leaking backend assumptions upward.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};

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
    /// Opaque version token for CAS operations.
    pub version: String,
    /// Last modification timestamp.
    pub last_modified: Option<DateTime<Utc>>,
}

/// Storage backend trait for object storage.
///
/// All storage backends (GCS, S3, memory) implement this trait. Lakeshift
/// keeps both its own durable state and the dataset artifacts behind it.
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
    /// **Ordering**: Results are returned in arbitrary order. Callers requiring
    /// deterministic order should sort by `path`.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;

    /// Gets object metadata without reading content.
    ///
    /// Returns `None` if object doesn't exist.
    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>>;
}

/// Returns whether an object exists at `path`.
///
/// # Errors
///
/// Returns an error if the metadata lookup fails.
pub async fn exists(storage: &dyn StorageBackend, path: &str) -> Result<bool> {
    Ok(storage.head(path).await?.is_some())
}

/// Returns whether any object exists under `prefix`.
///
/// # Errors
///
/// Returns an error if the listing fails.
pub async fn prefix_occupied(storage: &dyn StorageBackend, prefix: &str) -> Result<bool> {
    Ok(!storage.list(prefix).await?.is_empty())
}

/// Outcome of [`move_object`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    /// The object was copied to the destination and removed from the source.
    Moved,
    /// The source was already gone and the destination holds the object.
    AlreadyMoved,
    /// The destination holds different content; nothing was changed.
    DestinationConflict,
}

/// Moves an object from `src` to `dst`.
///
/// Object stores have no rename, so a move is a `DoesNotExist` copy followed by
/// a delete of the source. The operation is safe to re-invoke after an
/// interruption: a destination that already holds identical bytes is treated
/// as a completed copy, and a missing source with a present destination is
/// reported as [`MoveOutcome::AlreadyMoved`].
///
/// # Errors
///
/// Returns `Error::NotFound` when neither source nor destination exists, and
/// propagates storage failures.
pub async fn move_object(
    storage: &dyn StorageBackend,
    src: &str,
    dst: &str,
) -> Result<MoveOutcome> {
    let data = match storage.get(src).await {
        Ok(data) => data,
        Err(Error::NotFound(_)) => {
            return if exists(storage, dst).await? {
                Ok(MoveOutcome::AlreadyMoved)
            } else {
                Err(Error::NotFound(format!("move source missing: {src}")))
            };
        }
        Err(e) => return Err(e),
    };

    match storage
        .put(dst, data.clone(), WritePrecondition::DoesNotExist)
        .await?
    {
        WriteResult::Success { .. } => {}
        WriteResult::PreconditionFailed { .. } => {
            let existing = storage.get(dst).await?;
            if existing != data {
                return Ok(MoveOutcome::DestinationConflict);
            }
        }
    }

    storage.delete(src).await?;
    Ok(MoveOutcome::Moved)
}

/// In-memory storage backend for testing.
///
/// Thread-safe via `RwLock`. Not suitable for production.
/// Uses numeric versions internally (stored as strings) to simulate GCS-like behavior.
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
