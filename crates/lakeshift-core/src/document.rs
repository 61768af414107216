//! Durable JSON documents updated by compare-and-swap.
//!
//! Every piece of orchestrator state (version maps, dataset records, job and
//! workflow records, flow checkpoints) is a small JSON document in object
//! storage. Mutations follow the same protocol as the lock and manifest
//! writers:
//!
//! 1. Read the version token with `head`, then the body with `get`
//! 2. Compute the new value
//! 3. Write with `MatchesVersion(token)` (or `DoesNotExist` for a first write)
//! 4. On precondition failure, reload and retry (bounded)
//!
//! A conflicting writer can only make our CAS fail, never be overwritten, so
//! updates to a single document are linearizable.

use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};
use crate::storage::{StorageBackend, WritePrecondition, WriteResult};

/// Maximum CAS attempts for a single [`DocumentStore::update`] call.
pub const MAX_CAS_ATTEMPTS: u32 = 16;

/// A deserialized document together with the version token it was read at.
#[derive(Debug, Clone)]
pub struct Document<T> {
    /// The document body.
    pub value: T,
    /// Opaque storage version token for CAS writes.
    pub version: String,
}

/// The decision returned by an [`DocumentStore::update`] closure.
#[derive(Debug)]
pub enum Mutation<T> {
    /// Write this value.
    Put(T),
    /// Leave the stored document untouched.
    Unchanged,
}

/// JSON document access over a storage backend.
#[derive(Clone)]
pub struct DocumentStore {
    storage: Arc<dyn StorageBackend>,
}

impl std::fmt::Debug for DocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentStore").finish_non_exhaustive()
    }
}

impl DocumentStore {
    /// Creates a document store over the given backend.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Returns the underlying backend.
    #[must_use]
    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    /// Loads a document, or `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails or the body cannot be parsed.
    pub async fn load<T: DeserializeOwned>(&self, path: &str) -> Result<Option<Document<T>>> {
        // Version first, then body: a concurrent write between the two makes
        // the token stale, so a later CAS fails instead of clobbering.
        let Some(meta) = self.storage.head(path).await? else {
            return Ok(None);
        };

        let data = match self.storage.get(path).await {
            Ok(data) => data,
            Err(Error::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let value = serde_json::from_slice(&data).map_err(|e| Error::Serialization {
            message: format!("parse {path}: {e}"),
        })?;

        Ok(Some(Document {
            value,
            version: meta.version,
        }))
    }

    /// Writes a document only if none exists at `path`.
    ///
    /// Returns the new version token, or `None` if a document already exists.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or storage fails.
    pub async fn create<T: Serialize>(&self, path: &str, value: &T) -> Result<Option<String>> {
        let bytes = encode(path, value)?;
        match self
            .storage
            .put(path, bytes, WritePrecondition::DoesNotExist)
            .await?
        {
            WriteResult::Success { version } => Ok(Some(version)),
            WriteResult::PreconditionFailed { .. } => Ok(None),
        }
    }

    /// Replaces a document if its version still matches `expected_version`.
    ///
    /// Returns the new version token, or `None` on a version conflict.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or storage fails.
    pub async fn replace<T: Serialize>(
        &self,
        path: &str,
        value: &T,
        expected_version: &str,
    ) -> Result<Option<String>> {
        let bytes = encode(path, value)?;
        match self
            .storage
            .put(
                path,
                bytes,
                WritePrecondition::MatchesVersion(expected_version.to_string()),
            )
            .await?
        {
            WriteResult::Success { version } => Ok(Some(version)),
            WriteResult::PreconditionFailed { .. } => Ok(None),
        }
    }

    /// Read-modify-write loop with CAS.
    ///
    /// The closure sees the current value (or `None`) and decides whether to
    /// write. It may run more than once when writers race, so it must be a pure
    /// function of its input. Returns the value that is stored once the call
    /// completes.
    ///
    /// # Errors
    ///
    /// Returns the closure's error unchanged, storage errors converted via
    /// `From`, or `PreconditionFailed` after [`MAX_CAS_ATTEMPTS`] conflicts.
    pub async fn update<T, E, F>(
        &self,
        path: &str,
        mut mutate: F,
    ) -> std::result::Result<Option<T>, E>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
        E: From<Error>,
        F: FnMut(Option<&T>) -> std::result::Result<Mutation<T>, E> + Send,
    {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let current = self.load::<T>(path).await?;
            let mutation = mutate(current.as_ref().map(|doc| &doc.value))?;

            let next = match mutation {
                Mutation::Unchanged => return Ok(current.map(|doc| doc.value)),
                Mutation::Put(next) => next,
            };

            let written = match &current {
                Some(doc) => self.replace(path, &next, &doc.version).await?,
                None => self.create(path, &next).await?,
            };

            if written.is_some() {
                return Ok(Some(next));
            }

            tracing::debug!(path, attempt, "document CAS conflict, retrying");
        }

        Err(Error::PreconditionFailed {
            message: format!("exhausted {MAX_CAS_ATTEMPTS} CAS attempts on {path}"),
        }
        .into())
    }

    /// Deletes a document. Succeeds if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn delete(&self, path: &str) -> Result<()> {
        self.storage.delete(path).await
    }

    /// Loads every document under `prefix`, sorted by path.
    ///
    /// Objects that disappear between listing and reading are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails or a body cannot be parsed.
    pub async fn load_prefix<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<(String, T)>> {
        let mut metas = self.storage.list(prefix).await?;
        metas.sort_by(|a, b| a.path.cmp(&b.path));

        let mut out = Vec::with_capacity(metas.len());
        for meta in metas {
            if let Some(doc) = self.load::<T>(&meta.path).await? {
                out.push((meta.path, doc.value));
            }
        }
        Ok(out)
    }
}

fn encode<T: Serialize>(path: &str, value: &T) -> Result<Bytes> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| Error::Serialization {
            message: format!("serialize {path}: {e}"),
        })
}
