//! Advisory per-family lock backed by object storage.
//!
//! Two schema-change procedures on the same dataset family must never
//! interleave. The orchestrator holds a [`FamilyLock`] for the whole duration
//! of a flow; a second invocation does not wait for it but fails fast so the
//! operator can retry later.
//!
//! # How It Works
//!
//! 1. Acquisition writes a lock file with the holder's ID and expiry time
//! 2. The write uses `DoesNotExist` precondition - only one writer can succeed
//! 3. If the lock exists and has expired, it is taken over by a CAS write bound
//!    to the version read before the expiry check
//! 4. Release overwrites the record with an expired one (CAS), leaving the
//!    sequence number for the next holder to increment
//!
//! # Example
//!
//! ```rust,ignore
//! let lock = FamilyLock::new(storage.clone(), "weather");
//!
//! match lock.try_acquire(Duration::from_secs(300), Some("schema-change".into())).await? {
//!     LockAttempt::Acquired(guard) => {
//!         // ... run the flow ...
//!         guard.release().await?;
//!     }
//!     LockAttempt::Busy(holder) => println!("held by {}", holder.holder_id),
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::{Error, Result};
use crate::paths;
use crate::storage::{StorageBackend, WritePrecondition, WriteResult};

/// Default lock TTL (5 minutes), extended after every flow step.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(300);

/// Lock file contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    /// Unique lock holder ID.
    pub holder_id: String,

    /// When the lock expires.
    pub expires_at: DateTime<Utc>,

    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,

    /// Monotonically increasing acquisition counter, used as a fencing token.
    #[serde(default)]
    pub sequence_number: u64,

    /// Optional description of the operation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
}

impl LockInfo {
    /// Creates a new lock info with the given holder ID, TTL, and sequence number.
    #[must_use]
    pub fn new(holder_id: impl Into<String>, ttl: Duration, sequence_number: u64) -> Self {
        let now = Utc::now();
        Self {
            holder_id: holder_id.into(),
            expires_at: now + to_chrono(ttl),
            acquired_at: now,
            sequence_number,
            operation: None,
        }
    }

    /// Returns whether this lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Returns the remaining TTL, or zero if expired.
    #[must_use]
    pub fn remaining_ttl(&self) -> Duration {
        let millis = (self.expires_at - Utc::now()).num_milliseconds();
        if millis <= 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
        }
    }
}

fn to_chrono(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(300))
}

/// Result of a single acquisition attempt.
pub enum LockAttempt<S: StorageBackend + ?Sized> {
    /// The lock is now held by the returned guard.
    Acquired(LockGuard<S>),
    /// Another holder owns a live lock.
    Busy(LockInfo),
}

/// An advisory lock keyed on a dataset family.
pub struct FamilyLock<S: StorageBackend + ?Sized> {
    storage: Arc<S>,
    family: String,
    lock_path: String,
    holder_id: String,
}

// Manual Clone implementation to avoid requiring S: Clone.
impl<S: StorageBackend + ?Sized> Clone for FamilyLock<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            family: self.family.clone(),
            lock_path: self.lock_path.clone(),
            holder_id: self.holder_id.clone(),
        }
    }
}

impl<S: StorageBackend + ?Sized> FamilyLock<S> {
    /// Creates a lock handle for `family`.
    ///
    /// Each handle gets a unique holder ID.
    #[must_use]
    pub fn new(storage: Arc<S>, family: impl Into<String>) -> Self {
        let family = family.into();
        Self {
            storage,
            lock_path: paths::family_lock(&family),
            family,
            holder_id: Ulid::new().to_string(),
        }
    }

    /// Returns the family this lock guards.
    #[must_use]
    pub fn family(&self) -> &str {
        &self.family
    }

    /// Returns the holder ID for this lock instance.
    #[must_use]
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Attempts to acquire the lock once, without waiting.
    ///
    /// # Errors
    ///
    /// Returns an error only for storage or serialization failures; a lock
    /// held by someone else is reported as [`LockAttempt::Busy`].
    pub async fn try_acquire(
        &self,
        ttl: Duration,
        operation: Option<String>,
    ) -> Result<LockAttempt<S>> {
        let mut lock_info = LockInfo::new(&self.holder_id, ttl, 1);
        lock_info.operation.clone_from(&operation);

        match self
            .storage
            .put(&self.lock_path, encode(&lock_info)?, WritePrecondition::DoesNotExist)
            .await?
        {
            WriteResult::Success { version } => {
                return Ok(LockAttempt::Acquired(self.guard(version, 1)));
            }
            WriteResult::PreconditionFailed { .. } => {}
        }

        // Version FIRST, then contents, so the expiry decision is bound to the
        // same version the takeover CAS uses.
        let Some(meta) = self.storage.head(&self.lock_path).await? else {
            return Ok(LockAttempt::Busy(LockInfo::new("unknown", Duration::ZERO, 0)));
        };

        let Some(existing) = self.read_lock().await? else {
            return Ok(LockAttempt::Busy(LockInfo::new("unknown", Duration::ZERO, 0)));
        };

        if !existing.is_expired() {
            return Ok(LockAttempt::Busy(existing));
        }

        let sequence = existing.sequence_number.saturating_add(1);
        let mut takeover = LockInfo::new(&self.holder_id, ttl, sequence);
        takeover.operation = operation;

        match self
            .storage
            .put(
                &self.lock_path,
                encode(&takeover)?,
                WritePrecondition::MatchesVersion(meta.version),
            )
            .await?
        {
            WriteResult::Success { version } => {
                tracing::info!(
                    family = %self.family,
                    previous_holder = %existing.holder_id,
                    sequence,
                    "took over expired family lock"
                );
                Ok(LockAttempt::Acquired(self.guard(version, sequence)))
            }
            WriteResult::PreconditionFailed { .. } => {
                // Someone else won the takeover race.
                let holder = self.read_lock().await?.unwrap_or(existing);
                Ok(LockAttempt::Busy(holder))
            }
        }
    }

    fn guard(&self, version: String, sequence_number: u64) -> LockGuard<S> {
        LockGuard {
            storage: Arc::clone(&self.storage),
            lock_path: self.lock_path.clone(),
            holder_id: self.holder_id.clone(),
            version,
            sequence_number,
            released: false,
        }
    }

    async fn read_lock(&self) -> Result<Option<LockInfo>> {
        read_lock(self.storage.as_ref(), &self.lock_path).await
    }

    /// Forcefully breaks an existing lock (admin operation).
    ///
    /// Only for recovery when a holder is known to be dead but its TTL has
    /// not yet run out.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock could not be deleted.
    pub async fn force_break(&self) -> Result<()> {
        self.storage.delete(&self.lock_path).await
    }

    /// Checks if the lock is currently held (regardless of holder).
    ///
    /// # Errors
    ///
    /// Returns an error if the lock state could not be read.
    pub async fn is_locked(&self) -> Result<bool> {
        Ok(self
            .read_lock()
            .await?
            .is_some_and(|info| !info.is_expired()))
    }

    /// Reads the current lock info without acquiring the lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock state could not be read.
    pub async fn read_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock().await
    }
}

/// RAII guard for a held family lock.
///
/// Prefer calling [`LockGuard::release`]; dropping the guard releases it on a
/// best-effort basis.
pub struct LockGuard<S: StorageBackend + ?Sized> {
    storage: Arc<S>,
    lock_path: String,
    holder_id: String,
    version: String,
    sequence_number: u64,
    released: bool,
}

impl<S: StorageBackend + ?Sized> LockGuard<S> {
    /// Returns the holder ID for this lock.
    #[must_use]
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Returns the fencing sequence of this acquisition.
    ///
    /// A later acquisition of the same lock always has a higher sequence.
    #[must_use]
    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    /// Explicitly releases the lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock could not be released.
    pub async fn release(mut self) -> Result<()> {
        self.do_release().await
    }

    async fn do_release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }

        if let Some(info) = read_lock(self.storage.as_ref(), &self.lock_path).await? {
            if info.holder_id == self.holder_id {
                let expired = LockInfo {
                    holder_id: self.holder_id.clone(),
                    expires_at: Utc::now() - chrono::Duration::seconds(1),
                    acquired_at: info.acquired_at,
                    sequence_number: info.sequence_number,
                    operation: None,
                };

                // A failed CAS means another holder took over; leave it alone.
                let _ = self
                    .storage
                    .put(
                        &self.lock_path,
                        encode(&expired)?,
                        WritePrecondition::MatchesVersion(self.version.clone()),
                    )
                    .await?;
            }
        }

        self.released = true;
        Ok(())
    }

    /// Extends the lock so it expires `ttl` from now.
    ///
    /// # Errors
    ///
    /// Returns `PreconditionFailed` if the lock is no longer held by this guard.
    pub async fn extend(&mut self, ttl: Duration) -> Result<()> {
        match read_lock(self.storage.as_ref(), &self.lock_path).await? {
            Some(info) if info.holder_id == self.holder_id => {
                let mut renewed = info;
                renewed.expires_at = Utc::now() + to_chrono(ttl);

                match self
                    .storage
                    .put(
                        &self.lock_path,
                        encode(&renewed)?,
                        WritePrecondition::MatchesVersion(self.version.clone()),
                    )
                    .await?
                {
                    WriteResult::Success { version } => {
                        self.version = version;
                        Ok(())
                    }
                    WriteResult::PreconditionFailed { .. } => Err(Error::PreconditionFailed {
                        message: "lock modified by another holder".into(),
                    }),
                }
            }
            Some(_) => Err(Error::PreconditionFailed {
                message: "lock held by different holder".into(),
            }),
            None => Err(Error::NotFound(self.lock_path.clone())),
        }
    }
}

impl<S: StorageBackend + ?Sized> Drop for LockGuard<S> {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        // Outside a runtime there is nothing to spawn on; the TTL cleans up.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let storage = Arc::clone(&self.storage);
        let path = self.lock_path.clone();
        let holder = self.holder_id.clone();
        let version = self.version.clone();

        handle.spawn(async move {
            let Ok(Some(info)) = read_lock(storage.as_ref(), &path).await else {
                return;
            };
            if info.holder_id != holder {
                return;
            }
            let expired = LockInfo {
                holder_id: holder,
                expires_at: Utc::now() - chrono::Duration::seconds(1),
                acquired_at: info.acquired_at,
                sequence_number: info.sequence_number,
                operation: None,
            };
            if let Ok(bytes) = encode(&expired) {
                let _ = storage
                    .put(&path, bytes, WritePrecondition::MatchesVersion(version))
                    .await;
            }
        });
    }
}

async fn read_lock<S: StorageBackend + ?Sized>(
    storage: &S,
    path: &str,
) -> Result<Option<LockInfo>> {
    match storage.get(path).await {
        Ok(data) => serde_json::from_slice(&data)
            .map(Some)
            .map_err(|e| Error::Internal {
                message: format!("parse lock: {e}"),
            }),
        Err(Error::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

fn encode(info: &LockInfo) -> Result<Bytes> {
    serde_json::to_vec(info)
        .map(Bytes::from)
        .map_err(|e| Error::Internal {
            message: format!("serialize lock: {e}"),
        })
}
