//! Test storage with operation tracing and failure injection.
//!
//! [`TracingMemoryBackend`] wraps the core [`MemoryBackend`], records every
//! call, and can fail calls on demand. `fail_writes_after` is the crash
//! simulator: it lets the first `skip` writes under a prefix through and then
//! fails the next `count`, which is how integration tests stop a flow between
//! two persisted transitions.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use lakeshift_core::error::{Error, Result};
use lakeshift_core::storage::{
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

#[derive(Debug, Clone)]
struct WriteFault {
    prefix: String,
    skip: usize,
    remaining: usize,
}

/// In-memory storage backend with operation tracing.
#[derive(Debug, Clone, Default)]
pub struct TracingMemoryBackend {
    inner: MemoryBackend,
    operations: Arc<Mutex<Vec<StorageOp>>>,
    fail_paths: Arc<Mutex<Vec<String>>>,
    write_faults: Arc<Mutex<Vec<WriteFault>>>,
}

impl TracingMemoryBackend {
    /// Creates a new empty tracing storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all recorded operations.
    #[must_use]
    pub fn operations(&self) -> Vec<StorageOp> {
        self.operations.lock().expect("lock").clone()
    }

    /// Clears recorded operations.
    pub fn clear_operations(&self) {
        self.operations.lock().expect("lock").clear();
    }

    /// Returns how many puts were issued under `prefix`, failed ones included.
    #[must_use]
    pub fn writes_under(&self, prefix: &str) -> usize {
        self.operations
            .lock()
            .expect("lock")
            .iter()
            .filter(|op| matches!(op, StorageOp::Put { path, .. } if path.starts_with(prefix)))
            .count()
    }

    /// Fails every operation on paths under `prefix`.
    pub fn inject_failure(&self, prefix: impl Into<String>) {
        self.fail_paths.lock().expect("lock").push(prefix.into());
    }

    /// Lets `skip` puts under `prefix` succeed, then fails the next `count`.
    pub fn fail_writes_after(&self, prefix: impl Into<String>, skip: usize, count: usize) {
        self.write_faults.lock().expect("lock").push(WriteFault {
            prefix: prefix.into(),
            skip,
            remaining: count,
        });
    }

    /// Returns true while a `fail_writes_after` fault has failures left.
    #[must_use]
    pub fn write_faults_pending(&self) -> bool {
        self.write_faults
            .lock()
            .expect("lock")
            .iter()
            .any(|fault| fault.remaining > 0)
    }

    /// Clears all injected failures.
    pub fn clear_failures(&self) {
        self.fail_paths.lock().expect("lock").clear();
        self.write_faults.lock().expect("lock").clear();
    }

    /// Returns all stored paths under `prefix`, sorted.
    pub async fn paths_under(&self, prefix: &str) -> Vec<String> {
        let mut paths: Vec<String> = self
            .inner
            .list(prefix)
            .await
            .expect("list")
            .into_iter()
            .map(|meta| meta.path)
            .collect();
        paths.sort();
        paths
    }

    /// Writes `data` at `path` without recording or fault checks.
    pub async fn seed(&self, path: &str, data: impl Into<Bytes>) {
        self.inner
            .put(path, data.into(), WritePrecondition::None)
            .await
            .expect("seed");
    }

    fn record(&self, op: StorageOp) {
        self.operations.lock().expect("lock").push(op);
    }

    fn check_failure(&self, path: &str) -> Result<()> {
        let fail_paths = self.fail_paths.lock().expect("lock");
        if fail_paths.iter().any(|p| path.starts_with(p)) {
            return Err(Error::storage(format!("injected failure for path: {path}")));
        }
        Ok(())
    }

    fn check_write_fault(&self, path: &str) -> Result<()> {
        let mut faults = self.write_faults.lock().expect("lock");
        for fault in faults.iter_mut().filter(|f| path.starts_with(&f.prefix)) {
            if fault.skip > 0 {
                fault.skip -= 1;
            } else if fault.remaining > 0 {
                fault.remaining -= 1;
                return Err(Error::storage(format!("injected write failure for path: {path}")));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for TracingMemoryBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
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
        self.check_failure(path)?;
        self.record(StorageOp::Put {
            path: path.to_string(),
            size: data.len(),
            precondition: precondition.clone(),
        });
        self.check_write_fault(path)?;
        self.inner.put(path, data, precondition).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.check_failure(path)?;
        self.record(StorageOp::Delete {
            path: path.to_string(),
        });
        self.inner.delete(path).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        self.check_failure(prefix)?;
        self.record(StorageOp::List {
            prefix: prefix.to_string(),
        });
        self.inner.list(prefix).await
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        self.check_failure(path)?;
        self.record(StorageOp::Head {
            path: path.to_string(),
        });
        self.inner.head(path).await
    }
}
