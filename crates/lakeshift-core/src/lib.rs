//! # lakeshift-core
//!
//! Core abstractions shared by every Lakeshift component.
//!
//! Lakeshift orchestrates schema evolution for a JSON-to-Parquet ingestion
//! pipeline. This crate holds the primitives the catalog and flow crates are
//! built on:
//!
//! - **Storage**: The object storage contract with conditional writes
//! - **Documents**: Durable JSON state updated by compare-and-swap
//! - **Locks**: Advisory per-family locks with TTL and fencing
//! - **Identifiers**: ULID-backed ids for flows, sandboxes, and runs
//! - **Observability**: Logging initialization and span helpers
//!
//! ## Example
//!
//! ```rust
//! use lakeshift_core::prelude::*;
//!
//! let flow = FlowId::generate();
//! assert_eq!(flow.to_string().len(), 26);
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod document;
pub mod error;
pub mod id;
pub mod lock;
pub mod observability;
pub mod paths;
pub mod storage;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::document::{Document, DocumentStore};
    pub use crate::error::{Error, Result};
    pub use crate::id::{FlowId, RunId, SandboxId};
    pub use crate::lock::{FamilyLock, LockAttempt, LockGuard, LockInfo};
    pub use crate::storage::{
        MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult,
    };
}

pub use document::{Document, DocumentStore};
pub use error::{Error, Result};
pub use id::{FlowId, RunId, SandboxId};
pub use lock::{FamilyLock, LockAttempt, LockGuard, LockInfo};
pub use observability::{LogFormat, init_logging};
pub use storage::{MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult};
