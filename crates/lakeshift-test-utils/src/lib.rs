//! Shared test utilities for Lakeshift integration tests.
//!
//! This crate provides:
//! - [`TracingMemoryBackend`]: In-memory storage with operation recording and
//!   failure injection
//! - [`TestContext`]: An orchestrator wired to scripted collaborators
//! - Schema and sample fixtures
//! - [`ScriptedTransformRunner`] and [`FakeDiscovery`] collaborator fakes
//! - Custom assertion helpers
//!
//! # Example
//!
//! ```rust,ignore
//! use lakeshift_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let ctx = TestContext::registered().await;
//!     let report = ctx
//!         .orchestrator
//!         .submit(ctx.request(compatible_candidate()))
//!         .await
//!         .expect("submit");
//!     assert_completed(&report, Branch::Compatible);
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

pub mod assertions;
pub mod fakes;
pub mod fixtures;
pub mod storage;

pub use assertions::*;
pub use fakes::*;
pub use fixtures::*;
pub use storage::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("lakeshift=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
