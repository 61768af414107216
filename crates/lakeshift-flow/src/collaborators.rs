//! Interfaces to the external systems the orchestrator drives.
//!
//! The transform engine and the schema discovery service are black boxes:
//! the orchestrator only needs to start them and read their verdict. Both are
//! injected as trait objects so deployments can bind them to their cloud
//! services and tests can script them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use lakeshift_catalog::SchemaDescription;

use crate::error::Result;

/// Verdict of a transform job run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TransformOutcome {
    /// The job finished and wrote columnar output.
    Success {
        /// Prefix the output was written to.
        output_location: String,
        /// Records the job converted.
        records_processed: u64,
    },
    /// The job ran and rejected its input.
    Failure {
        /// The job's failure detail.
        detail: String,
    },
}

/// Runs the JSON-to-columnar transform job.
#[async_trait]
pub trait TransformJobRunner: Send + Sync {
    /// Transforms the JSON objects under `dataset_location` with `schema`.
    ///
    /// A job that runs and fails is a [`TransformOutcome::Failure`]; an `Err`
    /// means the job could not be run at all.
    async fn run(&self, dataset_location: &str, schema: &SchemaDescription)
        -> Result<TransformOutcome>;
}

/// Schema discovery (crawler) service.
#[async_trait]
pub trait SchemaDiscovery: Send + Sync {
    /// Infers a candidate schema for the JSON objects under `location`.
    async fn propose_schema(&self, family: &str, location: &str) -> Result<SchemaDescription>;

    /// Adds `location` to the discovery scope. Must be idempotent.
    async fn register_scope(&self, location: &str) -> Result<()>;

    /// Returns true once `location` is visible in the discovery scope.
    async fn scope_registered(&self, location: &str) -> Result<bool>;
}
