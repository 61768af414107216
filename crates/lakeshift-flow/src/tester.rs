//! Sandbox trial runs of the transform job against a candidate schema.
//!
//! The tester copies representative samples into a fresh sandbox prefix,
//! runs the transform job on them, and checks that every staged record came
//! out the other side. The sandbox (staged input and job output) is deleted on
//! every exit path, including timeouts and collaborator errors.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use lakeshift_catalog::{AppVersion, SchemaDescription};
use lakeshift_core::storage::{self, StorageBackend, WritePrecondition};
use lakeshift_core::{SandboxId, paths};

use crate::collaborators::{TransformJobRunner, TransformOutcome};
use crate::error::Result;
use crate::metrics::FlowMetrics;

/// A sample object of the family's raw JSON input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleRef {
    /// App version that produced the sample.
    pub app_version: AppVersion,
    /// Object path of the sample.
    pub path: String,
    /// Number of JSON records in the sample.
    pub records: u64,
}

/// Old-schema and new-schema samples for one compatibility test.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SamplePlan {
    /// Representative samples of data already ingested.
    pub old: Vec<SampleRef>,
    /// Backfill sample written with the candidate schema.
    pub new: Vec<SampleRef>,
}

/// Why a compatibility test failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailReason {
    /// The transform run did not finish within the bound.
    Timeout,
    /// The transform job rejected the input.
    Transform {
        /// The job's failure detail.
        detail: String,
    },
    /// The job finished but did not convert every staged record.
    IncompleteOutput {
        /// Records staged.
        expected: u64,
        /// Records the job reports converting.
        processed: u64,
    },
    /// The job finished but its output location is empty.
    EmptyOutput {
        /// The reported output location.
        output_location: String,
    },
}

/// Result of a compatibility test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum TestVerdict {
    /// The candidate schema reads old and new samples.
    Pass,
    /// The candidate schema does not.
    Fail(FailReason),
}

/// Runs trial transforms in throwaway sandboxes.
pub struct CompatibilityTester {
    storage: Arc<dyn StorageBackend>,
    runner: Arc<dyn TransformJobRunner>,
    sandbox_root: String,
    metrics: FlowMetrics,
}

impl std::fmt::Debug for CompatibilityTester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompatibilityTester")
            .field("sandbox_root", &self.sandbox_root)
            .finish_non_exhaustive()
    }
}

struct Staged {
    input: String,
    records: u64,
}

impl CompatibilityTester {
    /// Creates a tester staging sandboxes under `sandbox_root`.
    #[must_use]
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        runner: Arc<dyn TransformJobRunner>,
        sandbox_root: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            runner,
            sandbox_root: sandbox_root.into(),
            metrics: FlowMetrics::new(),
        }
    }

    /// Tests whether `candidate` can transform both sample sets.
    ///
    /// Old samples are reduced to one per distinct app version (first
    /// occurrence wins); new samples are staged in full.
    ///
    /// # Errors
    ///
    /// Returns an error when staging or teardown hits storage failures, or
    /// when the runner cannot be invoked. A job that runs and fails, or does
    /// not finish within `timeout`, is a [`TestVerdict::Fail`], not an error.
    #[tracing::instrument(skip(self, samples, candidate), fields(sandbox))]
    pub async fn test(
        &self,
        family: &str,
        samples: &SamplePlan,
        candidate: &SchemaDescription,
        timeout: Duration,
    ) -> Result<TestVerdict> {
        let sandbox = SandboxId::generate();
        tracing::Span::current().record("sandbox", tracing::field::display(sandbox));
        let prefix = paths::as_prefix(&format!(
            "{}/{family}/{sandbox}",
            self.sandbox_root.trim_end_matches('/')
        ));

        let mut output_location = None;
        let result = self
            .run_in_sandbox(&prefix, samples, candidate, timeout, &mut output_location)
            .await;
        let teardown = self.teardown(&prefix, output_location.as_deref()).await;

        let verdict = match (result, teardown) {
            (Ok(verdict), Ok(())) => verdict,
            (Ok(_), Err(e)) => return Err(e),
            (Err(e), teardown) => {
                if let Err(cleanup) = teardown {
                    tracing::warn!(error = %cleanup, "sandbox teardown failed after error");
                }
                return Err(e);
            }
        };

        self.metrics.record_compatibility_test(&verdict);
        tracing::info!(?verdict, "compatibility test finished");
        Ok(verdict)
    }

    async fn run_in_sandbox(
        &self,
        prefix: &str,
        samples: &SamplePlan,
        candidate: &SchemaDescription,
        timeout: Duration,
        output_location: &mut Option<String>,
    ) -> Result<TestVerdict> {
        let staged = self.stage(prefix, samples).await?;

        let running = self.runner.run(&staged.input, candidate);
        let outcome = match tokio::time::timeout(timeout, running).await {
            Ok(outcome) => outcome?,
            Err(_) => {
                tracing::warn!(?timeout, "transform run timed out");
                return Ok(TestVerdict::Fail(FailReason::Timeout));
            }
        };

        match outcome {
            TransformOutcome::Failure { detail } => {
                Ok(TestVerdict::Fail(FailReason::Transform { detail }))
            }
            TransformOutcome::Success {
                output_location: location,
                records_processed,
            } => {
                *output_location = Some(location.clone());
                if records_processed < staged.records {
                    return Ok(TestVerdict::Fail(FailReason::IncompleteOutput {
                        expected: staged.records,
                        processed: records_processed,
                    }));
                }
                if !storage::prefix_occupied(self.storage.as_ref(), &paths::as_prefix(&location))
                    .await?
                {
                    return Ok(TestVerdict::Fail(FailReason::EmptyOutput {
                        output_location: location,
                    }));
                }
                Ok(TestVerdict::Pass)
            }
        }
    }

    async fn stage(&self, prefix: &str, samples: &SamplePlan) -> Result<Staged> {
        let input = format!("{prefix}input/");
        let mut seen = BTreeSet::new();
        let old = samples
            .old
            .iter()
            .filter(|sample| seen.insert(sample.app_version.clone()));

        let mut records = 0;
        let mut index = 0usize;
        for (group, sample) in old
            .map(|s| ("old", s))
            .chain(samples.new.iter().map(|s| ("new", s)))
        {
            let name = sample.path.rsplit('/').next().unwrap_or(&sample.path);
            let target = format!("{input}{group}/{index:05}-{name}");
            let data = self.storage.get(&sample.path).await?;
            self.storage
                .put(&target, data, WritePrecondition::None)
                .await?;
            records += sample.records;
            index += 1;
        }

        tracing::debug!(objects = index, records, "samples staged");
        Ok(Staged { input, records })
    }

    async fn teardown(&self, prefix: &str, output_location: Option<&str>) -> Result<()> {
        let mut prefixes = vec![prefix.to_string()];
        if let Some(output) = output_location {
            let output = paths::as_prefix(output);
            if !output.starts_with(prefix) {
                prefixes.push(output);
            }
        }

        for p in prefixes {
            for meta in self.storage.list(&p).await? {
                self.storage.delete(&meta.path).await?;
            }
        }
        Ok(())
    }
}
