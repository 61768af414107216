//! Step implementations.
//!
//! Every step may run more than once for the same flow (crash before the
//! record was saved, or `resume` after a failure), so each one either checks
//! durable state first or calls an operation that is idempotent on its own.

use std::collections::BTreeMap;

use lakeshift_catalog::{
    CatalogError, ChangeKind, DatasetVersion, SchemaChange, SchemaDescription,
};

use super::SchemaChangeOrchestrator;
use crate::error::{Error, Result};
use crate::flow::{Branch, CandidateSource, FlowRecord, FlowState, FlowStep};
use crate::tester::{FailReason, TestVerdict};

/// Parameters of the ingestion job for `dataset`.
pub(super) fn job_params(dataset: &DatasetVersion) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("family".to_string(), dataset.family.clone()),
        ("dataset_version".to_string(), dataset.version.to_string()),
        ("dataset_location".to_string(), dataset.storage_location.clone()),
        (
            "schema_revision".to_string(),
            dataset.current_schema.revision.to_string(),
        ),
    ])
}

/// Name of the job created for a forked dataset.
fn job_name(dataset: &DatasetVersion) -> String {
    format!("{}-v{}-json-to-parquet", dataset.family, dataset.version)
}

/// Either a decided verdict or the fields that made the comparator give up.
enum Verdict {
    Decided(ChangeKind),
    Ambiguous(Vec<String>),
}

fn snapshot<'a, T>(value: Option<&'a T>, what: &str) -> Result<&'a T> {
    value.ok_or_else(|| {
        lakeshift_core::Error::Internal {
            message: format!("flow record has no {what} snapshot"),
        }
        .into()
    })
}

impl SchemaChangeOrchestrator {
    pub(super) async fn run_step(&self, record: &mut FlowRecord, step: FlowStep) -> Result<()> {
        match step {
            FlowStep::Classify => return self.classify(record).await,
            FlowStep::PauseTriggers => {
                for workflow in &record.workflows {
                    self.jobs.pause_trigger(workflow).await?;
                }
                // A run already in flight must drain before the dataset
                // is rewritten in place.
                if record.branch == Some(Branch::Compatible) {
                    self.jobs.ensure_idle(&record.request.job).await?;
                }
            }
            FlowStep::AppendMapping => self.append_mapping(record).await?,
            FlowStep::ArchiveDataset => {
                self.jobs.ensure_idle(&record.request.job).await?;
                let source = snapshot(record.source.as_ref(), "source")?;
                let archived = self.archiver.archive(source).await?;
                record.archive_slot = Some(archived.slot);
            }
            FlowStep::PublishSchema => {
                let source = snapshot(record.source.as_ref(), "source")?;
                let target = snapshot(record.target.as_ref(), "target")?;
                self.registry
                    .publish_schema(
                        &source.family,
                        source.version,
                        source.update_number,
                        &target.current_schema,
                    )
                    .await?;
                self.jobs
                    .update_params(&record.request.job, job_params(target))
                    .await?;
            }
            FlowStep::ResetCheckpoint => {
                self.jobs.reset_checkpoint(&record.request.job).await?;
            }
            FlowStep::RegisterScope => {
                let target = snapshot(record.target.as_ref(), "target")?;
                self.register_scope(&target.storage_location).await?;
            }
            FlowStep::CreateJob => self.create_job(record).await?,
            FlowStep::ResumeTriggers => {
                for workflow in &record.workflows {
                    self.jobs.resume_trigger(workflow).await?;
                }
            }
        }
        record.complete_step(step)
    }

    /// Obtains the candidate, classifies it, and routes the flow.
    async fn classify(&self, record: &mut FlowRecord) -> Result<()> {
        let family = record.request.family.clone();
        let candidate = match &record.request.candidate {
            CandidateSource::Provided(schema) => schema.clone(),
            CandidateSource::Discover { location } => {
                self.discovery.propose_schema(&family, location).await?
            }
        };

        let Some(current) = self.version_map.latest(&family).await? else {
            return Err(Error::FamilyNotFound { family });
        };
        let source = self
            .registry
            .get(&family, current.dataset.version)
            .await?;

        let verdict = match self.comparator.classify(&source.current_schema, &candidate) {
            Ok(kind) => Verdict::Decided(kind),
            Err(CatalogError::ClassificationAmbiguous { fields, .. }) => Verdict::Ambiguous(fields),
            Err(err) => return Err(err.into()),
        };
        let label = match &verdict {
            Verdict::Decided(kind) => kind.to_string(),
            Verdict::Ambiguous(_) => "ambiguous".to_string(),
        };
        tracing::info!(
            source = %source.name(),
            revision = candidate.revision,
            verdict = %label,
            "schema change classified"
        );

        record.change = Some(SchemaChange::detected(
            source.current_schema.clone(),
            candidate.clone(),
        ));
        record.source = Some(source);

        let samples = record.request.samples.clone();
        let verdict = match (verdict, samples.as_ref()) {
            (Verdict::Decided(ChangeKind::NoChange), _) => {
                record.kind = Some(ChangeKind::NoChange);
                return record.complete_step(FlowStep::Classify);
            }
            (Verdict::Decided(ChangeKind::Incompatible), _) => {
                Verdict::Decided(ChangeKind::Incompatible)
            }
            (_, Some(samples)) => {
                let tested = self
                    .tester
                    .test(&family, samples, &candidate, self.config.tester_timeout)
                    .await?;
                match tested {
                    TestVerdict::Pass => Verdict::Decided(ChangeKind::Compatible),
                    TestVerdict::Fail(FailReason::Timeout) => {
                        return Err(Error::Timeout {
                            operation: "compatibility test".into(),
                            after: self.config.tester_timeout,
                        });
                    }
                    TestVerdict::Fail(reason) => {
                        tracing::info!(?reason, "compatibility test failed, forking dataset");
                        Verdict::Decided(ChangeKind::Incompatible)
                    }
                }
            }
            (verdict, None) => verdict,
        };

        match verdict {
            Verdict::Decided(kind) => self.enter_branch(record, kind).await,
            Verdict::Ambiguous(fields) => {
                record.transition(FlowState::AwaitingConfirmation { fields })
            }
        }
    }

    /// Snapshots the target dataset and the family's workflows, then moves
    /// the flow onto the branch for `kind`.
    pub(super) async fn enter_branch(
        &self,
        record: &mut FlowRecord,
        kind: ChangeKind,
    ) -> Result<()> {
        let source = snapshot(record.source.as_ref(), "source")?;
        let candidate: SchemaDescription = snapshot(record.change.as_ref(), "change")?.to.clone();

        let target = match kind {
            ChangeKind::Compatible => source.with_update(candidate),
            ChangeKind::Incompatible => {
                let latest = self
                    .registry
                    .latest(&source.family)
                    .await?
                    .unwrap_or_else(|| source.clone());
                latest.fork(&self.config.dataset_root, candidate)
            }
            ChangeKind::NoChange => source.clone(),
        };
        let workflows = self.jobs.workflows_for_job(&record.request.job).await?;

        record.enter_branch(kind)?;
        record.target = Some(target);
        record.workflows = workflows;
        Ok(())
    }

    async fn append_mapping(&self, record: &FlowRecord) -> Result<()> {
        let target = snapshot(record.target.as_ref(), "target")?;
        if record.branch == Some(Branch::Incompatible) {
            self.registry.register(target).await?;
        }
        let outcome = self
            .version_map
            .ensure_entry(&target.family, &record.request.app_version, target)
            .await?;
        tracing::info!(
            ?outcome,
            dataset = %target.name(),
            app_version = %record.request.app_version,
            "version map entry ensured"
        );
        Ok(())
    }

    /// Adds `location` to the discovery scope and waits until it is visible.
    async fn register_scope(&self, location: &str) -> Result<()> {
        self.discovery.register_scope(location).await?;
        for attempt in 1..=self.config.scope_poll_attempts {
            if self.discovery.scope_registered(location).await? {
                tracing::info!(location, attempt, "discovery scope registered");
                return Ok(());
            }
            tokio::time::sleep(self.config.scope_poll_interval).await;
        }
        Err(Error::Timeout {
            operation: format!("scope registration for {location}"),
            after: self.config.scope_poll_interval * self.config.scope_poll_attempts,
        })
    }

    /// Creates the forked dataset's job and moves the workflows over to it.
    async fn create_job(&self, record: &mut FlowRecord) -> Result<()> {
        let target = snapshot(record.target.as_ref(), "target")?;
        let name = job_name(target);
        let created_by = record.flow_id.to_string();
        self.jobs
            .create_job(&name, job_params(target), Some(&created_by))
            .await?;

        for workflow in &record.workflows {
            self.jobs.bind_job_to_workflow(&name, workflow).await?;
            if name != record.request.job {
                self.jobs
                    .unbind_job_from_workflow(&record.request.job, workflow)
                    .await?;
            }
        }
        tracing::info!(job = %name, workflows = ?record.workflows, "ingestion job created");
        record.new_job = Some(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lakeshift_catalog::{DataType, FieldSpec};

    #[test]
    fn forked_job_name_and_params() {
        let schema = SchemaDescription::new(
            "weather",
            3,
            vec![FieldSpec::nullable("temp", DataType::Double)],
        )
        .expect("schema");
        let dataset = DatasetVersion::initial("datasets", schema.clone()).fork("datasets", schema);
        assert_eq!(job_name(&dataset), "weather-v2-json-to-parquet");

        let params = job_params(&dataset);
        assert_eq!(params["dataset_version"], "2");
        assert_eq!(params["dataset_location"], "datasets/weather_v2/");
        assert_eq!(params["schema_revision"], "3");
    }
}
