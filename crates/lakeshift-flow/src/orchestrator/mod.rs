//! The schema-change orchestrator.
//!
//! [`SchemaChangeOrchestrator`] drives a [`FlowRecord`] through its steps
//! while holding the family lock. The record is persisted after every
//! transition and the lock TTL is renewed on a heartbeat while a step runs
//! and again after it completes. A crash between any two steps loses
//! nothing: `resume` re-enters at the recorded step and each step uses
//! durable state to skip work it already did.

mod steps;

use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::Instrument;

use lakeshift_catalog::{
    AppVersion, CatalogError, ChangeKind, DatasetArchiver, DatasetRegistry, DatasetVersion,
    SchemaComparator, SchemaDescription, VersionMap,
};
use lakeshift_core::observability::flow_span;
use lakeshift_core::{
    DocumentStore, FamilyLock, FlowId, LockAttempt, LockGuard, StorageBackend, paths,
};

use crate::collaborators::{SchemaDiscovery, TransformJobRunner};
use crate::config::OrchestratorConfig;
use crate::error::{Error, Result};
use crate::flow::{FlowRecord, FlowReport, FlowState, FlowStep, SchemaChangeRequest};
use crate::jobs::JobController;
use crate::metrics::{FlowMetrics, TimingGuard};
use crate::store::FlowStore;
use crate::tester::CompatibilityTester;

type Guard = LockGuard<dyn StorageBackend>;

/// Sequences schema-change flows for dataset families.
pub struct SchemaChangeOrchestrator {
    storage: Arc<dyn StorageBackend>,
    registry: DatasetRegistry,
    version_map: VersionMap,
    archiver: DatasetArchiver,
    jobs: JobController,
    flows: FlowStore,
    comparator: SchemaComparator,
    tester: CompatibilityTester,
    discovery: Arc<dyn SchemaDiscovery>,
    config: OrchestratorConfig,
    metrics: FlowMetrics,
}

impl std::fmt::Debug for SchemaChangeOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaChangeOrchestrator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SchemaChangeOrchestrator {
    /// Creates an orchestrator over `storage` and the external collaborators.
    #[must_use]
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        runner: Arc<dyn TransformJobRunner>,
        discovery: Arc<dyn SchemaDiscovery>,
        config: OrchestratorConfig,
    ) -> Self {
        let docs = DocumentStore::new(Arc::clone(&storage));
        Self {
            registry: DatasetRegistry::new(docs.clone()),
            version_map: VersionMap::new(docs.clone()),
            archiver: DatasetArchiver::new(docs.clone(), config.archive_root.clone()),
            jobs: JobController::new(docs.clone()),
            flows: FlowStore::new(docs),
            comparator: SchemaComparator,
            tester: CompatibilityTester::new(
                Arc::clone(&storage),
                runner,
                config.sandbox_root.clone(),
            ),
            storage,
            discovery,
            config,
            metrics: FlowMetrics::new(),
        }
    }

    /// Returns the job controller.
    #[must_use]
    pub fn jobs(&self) -> &JobController {
        &self.jobs
    }

    /// Returns the version map.
    #[must_use]
    pub fn version_map(&self) -> &VersionMap {
        &self.version_map
    }

    /// Returns the dataset registry.
    #[must_use]
    pub fn registry(&self) -> &DatasetRegistry {
        &self.registry
    }

    /// Returns the archiver.
    #[must_use]
    pub fn archiver(&self) -> &DatasetArchiver {
        &self.archiver
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Bootstraps a family: dataset `v1`, its first version map entry, and
    /// the ingestion job bound to `workflow`.
    ///
    /// Re-registering with the same arguments is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockBusy`] while a flow holds the family,
    /// [`Error::JobAlreadyExists`] if `job` exists with other parameters, and
    /// catalog errors if the family is already mapped differently.
    #[tracing::instrument(skip(self, schema), fields(revision = schema.revision))]
    pub async fn register_family(
        &self,
        family: &str,
        first_app_version: &AppVersion,
        schema: SchemaDescription,
        job: &str,
        workflow: &str,
    ) -> Result<DatasetVersion> {
        paths::validate_segment("family", family)?;
        if schema.family != family {
            return Err(CatalogError::InvalidSchema {
                message: format!("schema belongs to {}, not {family}", schema.family),
            }
            .into());
        }

        let guard = self.acquire(family, "register_family").await?;
        let result = async {
            let dataset = self
                .registry
                .register(&DatasetVersion::initial(&self.config.dataset_root, schema))
                .await?;
            self.version_map
                .ensure_entry(family, first_app_version, &dataset)
                .await?;
            self.jobs.register_workflow(workflow).await?;
            self.jobs
                .create_job(job, steps::job_params(&dataset), None)
                .await?;
            self.jobs.bind_job_to_workflow(job, workflow).await?;
            tracing::info!(dataset = %dataset.name(), "family registered");
            Ok(dataset)
        }
        .await;
        Self::release(guard, result).await
    }

    /// Submits a detected schema change and drives it as far as it goes.
    ///
    /// Step failures are not errors: the returned report shows the flow in
    /// [`FlowState::Failed`] with the failing step and error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockBusy`] when another process holds the family,
    /// [`Error::FlowPending`] when the family has an unfinished flow, and
    /// storage errors when the flow record cannot be persisted.
    pub async fn submit(&self, request: SchemaChangeRequest) -> Result<FlowReport> {
        paths::validate_segment("family", &request.family)?;
        paths::validate_segment("job", &request.job)?;

        let flow_id = FlowId::generate();
        let family = request.family.clone();
        let span = flow_span("submit", &flow_id.to_string(), &family);

        async {
            let mut guard = self.acquire(&family, "submit").await?;
            let result = self.submit_locked(flow_id, request, &mut guard).await;
            Self::release(guard, result).await
        }
        .instrument(span)
        .await
    }

    async fn submit_locked(
        &self,
        flow_id: FlowId,
        request: SchemaChangeRequest,
        guard: &mut Guard,
    ) -> Result<FlowReport> {
        let family = request.family.clone();
        if let Some(pending) = self.flows.active_flow(&family).await? {
            return Err(Error::FlowPending {
                family,
                flow_id: pending,
            });
        }

        let mut record = FlowRecord::new(flow_id, request);
        self.flows.create(&record).await?;
        if let Some(pending) = self.flows.claim_family(&family, flow_id).await? {
            record.transition(FlowState::Aborted)?;
            self.flows.save(&record).await?;
            return Err(Error::FlowPending {
                family,
                flow_id: pending,
            });
        }
        tracing::info!("flow submitted");

        self.drive(&mut record, guard).await?;
        Ok(record.report())
    }

    /// Resumes a failed, cancelled, or interrupted flow at its recorded step.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] for finished flows and flows
    /// awaiting confirmation, [`Error::FlowNotFound`], and [`Error::LockBusy`].
    pub async fn resume(&self, flow_id: FlowId) -> Result<FlowReport> {
        let record = self.flows.load(flow_id).await?;
        let span = flow_span("resume", &flow_id.to_string(), record.family());

        async {
            let mut guard = self.acquire(record.family(), "resume").await?;
            let result = self.resume_locked(flow_id, &mut guard).await;
            Self::release(guard, result).await
        }
        .instrument(span)
        .await
    }

    async fn resume_locked(&self, flow_id: FlowId, guard: &mut Guard) -> Result<FlowReport> {
        let mut record = self.flows.load(flow_id).await?;
        match record.state.clone() {
            FlowState::Failed { step, .. } => {
                let reentry = record.entering(step);
                record.transition(reentry)?;
                self.save(&record, "failed").await?;
            }
            FlowState::Cancelled { at } => {
                self.flows.clear_cancel(flow_id).await?;
                let reentry = record.entering(at);
                record.transition(reentry)?;
                self.save(&record, "cancelled").await?;
            }
            FlowState::Detected
            | FlowState::Classifying
            | FlowState::CompatibleFlow { .. }
            | FlowState::IncompatibleFlow { .. } => {
                tracing::info!(state = %record.state, "resuming interrupted flow");
            }
            FlowState::AwaitingConfirmation { .. } => {
                return Err(Error::InvalidStateTransition {
                    from: record.state.to_string(),
                    to: "resume".into(),
                    reason: "flow awaits operator confirmation".into(),
                });
            }
            FlowState::Completed | FlowState::Aborted => {
                return Err(Error::InvalidStateTransition {
                    from: record.state.to_string(),
                    to: "resume".into(),
                    reason: "flow is terminal".into(),
                });
            }
        }

        self.drive(&mut record, guard).await?;
        Ok(record.report())
    }

    /// Resolves an ambiguous classification and continues the flow.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] unless the flow is awaiting
    /// confirmation and `kind` is compatible or incompatible.
    pub async fn confirm(&self, flow_id: FlowId, kind: ChangeKind) -> Result<FlowReport> {
        let record = self.flows.load(flow_id).await?;
        let span = flow_span("confirm", &flow_id.to_string(), record.family());

        async {
            let mut guard = self.acquire(record.family(), "confirm").await?;
            let result = async {
                let mut record = self.flows.load(flow_id).await?;
                if !matches!(record.state, FlowState::AwaitingConfirmation { .. }) {
                    return Err(Error::InvalidStateTransition {
                        from: record.state.to_string(),
                        to: format!("confirmed {kind}"),
                        reason: "flow is not awaiting confirmation".into(),
                    });
                }
                self.enter_branch(&mut record, kind).await?;
                tracing::info!(%kind, "classification confirmed");
                self.save(&record, "awaiting_confirmation").await?;
                self.drive(&mut record, &mut guard).await?;
                Ok(record.report())
            }
            .await;
            Self::release(guard, result).await
        }
        .instrument(span)
        .await
    }

    /// Requests that a flow stop before its next step.
    ///
    /// A flow that nobody is driving is cancelled immediately; a running flow
    /// stops at its next step boundary.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] for finished flows.
    pub async fn cancel(&self, flow_id: FlowId) -> Result<FlowReport> {
        let record = self.flows.load(flow_id).await?;
        if record.state.is_terminal() {
            return Err(Error::InvalidStateTransition {
                from: record.state.to_string(),
                to: "cancelled".into(),
                reason: "flow is terminal".into(),
            });
        }
        self.flows.request_cancel(flow_id).await?;

        let lock = FamilyLock::new(Arc::clone(&self.storage), record.family());
        let guard = match lock.try_acquire(self.config.lock_ttl, Some("cancel".into())).await? {
            LockAttempt::Acquired(guard) => guard,
            LockAttempt::Busy(info) => {
                tracing::info!(
                    %flow_id,
                    holder = %info.holder_id,
                    "cancel requested while flow runs"
                );
                return Ok(record.report());
            }
        };

        let result = async {
            let mut record = self.flows.load(flow_id).await?;
            let already = matches!(record.state, FlowState::Cancelled { .. });
            if let (false, Some(at)) = (already, record.state.cancel_point()) {
                let from = record.state.name();
                record.transition(FlowState::Cancelled { at })?;
                self.save(&record, from).await?;
                self.metrics
                    .record_flow_outcome(branch_label(&record), "cancelled");
                tracing::info!(%flow_id, %at, "flow cancelled");
            }
            Ok(record.report())
        }
        .await;
        Self::release(guard, result).await
    }

    /// Abandons a flow and releases its family.
    ///
    /// Triggers paused by the flow stay paused; the operator decides how to
    /// restore the family.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] for finished flows and
    /// [`Error::LockBusy`] while the flow is being driven.
    pub async fn abort(&self, flow_id: FlowId) -> Result<FlowReport> {
        let record = self.flows.load(flow_id).await?;
        let guard = self.acquire(record.family(), "abort").await?;
        let result = async {
            let mut record = self.flows.load(flow_id).await?;
            let from = record.state.name();
            record.transition(FlowState::Aborted)?;
            self.save(&record, from).await?;
            self.finish(&record).await?;
            tracing::warn!(%flow_id, family = %record.family(), "flow aborted");
            Ok(record.report())
        }
        .await;
        Self::release(guard, result).await
    }

    /// Returns a flow's report.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FlowNotFound`].
    pub async fn report(&self, flow_id: FlowId) -> Result<FlowReport> {
        Ok(self.flows.load(flow_id).await?.report())
    }

    /// Returns the family's unfinished flow, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn active_flow(&self, family: &str) -> Result<Option<FlowId>> {
        self.flows.active_flow(family).await
    }

    /// Runs pending steps until the flow completes, fails, parks, or is
    /// cancelled.
    ///
    /// Step errors are recorded in the flow; only persistence and lock errors
    /// are returned.
    async fn drive(&self, record: &mut FlowRecord, guard: &mut Guard) -> Result<()> {
        while let Some(step) = record.state.pending_step() {
            if self.flows.cancel_requested(record.flow_id).await? {
                let from = record.state.name();
                record.transition(FlowState::Cancelled { at: step })?;
                self.save(record, from).await?;
                self.metrics
                    .record_flow_outcome(branch_label(record), "cancelled");
                tracing::info!(%step, "flow cancelled between steps");
                return Ok(());
            }

            if record.state == FlowState::Detected {
                record.transition(FlowState::Classifying)?;
                self.save(record, "detected").await?;
            }

            let from = record.state.name();
            let outcome = {
                let metrics = &self.metrics;
                let _timing = TimingGuard::new(move |elapsed| {
                    metrics.observe_step_duration(step.as_str(), elapsed);
                });
                self.run_step_holding_lock(record, step, guard).await?
            };

            if let Err(err) = outcome {
                tracing::warn!(
                    %step,
                    error = %err,
                    retryable = err.is_retryable(),
                    "flow step failed"
                );
                record.fail(step, &err)?;
                self.save(record, from).await?;
                self.metrics.record_flow_outcome(branch_label(record), "failed");
                return Ok(());
            }

            self.save(record, from).await?;
            tracing::info!(%step, state = %record.state, "flow step completed");
            guard.extend(self.config.lock_ttl).await?;
        }

        match &record.state {
            FlowState::Completed => {
                self.finish(record).await?;
                self.metrics
                    .record_flow_outcome(branch_label(record), "completed");
                tracing::info!(kind = ?record.kind, "flow completed");
            }
            FlowState::AwaitingConfirmation { fields } => {
                self.metrics
                    .record_flow_outcome(branch_label(record), "awaiting");
                tracing::warn!(?fields, "classification ambiguous, awaiting confirmation");
            }
            _ => {}
        }
        Ok(())
    }

    /// Runs one step while renewing the family lock every heartbeat.
    ///
    /// The outer error means the lock could not be renewed: the step is
    /// dropped unfinished and the flow is left for the new holder to resume.
    /// The inner result is the step's own outcome.
    async fn run_step_holding_lock(
        &self,
        record: &mut FlowRecord,
        step: FlowStep,
        guard: &mut Guard,
    ) -> Result<Result<()>> {
        let mut heartbeat = tokio::time::interval(self.config.lock_heartbeat());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        heartbeat.tick().await;

        let running = self.run_step(record, step);
        tokio::pin!(running);
        loop {
            tokio::select! {
                outcome = &mut running => return Ok(outcome),
                _ = heartbeat.tick() => {
                    if let Err(err) = guard.extend(self.config.lock_ttl).await {
                        tracing::error!(%step, error = %err, "lost family lock mid-step");
                        self.metrics.record_lock_contention();
                        return Err(err.into());
                    }
                    tracing::debug!(%step, "family lock renewed");
                }
            }
        }
    }

    async fn save(&self, record: &FlowRecord, from: &str) -> Result<()> {
        self.flows.save(record).await?;
        self.metrics.record_transition(from, record.state.name());
        Ok(())
    }

    async fn finish(&self, record: &FlowRecord) -> Result<()> {
        self.flows
            .release_family(record.family(), record.flow_id)
            .await?;
        self.flows.clear_cancel(record.flow_id).await
    }

    async fn acquire(&self, family: &str, operation: &str) -> Result<Guard> {
        let lock = FamilyLock::new(Arc::clone(&self.storage), family);
        match lock
            .try_acquire(self.config.lock_ttl, Some(operation.to_string()))
            .await?
        {
            LockAttempt::Acquired(guard) => Ok(guard),
            LockAttempt::Busy(info) => {
                self.metrics.record_lock_contention();
                Err(Error::LockBusy {
                    family: family.to_string(),
                    holder: info.holder_id,
                })
            }
        }
    }

    async fn release<T>(guard: Guard, result: Result<T>) -> Result<T> {
        if let Err(err) = guard.release().await {
            tracing::warn!(error = %err, "failed to release family lock; it expires with its TTL");
        }
        result
    }
}

fn branch_label(record: &FlowRecord) -> &'static str {
    record.branch.map_or("none", |branch| branch.as_str())
}
