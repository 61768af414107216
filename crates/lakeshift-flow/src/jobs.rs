//! Job, workflow, trigger, and checkpoint control.
//!
//! The [`JobController`] is the only writer of trigger states and job
//! checkpoints. The scheduler starts runs through
//! [`JobController::fire_workflow`], which honors paused triggers and the
//! one-run-per-job limit; runs report back through
//! [`JobController::complete_run`], which advances the checkpoint.
//!
//! Every operation is idempotent: repeating it after a crash converges to the
//! same durable state.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lakeshift_core::document::{DocumentStore, Mutation};
use lakeshift_core::{RunId, paths};

use crate::error::{Error, Result};

/// Run property holding the JSON-encoded records of a batched run.
pub const MESSAGES_PROPERTY: &str = "messages";

/// Trigger state of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerState {
    /// Events start runs.
    Active,
    /// Events are ignored.
    Paused,
}

/// A workflow: a trigger plus the jobs it starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRecord {
    /// Workflow id.
    pub id: String,
    /// Trigger state.
    pub trigger: TriggerState,
    /// Jobs started when the workflow fires.
    pub jobs: BTreeSet<String>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

/// Definition of an ingestion job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    /// Job name.
    pub name: String,
    /// Job parameters (target dataset, schema revision, ...).
    pub params: BTreeMap<String, String>,
    /// Flow that created the job, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Position of a job's incremental processing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CheckpointMarker {
    /// The next run reprocesses all input.
    Reset,
    /// Input up to and including `marker` has been processed.
    Processed {
        /// Opaque position reported by the job.
        marker: String,
    },
}

/// Durable checkpoint of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCheckpoint {
    /// Job name.
    pub job: String,
    /// Current position.
    pub marker: CheckpointMarker,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

/// An in-flight run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveRun {
    /// Job name.
    pub job: String,
    /// Run id.
    pub run_id: RunId,
    /// Workflow that started the run.
    pub workflow: String,
    /// Properties of the triggering event (e.g. `input_bucket`, `input_key`).
    pub run_properties: BTreeMap<String, String>,
    /// Start time.
    pub started_at: DateTime<Utc>,
}

/// A finished run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    /// The run as it was started.
    pub run: ActiveRun,
    /// Whether the run succeeded.
    pub succeeded: bool,
    /// Checkpoint marker reported on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marker: Option<String>,
    /// Failure detail reported on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Completion time.
    pub finished_at: DateTime<Utc>,
}

/// Result of [`JobController::fire_workflow`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FireOutcome {
    /// Runs were started, one per bound job.
    Started(Vec<ActiveRun>),
    /// The trigger is paused; nothing was started.
    Skipped {
        /// The paused workflow.
        workflow: String,
    },
}

/// Controls jobs, workflow triggers, and checkpoints.
#[derive(Debug, Clone)]
pub struct JobController {
    docs: DocumentStore,
}

impl JobController {
    /// Creates a controller over a document store.
    #[must_use]
    pub fn new(docs: DocumentStore) -> Self {
        Self { docs }
    }

    /// Registers a workflow with an active trigger. Existing workflows are
    /// returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid id or a storage failure.
    pub async fn register_workflow(&self, workflow: &str) -> Result<WorkflowRecord> {
        paths::validate_segment("workflow", workflow)?;
        let record = WorkflowRecord {
            id: workflow.to_string(),
            trigger: TriggerState::Active,
            jobs: BTreeSet::new(),
            updated_at: Utc::now(),
        };
        let stored = self
            .docs
            .update::<WorkflowRecord, Error, _>(&paths::workflow(workflow), |current| {
                Ok(match current {
                    Some(_) => Mutation::Unchanged,
                    None => Mutation::Put(record.clone()),
                })
            })
            .await?;
        Ok(stored.unwrap_or(record))
    }

    /// Loads a workflow.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WorkflowNotFound`] if it is not registered.
    pub async fn workflow(&self, workflow: &str) -> Result<WorkflowRecord> {
        self.docs
            .load::<WorkflowRecord>(&paths::workflow(workflow))
            .await?
            .map(|doc| doc.value)
            .ok_or_else(|| Error::WorkflowNotFound {
                workflow: workflow.to_string(),
            })
    }

    /// Pauses a workflow's trigger. Pausing a paused trigger is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WorkflowNotFound`] if it is not registered.
    #[tracing::instrument(skip(self))]
    pub async fn pause_trigger(&self, workflow: &str) -> Result<()> {
        self.set_trigger(workflow, TriggerState::Paused).await?;
        tracing::info!("trigger paused");
        Ok(())
    }

    /// Resumes a workflow's trigger. Resuming an active trigger is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::JobInProgress`] while any bound job has a run in
    /// flight, and [`Error::WorkflowNotFound`] if it is not registered.
    #[tracing::instrument(skip(self))]
    pub async fn resume_trigger(&self, workflow: &str) -> Result<()> {
        let record = self.workflow(workflow).await?;
        if record.trigger == TriggerState::Active {
            return Ok(());
        }
        for job in &record.jobs {
            self.ensure_idle(job).await?;
        }
        self.set_trigger(workflow, TriggerState::Active).await?;
        tracing::info!("trigger resumed");
        Ok(())
    }

    async fn set_trigger(&self, workflow: &str, trigger: TriggerState) -> Result<()> {
        self.docs
            .update::<WorkflowRecord, Error, _>(&paths::workflow(workflow), |current| {
                let Some(current) = current else {
                    return Err(Error::WorkflowNotFound {
                        workflow: workflow.to_string(),
                    });
                };
                if current.trigger == trigger {
                    return Ok(Mutation::Unchanged);
                }
                let mut next = current.clone();
                next.trigger = trigger;
                next.updated_at = Utc::now();
                Ok(Mutation::Put(next))
            })
            .await?;
        Ok(())
    }

    /// Creates a job.
    ///
    /// Re-creating a job with the same parameters by the same creator returns
    /// the stored job, so a flow can retry its create step.
    ///
    /// # Errors
    ///
    /// Returns [`Error::JobAlreadyExists`] when the name is taken by a job with
    /// a different creator or different parameters.
    #[tracing::instrument(skip(self, params))]
    pub async fn create_job(
        &self,
        name: &str,
        params: BTreeMap<String, String>,
        created_by: Option<&str>,
    ) -> Result<JobRecord> {
        paths::validate_segment("job", name)?;
        let record = JobRecord {
            name: name.to_string(),
            params,
            created_by: created_by.map(str::to_string),
            created_at: Utc::now(),
        };

        if self.docs.create(&paths::job(name), &record).await?.is_some() {
            tracing::info!("job created");
            return Ok(record);
        }

        let existing = self.job(name).await?;
        if existing.created_by == record.created_by && existing.params == record.params {
            Ok(existing)
        } else {
            Err(Error::JobAlreadyExists {
                job: name.to_string(),
            })
        }
    }

    /// Loads a job.
    ///
    /// # Errors
    ///
    /// Returns [`Error::JobNotFound`] if it is not registered.
    pub async fn job(&self, name: &str) -> Result<JobRecord> {
        self.docs
            .load::<JobRecord>(&paths::job(name))
            .await?
            .map(|doc| doc.value)
            .ok_or_else(|| Error::JobNotFound {
                job: name.to_string(),
            })
    }

    /// Merges `params` into a job's parameters, overwriting keys it already
    /// has. Applying the same parameters twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::JobNotFound`] if it is not registered.
    #[tracing::instrument(skip(self, params))]
    pub async fn update_params(&self, job: &str, params: BTreeMap<String, String>) -> Result<()> {
        self.docs
            .update::<JobRecord, Error, _>(&paths::job(job), |current| {
                let Some(current) = current else {
                    return Err(Error::JobNotFound {
                        job: job.to_string(),
                    });
                };
                let mut next = current.clone();
                next.params.extend(params.clone());
                if next.params == current.params {
                    return Ok(Mutation::Unchanged);
                }
                Ok(Mutation::Put(next))
            })
            .await?;
        Ok(())
    }

    /// Binds a job to a workflow. Binding twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::JobNotFound`] or [`Error::WorkflowNotFound`].
    #[tracing::instrument(skip(self))]
    pub async fn bind_job_to_workflow(&self, job: &str, workflow: &str) -> Result<()> {
        self.job(job).await?;
        self.update_bindings(workflow, |jobs| jobs.insert(job.to_string()))
            .await
    }

    /// Removes a job from a workflow. Unbinding an unbound job is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WorkflowNotFound`] if the workflow is not registered.
    #[tracing::instrument(skip(self))]
    pub async fn unbind_job_from_workflow(&self, job: &str, workflow: &str) -> Result<()> {
        self.update_bindings(workflow, |jobs| jobs.remove(job)).await
    }

    async fn update_bindings<F>(&self, workflow: &str, change: F) -> Result<()>
    where
        F: Fn(&mut BTreeSet<String>) -> bool + Send + Sync,
    {
        self.docs
            .update::<WorkflowRecord, Error, _>(&paths::workflow(workflow), |current| {
                let Some(current) = current else {
                    return Err(Error::WorkflowNotFound {
                        workflow: workflow.to_string(),
                    });
                };
                let mut next = current.clone();
                if !change(&mut next.jobs) {
                    return Ok(Mutation::Unchanged);
                }
                next.updated_at = Utc::now();
                Ok(Mutation::Put(next))
            })
            .await?;
        Ok(())
    }

    /// Returns the ids of the workflows a job is bound to, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the workflows cannot be read.
    pub async fn workflows_for_job(&self, job: &str) -> Result<Vec<String>> {
        Ok(self
            .docs
            .load_prefix::<WorkflowRecord>(&paths::workflows_prefix())
            .await?
            .into_iter()
            .filter(|(_, wf)| wf.jobs.contains(job))
            .map(|(_, wf)| wf.id)
            .collect())
    }

    /// Returns a job's checkpoint. A job that never ran is at [`CheckpointMarker::Reset`].
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint cannot be read.
    pub async fn checkpoint(&self, job: &str) -> Result<JobCheckpoint> {
        Ok(self
            .docs
            .load::<JobCheckpoint>(&paths::checkpoint(job))
            .await?
            .map_or_else(
                || JobCheckpoint {
                    job: job.to_string(),
                    marker: CheckpointMarker::Reset,
                    updated_at: Utc::now(),
                },
                |doc| doc.value,
            ))
    }

    /// Resets a job's checkpoint so its next run reprocesses everything.
    ///
    /// # Errors
    ///
    /// Returns [`Error::JobNotFound`] for an unknown job and
    /// [`Error::JobInProgress`] while a run is in flight.
    #[tracing::instrument(skip(self))]
    pub async fn reset_checkpoint(&self, job: &str) -> Result<()> {
        self.job(job).await?;
        self.ensure_idle(job).await?;
        self.write_checkpoint(job, CheckpointMarker::Reset).await?;
        tracing::info!("checkpoint reset");
        Ok(())
    }

    async fn write_checkpoint(&self, job: &str, marker: CheckpointMarker) -> Result<()> {
        let next = JobCheckpoint {
            job: job.to_string(),
            marker,
            updated_at: Utc::now(),
        };
        self.docs
            .update::<JobCheckpoint, Error, _>(&paths::checkpoint(job), |current| {
                Ok(match current {
                    Some(c) if c.marker == next.marker => Mutation::Unchanged,
                    _ => Mutation::Put(next.clone()),
                })
            })
            .await?;
        Ok(())
    }

    /// Returns the in-flight run of a job, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the run marker cannot be read.
    pub async fn active_run(&self, job: &str) -> Result<Option<ActiveRun>> {
        Ok(self
            .docs
            .load::<ActiveRun>(&paths::active_run(job))
            .await?
            .map(|doc| doc.value))
    }

    /// Fails unless `job` has no run in flight.
    ///
    /// # Errors
    ///
    /// Returns [`Error::JobInProgress`] naming the in-flight run.
    pub async fn ensure_idle(&self, job: &str) -> Result<()> {
        match self.active_run(job).await? {
            Some(run) => Err(Error::JobInProgress {
                job: job.to_string(),
                run_id: run.run_id.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Starts one run of every job bound to `workflow`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WorkflowNotFound`] for an unknown workflow and
    /// [`Error::JobInProgress`] when a bound job is already running; in that
    /// case no run is started.
    #[tracing::instrument(skip(self, run_properties))]
    pub async fn fire_workflow(
        &self,
        workflow: &str,
        run_properties: BTreeMap<String, String>,
    ) -> Result<FireOutcome> {
        let record = self.workflow(workflow).await?;
        if record.trigger == TriggerState::Paused {
            tracing::info!("trigger paused, event skipped");
            return Ok(FireOutcome::Skipped {
                workflow: workflow.to_string(),
            });
        }

        for job in &record.jobs {
            self.ensure_idle(job).await?;
        }

        let mut started: Vec<ActiveRun> = Vec::with_capacity(record.jobs.len());
        for job in &record.jobs {
            let run = ActiveRun {
                job: job.clone(),
                run_id: RunId::generate(),
                workflow: workflow.to_string(),
                run_properties: run_properties.clone(),
                started_at: Utc::now(),
            };
            if self.docs.create(&paths::active_run(job), &run).await?.is_none() {
                // Lost a race with another firing; undo this firing's runs.
                for mine in &started {
                    self.docs.delete(&paths::active_run(&mine.job)).await?;
                }
                let holder = self.active_run(job).await?;
                return Err(Error::JobInProgress {
                    job: job.clone(),
                    run_id: holder.map(|r| r.run_id.to_string()).unwrap_or_default(),
                });
            }
            tracing::info!(job = %job, run_id = %run.run_id, "run started");
            started.push(run);
        }

        Ok(FireOutcome::Started(started))
    }

    /// Starts one run of `workflow` for a batch of records.
    ///
    /// The batch travels as a JSON array in the [`MESSAGES_PROPERTY`] run
    /// property, so a single run processes every record in it.
    ///
    /// # Errors
    ///
    /// As [`fire_workflow`](Self::fire_workflow), plus a serialization error
    /// if the batch cannot be encoded.
    pub async fn fire_batch<T: Serialize + Sync>(
        &self,
        workflow: &str,
        messages: &[T],
    ) -> Result<FireOutcome> {
        let encoded = serde_json::to_string(messages).map_err(|e| {
            lakeshift_core::Error::Serialization {
                message: format!("{MESSAGES_PROPERTY} run property: {e}"),
            }
        })?;
        self.fire_workflow(
            workflow,
            BTreeMap::from([(MESSAGES_PROPERTY.to_string(), encoded)]),
        )
        .await
    }

    /// Records a successful run and advances the job's checkpoint to `marker`.
    ///
    /// Completing an already completed run returns its record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] if `run_id` is neither the
    /// job's in-flight run nor a finished one.
    pub async fn complete_run(&self, job: &str, run_id: RunId, marker: &str) -> Result<RunRecord> {
        self.finish_run(job, run_id, Some(marker.to_string()), None)
            .await
    }

    /// Records a failed run. The checkpoint is left where it was.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] if `run_id` is neither the
    /// job's in-flight run nor a finished one.
    pub async fn fail_run(&self, job: &str, run_id: RunId, detail: &str) -> Result<RunRecord> {
        self.finish_run(job, run_id, None, Some(detail.to_string()))
            .await
    }

    #[tracing::instrument(skip(self, marker, detail))]
    async fn finish_run(
        &self,
        job: &str,
        run_id: RunId,
        marker: Option<String>,
        detail: Option<String>,
    ) -> Result<RunRecord> {
        let history_path = paths::run_history(job, &run_id.to_string());

        let active = match self.active_run(job).await? {
            Some(run) if run.run_id == run_id => run,
            _ => {
                return self
                    .docs
                    .load::<RunRecord>(&history_path)
                    .await?
                    .map(|doc| doc.value)
                    .ok_or_else(|| Error::InvalidStateTransition {
                        from: "idle".into(),
                        to: "finished".into(),
                        reason: format!("run {run_id} of {job} is not in flight"),
                    });
            }
        };

        let record = RunRecord {
            run: active,
            succeeded: marker.is_some(),
            marker,
            detail,
            finished_at: Utc::now(),
        };

        // Checkpoint first: a crash before the marker is cleared leaves the
        // run in flight, and a retry rewrites the same checkpoint.
        if let Some(marker) = &record.marker {
            self.write_checkpoint(
                job,
                CheckpointMarker::Processed {
                    marker: marker.clone(),
                },
            )
            .await?;
        }
        self.docs.create(&history_path, &record).await?;
        self.docs.delete(&paths::active_run(job)).await?;

        tracing::info!(succeeded = record.succeeded, "run finished");
        Ok(record)
    }
}
