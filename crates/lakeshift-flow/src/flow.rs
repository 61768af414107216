//! Schema-change flow records and their state machine.
//!
//! A flow is persisted after every transition. The record alone is enough to
//! resume: it carries the request, the classification, the source and target
//! dataset snapshots taken during classification, and the steps completed so
//! far.
//!
//! ```text
//! Detected -> Classifying -> CompatibleFlow{next}   -> ... -> Completed
//!                        \-> IncompatibleFlow{next} -> ... -> Completed
//!                        \-> AwaitingConfirmation -> (confirm) -> branch
//!                        \-> Completed (no change)
//! any running state -> Failed{step} | Cancelled{at} | Aborted
//! Failed / Cancelled -> re-entry at the recorded step
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lakeshift_catalog::{AppVersion, ChangeKind, DatasetVersion, SchemaChange, SchemaDescription};
use lakeshift_core::FlowId;

use crate::error::{Error, ErrorKind, Result};
use crate::tester::SamplePlan;

/// One checkpointed unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStep {
    /// Obtain the candidate schema and classify the change.
    Classify,
    /// Pause the family's workflow triggers.
    PauseTriggers,
    /// Append the version map entry for the new app version.
    AppendMapping,
    /// Move the current dataset's artifacts into an archive slot.
    ArchiveDataset,
    /// Swap the dataset's published schema.
    PublishSchema,
    /// Reset the ingestion job's checkpoint.
    ResetCheckpoint,
    /// Register the new dataset location with discovery.
    RegisterScope,
    /// Create the new dataset's job and bind it to the workflows.
    CreateJob,
    /// Resume the family's workflow triggers.
    ResumeTriggers,
}

impl FlowStep {
    /// Returns the step's stable name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Classify => "classify",
            Self::PauseTriggers => "pause_triggers",
            Self::AppendMapping => "append_mapping",
            Self::ArchiveDataset => "archive_dataset",
            Self::PublishSchema => "publish_schema",
            Self::ResetCheckpoint => "reset_checkpoint",
            Self::RegisterScope => "register_scope",
            Self::CreateJob => "create_job",
            Self::ResumeTriggers => "resume_triggers",
        }
    }
}

impl fmt::Display for FlowStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Steps of the compatible branch, in order.
pub const COMPATIBLE_STEPS: &[FlowStep] = &[
    FlowStep::PauseTriggers,
    FlowStep::AppendMapping,
    FlowStep::ArchiveDataset,
    FlowStep::PublishSchema,
    FlowStep::ResetCheckpoint,
    FlowStep::ResumeTriggers,
];

/// Steps of the incompatible branch, in order.
pub const INCOMPATIBLE_STEPS: &[FlowStep] = &[
    FlowStep::PauseTriggers,
    FlowStep::AppendMapping,
    FlowStep::RegisterScope,
    FlowStep::CreateJob,
    FlowStep::ResumeTriggers,
];

/// Which procedure a classified flow runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Branch {
    /// Same dataset version, update number bumped.
    Compatible,
    /// New dataset version.
    Incompatible,
}

impl Branch {
    /// Returns the branch's step sequence.
    #[must_use]
    pub const fn steps(self) -> &'static [FlowStep] {
        match self {
            Self::Compatible => COMPATIBLE_STEPS,
            Self::Incompatible => INCOMPATIBLE_STEPS,
        }
    }

    /// Returns the branch's stable name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Compatible => "compatible",
            Self::Incompatible => "incompatible",
        }
    }

    fn state_at(self, next: FlowStep) -> FlowState {
        match self {
            Self::Compatible => FlowState::CompatibleFlow { next },
            Self::Incompatible => FlowState::IncompatibleFlow { next },
        }
    }
}

/// Operator-facing summary of the error that halted a flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowFailure {
    /// Stable error classification.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Whether `resume` may succeed without intervention.
    pub retryable: bool,
}

impl From<&Error> for FlowFailure {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

/// State of a schema-change flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FlowState {
    /// Submitted, not yet classified.
    Detected,
    /// Classification in progress.
    Classifying,
    /// The comparator could not decide; an operator must confirm.
    AwaitingConfirmation {
        /// Fields whose nullability tightened.
        fields: Vec<String>,
    },
    /// Running the compatible branch.
    CompatibleFlow {
        /// Step to run next.
        next: FlowStep,
    },
    /// Running the incompatible branch.
    IncompatibleFlow {
        /// Step to run next.
        next: FlowStep,
    },
    /// All steps done.
    Completed,
    /// Halted at `step`.
    Failed {
        /// The step that failed.
        step: FlowStep,
        /// The first unresolved error.
        error: FlowFailure,
    },
    /// Stopped by an operator before `at`.
    Cancelled {
        /// The step that had not yet run.
        at: FlowStep,
    },
    /// Abandoned by an operator; the family is released.
    Aborted,
}

impl FlowState {
    /// Returns the state's stable name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Detected => "detected",
            Self::Classifying => "classifying",
            Self::AwaitingConfirmation { .. } => "awaiting_confirmation",
            Self::CompatibleFlow { .. } => "compatible_flow",
            Self::IncompatibleFlow { .. } => "incompatible_flow",
            Self::Completed => "completed",
            Self::Failed { .. } => "failed",
            Self::Cancelled { .. } => "cancelled",
            Self::Aborted => "aborted",
        }
    }

    /// Returns true for states no operation leaves.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }

    /// Returns the step the driver runs next, if the flow is runnable.
    #[must_use]
    pub const fn pending_step(&self) -> Option<FlowStep> {
        match self {
            Self::Detected | Self::Classifying => Some(FlowStep::Classify),
            Self::CompatibleFlow { next } | Self::IncompatibleFlow { next } => Some(*next),
            _ => None,
        }
    }

    /// Returns the step an operator cancellation would stop before.
    #[must_use]
    pub const fn cancel_point(&self) -> Option<FlowStep> {
        match self {
            Self::Detected | Self::Classifying | Self::AwaitingConfirmation { .. } => {
                Some(FlowStep::Classify)
            }
            Self::CompatibleFlow { next } | Self::IncompatibleFlow { next } => Some(*next),
            Self::Failed { step, .. } => Some(*step),
            Self::Cancelled { at } => Some(*at),
            Self::Completed | Self::Aborted => None,
        }
    }
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CompatibleFlow { next } | Self::IncompatibleFlow { next } => {
                write!(f, "{}({next})", self.name())
            }
            Self::Failed { step, .. } => write!(f, "failed({step})"),
            Self::Cancelled { at } => write!(f, "cancelled({at})"),
            _ => f.write_str(self.name()),
        }
    }
}

/// Where the candidate schema comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum CandidateSource {
    /// The caller supplies the schema.
    Provided(SchemaDescription),
    /// Discovery proposes a schema for the JSON under `location`.
    Discover {
        /// Location of the new JSON objects.
        location: String,
    },
}

/// A detected schema change submitted for orchestration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaChangeRequest {
    /// Dataset family.
    pub family: String,
    /// First app version emitting the candidate schema.
    pub app_version: AppVersion,
    /// Candidate schema.
    pub candidate: CandidateSource,
    /// The family's current ingestion job.
    pub job: String,
    /// Samples for a compatibility test, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub samples: Option<SamplePlan>,
}

impl SchemaChangeRequest {
    /// Creates a request without samples.
    #[must_use]
    pub fn new(
        family: impl Into<String>,
        app_version: AppVersion,
        candidate: CandidateSource,
        job: impl Into<String>,
    ) -> Self {
        Self {
            family: family.into(),
            app_version,
            candidate,
            job: job.into(),
            samples: None,
        }
    }

    /// Attaches samples for a compatibility test.
    #[must_use]
    pub fn with_samples(mut self, samples: SamplePlan) -> Self {
        self.samples = Some(samples);
        self
    }
}

/// Durable record of one flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowRecord {
    /// Flow id.
    pub flow_id: FlowId,
    /// The submitted request.
    pub request: SchemaChangeRequest,
    /// Current state.
    pub state: FlowState,
    /// Branch, once classified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<Branch>,
    /// The classified change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change: Option<SchemaChange>,
    /// Comparator or confirmed verdict.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ChangeKind>,
    /// Dataset the family was ingesting into when classified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<DatasetVersion>,
    /// Dataset the new app version is mapped to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<DatasetVersion>,
    /// Workflows bound to the family's job when the branch was entered.
    #[serde(default)]
    pub workflows: Vec<String>,
    /// Job created by the incompatible branch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_job: Option<String>,
    /// Archive slot used by the compatible branch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_slot: Option<u32>,
    /// Steps finished, in order.
    #[serde(default)]
    pub completed_steps: Vec<FlowStep>,
    /// Submission time.
    pub created_at: DateTime<Utc>,
    /// Last persisted transition.
    pub updated_at: DateTime<Utc>,
}

impl FlowRecord {
    /// Creates a record in [`FlowState::Detected`].
    #[must_use]
    pub fn new(flow_id: FlowId, request: SchemaChangeRequest) -> Self {
        let now = Utc::now();
        Self {
            flow_id,
            request,
            state: FlowState::Detected,
            branch: None,
            change: None,
            kind: None,
            source: None,
            target: None,
            workflows: Vec::new(),
            new_job: None,
            archive_slot: None,
            completed_steps: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns the family.
    #[must_use]
    pub fn family(&self) -> &str {
        &self.request.family
    }

    /// Moves to `next` if the state machine allows it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] otherwise.
    pub fn transition(&mut self, next: FlowState) -> Result<()> {
        if !self.allows(&next) {
            return Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: next.to_string(),
                reason: self.refusal(),
            });
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    fn allows(&self, next: &FlowState) -> bool {
        use FlowState as S;

        if matches!(next, S::Aborted) {
            return !self.state.is_terminal();
        }
        if matches!(next, S::Failed { .. } | S::Cancelled { .. }) {
            return !self.state.is_terminal() && !matches!(self.state, S::Cancelled { .. });
        }

        match (&self.state, next) {
            (S::Detected, S::Classifying)
            | (S::Classifying, S::AwaitingConfirmation { .. } | S::Completed) => true,
            (S::Classifying | S::AwaitingConfirmation { .. }, S::CompatibleFlow { next }) => {
                self.branch == Some(Branch::Compatible) && COMPATIBLE_STEPS.first() == Some(next)
            }
            (S::Classifying | S::AwaitingConfirmation { .. }, S::IncompatibleFlow { next }) => {
                self.branch == Some(Branch::Incompatible)
                    && INCOMPATIBLE_STEPS.first() == Some(next)
            }
            (S::CompatibleFlow { next: from }, S::CompatibleFlow { next: to }) => {
                follows(COMPATIBLE_STEPS, *from, *to)
            }
            (S::IncompatibleFlow { next: from }, S::IncompatibleFlow { next: to }) => {
                follows(INCOMPATIBLE_STEPS, *from, *to)
            }
            (S::CompatibleFlow { next } | S::IncompatibleFlow { next }, S::Completed) => {
                Some(*next) == self.branch.and_then(|b| b.steps().last().copied())
            }
            (S::Failed { step, .. }, to) | (S::Cancelled { at: step }, to) => {
                *to == self.entering(*step)
            }
            _ => false,
        }
    }

    fn refusal(&self) -> String {
        match &self.state {
            FlowState::Completed | FlowState::Aborted => "flow is terminal".into(),
            FlowState::AwaitingConfirmation { .. } => "flow awaits operator confirmation".into(),
            _ => "transition not allowed from the current state".into(),
        }
    }

    /// Returns the running state that re-enters the flow at `step`.
    #[must_use]
    pub fn entering(&self, step: FlowStep) -> FlowState {
        match (step, self.branch) {
            (FlowStep::Classify, _) | (_, None) => FlowState::Classifying,
            (step, Some(branch)) => branch.state_at(step),
        }
    }

    /// Records the branch verdict and moves to its first step.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] when the flow is not
    /// classifying or awaiting confirmation, or when `kind` is
    /// [`ChangeKind::NoChange`].
    pub fn enter_branch(&mut self, kind: ChangeKind) -> Result<()> {
        let branch = match kind {
            ChangeKind::Compatible => Branch::Compatible,
            ChangeKind::Incompatible => Branch::Incompatible,
            ChangeKind::NoChange => {
                return Err(Error::InvalidStateTransition {
                    from: self.state.to_string(),
                    to: "no_change".into(),
                    reason: "a branch needs a compatible or incompatible verdict".into(),
                });
            }
        };
        let mut change = self.change.clone();
        if let Some(change) = change.as_mut() {
            change.finalize(kind.into())?;
        }
        let previous = self.branch.replace(branch);
        let first = branch.steps()[0];
        if let Err(err) = self.transition(branch.state_at(first)) {
            self.branch = previous;
            return Err(err);
        }
        self.change = change;
        self.kind = Some(kind);
        if !self.completed_steps.contains(&FlowStep::Classify) {
            self.completed_steps.push(FlowStep::Classify);
        }
        Ok(())
    }

    /// Marks `step` done and advances to the branch's next step or
    /// [`FlowState::Completed`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] when `step` is not the
    /// pending step.
    pub fn complete_step(&mut self, step: FlowStep) -> Result<()> {
        if self.state.pending_step() != Some(step) {
            return Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: format!("{step} completed"),
                reason: "step is not pending".into(),
            });
        }
        let next = self.branch.and_then(|branch| {
            let steps = branch.steps();
            let idx = steps.iter().position(|s| *s == step)?;
            steps.get(idx + 1).map(|s| branch.state_at(*s))
        });
        self.transition(next.unwrap_or(FlowState::Completed))?;
        if !self.completed_steps.contains(&step) {
            self.completed_steps.push(step);
        }
        Ok(())
    }

    /// Halts the flow at `step` with `err`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] when the flow is terminal.
    pub fn fail(&mut self, step: FlowStep, err: &Error) -> Result<()> {
        self.transition(FlowState::Failed {
            step,
            error: FlowFailure::from(err),
        })
    }

    /// Returns the operator-facing summary.
    #[must_use]
    pub fn report(&self) -> FlowReport {
        FlowReport {
            flow_id: self.flow_id,
            family: self.request.family.clone(),
            state: self.state.clone(),
            branch: self.branch,
            kind: self.kind,
            last_completed_step: self.completed_steps.last().copied(),
            completed_steps: self.completed_steps.clone(),
            error: match &self.state {
                FlowState::Failed { error, .. } => Some(error.clone()),
                _ => None,
            },
            source: self.source.as_ref().map(DatasetVersion::name),
            target: self.target.as_ref().map(DatasetVersion::name),
            new_job: self.new_job.clone(),
        }
    }
}

fn follows(steps: &[FlowStep], from: FlowStep, to: FlowStep) -> bool {
    steps.windows(2).any(|w| w[0] == from && w[1] == to)
}

/// What an operator sees about a flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowReport {
    /// Flow id.
    pub flow_id: FlowId,
    /// Dataset family.
    pub family: String,
    /// Current state.
    pub state: FlowState,
    /// Branch, once classified.
    pub branch: Option<Branch>,
    /// Verdict, once classified.
    pub kind: Option<ChangeKind>,
    /// The last step finished.
    pub last_completed_step: Option<FlowStep>,
    /// Every step finished, in order.
    pub completed_steps: Vec<FlowStep>,
    /// The first unresolved error, while failed.
    pub error: Option<FlowFailure>,
    /// Source dataset name, e.g. `weather_v1`.
    pub source: Option<String>,
    /// Target dataset name.
    pub target: Option<String>,
    /// Job created by the incompatible branch.
    pub new_job: Option<String>,
}
