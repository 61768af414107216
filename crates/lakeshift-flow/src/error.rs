//! Error types for the orchestration domain.
//!
//! Every error maps to a stable [`ErrorKind`]. Flow records persist the kind
//! and the retryable flag rather than the error value, so an operator reading
//! a report sees the same classification a process restart would.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use lakeshift_catalog::CatalogError;
use lakeshift_core::FlowId;

/// The result type used throughout lakeshift-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in orchestration operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A job with the same name exists and was not created by this flow.
    #[error("job already exists: {job}")]
    JobAlreadyExists {
        /// The colliding job name.
        job: String,
    },

    /// The job is not registered.
    #[error("job not found: {job}")]
    JobNotFound {
        /// The missing job name.
        job: String,
    },

    /// A run of the job is in flight.
    #[error("job {job} has run {run_id} in progress")]
    JobInProgress {
        /// The busy job.
        job: String,
        /// The in-flight run.
        run_id: String,
    },

    /// The workflow is not registered.
    #[error("workflow not found: {workflow}")]
    WorkflowNotFound {
        /// The missing workflow id.
        workflow: String,
    },

    /// Another process holds the family lock.
    #[error("family {family} is locked by {holder}")]
    LockBusy {
        /// The locked family.
        family: String,
        /// Holder id of the current lock owner.
        holder: String,
    },

    /// An external call did not finish in time.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// What was being waited for.
        operation: String,
        /// The bound that was exceeded.
        after: Duration,
    },

    /// An external collaborator failed.
    #[error("{service} failed: {message}")]
    ExternalServiceFailure {
        /// The collaborator (transform runner, discovery).
        service: String,
        /// The collaborator's failure detail.
        message: String,
    },

    /// The family has no registered dataset lineage.
    #[error("family not registered: {family}")]
    FamilyNotFound {
        /// The unknown family.
        family: String,
    },

    /// The flow record does not exist.
    #[error("flow not found: {flow_id}")]
    FlowNotFound {
        /// The missing flow.
        flow_id: FlowId,
    },

    /// The family already has an unfinished flow.
    #[error("family {family} has unfinished flow {flow_id}")]
    FlowPending {
        /// The family.
        family: String,
        /// The unfinished flow.
        flow_id: FlowId,
    },

    /// An invalid state transition was attempted.
    #[error("invalid state transition: {from} -> {to} ({reason})")]
    InvalidStateTransition {
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
        /// The reason the transition is invalid.
        reason: String,
    },

    /// Configuration could not be loaded or validated.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// An error from lakeshift-catalog.
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// An error from lakeshift-core.
    #[error("core error: {0}")]
    Core(#[from] lakeshift_core::Error),
}

impl Error {
    /// Creates a collaborator failure.
    #[must_use]
    pub fn external(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ExternalServiceFailure {
            service: service.into(),
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Returns the stable classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::JobAlreadyExists { .. } => ErrorKind::JobAlreadyExists,
            Self::JobNotFound { .. } => ErrorKind::JobNotFound,
            Self::JobInProgress { .. } => ErrorKind::JobInProgress,
            Self::WorkflowNotFound { .. } => ErrorKind::WorkflowNotFound,
            Self::LockBusy { .. } => ErrorKind::LockBusy,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::ExternalServiceFailure { .. } => ErrorKind::ExternalServiceFailure,
            Self::FamilyNotFound { .. } => ErrorKind::FamilyNotFound,
            Self::FlowNotFound { .. } => ErrorKind::FlowNotFound,
            Self::FlowPending { .. } => ErrorKind::FlowPending,
            Self::InvalidStateTransition { .. } => ErrorKind::InvalidStateTransition,
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::Catalog(inner) => catalog_kind(inner),
            Self::Core(inner) => core_kind(inner),
        }
    }

    /// Returns true when re-invoking the failed operation may succeed without
    /// operator intervention.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

fn catalog_kind(err: &CatalogError) -> ErrorKind {
    match err {
        CatalogError::ClassificationAmbiguous { .. } => ErrorKind::ClassificationAmbiguous,
        CatalogError::UnmappedAppVersion { .. } => ErrorKind::UnmappedAppVersion,
        CatalogError::OverlapViolation { .. } => ErrorKind::OverlapViolation,
        CatalogError::ArchiveCollision { .. } => ErrorKind::ArchiveCollision,
        CatalogError::PartialMoveFailure { .. } => ErrorKind::PartialMoveFailure,
        CatalogError::ArtifactMissing { .. } => ErrorKind::ArtifactMissing,
        CatalogError::DatasetNotFound { .. } => ErrorKind::DatasetNotFound,
        CatalogError::DatasetConflict { .. } | CatalogError::StalePublish { .. } => {
            ErrorKind::DatasetConflict
        }
        CatalogError::InvalidSchema { .. } | CatalogError::InvalidAppVersion { .. } => {
            ErrorKind::InvalidInput
        }
        CatalogError::CasExhausted { .. } => ErrorKind::Contention,
        CatalogError::Core(inner) => core_kind(inner),
    }
}

fn core_kind(err: &lakeshift_core::Error) -> ErrorKind {
    use lakeshift_core::Error as Core;
    match err {
        Core::Storage { .. } => ErrorKind::Storage,
        Core::PreconditionFailed { .. } => ErrorKind::Contention,
        Core::InvalidId { .. } | Core::InvalidInput(_) => ErrorKind::InvalidInput,
        Core::Configuration { .. } => ErrorKind::Configuration,
        Core::NotFound(_) | Core::Serialization { .. } | Core::Internal { .. } => {
            ErrorKind::Internal
        }
    }
}

/// Stable, serializable error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The comparator could not decide.
    ClassificationAmbiguous,
    /// An app version precedes every mapping.
    UnmappedAppVersion,
    /// A mapping append would overlap existing entries.
    OverlapViolation,
    /// An archive slot holds foreign data.
    ArchiveCollision,
    /// An archive move was interrupted.
    PartialMoveFailure,
    /// A planned archive artifact vanished.
    ArtifactMissing,
    /// A dataset version is not registered.
    DatasetNotFound,
    /// A dataset record conflicts with the flow's snapshot.
    DatasetConflict,
    /// A job name collides with a foreign job.
    JobAlreadyExists,
    /// A job is not registered.
    JobNotFound,
    /// A job run is in flight.
    JobInProgress,
    /// A workflow is not registered.
    WorkflowNotFound,
    /// The family lock is held elsewhere.
    LockBusy,
    /// An external call exceeded its bound.
    Timeout,
    /// An external collaborator failed.
    ExternalServiceFailure,
    /// The family has no lineage.
    FamilyNotFound,
    /// The flow does not exist.
    FlowNotFound,
    /// The family has an unfinished flow.
    FlowPending,
    /// The requested transition is not allowed.
    InvalidStateTransition,
    /// Configuration is invalid.
    Configuration,
    /// Caller input is malformed.
    InvalidInput,
    /// Concurrent writers exhausted CAS retries.
    Contention,
    /// Object storage failed.
    Storage,
    /// Unexpected internal state.
    Internal,
}

impl ErrorKind {
    /// Returns true for failures that a plain retry can resolve.
    ///
    /// Collisions, overlaps, and name clashes need an operator to inspect
    /// durable state first.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::PartialMoveFailure
                | Self::ExternalServiceFailure
                | Self::Timeout
                | Self::JobInProgress
                | Self::LockBusy
                | Self::Contention
                | Self::Storage
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        let retryable = Error::Catalog(CatalogError::PartialMoveFailure {
            slot: "archive/weather_1_1/".into(),
            moved: 0,
            total: 2,
            message: "io".into(),
        });
        assert_eq!(retryable.kind(), ErrorKind::PartialMoveFailure);
        assert!(retryable.is_retryable());

        assert!(Error::external("transform", "crashed").is_retryable());
        assert!(Error::Core(lakeshift_core::Error::storage("503")).is_retryable());
    }

    #[test]
    fn inspection_kinds() {
        for err in [
            Error::JobAlreadyExists { job: "j".into() },
            Error::Catalog(CatalogError::OverlapViolation {
                family: "weather".into(),
                app_version: "1".into(),
                current_max: "2".into(),
            }),
            Error::Catalog(CatalogError::ArchiveCollision {
                slot: "s".into(),
                message: "m".into(),
            }),
        ] {
            assert!(!err.is_retryable(), "{err} must need inspection");
        }
    }

    #[test]
    fn nested_core_errors_classify_through_catalog() {
        let err = Error::Catalog(CatalogError::Core(lakeshift_core::Error::storage("down")));
        assert_eq!(err.kind(), ErrorKind::Storage);
    }

    #[test]
    fn state_transition_error_display() {
        let err = Error::InvalidStateTransition {
            from: "completed".into(),
            to: "compatible_flow".into(),
            reason: "flow is terminal".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("completed"));
        assert!(msg.contains("flow is terminal"));
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::PartialMoveFailure).expect("serialize");
        assert_eq!(json, "\"partial_move_failure\"");
    }
}
