//! Error types for lakeshift-catalog operations.

use thiserror::Error;

/// Result type alias for catalog operations.
pub type Result<T> = std::result::Result<T, CatalogError>;

/// Errors that can occur during catalog operations.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// The comparator cannot decide between compatible and incompatible.
    #[error("classification of {family} is ambiguous for fields {fields:?}")]
    ClassificationAmbiguous {
        /// Dataset family of the compared schemas.
        family: String,
        /// Field paths whose change has no decided verdict.
        fields: Vec<String>,
    },

    /// The app version precedes every mapping of the family.
    #[error("app version {app_version} of {family} is not mapped (earliest: {earliest:?})")]
    UnmappedAppVersion {
        /// Dataset family.
        family: String,
        /// The app version that was resolved.
        app_version: String,
        /// Earliest mapped app version, if the family has any entries.
        earliest: Option<String>,
    },

    /// An append would not extend the family's mapping strictly upward.
    #[error("mapping for {family} at {app_version} overlaps existing maximum {current_max}")]
    OverlapViolation {
        /// Dataset family.
        family: String,
        /// App version of the rejected entry.
        app_version: String,
        /// Greatest app version already mapped.
        current_max: String,
    },

    /// The archive slot already holds data that is not ours.
    #[error("archive slot {slot} is occupied: {message}")]
    ArchiveCollision {
        /// Archive location of the slot.
        slot: String,
        /// What was found in the slot.
        message: String,
    },

    /// Relocating artifacts stopped part way; re-invoking resumes the move.
    #[error("archive move into {slot} interrupted after {moved} of {total} artifacts: {message}")]
    PartialMoveFailure {
        /// Archive location of the slot.
        slot: String,
        /// Artifacts relocated before the failure.
        moved: usize,
        /// Total artifacts in the move.
        total: usize,
        /// Underlying failure.
        message: String,
    },

    /// An artifact recorded for archival exists at neither source nor destination.
    #[error("artifact missing: {path}")]
    ArtifactMissing {
        /// Source path of the artifact.
        path: String,
    },

    /// The dataset version is not registered.
    #[error("dataset not found: {family} v{version}")]
    DatasetNotFound {
        /// Dataset family.
        family: String,
        /// Dataset version.
        version: u32,
    },

    /// A different dataset is already registered under the same version.
    #[error("dataset {family} v{version} is already registered with different contents")]
    DatasetConflict {
        /// Dataset family.
        family: String,
        /// Dataset version.
        version: u32,
    },

    /// A schema publish raced with another publisher.
    #[error("publish of {family} v{version} expected update {expected}, found {found}")]
    StalePublish {
        /// Dataset family.
        family: String,
        /// Dataset version.
        version: u32,
        /// Update number the publisher started from.
        expected: u32,
        /// Update number currently stored.
        found: u32,
    },

    /// A schema description is malformed.
    #[error("invalid schema: {message}")]
    InvalidSchema {
        /// What is wrong with the schema.
        message: String,
    },

    /// An app version string could not be parsed.
    #[error("invalid app version '{value}': {message}")]
    InvalidAppVersion {
        /// The rejected input.
        value: String,
        /// Why it was rejected.
        message: String,
    },

    /// Compare-and-swap retries were exhausted under contention.
    #[error("CAS exhausted: {message}")]
    CasExhausted {
        /// Description of the contended document.
        message: String,
    },

    /// Core storage or serialization error.
    #[error(transparent)]
    Core(#[from] lakeshift_core::Error),
}

impl CatalogError {
    /// Returns true when re-invoking the failed operation may succeed without
    /// operator intervention.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::PartialMoveFailure { .. } | Self::CasExhausted { .. } => true,
            Self::Core(inner) => inner.is_transient(),
            _ => false,
        }
    }

    /// Converts CAS exhaustion reported by the document store into
    /// [`CatalogError::CasExhausted`].
    pub(crate) fn from_cas(err: Self) -> Self {
        match err {
            Self::Core(lakeshift_core::Error::PreconditionFailed { message }) => {
                crate::metrics::record_cas_exhausted();
                Self::CasExhausted { message }
            }
            other => other,
        }
    }
}
