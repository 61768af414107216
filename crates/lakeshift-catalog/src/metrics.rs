//! Catalog metrics.
//!
//! Counters for classification verdicts, version map appends, and archive
//! moves, plus the newest mapped dataset version per family. Recording is a
//! no-op until the host installs a `metrics` recorder.

use metrics::{counter, describe_counter, describe_gauge, gauge};

use crate::schema::ChangeKind;

// ============================================================================
// Metric Names
// ============================================================================

/// Comparator verdicts, labelled by kind.
pub const CLASSIFICATIONS: &str = "lakeshift_classifications_total";

/// Version map entries appended, labelled by family.
pub const MAP_APPENDS: &str = "lakeshift_version_map_appends_total";

/// Dataset version of the newest version map entry, labelled by family.
pub const MAPPED_DATASET_VERSION: &str = "lakeshift_mapped_dataset_version";

/// Artifacts relocated into archive slots, labelled by family.
pub const ARTIFACTS_MOVED: &str = "lakeshift_archive_artifacts_moved_total";

/// Archive operations, labelled by outcome.
pub const ARCHIVE_OPERATIONS: &str = "lakeshift_archive_operations_total";

/// Document updates that ran out of CAS attempts.
pub const CAS_EXHAUSTED: &str = "lakeshift_cas_exhausted_total";

// ============================================================================
// Metric Registration
// ============================================================================

/// Registers all catalog metric descriptions.
///
/// Call this once at application startup after initializing the metrics recorder.
pub fn register_metrics() {
    describe_counter!(CLASSIFICATIONS, "Schema comparator verdicts by kind");
    describe_counter!(MAP_APPENDS, "Version map entries appended");
    describe_gauge!(MAPPED_DATASET_VERSION, "Dataset version of the newest mapping");
    describe_counter!(ARTIFACTS_MOVED, "Dataset artifacts moved into the archive");
    describe_counter!(ARCHIVE_OPERATIONS, "Archive operations by outcome");
    describe_counter!(CAS_EXHAUSTED, "Document updates that exhausted CAS retries");
}

// ============================================================================
// Recording
// ============================================================================

/// Records a comparator verdict.
pub fn record_classification(kind: ChangeKind) {
    counter!(CLASSIFICATIONS, "kind" => kind.to_string()).increment(1);
}

/// Records an appended version map entry pointing at `dataset_version`.
pub fn record_map_append(family: &str, dataset_version: u32) {
    counter!(MAP_APPENDS, "family" => family.to_string()).increment(1);
    gauge!(MAPPED_DATASET_VERSION, "family" => family.to_string()).set(f64::from(dataset_version));
}

/// Records one relocated artifact.
pub fn record_artifact_moved(family: &str) {
    counter!(ARTIFACTS_MOVED, "family" => family.to_string()).increment(1);
}

/// Records the outcome of an archive operation.
pub fn record_archive_outcome(outcome: &'static str) {
    counter!(ARCHIVE_OPERATIONS, "outcome" => outcome).increment(1);
}

/// Records CAS exhaustion.
pub fn record_cas_exhausted() {
    counter!(CAS_EXHAUSTED).increment(1);
}
