//! Typed path helpers for orchestrator state.
//!
//! All durable state lives under the `state/` prefix of the backing store,
//! separate from dataset artifacts. Numeric components are zero-padded so a
//! lexicographic listing returns them in numeric order.
//!
//! ```text
//! state/
//!   locks/families/{family}.lock.json
//!   version_maps/{family}.json
//!   datasets/{family}/{version}.json
//!   archive/records/{family}/{version}/{slot}.json
//!   archive/intents/{family}/{version}/{slot}.json
//!   jobs/{job}.json
//!   workflows/{workflow}.json
//!   checkpoints/{job}.json
//!   runs/active/{job}.json
//!   runs/history/{job}/{run}.json
//!   flows/{flow}.json
//!   flows/{flow}.cancel.json
//!   flows/by-family/{family}.json
//!   ingest/invalid/{record}.json
//! ```

use crate::error::{Error, Result};

/// Root prefix for all orchestrator state.
pub const STATE_ROOT: &str = "state";

/// Validates a caller-supplied name used as a single path segment.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] if `value` is empty, contains a path
/// separator or a `..` component, or has surrounding whitespace.
pub fn validate_segment(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidInput(format!("{kind} must not be empty")));
    }
    if value.contains('/') || value.contains('\\') {
        return Err(Error::InvalidInput(format!(
            "{kind} '{value}' must not contain path separators"
        )));
    }
    if value == "." || value == ".." {
        return Err(Error::InvalidInput(format!("{kind} '{value}' is reserved")));
    }
    if value.trim() != value {
        return Err(Error::InvalidInput(format!(
            "{kind} '{value}' has surrounding whitespace"
        )));
    }
    Ok(())
}

/// Ensures a prefix ends with exactly one `/`.
#[must_use]
pub fn as_prefix(location: &str) -> String {
    format!("{}/", location.trim_end_matches('/'))
}

/// Lock file guarding schema changes of a family.
#[must_use]
pub fn family_lock(family: &str) -> String {
    format!("{STATE_ROOT}/locks/families/{family}.lock.json")
}

/// Version map document of a family.
#[must_use]
pub fn version_map(family: &str) -> String {
    format!("{STATE_ROOT}/version_maps/{family}.json")
}

/// Registry record of one dataset version.
#[must_use]
pub fn dataset_record(family: &str, version: u32) -> String {
    format!("{STATE_ROOT}/datasets/{family}/{version:010}.json")
}

/// Prefix holding all dataset records of a family.
#[must_use]
pub fn dataset_records_prefix(family: &str) -> String {
    format!("{STATE_ROOT}/datasets/{family}/")
}

/// Write-once archive record for a slot.
#[must_use]
pub fn archive_record(family: &str, version: u32, slot: u32) -> String {
    format!("{STATE_ROOT}/archive/records/{family}/{version:010}/{slot:010}.json")
}

/// Prefix holding the archive records of one dataset version.
#[must_use]
pub fn archive_records_prefix(family: &str, version: u32) -> String {
    format!("{STATE_ROOT}/archive/records/{family}/{version:010}/")
}

/// Durable intent written before artifacts are moved into a slot.
#[must_use]
pub fn archive_intent(family: &str, version: u32, slot: u32) -> String {
    format!("{STATE_ROOT}/archive/intents/{family}/{version:010}/{slot:010}.json")
}

/// Prefix holding the archive intents of one dataset version.
#[must_use]
pub fn archive_intents_prefix(family: &str, version: u32) -> String {
    format!("{STATE_ROOT}/archive/intents/{family}/{version:010}/")
}

/// Job definition record.
#[must_use]
pub fn job(name: &str) -> String {
    format!("{STATE_ROOT}/jobs/{name}.json")
}

/// Workflow record holding its trigger state and bound jobs.
#[must_use]
pub fn workflow(id: &str) -> String {
    format!("{STATE_ROOT}/workflows/{id}.json")
}

/// Prefix holding all workflow records.
#[must_use]
pub fn workflows_prefix() -> String {
    format!("{STATE_ROOT}/workflows/")
}

/// Checkpoint of a job.
#[must_use]
pub fn checkpoint(job: &str) -> String {
    format!("{STATE_ROOT}/checkpoints/{job}.json")
}

/// Marker present while a run of `job` is in flight.
#[must_use]
pub fn active_run(job: &str) -> String {
    format!("{STATE_ROOT}/runs/active/{job}.json")
}

/// Completed run record.
#[must_use]
pub fn run_history(job: &str, run: &str) -> String {
    format!("{STATE_ROOT}/runs/history/{job}/{run}.json")
}

/// Flow record.
#[must_use]
pub fn flow(id: &str) -> String {
    format!("{STATE_ROOT}/flows/{id}.json")
}

/// Cancellation marker for a flow.
#[must_use]
pub fn flow_cancel(id: &str) -> String {
    format!("{STATE_ROOT}/flows/{id}.cancel.json")
}

/// Pointer from a family to its unfinished flow.
#[must_use]
pub fn family_flow(family: &str) -> String {
    format!("{STATE_ROOT}/flows/by-family/{family}.json")
}

/// A raw record rejected at ingest.
#[must_use]
pub fn invalid_record(record: &str) -> String {
    format!("{STATE_ROOT}/ingest/invalid/{record}.json")
}

/// Prefix of all rejected raw records.
#[must_use]
pub fn invalid_records_prefix() -> String {
    format!("{STATE_ROOT}/ingest/invalid/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segments_reject_traversal() {
        assert!(validate_segment("family", "weather").is_ok());
        assert!(validate_segment("family", "").is_err());
        assert!(validate_segment("family", "a/b").is_err());
        assert!(validate_segment("family", "..").is_err());
        assert!(validate_segment("family", " weather").is_err());
    }

    #[test]
    fn numeric_components_sort_lexicographically() {
        let a = archive_record("weather", 2, 9);
        let b = archive_record("weather", 2, 10);
        assert!(a < b);
        assert!(a.starts_with(&archive_records_prefix("weather", 2)));
    }

    #[test]
    fn prefixes_have_single_trailing_slash() {
        assert_eq!(as_prefix("datasets/weather_v1"), "datasets/weather_v1/");
        assert_eq!(as_prefix("datasets/weather_v1//"), "datasets/weather_v1/");
    }

    #[test]
    fn cancel_marker_is_not_a_flow_record() {
        assert_ne!(flow("01J"), flow_cancel("01J"));
        assert!(!family_flow("weather").ends_with(".cancel.json"));
    }
}
