//! Custom assertion helpers for integration tests.

use lakeshift_flow::{Branch, ErrorKind, FlowReport, FlowState, FlowStep};

use crate::storage::{StorageOp, TracingMemoryBackend};

/// Asserts that a flow completed and ran every step of `branch`.
///
/// # Panics
///
/// Panics if the flow is not completed or skipped or repeated a step.
pub fn assert_completed(report: &FlowReport, branch: Branch) {
    assert_eq!(
        report.state,
        FlowState::Completed,
        "Expected flow to complete, but state was {:?} (error: {:?})",
        report.state,
        report.error
    );
    assert_eq!(report.branch, Some(branch));
    assert_eq!(
        report.completed_steps.first(),
        Some(&FlowStep::Classify),
        "Expected classification to be the first completed step"
    );
    assert_eq!(
        &report.completed_steps[1..],
        branch.steps(),
        "Expected every {} step exactly once, in order",
        branch.as_str()
    );
    assert!(report.error.is_none());
}

/// Asserts that a flow halted at `step` with an error of `kind`.
///
/// # Panics
///
/// Panics if the flow is not failed at `step` or the error kind differs.
pub fn assert_failed_at(report: &FlowReport, step: FlowStep, kind: ErrorKind) {
    match &report.state {
        FlowState::Failed { step: failed, error } => {
            assert_eq!(*failed, step, "Expected failure at {step}, got {failed}");
            assert_eq!(error.kind, kind, "Unexpected error: {}", error.message);
        }
        other => panic!("Expected flow to fail at {step}, but state was {other:?}"),
    }
    assert_eq!(
        report.error.as_ref().map(|e| e.kind),
        Some(kind),
        "Report should surface the step error"
    );
}

/// Asserts that a flow was cancelled before `step`.
///
/// # Panics
///
/// Panics if the flow is not cancelled at `step`.
pub fn assert_cancelled_at(report: &FlowReport, step: FlowStep) {
    assert_eq!(
        report.state,
        FlowState::Cancelled { at: step },
        "Expected flow to be cancelled before {step}"
    );
}

/// Asserts that a flow parked for operator confirmation of `fields`.
///
/// # Panics
///
/// Panics if the flow is not awaiting confirmation.
pub fn assert_awaiting_confirmation(report: &FlowReport, fields: &[&str]) {
    match &report.state {
        FlowState::AwaitingConfirmation { fields: actual } => {
            assert_eq!(actual, fields, "Unexpected ambiguous fields");
        }
        other => panic!("Expected flow to await confirmation, but state was {other:?}"),
    }
    assert_eq!(report.completed_steps, Vec::<FlowStep>::new());
    assert!(report.branch.is_none());
}

/// Asserts that nothing remains under `prefix`.
///
/// # Panics
///
/// Panics if any object is stored under `prefix`.
pub async fn assert_prefix_empty(storage: &TracingMemoryBackend, prefix: &str) {
    let leftovers = storage.paths_under(prefix).await;
    assert!(
        leftovers.is_empty(),
        "Expected no objects under {prefix}, found {leftovers:?}"
    );
}

/// Asserts that no write under `prefix` was attempted.
///
/// # Panics
///
/// Panics if a put under `prefix` was recorded.
pub fn assert_no_writes_under(ops: &[StorageOp], prefix: &str) {
    let writes: Vec<&StorageOp> = ops
        .iter()
        .filter(|op| matches!(op, StorageOp::Put { path, .. } if path.starts_with(prefix)))
        .collect();
    assert!(
        writes.is_empty(),
        "Expected no writes under {prefix}, found {writes:?}"
    );
}
