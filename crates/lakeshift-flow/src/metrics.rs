//! Observability metrics for schema-change flows.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `lakeshift_flow_transitions_total` | Counter | `from_state`, `to_state` | State transitions |
//! | `lakeshift_flow_step_duration_seconds` | Histogram | `step` | Step execution time |
//! | `lakeshift_flows_total` | Counter | `branch`, `outcome` | Flows reaching a resting state |
//! | `lakeshift_compatibility_tests_total` | Counter | `verdict` | Compatibility test verdicts |
//! | `lakeshift_lock_contention_total` | Counter | - | Submissions rejected by a held lock |
//!
//! Recording is a no-op until the host installs a `metrics` recorder.

use std::time::{Duration, Instant};

use metrics::{counter, describe_counter, describe_histogram, histogram};

use crate::tester::{FailReason, TestVerdict};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: flow state transitions.
    pub const TRANSITIONS_TOTAL: &str = "lakeshift_flow_transitions_total";
    /// Histogram: step execution duration in seconds.
    pub const STEP_DURATION_SECONDS: &str = "lakeshift_flow_step_duration_seconds";
    /// Counter: flows reaching a resting state.
    pub const FLOWS_TOTAL: &str = "lakeshift_flows_total";
    /// Counter: compatibility test verdicts.
    pub const COMPATIBILITY_TESTS_TOTAL: &str = "lakeshift_compatibility_tests_total";
    /// Counter: submissions rejected because the family lock was held.
    pub const LOCK_CONTENTION_TOTAL: &str = "lakeshift_lock_contention_total";
}

/// Label keys used across metrics.
pub mod labels {
    /// Previous flow state.
    pub const FROM_STATE: &str = "from_state";
    /// Target flow state.
    pub const TO_STATE: &str = "to_state";
    /// Flow step name.
    pub const STEP: &str = "step";
    /// Flow branch (compatible, incompatible, none).
    pub const BRANCH: &str = "branch";
    /// Resting-state outcome (completed, failed, awaiting, cancelled, aborted).
    pub const OUTCOME: &str = "outcome";
    /// Test verdict (pass, timeout, transform, incomplete, empty).
    pub const VERDICT: &str = "verdict";
}

/// Registers all flow metric descriptions.
///
/// Call this once at application startup after initializing the metrics recorder.
pub fn register_metrics() {
    describe_counter!(names::TRANSITIONS_TOTAL, "Schema-change flow state transitions");
    describe_histogram!(names::STEP_DURATION_SECONDS, "Flow step execution time in seconds");
    describe_counter!(names::FLOWS_TOTAL, "Flows reaching a resting state");
    describe_counter!(names::COMPATIBILITY_TESTS_TOTAL, "Compatibility test verdicts");
    describe_counter!(names::LOCK_CONTENTION_TOTAL, "Submissions rejected by a held family lock");
}

/// High-level interface for recording flow metrics.
#[derive(Debug, Clone, Default)]
pub struct FlowMetrics {
    _private: (),
}

impl FlowMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a flow state transition.
    pub fn record_transition(&self, from_state: &str, to_state: &str) {
        counter!(
            names::TRANSITIONS_TOTAL,
            labels::FROM_STATE => from_state.to_string(),
            labels::TO_STATE => to_state.to_string(),
        )
        .increment(1);
    }

    /// Records how long a step took, successful or not.
    pub fn observe_step_duration(&self, step: &str, duration: Duration) {
        histogram!(
            names::STEP_DURATION_SECONDS,
            labels::STEP => step.to_string(),
        )
        .record(duration.as_secs_f64());
    }

    /// Records a flow that stopped driving.
    pub fn record_flow_outcome(&self, branch: &str, outcome: &'static str) {
        counter!(
            names::FLOWS_TOTAL,
            labels::BRANCH => branch.to_string(),
            labels::OUTCOME => outcome,
        )
        .increment(1);
    }

    /// Records a compatibility test verdict.
    pub fn record_compatibility_test(&self, verdict: &TestVerdict) {
        let label = match verdict {
            TestVerdict::Pass => "pass",
            TestVerdict::Fail(FailReason::Timeout) => "timeout",
            TestVerdict::Fail(FailReason::Transform { .. }) => "transform",
            TestVerdict::Fail(FailReason::IncompleteOutput { .. }) => "incomplete",
            TestVerdict::Fail(FailReason::EmptyOutput { .. }) => "empty",
        };
        counter!(names::COMPATIBILITY_TESTS_TOTAL, labels::VERDICT => label).increment(1);
    }

    /// Records a submission rejected by a held lock.
    pub fn record_lock_contention(&self) {
        counter!(names::LOCK_CONTENTION_TOTAL).increment(1);
    }
}

/// A guard that records elapsed time when dropped.
pub struct TimingGuard<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    /// Creates a new timing guard that will call `on_drop` with the elapsed duration.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Returns the elapsed time since the guard was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl<F> Drop for TimingGuard<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn recording_without_recorder_is_noop() {
        register_metrics();
        let metrics = FlowMetrics::new();
        metrics.record_transition("detected", "classifying");
        metrics.observe_step_duration("archive_dataset", Duration::from_millis(3));
        metrics.record_flow_outcome("compatible", "completed");
        metrics.record_compatibility_test(&TestVerdict::Fail(FailReason::Timeout));
        metrics.record_lock_contention();
    }

    #[test]
    fn timing_guard_fires_on_drop() {
        let fired = Arc::new(AtomicBool::new(false));
        {
            let fired = fired.clone();
            let _guard = TimingGuard::new(move |_| fired.store(true, Ordering::SeqCst));
        }
        assert!(fired.load(Ordering::SeqCst));
    }
}
