//! Crash re-entry: a flow interrupted at any persisted transition converges
//! to the same end state as an uninterrupted run, with no duplicated mapping
//! entries, archive moves, or jobs.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::BTreeSet;

use lakeshift_catalog::SchemaDescription;
use lakeshift_flow::{CheckpointMarker, FlowReport, FlowState, Result, TriggerState};
use lakeshift_test_utils::{
    FAMILY, JOB, TestContext, WORKFLOW, assert_prefix_empty, compatible_candidate,
    incompatible_candidate,
};

const FLOW_STATE: &str = "state/flows/";

/// Counts the flow-state writes of an uninterrupted run.
async fn baseline_writes(candidate: &SchemaDescription) -> usize {
    let ctx = TestContext::registered().await;
    ctx.storage.clear_operations();
    let report = ctx
        .orchestrator
        .submit(ctx.request(candidate.clone()))
        .await
        .expect("baseline submit");
    assert_eq!(report.state, FlowState::Completed);
    ctx.storage.writes_under(FLOW_STATE)
}

/// Submits with the `n`th flow-state write failing, then recovers the way an
/// operator would: resume the family's pending flow, or resubmit if the
/// crash happened before the flow was claimed.
async fn crash_and_recover(candidate: &SchemaDescription, n: usize) -> TestContext {
    let ctx = TestContext::registered().await;
    ctx.storage.fail_writes_after(FLOW_STATE, n, 1);

    let first: Result<FlowReport> = ctx.orchestrator.submit(ctx.request(candidate.clone())).await;
    assert!(
        !ctx.storage.write_faults_pending(),
        "write {n} should have been attempted"
    );

    let mut report = first.ok();
    for _ in 0..3 {
        if report.as_ref().is_some_and(|r| r.state == FlowState::Completed) {
            break;
        }
        let next = match ctx.orchestrator.active_flow(FAMILY).await.expect("pointer") {
            Some(flow_id) => ctx.orchestrator.resume(flow_id).await,
            None => ctx.orchestrator.submit(ctx.request(candidate.clone())).await,
        };
        report = Some(next.unwrap_or_else(|e| panic!("recovery after write {n} failed: {e}")));
    }

    let report = report.expect("report");
    assert_eq!(report.state, FlowState::Completed, "crash at write {n}: {report:?}");
    assert_eq!(ctx.orchestrator.active_flow(FAMILY).await.expect("pointer"), None);
    ctx
}

#[tokio::test]
async fn compatible_flow_survives_a_crash_at_every_write() {
    let candidate = compatible_candidate();
    let writes = baseline_writes(&candidate).await;
    assert!(writes >= 8, "expected a write per transition, got {writes}");

    for n in 0..writes {
        let ctx = crash_and_recover(&candidate, n).await;

        let entries = ctx.orchestrator.version_map().entries(FAMILY).await.expect("entries");
        assert_eq!(entries.len(), 2, "crash at write {n}");

        let records = ctx.orchestrator.archiver().records(FAMILY, 1).await.expect("records");
        assert_eq!(records.len(), 1, "crash at write {n}");
        assert_eq!(records[0].artifacts.len(), 3);
        assert_prefix_empty(&ctx.storage, "datasets/weather_v1/").await;

        let dataset = ctx.orchestrator.registry().get(FAMILY, 1).await.expect("dataset");
        assert_eq!(dataset.update_number, 1, "crash at write {n}");

        let jobs = ctx.orchestrator.jobs();
        assert_eq!(jobs.workflow(WORKFLOW).await.expect("wf").trigger, TriggerState::Active);
        assert_eq!(jobs.checkpoint(JOB).await.expect("cp").marker, CheckpointMarker::Reset);
    }
}

#[tokio::test]
async fn incompatible_flow_survives_a_crash_at_every_write() {
    let candidate = incompatible_candidate();
    let writes = baseline_writes(&candidate).await;
    assert!(writes >= 7, "expected a write per transition, got {writes}");

    for n in 0..writes {
        let ctx = crash_and_recover(&candidate, n).await;

        let entries = ctx.orchestrator.version_map().entries(FAMILY).await.expect("entries");
        let versions: Vec<u32> = entries.iter().map(|e| e.dataset.version).collect();
        assert_eq!(versions, vec![1, 2], "crash at write {n}");
        assert!(ctx.orchestrator.registry().get(FAMILY, 3).await.is_err());

        let jobs = ctx.orchestrator.jobs();
        let workflow = jobs.workflow(WORKFLOW).await.expect("wf");
        assert_eq!(workflow.trigger, TriggerState::Active);
        assert_eq!(
            workflow.jobs,
            BTreeSet::from(["weather-v2-json-to-parquet".to_string()]),
            "crash at write {n}"
        );
        assert_eq!(ctx.discovery.scopes(), vec!["datasets/weather_v2/".to_string()]);
    }
}

#[tokio::test]
async fn partial_archive_move_resumes_in_the_same_slot() {
    let ctx = TestContext::registered().await;
    // The second artifact move fails once mid-archive.
    ctx.storage
        .fail_writes_after("archive/weather_1_1/", 1, 1);

    let report = ctx
        .orchestrator
        .submit(ctx.request(compatible_candidate()))
        .await
        .expect("submit");
    lakeshift_test_utils::assert_failed_at(
        &report,
        lakeshift_flow::FlowStep::ArchiveDataset,
        lakeshift_flow::ErrorKind::PartialMoveFailure,
    );
    assert!(report.error.as_ref().is_some_and(|e| e.retryable));

    let resumed = ctx.orchestrator.resume(report.flow_id).await.expect("resume");
    assert_eq!(resumed.state, FlowState::Completed);

    let records = ctx.orchestrator.archiver().records(FAMILY, 1).await.expect("records");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].slot, 1);
    assert_eq!(ctx.storage.paths_under("archive/").await.len(), 3);
    assert_prefix_empty(&ctx.storage, "datasets/weather_v1/").await;
}
