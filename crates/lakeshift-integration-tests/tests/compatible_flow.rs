//! Compatible schema changes: same dataset version, bumped update number.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::{BTreeMap, BTreeSet};

use lakeshift_catalog::{ChangeKind, DataType, FieldSpec};
use lakeshift_flow::{
    Branch, CandidateSource, CheckpointMarker, ErrorKind, FireOutcome, FlowState, FlowStep,
    SchemaChangeRequest, TriggerState,
};
use lakeshift_test_utils::{
    FAMILY, JOB, TestContext, V1_ARTIFACTS, WORKFLOW, app_version, assert_completed,
    assert_failed_at, assert_prefix_empty, compatible_candidate, init_test_logging, weather_v1,
};

/// Runs one ingestion so the job has a processed checkpoint to reset.
async fn ingest_once(ctx: &TestContext) {
    let jobs = ctx.orchestrator.jobs();
    let props = BTreeMap::from([("input_key".to_string(), "weather/1.0/obs.json".to_string())]);
    let FireOutcome::Started(runs) = jobs.fire_workflow(WORKFLOW, props).await.expect("fire") else {
        panic!("trigger should be active");
    };
    jobs.complete_run(JOB, runs[0].run_id, "weather/1.0/obs.json")
        .await
        .expect("complete run");
}

#[tokio::test]
async fn compatible_change_updates_dataset_in_place() {
    init_test_logging();
    let ctx = TestContext::registered().await;
    ingest_once(&ctx).await;

    let report = ctx
        .orchestrator
        .submit(ctx.request(compatible_candidate()))
        .await
        .expect("submit");

    assert_completed(&report, Branch::Compatible);
    assert_eq!(report.kind, Some(ChangeKind::Compatible));
    assert_eq!(report.source.as_deref(), Some("weather_v1"));
    assert_eq!(report.target.as_deref(), Some("weather_v1"));
    assert_eq!(report.new_job, None);

    // Same version, one update later, published with the candidate.
    let dataset = ctx.orchestrator.registry().get(FAMILY, 1).await.expect("dataset");
    assert_eq!(dataset.update_number, 1);
    assert_eq!(dataset.current_schema, compatible_candidate());
    assert!(ctx.orchestrator.registry().get(FAMILY, 2).await.is_err());

    let entries = ctx.orchestrator.version_map().entries(FAMILY).await.expect("entries");
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1].app_version, app_version("2.0"));
    assert_eq!((entries[1].dataset.version, entries[1].dataset.update_number), (1, 1));

    // Artifacts of update 0 moved to slot 1.
    let records = ctx.orchestrator.archiver().records(FAMILY, 1).await.expect("records");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].slot, 1);
    assert_eq!(records[0].update_number, 0);
    let archived: BTreeSet<&str> = records[0].artifacts.iter().map(String::as_str).collect();
    assert_eq!(archived, V1_ARTIFACTS.into_iter().collect());
    assert_prefix_empty(&ctx.storage, "datasets/weather_v1/").await;
    assert_eq!(ctx.storage.paths_under(&records[0].archive_location).await.len(), 3);

    let jobs = ctx.orchestrator.jobs();
    assert_eq!(jobs.checkpoint(JOB).await.expect("checkpoint").marker, CheckpointMarker::Reset);
    assert_eq!(jobs.workflow(WORKFLOW).await.expect("workflow").trigger, TriggerState::Active);
    assert_eq!(ctx.orchestrator.active_flow(FAMILY).await.expect("pointer"), None);

    // The job now writes with the published schema.
    let params = jobs.job(JOB).await.expect("job").params;
    assert_eq!(params["schema_revision"], compatible_candidate().revision.to_string());
    assert_eq!(params["dataset_version"], "1");
}

#[tokio::test]
async fn successive_compatible_changes_take_new_archive_slots() {
    let ctx = TestContext::registered().await;
    ctx.orchestrator
        .submit(ctx.request(compatible_candidate()))
        .await
        .expect("first change");

    // The job reprocessed everything into the dataset location.
    let dataset = ctx.orchestrator.registry().get(FAMILY, 1).await.expect("dataset");
    ctx.seed_artifacts(&dataset, &["part-00000.parquet"]).await;

    let mut next = compatible_candidate();
    next.revision = 3;
    next.fields.push(FieldSpec::nullable("wind", DataType::Double));
    let report = ctx
        .orchestrator
        .submit(ctx.request_at("3.0", next))
        .await
        .expect("second change");
    assert_completed(&report, Branch::Compatible);

    let records = ctx.orchestrator.archiver().records(FAMILY, 1).await.expect("records");
    let slots: Vec<(u32, u32)> = records.iter().map(|r| (r.slot, r.update_number)).collect();
    assert_eq!(slots, vec![(1, 0), (2, 1)]);
    assert_eq!(
        ctx.orchestrator.registry().get(FAMILY, 1).await.expect("dataset").update_number,
        2
    );
}

#[tokio::test]
async fn identical_schema_completes_without_side_effects() {
    let ctx = TestContext::registered().await;
    ctx.storage.clear_operations();

    let report = ctx
        .orchestrator
        .submit(ctx.request(weather_v1()))
        .await
        .expect("submit");

    assert_eq!(report.state, FlowState::Completed);
    assert_eq!(report.kind, Some(ChangeKind::NoChange));
    assert_eq!(report.branch, None);
    assert_eq!(report.completed_steps, vec![FlowStep::Classify]);

    let entries = ctx.orchestrator.version_map().entries(FAMILY).await.expect("entries");
    assert_eq!(entries.len(), 1);
    assert!(ctx.orchestrator.archiver().records(FAMILY, 1).await.expect("records").is_empty());
    assert_eq!(ctx.storage.paths_under("datasets/weather_v1/").await.len(), 3);
    lakeshift_test_utils::assert_no_writes_under(&ctx.storage.operations(), "state/workflows/");
}

#[tokio::test]
async fn passing_compatibility_test_keeps_compatible_branch() {
    let ctx = TestContext::registered().await;
    let samples = ctx.seed_samples().await;

    let report = ctx
        .orchestrator
        .submit(ctx.request(compatible_candidate()).with_samples(samples))
        .await
        .expect("submit");

    assert_completed(&report, Branch::Compatible);
    assert_eq!(ctx.runner.inputs().len(), 1);
    assert_prefix_empty(&ctx.storage, "sandbox/").await;
}

#[tokio::test]
async fn discovered_candidate_drives_the_flow() {
    let ctx = TestContext::registered().await;
    ctx.discovery.propose("raw/weather/2.0/", compatible_candidate());

    let request = SchemaChangeRequest::new(
        FAMILY,
        app_version("2.0"),
        CandidateSource::Discover {
            location: "raw/weather/2.0/".into(),
        },
        JOB,
    );
    let report = ctx.orchestrator.submit(request).await.expect("submit");
    assert_completed(&report, Branch::Compatible);
}

#[tokio::test]
async fn discovery_failure_halts_at_classify() {
    let ctx = TestContext::registered().await;
    let request = SchemaChangeRequest::new(
        FAMILY,
        app_version("2.0"),
        CandidateSource::Discover {
            location: "raw/weather/unknown/".into(),
        },
        JOB,
    );

    let report = ctx.orchestrator.submit(request).await.expect("submit");
    assert_failed_at(&report, FlowStep::Classify, ErrorKind::ExternalServiceFailure);
    assert!(report.error.as_ref().is_some_and(|e| e.retryable));
    assert_eq!(report.last_completed_step, None);

    // Nothing past classification happened.
    assert_eq!(
        ctx.orchestrator
            .jobs()
            .workflow(WORKFLOW)
            .await
            .expect("workflow")
            .trigger,
        TriggerState::Active
    );
    assert_eq!(
        ctx.orchestrator.active_flow(FAMILY).await.expect("pointer"),
        Some(report.flow_id)
    );
}

#[tokio::test]
async fn unregistered_family_fails_classification() {
    let ctx = TestContext::new();
    let report = ctx
        .orchestrator
        .submit(ctx.request(compatible_candidate()))
        .await
        .expect("submit");
    assert_failed_at(&report, FlowStep::Classify, ErrorKind::FamilyNotFound);
}

#[tokio::test]
async fn resolve_is_monotonic_across_updates() {
    let ctx = TestContext::registered().await;
    ctx.orchestrator
        .submit(ctx.request(compatible_candidate()))
        .await
        .expect("submit");

    let map = ctx.orchestrator.version_map();
    let mut last = (0, 0);
    for version in ["1.0", "1.2", "1.10", "2.0", "2.0.1", "9.9"] {
        let dataset = map.resolve(FAMILY, &app_version(version)).await.expect("resolve");
        let key = (dataset.version, dataset.update_number);
        assert!(key >= last, "{version} resolved backwards: {key:?} < {last:?}");
        last = key;
    }
    assert_eq!(last, (1, 1));
    assert!(map.resolve(FAMILY, &app_version("0.9")).await.is_err());
}
