//! Operator controls: confirmation, cancellation, abort, and the per-family
//! exclusion guarantees.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use lakeshift_catalog::ChangeKind;
use lakeshift_core::{FamilyLock, LockAttempt, StorageBackend};
use lakeshift_flow::{
    Branch, CheckpointMarker, Error, ErrorKind, FireOutcome, FlowState, FlowStep,
    OrchestratorConfig, TriggerState,
};
use lakeshift_test_utils::{
    FAMILY, JOB, RunScript, TestContext, V1_ARTIFACTS, WORKFLOW, ambiguous_candidate, app_version,
    assert_awaiting_confirmation, assert_cancelled_at, assert_completed, assert_failed_at,
    compatible_candidate, incompatible_candidate, test_config, weather_v1,
};

fn family_lock(ctx: &TestContext) -> FamilyLock<dyn StorageBackend> {
    let storage: Arc<dyn StorageBackend> = ctx.storage.clone();
    FamilyLock::new(storage, FAMILY)
}

#[tokio::test]
async fn ambiguous_change_waits_for_confirmation() {
    let ctx = TestContext::registered().await;

    let parked = ctx
        .orchestrator
        .submit(ctx.request(ambiguous_candidate()))
        .await
        .expect("submit");
    assert_awaiting_confirmation(&parked, &["temp"]);
    assert_eq!(
        ctx.orchestrator.active_flow(FAMILY).await.expect("pointer"),
        Some(parked.flow_id)
    );

    // Resume cannot decide for the operator.
    assert!(matches!(
        ctx.orchestrator.resume(parked.flow_id).await,
        Err(Error::InvalidStateTransition { .. })
    ));
    assert!(matches!(
        ctx.orchestrator.confirm(parked.flow_id, ChangeKind::NoChange).await,
        Err(Error::InvalidStateTransition { .. })
    ));

    let report = ctx
        .orchestrator
        .confirm(parked.flow_id, ChangeKind::Incompatible)
        .await
        .expect("confirm");
    assert_completed(&report, Branch::Incompatible);
    assert_eq!(report.target.as_deref(), Some("weather_v2"));

    assert!(matches!(
        ctx.orchestrator.confirm(parked.flow_id, ChangeKind::Compatible).await,
        Err(Error::InvalidStateTransition { .. })
    ));
}

#[tokio::test]
async fn second_submission_while_a_flow_is_pending() {
    let ctx = TestContext::registered().await;
    let parked = ctx
        .orchestrator
        .submit(ctx.request(ambiguous_candidate()))
        .await
        .expect("submit");

    match ctx
        .orchestrator
        .submit(ctx.request_at("3.0", compatible_candidate()))
        .await
    {
        Err(Error::FlowPending { family, flow_id }) => {
            assert_eq!(family, FAMILY);
            assert_eq!(flow_id, parked.flow_id);
        }
        other => panic!("expected FlowPending, got {other:?}"),
    }
}

#[tokio::test]
async fn held_lock_rejects_submission_fast() {
    let ctx = TestContext::registered().await;
    let lock = family_lock(&ctx);
    let LockAttempt::Acquired(guard) = lock
        .try_acquire(Duration::from_secs(30), Some("maintenance".into()))
        .await
        .expect("acquire")
    else {
        panic!("family should be unlocked");
    };

    match ctx.orchestrator.submit(ctx.request(compatible_candidate())).await {
        Err(err @ Error::LockBusy { .. }) => {
            assert_eq!(err.kind(), ErrorKind::LockBusy);
            assert!(err.is_retryable());
        }
        other => panic!("expected LockBusy, got {other:?}"),
    }
    assert_eq!(ctx.orchestrator.active_flow(FAMILY).await.expect("pointer"), None);

    guard.release().await.expect("release");
    let report = ctx
        .orchestrator
        .submit(ctx.request(compatible_candidate()))
        .await
        .expect("submit after release");
    assert_completed(&report, Branch::Compatible);
    assert!(!lock.is_locked().await.expect("lock state"));
}

#[tokio::test]
async fn cancel_stops_a_running_flow_at_the_next_step() {
    let ctx = TestContext::registered().await;
    let (entered, gate) = ctx.discovery.hold_register_scope();

    let orchestrator = Arc::clone(&ctx.orchestrator);
    let request = ctx.request(incompatible_candidate());
    let running = tokio::spawn(async move { orchestrator.submit(request).await });
    entered.notified().await;

    let flow_id = ctx
        .orchestrator
        .active_flow(FAMILY)
        .await
        .expect("pointer")
        .expect("flow running");

    // The driver holds the family lock.
    assert!(matches!(
        ctx.orchestrator.submit(ctx.request_at("3.0", compatible_candidate())).await,
        Err(Error::LockBusy { .. })
    ));
    assert!(matches!(
        ctx.orchestrator.abort(flow_id).await,
        Err(Error::LockBusy { .. })
    ));

    let requested = ctx.orchestrator.cancel(flow_id).await.expect("cancel");
    assert_eq!(
        requested.state,
        FlowState::IncompatibleFlow {
            next: FlowStep::RegisterScope
        }
    );

    gate.notify_one();
    let report = running.await.expect("join").expect("submit");
    assert_cancelled_at(&report, FlowStep::CreateJob);
    assert_eq!(report.last_completed_step, Some(FlowStep::RegisterScope));

    // Resume continues where the flow stopped.
    let resumed = ctx.orchestrator.resume(flow_id).await.expect("resume");
    assert_completed(&resumed, Branch::Incompatible);
    assert_eq!(ctx.discovery.register_calls(), 1);
}

#[tokio::test]
async fn cancel_of_an_idle_flow_takes_effect_immediately() {
    let ctx = TestContext::registered().await;
    let parked = ctx
        .orchestrator
        .submit(ctx.request(ambiguous_candidate()))
        .await
        .expect("submit");

    let report = ctx.orchestrator.cancel(parked.flow_id).await.expect("cancel");
    assert_cancelled_at(&report, FlowStep::Classify);
    let again = ctx.orchestrator.cancel(parked.flow_id).await.expect("cancel twice");
    assert_eq!(again.state, report.state);

    // The family stays held until the operator resumes or aborts.
    assert_eq!(
        ctx.orchestrator.active_flow(FAMILY).await.expect("pointer"),
        Some(parked.flow_id)
    );
    let resumed = ctx.orchestrator.resume(parked.flow_id).await.expect("resume");
    assert_awaiting_confirmation(&resumed, &["temp"]);
}

#[tokio::test]
async fn abort_releases_the_family() {
    let ctx = TestContext::registered().await;
    let parked = ctx
        .orchestrator
        .submit(ctx.request(ambiguous_candidate()))
        .await
        .expect("submit");

    let aborted = ctx.orchestrator.abort(parked.flow_id).await.expect("abort");
    assert_eq!(aborted.state, FlowState::Aborted);
    assert_eq!(ctx.orchestrator.active_flow(FAMILY).await.expect("pointer"), None);

    for op in [
        ctx.orchestrator.abort(parked.flow_id).await,
        ctx.orchestrator.resume(parked.flow_id).await,
        ctx.orchestrator.cancel(parked.flow_id).await,
    ] {
        assert!(matches!(op, Err(Error::InvalidStateTransition { .. })));
    }

    let report = ctx
        .orchestrator
        .submit(ctx.request(compatible_candidate()))
        .await
        .expect("submit after abort");
    assert_completed(&report, Branch::Compatible);
}

#[tokio::test]
async fn in_flight_run_blocks_archiving_until_it_finishes() {
    let ctx = TestContext::registered().await;
    let jobs = ctx.orchestrator.jobs();
    let props = BTreeMap::from([("input_key".to_string(), "weather/1.0/late.json".to_string())]);
    let FireOutcome::Started(runs) = jobs.fire_workflow(WORKFLOW, props).await.expect("fire") else {
        panic!("trigger should be active");
    };

    let report = ctx
        .orchestrator
        .submit(ctx.request(compatible_candidate()))
        .await
        .expect("submit");
    assert_failed_at(&report, FlowStep::PauseTriggers, ErrorKind::JobInProgress);
    assert_eq!(report.last_completed_step, Some(FlowStep::Classify));

    // Paused: new events do not start runs while the flow is halted.
    assert_eq!(jobs.workflow(WORKFLOW).await.expect("wf").trigger, TriggerState::Paused);
    assert!(matches!(
        jobs.fire_workflow(WORKFLOW, BTreeMap::new()).await.expect("fire"),
        FireOutcome::Skipped { .. }
    ));
    // Nothing was moved or published under the running job.
    assert!(ctx.orchestrator.archiver().records(FAMILY, 1).await.expect("records").is_empty());
    let dataset = ctx.orchestrator.registry().get(FAMILY, 1).await.expect("dataset");
    assert_eq!(dataset.update_number, 0);

    // The run lands its output, then finishes.
    ctx.seed_artifacts(&dataset, &["part-late.parquet"]).await;
    jobs.complete_run(JOB, runs[0].run_id, "weather/1.0/late.json")
        .await
        .expect("complete");

    let resumed = ctx.orchestrator.resume(report.flow_id).await.expect("resume");
    assert_completed(&resumed, Branch::Compatible);
    let records = ctx.orchestrator.archiver().records(FAMILY, 1).await.expect("records");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].artifacts.len(), V1_ARTIFACTS.len() + 1);
    assert!(records[0].artifacts.iter().any(|a| a == "part-late.parquet"));
    assert_eq!(jobs.checkpoint(JOB).await.expect("cp").marker, CheckpointMarker::Reset);
    assert_eq!(jobs.workflow(WORKFLOW).await.expect("wf").trigger, TriggerState::Active);
}

#[tokio::test]
async fn incompatible_fork_does_not_wait_for_the_running_job() {
    let ctx = TestContext::registered().await;
    let jobs = ctx.orchestrator.jobs();
    let FireOutcome::Started(runs) =
        jobs.fire_workflow(WORKFLOW, BTreeMap::new()).await.expect("fire")
    else {
        panic!("trigger should be active");
    };

    let report = ctx
        .orchestrator
        .submit(ctx.request(incompatible_candidate()))
        .await
        .expect("submit");
    assert_completed(&report, Branch::Incompatible);
    let running = jobs.active_run(JOB).await.expect("run");
    assert_eq!(running.map(|r| r.run_id), Some(runs[0].run_id));
}

#[tokio::test]
async fn expired_lock_of_a_crashed_holder_is_taken_over() {
    let ctx = TestContext::registered().await;
    let lock = family_lock(&ctx);
    let LockAttempt::Acquired(_abandoned) = lock
        .try_acquire(Duration::from_millis(1), Some("crashed".into()))
        .await
        .expect("acquire")
    else {
        panic!("family should be unlocked");
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let report = ctx
        .orchestrator
        .submit(ctx.request(compatible_candidate()))
        .await
        .expect("takeover");
    assert_completed(&report, Branch::Compatible);
}

#[tokio::test]
async fn step_outlasting_the_lock_ttl_keeps_the_family() {
    let ctx = TestContext::with_config(OrchestratorConfig {
        lock_ttl: Duration::from_millis(300),
        tester_timeout: Duration::from_secs(5),
        ..test_config()
    });
    let dataset = ctx
        .orchestrator
        .register_family(FAMILY, &app_version("1.0"), weather_v1(), JOB, WORKFLOW)
        .await
        .expect("register");
    ctx.seed_artifacts(&dataset, &V1_ARTIFACTS).await;
    let samples = ctx.seed_samples().await;
    ctx.runner.script(RunScript::Delay(Duration::from_secs(1)));

    let orchestrator = Arc::clone(&ctx.orchestrator);
    let request = ctx.request(compatible_candidate()).with_samples(samples);
    let running = tokio::spawn(async move { orchestrator.submit(request).await });

    // Twice the TTL into the trial run, the driver still holds the family.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let flow_id = ctx
        .orchestrator
        .active_flow(FAMILY)
        .await
        .expect("pointer")
        .expect("flow running");
    assert!(matches!(
        ctx.orchestrator.resume(flow_id).await,
        Err(Error::LockBusy { .. })
    ));
    assert!(matches!(
        ctx.orchestrator.abort(flow_id).await,
        Err(Error::LockBusy { .. })
    ));

    let report = running.await.expect("join").expect("submit");
    assert_completed(&report, Branch::Compatible);
    assert_eq!(ctx.runner.inputs().len(), 1, "the trial ran exactly once");
}
