use std::time::{Duration, SystemTime};

use crate::support::helpers::{
    init_tracing, invocation_log, recording_registry, test_config, Harness, RecordingStage,
};
use anyhow::Result;
use entityflow::{
    facts, CollaboratorError, EntityRef, EntityType, KnownData, PipelineError, ProcessingTask,
    ReplanPolicy, RunStatus, SkipReason, StageError, StageErrorKind, StageKind, StageOutcome,
    StageStatus, TaskOutcome,
};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

async fn run(harness: &Harness, task: ProcessingTask) -> Result<TaskOutcome> {
    let handle = harness.orchestrator.submit(task)?;
    Ok(timeout(WAIT, handle.wait()).await?)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn school_plan_grows_once_enrollment_is_known() -> Result<()> {
    init_tracing();
    let log = invocation_log();
    let mut harness = Harness::start(test_config().build()?, recording_registry(&log), log)?;
    let entity = EntityRef::school(42);
    harness
        .known
        .insert(entity, KnownData::new().with(facts::HAS_LOCATION, true));

    let preview = harness.orchestrator.preview(entity).await?;
    let planned: Vec<StageKind> = preview.stages.iter().map(|stage| stage.stage).collect();
    assert_eq!(
        planned,
        vec![StageKind::Location, StageKind::Demographics, StageKind::Enrollment]
    );

    let outcome = run(&harness, ProcessingTask::new(entity)).await?;
    let result = outcome.result().expect("pipeline result");
    assert!(result.overall_succeeded);
    assert_eq!(
        harness.invocations(entity),
        vec![
            StageKind::Location,
            StageKind::Demographics,
            StageKind::Enrollment,
            StageKind::Projections,
            StageKind::Metrics,
        ]
    );
    assert_eq!(result.executed_stages().len(), 5);
    assert_eq!(result.status(StageKind::Team), None);

    let summary = harness.store.run_summary(entity).expect("run summary");
    assert_eq!(summary.status, RunStatus::Completed);
    assert!(harness.store.active_runs().is_empty());

    harness.orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn once_at_start_keeps_the_initial_plan() -> Result<()> {
    init_tracing();
    let log = invocation_log();
    let config = test_config()
        .replan_policy(ReplanPolicy::OnceAtStart)
        .build()?;
    let mut harness = Harness::start(config, recording_registry(&log), log)?;
    let entity = EntityRef::school(42);
    harness.known.insert(entity, KnownData::new());

    let outcome = run(&harness, ProcessingTask::new(entity)).await?;
    assert!(outcome.succeeded());
    assert_eq!(
        harness.invocations(entity),
        vec![StageKind::Location, StageKind::Demographics, StageKind::Enrollment]
    );

    harness.orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_stage_skips_dependents_but_not_independent_stages() -> Result<()> {
    init_tracing();
    let log = invocation_log();
    let registry = recording_registry(&log).with(
        StageKind::Location,
        RecordingStage::new(&log).failing(StageError::permanent("address missing")),
    );
    let mut harness = Harness::start(test_config().build()?, registry, log)?;
    let entity = EntityRef::school(7);
    harness
        .known
        .insert(entity, KnownData::new().with(facts::TEAM_NAME, "north"));

    let outcome = run(&harness, ProcessingTask::new(entity)).await?;
    let result = outcome.result().expect("pipeline result");
    assert!(!result.overall_succeeded);
    assert_eq!(result.status(StageKind::Location), Some(StageStatus::Failed));
    for dependent in [StageKind::Demographics, StageKind::Enrollment] {
        assert_eq!(
            result.status(dependent),
            Some(StageStatus::Skipped(SkipReason::UpstreamFailure))
        );
    }
    assert_eq!(result.status(StageKind::Team), Some(StageStatus::Succeeded));
    assert_eq!(
        harness.invocations(entity),
        vec![StageKind::Location, StageKind::Team]
    );

    let error = result
        .outcome(StageKind::Location)
        .and_then(|outcome| outcome.error.clone())
        .expect("failure carries its error");
    assert_eq!(error.kind, StageErrorKind::Permanent);

    let summary = harness.store.run_summary(entity).expect("run summary");
    assert_eq!(summary.status, RunStatus::Failed);
    assert!(summary.error.is_some_and(|error| error.contains("location")));

    harness.orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rerun_within_freshness_is_cached_until_forced() -> Result<()> {
    init_tracing();
    let log = invocation_log();
    let mut harness = Harness::start(test_config().build()?, recording_registry(&log), log)?;
    let entity = EntityRef::location(11);
    harness.known.insert(entity, KnownData::new());

    assert!(run(&harness, ProcessingTask::new(entity)).await?.succeeded());
    let first_invocations = harness.invocations(entity);
    assert_eq!(
        first_invocations,
        vec![StageKind::Location, StageKind::Demographics]
    );
    let stored_after_first = harness.store.snapshot(entity);

    let rerun = run(&harness, ProcessingTask::new(entity)).await?;
    let result = rerun.result().expect("pipeline result");
    assert!(result.overall_succeeded);
    assert!(result.executed_stages().is_empty());
    assert_eq!(
        result.stages_with(StageStatus::Skipped(SkipReason::Cached)),
        vec![StageKind::Location, StageKind::Demographics]
    );
    assert_eq!(harness.invocations(entity), first_invocations);
    for (stage, outcome) in harness.store.snapshot(entity) {
        assert_eq!(
            outcome.output_at,
            stored_after_first[&stage].output_at,
            "{stage} output time must survive a cached rerun"
        );
    }

    let forced = run(&harness, ProcessingTask::new(entity).force_refresh(true)).await?;
    assert_eq!(
        forced.result().expect("pipeline result").executed_stages(),
        vec![StageKind::Location, StageKind::Demographics]
    );
    assert_eq!(harness.invocations(entity).len(), 4);

    harness.orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn resubmission_after_a_failed_forced_run_reruns_the_failed_tail() -> Result<()> {
    init_tracing();
    let log = invocation_log();
    let registry = recording_registry(&log).with(
        StageKind::Location,
        RecordingStage::new(&log).failing_once(StageError::transient("geocoder unavailable")),
    );
    let mut harness = Harness::start(test_config().build()?, registry, log)?;
    let entity = EntityRef::location(21);
    harness.known.insert(entity, KnownData::new());
    let produced = SystemTime::now() - Duration::from_secs(3_600);
    for stage in [StageKind::Location, StageKind::Demographics] {
        harness
            .store
            .seed(entity, stage, StageOutcome::succeeded_at(produced));
    }

    let forced = run(&harness, ProcessingTask::new(entity).force_refresh(true)).await?;
    let forced = forced.result().expect("pipeline result");
    assert!(!forced.overall_succeeded);
    assert_eq!(forced.failed_stages(), vec![StageKind::Location]);
    assert_eq!(
        forced.status(StageKind::Demographics),
        Some(StageStatus::Skipped(SkipReason::UpstreamFailure))
    );

    let resubmitted = run(&harness, ProcessingTask::new(entity)).await?;
    let resubmitted = resubmitted.result().expect("pipeline result");
    assert!(resubmitted.overall_succeeded);
    assert_eq!(
        resubmitted.stages_with(StageStatus::Succeeded),
        vec![StageKind::Location, StageKind::Demographics]
    );
    assert_eq!(
        harness.invocations(entity),
        vec![StageKind::Location, StageKind::Location, StageKind::Demographics]
    );
    let summary = harness.store.run_summary(entity).expect("run summary");
    assert_eq!(summary.status, RunStatus::Completed);

    harness.orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn team_assignment_is_not_repeated_on_unchanged_rerun() -> Result<()> {
    init_tracing();
    let log = invocation_log();
    let mut harness = Harness::start(test_config().build()?, recording_registry(&log), log)?;
    let entity = EntityRef::school(11);
    harness
        .known
        .insert(entity, KnownData::new().with(facts::TEAM_NAME, "north"));

    assert!(run(&harness, ProcessingTask::new(entity)).await?.succeeded());
    let first_invocations = harness.invocations(entity);
    assert!(first_invocations.contains(&StageKind::Team));

    let rerun = run(&harness, ProcessingTask::new(entity)).await?;
    let result = rerun.result().expect("pipeline result");
    assert!(result.overall_succeeded);
    assert!(result.executed_stages().is_empty());
    assert_eq!(
        result.status(StageKind::Team),
        Some(StageStatus::Skipped(SkipReason::Cached))
    );
    assert_eq!(harness.invocations(entity), first_invocations);

    let forced = run(&harness, ProcessingTask::new(entity).force_refresh(true)).await?;
    assert_eq!(
        forced.result().expect("pipeline result").status(StageKind::Team),
        Some(StageStatus::Succeeded)
    );

    harness.orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn batch_status_and_summary_cover_recorded_runs() -> Result<()> {
    init_tracing();
    let log = invocation_log();
    let registry = recording_registry(&log).with(
        StageKind::Demographics,
        RecordingStage::new(&log).failing(StageError::permanent("census tract missing")),
    );
    let mut harness = Harness::start(test_config().build()?, registry, log)?;
    harness.known.insert(EntityRef::location(1), KnownData::new());
    harness.known.insert(EntityRef::school(2), KnownData::new());

    assert!(!run(&harness, ProcessingTask::new(EntityRef::location(1)))
        .await?
        .succeeded());
    assert!(!run(&harness, ProcessingTask::new(EntityRef::school(2)))
        .await?
        .succeeded());

    let statuses = harness
        .orchestrator
        .status_many([1, 5], EntityType::Location)
        .await;
    assert_eq!(statuses.len(), 2);
    assert_eq!(statuses[0].0, EntityRef::location(1));
    let first = statuses[0].1.as_ref().expect("stored status");
    assert_eq!(
        first.stages.get(&StageKind::Demographics).map(|outcome| outcome.status),
        Some(StageStatus::Failed)
    );
    assert!(statuses[1].1.as_ref().expect("empty status").stages.is_empty());

    let summary = harness.orchestrator.processing_summary().await?;
    assert_eq!(summary.total, 2);
    assert_eq!(summary.failed, 2);
    assert_eq!(summary.processing, 0);
    assert_eq!(summary.by_entity_type.get(&EntityType::School), Some(&1));
    assert_eq!(summary.by_entity_type.get(&EntityType::Location), Some(&1));
    assert!(summary.active.is_empty());

    harness.orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_stage_times_out_as_transient_failure() -> Result<()> {
    init_tracing();
    let log = invocation_log();
    let registry = recording_registry(&log).with(
        StageKind::Demographics,
        RecordingStage::new(&log).delayed(Duration::from_secs(2)),
    );
    let config = test_config()
        .stage_timeout(Duration::from_millis(100))
        .build()?;
    let mut harness = Harness::start(config, registry, log)?;
    let entity = EntityRef::location(5);
    harness.known.insert(entity, KnownData::new());

    let outcome = run(&harness, ProcessingTask::new(entity)).await?;
    let result = outcome.result().expect("pipeline result");
    assert_eq!(result.status(StageKind::Location), Some(StageStatus::Succeeded));
    let demographics = result
        .outcome(StageKind::Demographics)
        .expect("demographics outcome");
    assert_eq!(demographics.status, StageStatus::Failed);
    assert!(demographics
        .error
        .as_ref()
        .is_some_and(StageError::is_transient));
    assert_eq!(harness.orchestrator.telemetry().stage_timeouts, 1);

    harness.orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_entity_fails_without_stages() -> Result<()> {
    init_tracing();
    let log = invocation_log();
    let mut harness = Harness::start(test_config().build()?, recording_registry(&log), log)?;
    let entity = EntityRef::school(404);

    let outcome = run(&harness, ProcessingTask::new(entity)).await?;
    let result = outcome.result().expect("pipeline result");
    assert!(!result.overall_succeeded);
    assert!(result.per_stage.is_empty());
    assert_eq!(
        result.error,
        Some(PipelineError::KnownData(CollaboratorError::NotFound(entity)))
    );
    assert!(harness.invocations(entity).is_empty());

    let status = harness.orchestrator.status(entity).await?;
    assert!(status.stages.is_empty());
    assert_eq!(status.task, None);

    harness.orchestrator.shutdown().await;
    Ok(())
}
