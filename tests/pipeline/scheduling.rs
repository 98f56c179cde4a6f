use std::time::Duration;

use crate::support::helpers::{
    init_tracing, invocation_log, recording_registry, test_config, wait_until, Gate, Harness,
    RecordingStage,
};
use anyhow::Result;
use entityflow::{
    EntityRef, KnownData, Priority, ProcessingTask, StageKind, SubmitError, TaskEvent,
    TaskHandle, TaskOutcome,
};
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(5);

/// Harness whose location stage blocks until the returned gate opens.
fn gated_harness(workers: usize, capacity: usize) -> Result<(Harness, Gate)> {
    let log = invocation_log();
    let gate = Gate::closed();
    let registry = recording_registry(&log)
        .with(StageKind::Location, RecordingStage::new(&log).gated(&gate));
    let config = test_config()
        .worker_count(workers)
        .queue_capacity(capacity)
        .build()?;
    Ok((Harness::start(config, registry, log)?, gate))
}

fn schools(harness: &Harness, ids: impl IntoIterator<Item = u64>) {
    for id in ids {
        harness.known.insert(EntityRef::school(id), KnownData::new());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicates_run_the_pipeline_once() -> Result<()> {
    init_tracing();
    let (mut harness, gate) = gated_harness(4, 64)?;
    let entity = EntityRef::school(42);
    schools(&harness, [42]);

    let orchestrator = &harness.orchestrator;
    let results: Vec<Result<TaskHandle, SubmitError>> = std::thread::scope(|scope| {
        let submitters: Vec<_> = (0..8)
            .map(|_| scope.spawn(|| orchestrator.submit(ProcessingTask::new(entity))))
            .collect();
        submitters
            .into_iter()
            .map(|submitter| submitter.join().expect("submitter thread panicked"))
            .collect()
    });

    let accepted: Vec<&TaskHandle> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(accepted.len(), 1, "exactly one submission is admitted");
    let accepted = accepted[0].clone();
    for result in &results {
        match result {
            Ok(handle) => assert_eq!(handle.id(), accepted.id()),
            Err(SubmitError::DuplicateRejected { existing }) => {
                assert_eq!(existing.id(), accepted.id());
                assert_eq!(existing.entity(), entity);
            }
            Err(other) => panic!("unexpected submit error: {other}"),
        }
    }
    assert_eq!(harness.orchestrator.telemetry().duplicates_rejected, 7);

    gate.open();
    let outcome = timeout(WAIT, accepted.wait()).await?;
    assert!(outcome.succeeded());
    let location_runs = harness
        .invocations(entity)
        .into_iter()
        .filter(|stage| *stage == StageKind::Location)
        .count();
    assert_eq!(location_runs, 1);

    // The entity is released once its outcome is published.
    let again = harness.orchestrator.submit(ProcessingTask::new(entity))?;
    assert_ne!(again.id(), accepted.id());
    timeout(WAIT, again.wait()).await?;

    harness.orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn workers_claim_by_priority_then_submission_order() -> Result<()> {
    init_tracing();
    let (mut harness, gate) = gated_harness(1, 64)?;
    schools(&harness, 1..=5);

    let blocker = harness.orchestrator.submit(ProcessingTask::new(EntityRef::school(1)))?;
    wait_until("blocker claimed", WAIT, || {
        harness.entities_invoked(StageKind::Location).len() == 1
    })
    .await?;

    let mut handles = vec![blocker];
    for (id, priority) in [
        (2, Priority::Low),
        (3, Priority::Normal),
        (4, Priority::High),
        (5, Priority::High),
    ] {
        let task = ProcessingTask::new(EntityRef::school(id)).with_priority(priority);
        handles.push(harness.orchestrator.submit(task)?);
    }

    let pending = harness.orchestrator.queue_status().pending;
    assert_eq!((pending.high, pending.normal, pending.low), (2, 1, 1));

    gate.open();
    for handle in &handles {
        assert!(timeout(WAIT, handle.wait()).await?.succeeded());
    }

    let order: Vec<u64> = harness
        .entities_invoked(StageKind::Location)
        .iter()
        .map(|entity| entity.id.0)
        .collect();
    assert_eq!(order, vec![1, 4, 5, 3, 2]);

    harness.orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn saturation_rejects_without_touching_queue_state() -> Result<()> {
    init_tracing();
    let (mut harness, gate) = gated_harness(1, 2)?;
    schools(&harness, 1..=4);

    let running = harness.orchestrator.submit(ProcessingTask::new(EntityRef::school(1)))?;
    wait_until("first task running", WAIT, || {
        harness.orchestrator.queue_status().running == 1
    })
    .await?;
    let queued = [
        harness.orchestrator.submit(ProcessingTask::new(EntityRef::school(2)))?,
        harness.orchestrator.submit(ProcessingTask::new(EntityRef::school(3)))?,
    ];

    let before = harness.orchestrator.queue_status();
    let rejected = harness
        .orchestrator
        .submit(ProcessingTask::new(EntityRef::school(4)).with_priority(Priority::High));
    assert!(matches!(
        rejected,
        Err(SubmitError::QueueSaturated { capacity: 2 })
    ));
    assert_eq!(harness.orchestrator.queue_status(), before);
    assert_eq!(harness.orchestrator.telemetry().saturations, 1);

    gate.open();
    timeout(WAIT, running.wait()).await?;
    for handle in &queued {
        timeout(WAIT, handle.wait()).await?;
    }

    let retried = harness.orchestrator.submit(ProcessingTask::new(EntityRef::school(4)))?;
    assert!(timeout(WAIT, retried.wait()).await?.succeeded());

    harness.orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_cancels_queued_tasks_and_drains_running_ones() -> Result<()> {
    init_tracing();
    let (mut harness, gate) = gated_harness(1, 64)?;
    schools(&harness, 1..=3);

    let running = harness.orchestrator.submit(ProcessingTask::new(EntityRef::school(1)))?;
    wait_until("first task running", WAIT, || {
        harness.orchestrator.queue_status().running == 1
    })
    .await?;
    let queued = [
        harness.orchestrator.submit(ProcessingTask::new(EntityRef::school(2)))?,
        harness.orchestrator.submit(ProcessingTask::new(EntityRef::school(3)))?,
    ];

    let (cancelled, _) = tokio::join!(harness.orchestrator.shutdown(), async {
        sleep(Duration::from_millis(50)).await;
        gate.open();
    });
    assert_eq!(cancelled, 2);

    assert!(timeout(WAIT, running.wait()).await?.succeeded());
    for handle in &queued {
        assert_eq!(timeout(WAIT, handle.wait()).await?, TaskOutcome::Cancelled);
    }
    assert_eq!(
        harness.entities_invoked(StageKind::Location),
        vec![EntityRef::school(1)]
    );
    assert!(matches!(
        harness.orchestrator.submit(ProcessingTask::new(EntityRef::school(4))),
        Err(SubmitError::ShuttingDown)
    ));
    assert_eq!(harness.orchestrator.telemetry().cancelled, 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn subscribers_observe_task_lifecycle() -> Result<()> {
    init_tracing();
    let log = invocation_log();
    let mut harness = Harness::start(test_config().build()?, recording_registry(&log), log)?;
    let entity = EntityRef::location(9);
    harness.known.insert(entity, KnownData::new());

    let mut events = harness.orchestrator.subscribe();
    let handle = harness.orchestrator.submit(ProcessingTask::new(entity))?;

    let mut seen = Vec::new();
    while seen.len() < 3 {
        let event = timeout(WAIT, events.recv()).await??;
        if event.entity() == entity {
            seen.push(event);
        }
    }
    assert!(seen.iter().all(|event| event.id() == handle.id()));
    assert!(matches!(seen[0], TaskEvent::Queued { priority: Priority::Normal, .. }));
    assert!(matches!(seen[1], TaskEvent::Started { .. }));
    assert!(matches!(seen[2], TaskEvent::Finished { succeeded: true, .. }));

    harness.orchestrator.shutdown().await;
    Ok(())
}
