//! Submission surface: wires the queue, the worker pool, the pipeline runner,
//! bulk submission and the metrics reporter behind one handle.

use crate::pipeline::collaborators::{CollaboratorError, KnownDataSource, StatusStore};
use crate::pipeline::outcome::{PipelineError, ProcessingSummary, StageStatusMap};
use crate::pipeline::runner::{PipelineRunner, PipelineRunnerParams};
use crate::runtime::config::SchedulerConfig;
use crate::runtime::telemetry::{spawn_metrics_reporter, Telemetry, TelemetrySnapshot};
use crate::scheduler::bulk::{BulkCoordinator, BulkHandle, BulkRetry};
use crate::scheduler::queue::{QueueStatus, TaskQueue};
use crate::scheduler::task::{
    Priority, ProcessingTask, SubmitError, TaskEvent, TaskHandle, TaskState,
};
use crate::scheduler::worker_pool::{WorkerPool, WorkerPoolParams};
use crate::stages::catalog::StageCatalog;
use crate::stages::contract::{EntityRef, EntityType, KnownData, StageKind};
use crate::stages::planner::StagePlanner;
use crate::stages::registry::StageRegistry;
use anyhow::{bail, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// What a run would do for one stage, without invoking anything.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StagePreview {
    pub stage: StageKind,
    pub description: &'static str,
    pub depends_on: Vec<StageKind>,
    pub required_facts: Vec<String>,
    pub freshness: Option<Duration>,
    /// The stored output would be reused by an unforced run.
    pub cached: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelinePreview {
    pub entity: EntityRef,
    pub known_data: KnownData,
    pub stages: Vec<StagePreview>,
}

/// Stored stage outcomes plus the live task, if one is queued or running.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityStatus {
    pub entity: EntityRef,
    pub stages: StageStatusMap,
    pub task: Option<TaskState>,
}

pub struct Orchestrator {
    queue: Arc<TaskQueue>,
    runner: Arc<PipelineRunner>,
    telemetry: Arc<Telemetry>,
    bulk: BulkCoordinator,
    pool: WorkerPool,
    reporter: Option<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    /// Starts the worker pool and the metrics reporter. Must be called from
    /// inside a tokio runtime.
    ///
    /// Fails when the registry carries an implementation for a stage the
    /// catalog does not declare. Catalog stages without an implementation are
    /// allowed and fail permanently when they are reached.
    pub fn start(
        config: SchedulerConfig,
        catalog: StageCatalog,
        registry: StageRegistry,
        status_store: Arc<dyn StatusStore>,
        known_data: Arc<dyn KnownDataSource>,
    ) -> Result<Self> {
        if let Some(stray) = registry.kinds().find(|kind| !catalog.contains(*kind)) {
            bail!("stage {stray} is registered but not declared in the catalog");
        }
        for spec in catalog.specs() {
            if !registry.contains(spec.kind) {
                tracing::warn!(stage = %spec.kind, "stage has no registered implementation");
            }
        }

        let shutdown = CancellationToken::new();
        let telemetry = Arc::new(Telemetry::default());
        let queue = Arc::new(TaskQueue::with_parts(
            config.queue_capacity(),
            config.event_capacity(),
            telemetry.clone(),
        ));
        let runner = Arc::new(PipelineRunner::new(PipelineRunnerParams {
            planner: StagePlanner::new(Arc::new(catalog)),
            registry,
            status_store,
            known_data,
            telemetry: telemetry.clone(),
            stage_timeout: config.stage_timeout(),
            replan_policy: config.replan_policy(),
        }));

        let pool = WorkerPool::launch(WorkerPoolParams {
            worker_count: config.worker_count(),
            queue: queue.clone(),
            runner: runner.clone(),
            telemetry: telemetry.clone(),
            shutdown: shutdown.clone(),
        });
        let reporter = spawn_metrics_reporter(
            telemetry.clone(),
            queue.clone(),
            shutdown.child_token(),
            config.metrics_interval(),
        );
        let bulk = BulkCoordinator::new(
            queue.clone(),
            BulkRetry {
                initial_delay: config.bulk_retry_initial_delay(),
                max_delay: config.bulk_retry_max_delay(),
                max_attempts: config.bulk_retry_max_attempts(),
            },
            shutdown.child_token(),
        );

        tracing::info!(
            workers = pool.size(),
            queue_capacity = config.queue_capacity(),
            stage_timeout_secs = config.stage_timeout().as_secs(),
            replan = ?config.replan_policy(),
            "orchestrator started"
        );

        Ok(Self {
            queue,
            runner,
            telemetry,
            bulk,
            pool,
            reporter: Some(reporter),
            shutdown,
        })
    }

    /// Root token; cancelling it stops workers once the queue is empty.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn submit(&self, task: ProcessingTask) -> Result<TaskHandle, SubmitError> {
        self.queue.push(task)
    }

    /// Submits every task synchronously. Results are in input order.
    pub fn submit_bulk(
        &self,
        tasks: impl IntoIterator<Item = ProcessingTask>,
    ) -> Vec<Result<TaskHandle, SubmitError>> {
        tasks.into_iter().map(|task| self.queue.push(task)).collect()
    }

    /// Returns immediately; admission continues in the background and retries
    /// while the queue is saturated.
    pub fn submit_many(
        &self,
        entity_ids: impl IntoIterator<Item = u64>,
        entity_type: EntityType,
        priority: Priority,
    ) -> BulkHandle {
        self.bulk.submit_many(entity_ids, entity_type, priority)
    }

    /// Plans the pipeline for `entity` against its current facts and stored
    /// status without touching either.
    pub async fn preview(&self, entity: EntityRef) -> Result<PipelinePreview, PipelineError> {
        let known = self
            .runner
            .known_data()
            .known_data(entity)
            .await
            .map_err(PipelineError::KnownData)?;
        let plan = self
            .runner
            .planner()
            .plan(entity.entity_type, &known)
            .map_err(PipelineError::Planning)?;

        let stored = match self.runner.status_store().get_status(entity).await {
            Ok(stored) => stored,
            Err(err) => {
                tracing::warn!(entity = %entity, error = %err, "preview without stored status");
                StageStatusMap::new()
            }
        };

        let now = SystemTime::now();
        let catalog = self.runner.planner().catalog();
        let stages = plan
            .into_iter()
            .filter_map(|stage| catalog.spec(stage))
            .map(|spec| StagePreview {
                stage: spec.kind,
                description: spec.kind.description(),
                depends_on: spec.depends_on.clone(),
                required_facts: spec.applies_to.required_facts().to_vec(),
                freshness: spec.freshness,
                cached: stored
                    .get(&spec.kind)
                    .is_some_and(|prior| prior.is_reusable(spec.freshness, now)),
            })
            .collect();

        Ok(PipelinePreview {
            entity,
            known_data: known,
            stages,
        })
    }

    pub async fn status(&self, entity: EntityRef) -> Result<EntityStatus, CollaboratorError> {
        let stages = self.runner.status_store().get_status(entity).await?;
        Ok(EntityStatus {
            entity,
            stages,
            task: self.queue.handle(entity).map(|handle| handle.state()),
        })
    }

    /// Status of several entities of one type, in input order. A failed
    /// lookup is reported for its entity without failing the batch.
    pub async fn status_many(
        &self,
        entity_ids: impl IntoIterator<Item = u64>,
        entity_type: EntityType,
    ) -> Vec<(EntityRef, Result<EntityStatus, CollaboratorError>)> {
        let mut statuses = Vec::new();
        for id in entity_ids {
            let entity = EntityRef::new(id, entity_type);
            let status = self.status(entity).await;
            if let Err(err) = &status {
                tracing::warn!(entity = %entity, error = %err, "failed to read entity status");
            }
            statuses.push((entity, status));
        }
        statuses
    }

    /// Counts of recorded runs by status and entity type, plus the entities
    /// still processing.
    pub async fn processing_summary(&self) -> Result<ProcessingSummary, CollaboratorError> {
        let runs = self.runner.status_store().list_runs().await?;
        Ok(ProcessingSummary::from_runs(runs))
    }

    pub fn queue_status(&self) -> QueueStatus {
        self.queue.status()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.queue.subscribe()
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot()
    }

    /// Stops admission, cancels queued tasks, waits for running tasks and
    /// joins the workers. Returns the number of cancelled tasks. Calling it
    /// again is a no-op.
    pub async fn shutdown(&mut self) -> usize {
        let Some(reporter) = self.reporter.take() else {
            return 0;
        };

        let cancelled = self.queue.close();
        tracing::info!(cancelled, running = self.queue.running_len(), "draining workers");
        self.shutdown.cancel();
        self.pool.join().await;

        if let Err(err) = reporter.await {
            tracing::warn!(error = %err, "metrics reporter terminated unexpectedly");
        }
        tracing::info!("orchestrator stopped");
        cancelled
    }

    /// Runs until Ctrl-C (SIGINT) or until the root token is cancelled, then
    /// shuts down.
    pub async fn run_until_ctrl_c(&mut self) -> Result<usize> {
        tracing::info!("orchestrator running; waiting for Ctrl-C (SIGINT) to initiate shutdown");
        tokio::select! {
            result = signal::ctrl_c() => {
                result?;
                tracing::info!("Ctrl-C received; shutting down orchestrator");
            }
            _ = self.shutdown.cancelled() => {
                tracing::info!("orchestrator shutdown token cancelled");
            }
        }
        Ok(self.shutdown().await)
    }
}
