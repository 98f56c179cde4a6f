//! Executes the planned stages for one entity.
//!
//! The runner never aborts on a stage failure: the failing stage is recorded,
//! its dependents are skipped with [`SkipReason::UpstreamFailure`] and every
//! independent stage still runs. Each outcome is persisted before the next
//! stage is considered, so a crash mid-run leaves an accurate status trail.

use crate::pipeline::collaborators::{KnownDataSource, StatusStore};
use crate::pipeline::outcome::{
    PipelineError, PipelineResult, RunStatus, RunSummary, SkipReason, StageOutcome,
    StageStatus, StageStatusMap,
};
use crate::runtime::config::ReplanPolicy;
use crate::runtime::telemetry::Telemetry;
use crate::scheduler::task::ProcessingTask;
use crate::stages::contract::{
    EntityRef, KnownData, StageError, StageKind, StageRequest, StageResult,
};
use crate::stages::planner::StagePlanner;
use crate::stages::registry::StageRegistry;
use futures::FutureExt;
use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time::{self, Instant};

pub struct PipelineRunnerParams {
    pub planner: StagePlanner,
    pub registry: StageRegistry,
    pub status_store: Arc<dyn StatusStore>,
    pub known_data: Arc<dyn KnownDataSource>,
    pub telemetry: Arc<Telemetry>,
    pub stage_timeout: Duration,
    pub replan_policy: ReplanPolicy,
}

pub struct PipelineRunner {
    planner: StagePlanner,
    registry: StageRegistry,
    status_store: Arc<dyn StatusStore>,
    known_data: Arc<dyn KnownDataSource>,
    telemetry: Arc<Telemetry>,
    stage_timeout: Duration,
    replan_policy: ReplanPolicy,
}

/// Mutable state of a single run.
struct RunState {
    known: KnownData,
    /// Outcomes as stored before the run started. Cache decisions read these,
    /// never the pending and running writes of the current run.
    stored: StageStatusMap,
    /// Prior outcomes overlaid with everything written during this run.
    current: StageStatusMap,
    /// Every stage planned at some point during the run, in first-planned order.
    planned: Vec<StageKind>,
    visited: HashSet<StageKind>,
}

impl PipelineRunner {
    pub fn new(params: PipelineRunnerParams) -> Self {
        Self {
            planner: params.planner,
            registry: params.registry,
            status_store: params.status_store,
            known_data: params.known_data,
            telemetry: params.telemetry,
            stage_timeout: params.stage_timeout,
            replan_policy: params.replan_policy,
        }
    }

    pub fn planner(&self) -> &StagePlanner {
        &self.planner
    }

    pub fn status_store(&self) -> &Arc<dyn StatusStore> {
        &self.status_store
    }

    pub fn known_data(&self) -> &Arc<dyn KnownDataSource> {
        &self.known_data
    }

    pub async fn run(&self, task: &ProcessingTask) -> PipelineResult {
        let entity = task.entity;
        let started_at = SystemTime::now();

        let known = match self.known_data.known_data(entity).await {
            Ok(known) => known,
            Err(err) => {
                tracing::warn!(entity = %entity, error = %err, "failed to load known data");
                self.telemetry.record_run(false);
                return PipelineResult::aborted(entity, started_at, PipelineError::KnownData(err));
            }
        };

        let current = match self.status_store.get_status(entity).await {
            Ok(status) => status,
            Err(err) => {
                tracing::warn!(
                    entity = %entity,
                    error = %err,
                    "failed to read prior stage status; treating every stage as stale"
                );
                StageStatusMap::new()
            }
        };

        let requested = task.requested_stages.as_deref();
        let mut plan = match self
            .planner
            .plan_requested(entity.entity_type, &known, requested)
        {
            Ok(plan) => plan,
            Err(err) => {
                tracing::error!(entity = %entity, error = %err, "failed to plan stages");
                self.telemetry.record_run(false);
                return PipelineResult::aborted(entity, started_at, PipelineError::Planning(err));
            }
        };

        tracing::info!(
            entity = %entity,
            stages = ?plan,
            force_refresh = task.force_refresh,
            data_year = ?task.data_year,
            "starting pipeline"
        );

        let mut state = RunState {
            known,
            stored: current.clone(),
            current,
            planned: Vec::with_capacity(plan.len()),
            visited: HashSet::with_capacity(plan.len()),
        };
        self.mark_pending(entity, &plan, &mut state).await;
        self.record_run(entity, RunStatus::Processing, task, &state, None)
            .await;

        loop {
            let Some(stage) = next_unvisited(&plan, &state.visited) else {
                break;
            };
            state.visited.insert(stage);
            let executed = self.visit(task, stage, &mut state).await;
            if !executed || self.replan_policy == ReplanPolicy::OnceAtStart {
                continue;
            }

            match self
                .planner
                .plan_requested(entity.entity_type, &state.known, requested)
            {
                Ok(next) => {
                    if next != plan {
                        tracing::debug!(
                            entity = %entity,
                            after = %stage,
                            previous = ?plan,
                            next = ?next,
                            "plan changed after stage"
                        );
                    }
                    self.drop_stages(entity, &plan, &next, &mut state).await;
                    self.mark_pending(entity, &next, &mut state).await;
                    plan = next;
                }
                Err(err) => {
                    tracing::warn!(
                        entity = %entity,
                        error = %err,
                        "re-planning failed; keeping current plan"
                    );
                }
            }
        }

        let per_stage: StageStatusMap = state
            .planned
            .iter()
            .filter_map(|stage| {
                state
                    .current
                    .get(stage)
                    .map(|outcome| (*stage, outcome.clone()))
            })
            .collect();
        let failed: Vec<String> = per_stage
            .iter()
            .filter(|(_, outcome)| outcome.is_failed())
            .map(|(stage, _)| stage.to_string())
            .collect();
        let overall_succeeded = failed.is_empty();

        let (status, error) = if overall_succeeded {
            (RunStatus::Completed, None)
        } else {
            (
                RunStatus::Failed,
                Some(format!("failed stages: {}", failed.join(", "))),
            )
        };
        self.record_run(entity, status, task, &state, error).await;
        self.telemetry.record_run(overall_succeeded);

        tracing::info!(
            entity = %entity,
            succeeded = overall_succeeded,
            failed = ?failed,
            "pipeline finished"
        );

        PipelineResult {
            entity,
            per_stage,
            overall_succeeded,
            error: None,
            started_at,
            finished_at: SystemTime::now(),
        }
    }

    /// Returns `true` when the stage was invoked, `false` when it was skipped.
    async fn visit(&self, task: &ProcessingTask, stage: StageKind, state: &mut RunState) -> bool {
        let entity = task.entity;
        let spec = self.planner.catalog().spec(stage);
        let freshness = spec.and_then(|spec| spec.freshness);
        let blocked_by = spec.and_then(|spec| {
            spec.depends_on.iter().copied().find(|dependency| {
                state.visited.contains(dependency)
                    && state
                        .current
                        .get(dependency)
                        .is_some_and(StageOutcome::blocks_dependents)
            })
        });
        let prior = state.current.get(&stage).cloned();
        let reusable = !task.force_refresh
            && state
                .stored
                .get(&stage)
                .is_some_and(|stored| stored.is_reusable(freshness, SystemTime::now()));

        if let Some(dependency) = blocked_by {
            tracing::info!(
                entity = %entity,
                stage = %stage,
                dependency = %dependency,
                "skipping stage after upstream failure"
            );
            let outcome = StageOutcome::skipped(SkipReason::UpstreamFailure, prior.as_ref());
            self.telemetry.record_stage_skipped();
            self.persist(entity, stage, outcome, state).await;
            return false;
        }

        if reusable {
            tracing::debug!(entity = %entity, stage = %stage, "stage output still fresh");
            let outcome = StageOutcome::skipped(SkipReason::Cached, prior.as_ref());
            self.telemetry.record_stage_skipped();
            self.persist(entity, stage, outcome, state).await;
            return false;
        }

        self.persist(entity, stage, StageOutcome::running(prior.as_ref()), state)
            .await;

        let request = StageRequest {
            entity,
            stage,
            known_data: state.known.clone(),
            data_year: task.data_year,
        };
        let started = Instant::now();
        let outcome = match self.invoke(stage, request).await {
            Ok(updates) => {
                tracing::info!(
                    entity = %entity,
                    stage = %stage,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    facts = updates.len(),
                    "stage succeeded"
                );
                state.known.merge(updates);
                self.telemetry.record_stage_executed(true);
                StageOutcome::succeeded()
            }
            Err(err) => {
                tracing::warn!(
                    entity = %entity,
                    stage = %stage,
                    kind = ?err.kind,
                    error = %err.message,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "stage failed"
                );
                self.telemetry.record_stage_executed(false);
                StageOutcome::failed(err, prior.as_ref())
            }
        };
        self.persist(entity, stage, outcome, state).await;
        true
    }

    /// Invokes the registered implementation under the stage timeout. Panics
    /// become permanent failures and timeouts become transient ones.
    async fn invoke(&self, stage: StageKind, request: StageRequest) -> StageResult {
        let Some(implementation) = self.registry.get(stage) else {
            return Err(StageError::permanent(format!(
                "no implementation registered for stage {stage}"
            )));
        };

        let invocation =
            match std::panic::catch_unwind(AssertUnwindSafe(|| implementation.invoke(request))) {
                Ok(invocation) => invocation,
                Err(panic) => return Err(panicked(stage, panic.as_ref())),
            };

        match time::timeout(self.stage_timeout, AssertUnwindSafe(invocation).catch_unwind()).await
        {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(panicked(stage, panic.as_ref())),
            Err(_) => {
                self.telemetry.record_stage_timeout();
                Err(StageError::transient(format!(
                    "stage {stage} timed out after {:?}",
                    self.stage_timeout
                )))
            }
        }
    }

    /// Marks newly planned stages pending. A stage that an earlier re-plan
    /// dropped and this one brings back is marked pending again.
    async fn mark_pending(&self, entity: EntityRef, plan: &[StageKind], state: &mut RunState) {
        for &stage in plan {
            let returning = !state.visited.contains(&stage)
                && state.current.get(&stage).is_some_and(|outcome| {
                    outcome.status == StageStatus::Skipped(SkipReason::NotApplicable)
                });
            if state.planned.contains(&stage) && !returning {
                continue;
            }
            if !state.planned.contains(&stage) {
                state.planned.push(stage);
            }
            let outcome = StageOutcome::pending(state.current.get(&stage));
            self.persist(entity, stage, outcome, state).await;
        }
    }

    /// Persists `Skipped(NotApplicable)` for stages the re-plan removed before
    /// they were visited.
    async fn drop_stages(
        &self,
        entity: EntityRef,
        previous: &[StageKind],
        next: &[StageKind],
        state: &mut RunState,
    ) {
        for &stage in previous {
            if state.visited.contains(&stage) || next.contains(&stage) {
                continue;
            }
            tracing::debug!(entity = %entity, stage = %stage, "stage no longer applicable");
            let outcome =
                StageOutcome::skipped(SkipReason::NotApplicable, state.current.get(&stage));
            self.telemetry.record_stage_skipped();
            self.persist(entity, stage, outcome, state).await;
        }
    }

    /// Status writes are best effort: a failed write is logged and counted,
    /// and the run continues with its in-memory view.
    async fn persist(
        &self,
        entity: EntityRef,
        stage: StageKind,
        outcome: StageOutcome,
        state: &mut RunState,
    ) {
        if let Err(err) = self
            .status_store
            .set_status(entity, stage, outcome.clone())
            .await
        {
            self.telemetry.record_status_write_failure();
            tracing::warn!(
                entity = %entity,
                stage = %stage,
                status = ?outcome.status,
                error = %err,
                "failed to persist stage status"
            );
        }
        state.current.insert(stage, outcome);
    }

    async fn record_run(
        &self,
        entity: EntityRef,
        status: RunStatus,
        task: &ProcessingTask,
        state: &RunState,
        error: Option<String>,
    ) {
        let summary = RunSummary {
            status,
            stages: state.planned.clone(),
            data_year: task.data_year,
            updated_at: SystemTime::now(),
            error,
        };
        if let Err(err) = self.status_store.record_run(entity, summary).await {
            self.telemetry.record_status_write_failure();
            tracing::warn!(
                entity = %entity,
                status = ?status,
                error = %err,
                "failed to record run status"
            );
        }
    }
}

fn next_unvisited(plan: &[StageKind], visited: &HashSet<StageKind>) -> Option<StageKind> {
    plan.iter().copied().find(|stage| !visited.contains(stage))
}

fn panicked(stage: StageKind, panic: &(dyn Any + Send)) -> StageError {
    StageError::permanent(format!("stage {stage} panicked: {}", panic_message(panic)))
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
