use crate::pipeline::collaborators::CollaboratorError;
use crate::stages::catalog::PlanningError;
use crate::stages::contract::{EntityRef, EntityType, StageError, StageKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};
use thiserror::Error;

pub type StageStatusMap = BTreeMap<StageKind, StageOutcome>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Prior output is still inside the stage's freshness window.
    Cached,
    /// A dependency failed, or was itself skipped because of a failure.
    UpstreamFailure,
    /// Planned at run start but dropped when the plan was re-evaluated.
    NotApplicable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Skipped(SkipReason),
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub status: StageStatus,
    pub error: Option<StageError>,
    pub updated_at: SystemTime,
    /// When the stage last produced output. Survives later pending, skipped
    /// and failed writes so freshness is judged against real output.
    pub output_at: Option<SystemTime>,
}

impl StageOutcome {
    fn carried(status: StageStatus, prior: Option<&StageOutcome>) -> Self {
        Self {
            status,
            error: None,
            updated_at: SystemTime::now(),
            output_at: prior.and_then(|outcome| outcome.output_at),
        }
    }

    pub fn pending(prior: Option<&StageOutcome>) -> Self {
        Self::carried(StageStatus::Pending, prior)
    }

    pub fn running(prior: Option<&StageOutcome>) -> Self {
        Self::carried(StageStatus::Running, prior)
    }

    pub fn skipped(reason: SkipReason, prior: Option<&StageOutcome>) -> Self {
        Self::carried(StageStatus::Skipped(reason), prior)
    }

    pub fn failed(error: StageError, prior: Option<&StageOutcome>) -> Self {
        Self {
            error: Some(error),
            ..Self::carried(StageStatus::Failed, prior)
        }
    }

    pub fn succeeded() -> Self {
        let now = SystemTime::now();
        Self {
            status: StageStatus::Succeeded,
            error: None,
            updated_at: now,
            output_at: Some(now),
        }
    }

    /// Outcome of a stage that produced output at `at`, for seeding stores.
    pub fn succeeded_at(at: SystemTime) -> Self {
        Self {
            status: StageStatus::Succeeded,
            error: None,
            updated_at: at,
            output_at: Some(at),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == StageStatus::Failed
    }

    /// Dependents of this stage must not run.
    pub fn blocks_dependents(&self) -> bool {
        matches!(
            self.status,
            StageStatus::Failed | StageStatus::Skipped(SkipReason::UpstreamFailure)
        )
    }

    /// Output newer than `window` counts as fresh. Timestamps ahead of `now`
    /// (clock skew between writers) are treated as fresh too.
    pub fn is_fresh(&self, window: Duration, now: SystemTime) -> bool {
        match self.output_at {
            Some(at) => now.duration_since(at).map_or(true, |age| age < window),
            None => false,
        }
    }

    /// Whether a stored outcome can stand in for a fresh invocation. Only a
    /// success, or a cache hit on an earlier success, qualifies. A stage
    /// without a window keeps its output until a forced refresh.
    pub fn is_reusable(&self, window: Option<Duration>, now: SystemTime) -> bool {
        let succeeded = matches!(
            self.status,
            StageStatus::Succeeded | StageStatus::Skipped(SkipReason::Cached)
        );
        succeeded
            && match window {
                Some(window) => self.is_fresh(window, now),
                None => self.output_at.is_some(),
            }
    }
}

/// Run-level failure that prevented stages from being planned or executed.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum PipelineError {
    #[error("failed to load known data: {0}")]
    KnownData(CollaboratorError),
    #[error("planning failed: {0}")]
    Planning(PlanningError),
    #[error("pipeline aborted: {0}")]
    Aborted(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub entity: EntityRef,
    /// One outcome per planned stage. Stages that never applied are absent.
    pub per_stage: StageStatusMap,
    pub overall_succeeded: bool,
    pub error: Option<PipelineError>,
    pub started_at: SystemTime,
    pub finished_at: SystemTime,
}

impl PipelineResult {
    pub fn aborted(entity: EntityRef, started_at: SystemTime, error: PipelineError) -> Self {
        Self {
            entity,
            per_stage: StageStatusMap::new(),
            overall_succeeded: false,
            error: Some(error),
            started_at,
            finished_at: SystemTime::now(),
        }
    }

    pub fn outcome(&self, stage: StageKind) -> Option<&StageOutcome> {
        self.per_stage.get(&stage)
    }

    pub fn status(&self, stage: StageKind) -> Option<StageStatus> {
        self.per_stage.get(&stage).map(|outcome| outcome.status)
    }

    pub fn stages_with(&self, status: StageStatus) -> Vec<StageKind> {
        self.per_stage
            .iter()
            .filter(|(_, outcome)| outcome.status == status)
            .map(|(stage, _)| *stage)
            .collect()
    }

    pub fn failed_stages(&self) -> Vec<StageKind> {
        self.stages_with(StageStatus::Failed)
    }

    pub fn executed_stages(&self) -> Vec<StageKind> {
        self.per_stage
            .iter()
            .filter(|(_, outcome)| {
                matches!(outcome.status, StageStatus::Succeeded | StageStatus::Failed)
            })
            .map(|(stage, _)| *stage)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Processing,
    Completed,
    Failed,
}

/// Run-level record kept next to the per-stage outcomes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub status: RunStatus,
    pub stages: Vec<StageKind>,
    pub data_year: Option<i32>,
    pub updated_at: SystemTime,
    pub error: Option<String>,
}

/// Entries kept in [`ProcessingSummary::recent`].
pub const RECENT_ACTIVITY_LIMIT: usize = 10;

/// Run counts across every entity with a recorded run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessingSummary {
    pub total: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub by_entity_type: BTreeMap<EntityType, usize>,
    /// Entities whose latest run is still processing.
    pub active: Vec<EntityRef>,
    /// Most recently updated runs, newest first.
    pub recent: Vec<(EntityRef, RunSummary)>,
}

impl ProcessingSummary {
    pub fn from_runs(runs: Vec<(EntityRef, RunSummary)>) -> Self {
        let mut summary = Self {
            total: runs.len(),
            ..Self::default()
        };
        for (entity, run) in &runs {
            match run.status {
                RunStatus::Processing => {
                    summary.processing += 1;
                    summary.active.push(*entity);
                }
                RunStatus::Completed => summary.completed += 1,
                RunStatus::Failed => summary.failed += 1,
            }
            *summary.by_entity_type.entry(entity.entity_type).or_default() += 1;
        }
        summary.active.sort();

        let mut recent = runs;
        recent.sort_by(|(_, a), (_, b)| b.updated_at.cmp(&a.updated_at));
        recent.truncate(RECENT_ACTIVITY_LIMIT);
        summary.recent = recent;
        summary
    }
}
