use crate::pipeline::outcome::PipelineResult;
use crate::stages::contract::{EntityRef, StageKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;
use tokio::sync::watch;

/// Ordering key of the pending queue. Declaration order matters: `High`
/// compares greatest.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            other => Err(format!("unknown priority `{other}`")),
        }
    }
}

/// Monotonic identifier assigned at admission. Lower ids were admitted first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// A request to run the pipeline for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingTask {
    pub entity: EntityRef,
    pub priority: Priority,
    /// Ignore freshness windows and execute every applicable stage.
    pub force_refresh: bool,
    /// Restrict the run to these stages. Stages the planner does not select
    /// are still left out.
    pub requested_stages: Option<Vec<StageKind>>,
    pub data_year: Option<i32>,
    pub submitted_at: SystemTime,
}

impl ProcessingTask {
    pub fn new(entity: EntityRef) -> Self {
        Self {
            entity,
            priority: Priority::Normal,
            force_refresh: false,
            requested_stages: None,
            data_year: None,
            submitted_at: SystemTime::now(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn force_refresh(mut self, force: bool) -> Self {
        self.force_refresh = force;
        self
    }

    pub fn only_stages(mut self, stages: impl IntoIterator<Item = StageKind>) -> Self {
        self.requested_stages = Some(stages.into_iter().collect());
        self
    }

    pub fn data_year(mut self, year: i32) -> Self {
        self.data_year = Some(year);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskState {
    Queued,
    Running,
    Finished(Arc<PipelineResult>),
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Finished(_) | TaskState::Cancelled)
    }

    fn outcome(&self) -> Option<TaskOutcome> {
        match self {
            TaskState::Finished(result) => Some(TaskOutcome::Completed(result.clone())),
            TaskState::Cancelled => Some(TaskOutcome::Cancelled),
            TaskState::Queued | TaskState::Running => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed(Arc<PipelineResult>),
    /// Removed from the queue by shutdown before a worker claimed it.
    Cancelled,
}

impl TaskOutcome {
    pub fn result(&self) -> Option<&PipelineResult> {
        match self {
            TaskOutcome::Completed(result) => Some(result),
            TaskOutcome::Cancelled => None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.result().is_some_and(|result| result.overall_succeeded)
    }
}

/// Cheap, cloneable view of an admitted task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: TaskId,
    entity: EntityRef,
    priority: Priority,
    state: watch::Receiver<TaskState>,
}

impl TaskHandle {
    pub(crate) fn new(
        id: TaskId,
        entity: EntityRef,
        priority: Priority,
        state: watch::Receiver<TaskState>,
    ) -> Self {
        Self {
            id,
            entity,
            priority,
            state,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn entity(&self) -> EntityRef {
        self.entity
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn state(&self) -> TaskState {
        self.state.borrow().clone()
    }

    /// Resolves once the task finishes or is cancelled.
    pub async fn wait(&self) -> TaskOutcome {
        let mut state = self.state.clone();
        let terminal = state
            .wait_for(TaskState::is_terminal)
            .await
            .ok()
            .and_then(|state| state.outcome());
        // A dropped sender without a terminal state means the worker never
        // reported back.
        terminal
            .or_else(|| self.state.borrow().outcome())
            .unwrap_or(TaskOutcome::Cancelled)
    }
}

/// Lifecycle notifications fanned out to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    Queued {
        id: TaskId,
        entity: EntityRef,
        priority: Priority,
    },
    Started {
        id: TaskId,
        entity: EntityRef,
    },
    Finished {
        id: TaskId,
        entity: EntityRef,
        succeeded: bool,
    },
    Cancelled {
        id: TaskId,
        entity: EntityRef,
    },
}

impl TaskEvent {
    pub fn entity(&self) -> EntityRef {
        match self {
            TaskEvent::Queued { entity, .. }
            | TaskEvent::Started { entity, .. }
            | TaskEvent::Finished { entity, .. }
            | TaskEvent::Cancelled { entity, .. } => *entity,
        }
    }

    pub fn id(&self) -> TaskId {
        match self {
            TaskEvent::Queued { id, .. }
            | TaskEvent::Started { id, .. }
            | TaskEvent::Finished { id, .. }
            | TaskEvent::Cancelled { id, .. } => *id,
        }
    }
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("queue is saturated ({capacity} pending tasks)")]
    QueueSaturated { capacity: usize },
    #[error("entity {} already has {} in flight", .existing.entity(), .existing.id())]
    DuplicateRejected { existing: TaskHandle },
    #[error("scheduler is shutting down")]
    ShuttingDown,
}

impl SubmitError {
    /// Saturation is the only rejection that may clear up on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SubmitError::QueueSaturated { .. })
    }
}
