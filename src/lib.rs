pub mod pipeline;
pub mod runtime;
pub mod scheduler;
pub mod stages;

pub use pipeline::collaborators::{
    CollaboratorError, CollaboratorFuture, KnownDataSource, StatusStore,
};
pub use pipeline::memory::{InMemoryKnownData, InMemoryStatusStore};
pub use pipeline::outcome::{
    PipelineError, PipelineResult, ProcessingSummary, RunStatus, RunSummary, SkipReason,
    StageOutcome, StageStatus, StageStatusMap,
};
pub use pipeline::runner::{PipelineRunner, PipelineRunnerParams};
pub use runtime::config::{
    ReplanPolicy, SchedulerConfig, SchedulerConfigBuilder, SchedulerConfigParams,
};
pub use runtime::orchestrator::{EntityStatus, Orchestrator, PipelinePreview, StagePreview};
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
pub use scheduler::bulk::{BulkHandle, BulkItem, BulkItemOutcome, BulkProgress, BulkSummary};
pub use scheduler::queue::{QueueStatus, TaskQueue};
pub use scheduler::task::{
    Priority, ProcessingTask, SubmitError, TaskEvent, TaskHandle, TaskId, TaskOutcome, TaskState,
};
pub use stages::catalog::{Applicability, PlanningError, StageCatalog, StageSpec};
pub use stages::contract::{
    facts, EntityId, EntityRef, EntityType, FnStage, KnownData, Stage, StageError,
    StageErrorKind, StageFuture, StageKind, StageRequest, StageResult, UnknownName,
};
pub use stages::planner::StagePlanner;
pub use stages::registry::StageRegistry;
