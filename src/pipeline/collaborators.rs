use crate::pipeline::outcome::{RunSummary, StageOutcome, StageStatusMap};
use crate::stages::contract::{EntityRef, KnownData, StageKind};
use core::future::Future;
use core::pin::Pin;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type CollaboratorFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, CollaboratorError>> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum CollaboratorError {
    #[error("entity {0} not found")]
    NotFound(EntityRef),
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
}

/// Persistent per-entity, per-stage status storage.
///
/// Writes are expected to be durable before the returned future resolves so
/// the next stage's freshness decision observes them.
pub trait StatusStore: Send + Sync + 'static {
    /// Returns every recorded stage outcome for the entity. Unknown entities
    /// yield an empty map.
    fn get_status(&self, entity: EntityRef) -> CollaboratorFuture<'_, StageStatusMap>;

    fn set_status(
        &self,
        entity: EntityRef,
        stage: StageKind,
        outcome: StageOutcome,
    ) -> CollaboratorFuture<'_, ()>;

    /// Records the run-level status. Stores without run tracking ignore it.
    fn record_run(&self, _entity: EntityRef, _summary: RunSummary) -> CollaboratorFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    /// Latest run summary per entity. Stores without run tracking report none.
    fn list_runs(&self) -> CollaboratorFuture<'_, Vec<(EntityRef, RunSummary)>> {
        Box::pin(async { Ok(Vec::new()) })
    }
}

/// Read-only access to the facts stage predicates consult.
pub trait KnownDataSource: Send + Sync + 'static {
    /// Fails with [`CollaboratorError::NotFound`] for entities the backing
    /// storage does not hold.
    fn known_data(&self, entity: EntityRef) -> CollaboratorFuture<'_, KnownData>;
}
