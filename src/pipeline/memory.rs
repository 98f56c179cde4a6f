//! In-process collaborators used by tests, demos and single-node deployments.

use crate::pipeline::collaborators::{
    CollaboratorError, CollaboratorFuture, KnownDataSource, StatusStore,
};
use crate::pipeline::outcome::{RunStatus, RunSummary, StageOutcome, StageStatus, StageStatusMap};
use crate::stages::contract::{EntityRef, KnownData, StageKind};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Default)]
struct StoreState {
    stages: HashMap<EntityRef, StageStatusMap>,
    runs: HashMap<EntityRef, RunSummary>,
    history: Vec<(EntityRef, StageKind, StageStatus)>,
    reject_writes: bool,
}

#[derive(Debug, Default)]
pub struct InMemoryStatusStore {
    state: Mutex<StoreState>,
}

impl InMemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes an outcome directly, bypassing the history log.
    pub fn seed(&self, entity: EntityRef, stage: StageKind, outcome: StageOutcome) {
        let mut state = self.state.lock().expect("status store mutex poisoned");
        state.stages.entry(entity).or_default().insert(stage, outcome);
    }

    pub fn snapshot(&self, entity: EntityRef) -> StageStatusMap {
        let state = self.state.lock().expect("status store mutex poisoned");
        state.stages.get(&entity).cloned().unwrap_or_default()
    }

    pub fn run_summary(&self, entity: EntityRef) -> Option<RunSummary> {
        let state = self.state.lock().expect("status store mutex poisoned");
        state.runs.get(&entity).cloned()
    }

    /// Entities whose latest run is still marked as processing.
    pub fn active_runs(&self) -> Vec<EntityRef> {
        self.runs()
            .into_iter()
            .filter(|(_, summary)| summary.status == RunStatus::Processing)
            .map(|(entity, _)| entity)
            .collect()
    }

    /// Latest run summary per entity, ordered by entity.
    pub fn runs(&self) -> Vec<(EntityRef, RunSummary)> {
        let state = self.state.lock().expect("status store mutex poisoned");
        let mut runs: Vec<_> = state
            .runs
            .iter()
            .map(|(entity, summary)| (*entity, summary.clone()))
            .collect();
        runs.sort_by_key(|(entity, _)| *entity);
        runs
    }

    /// Every accepted stage write for the entity, oldest first.
    pub fn history(&self, entity: EntityRef) -> Vec<(StageKind, StageStatus)> {
        let state = self.state.lock().expect("status store mutex poisoned");
        state
            .history
            .iter()
            .filter(|(written, _, _)| *written == entity)
            .map(|(_, stage, status)| (*stage, *status))
            .collect()
    }

    /// While set, every write fails with [`CollaboratorError::Unavailable`].
    pub fn reject_writes(&self, reject: bool) {
        let mut state = self.state.lock().expect("status store mutex poisoned");
        state.reject_writes = reject;
    }
}

impl StatusStore for InMemoryStatusStore {
    fn get_status(&self, entity: EntityRef) -> CollaboratorFuture<'_, StageStatusMap> {
        Box::pin(async move { Ok(self.snapshot(entity)) })
    }

    fn set_status(
        &self,
        entity: EntityRef,
        stage: StageKind,
        outcome: StageOutcome,
    ) -> CollaboratorFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().expect("status store mutex poisoned");
            if state.reject_writes {
                return Err(CollaboratorError::Unavailable(
                    "status store rejects writes".to_string(),
                ));
            }
            state.history.push((entity, stage, outcome.status));
            state.stages.entry(entity).or_default().insert(stage, outcome);
            Ok(())
        })
    }

    fn record_run(&self, entity: EntityRef, summary: RunSummary) -> CollaboratorFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().expect("status store mutex poisoned");
            if state.reject_writes {
                return Err(CollaboratorError::Unavailable(
                    "status store rejects writes".to_string(),
                ));
            }
            state.runs.insert(entity, summary);
            Ok(())
        })
    }

    fn list_runs(&self) -> CollaboratorFuture<'_, Vec<(EntityRef, RunSummary)>> {
        Box::pin(async move { Ok(self.runs()) })
    }
}

#[derive(Debug, Default)]
pub struct InMemoryKnownData {
    entities: Mutex<HashMap<EntityRef, KnownData>>,
}

impl InMemoryKnownData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entity: EntityRef, known: KnownData) {
        self.entities
            .lock()
            .expect("known data mutex poisoned")
            .insert(entity, known);
    }

    /// Sets a single fact, registering the entity if needed.
    pub fn set_fact(&self, entity: EntityRef, name: &str, value: impl Into<Value>) {
        self.entities
            .lock()
            .expect("known data mutex poisoned")
            .entry(entity)
            .or_default()
            .insert(name, value);
    }

    pub fn remove(&self, entity: EntityRef) -> Option<KnownData> {
        self.entities
            .lock()
            .expect("known data mutex poisoned")
            .remove(&entity)
    }
}

impl KnownDataSource for InMemoryKnownData {
    fn known_data(&self, entity: EntityRef) -> CollaboratorFuture<'_, KnownData> {
        Box::pin(async move {
            self.entities
                .lock()
                .expect("known data mutex poisoned")
                .get(&entity)
                .cloned()
                .ok_or(CollaboratorError::NotFound(entity))
        })
    }
}
