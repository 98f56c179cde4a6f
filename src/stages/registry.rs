use super::contract::{Stage, StageKind};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Maps each catalog stage to the collaborator that implements it.
#[derive(Clone, Default)]
pub struct StageRegistry {
    stages: HashMap<StageKind, Arc<dyn Stage>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: StageKind, stage: impl Stage) -> &mut Self {
        self.stages.insert(kind, Arc::new(stage));
        self
    }

    pub fn with(mut self, kind: StageKind, stage: impl Stage) -> Self {
        self.register(kind, stage);
        self
    }

    pub fn with_shared(mut self, kind: StageKind, stage: Arc<dyn Stage>) -> Self {
        self.stages.insert(kind, stage);
        self
    }

    pub fn get(&self, kind: StageKind) -> Option<Arc<dyn Stage>> {
        self.stages.get(&kind).cloned()
    }

    pub fn contains(&self, kind: StageKind) -> bool {
        self.stages.contains_key(&kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = StageKind> + '_ {
        self.stages.keys().copied()
    }
}

impl fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.stages.keys().collect();
        kinds.sort();
        f.debug_struct("StageRegistry").field("stages", &kinds).finish()
    }
}
