//! Declarative stage catalog: which entities a stage applies to, what it
//! depends on, and how long its output stays fresh.
//!
//! The catalog is validated once when it is built, so a dependency cycle is a
//! startup failure rather than something a running pipeline can hit.

use super::contract::{facts, EntityType, KnownData, StageKind};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

const DAY_SECS: u64 = 24 * 60 * 60;
const LOCATION_FRESHNESS: Duration = Duration::from_secs(30 * DAY_SECS);
const DEMOGRAPHICS_FRESHNESS: Duration = Duration::from_secs(90 * DAY_SECS);
const ENROLLMENT_FRESHNESS: Duration = Duration::from_secs(7 * DAY_SECS);
const ANALYSIS_FRESHNESS: Duration = Duration::from_secs(7 * DAY_SECS);

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum PlanningError {
    #[error("stage {0} is declared more than once in the catalog")]
    DuplicateStage(StageKind),
    #[error("stage {stage} depends on {dependency}, which is not in the catalog")]
    UnknownDependency {
        stage: StageKind,
        dependency: StageKind,
    },
    #[error("stage dependency cycle detected at {0}")]
    Cycle(StageKind),
}

/// Predicate over entity type and known facts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applicability {
    entity_types: Vec<EntityType>,
    required_facts: Vec<String>,
}

impl Applicability {
    pub fn any_entity() -> Self {
        Self {
            entity_types: vec![EntityType::School, EntityType::Location],
            required_facts: Vec::new(),
        }
    }

    pub fn only(entity_types: &[EntityType]) -> Self {
        Self {
            entity_types: entity_types.to_vec(),
            required_facts: Vec::new(),
        }
    }

    pub fn requires(mut self, fact: impl Into<String>) -> Self {
        self.required_facts.push(fact.into());
        self
    }

    pub fn entity_types(&self) -> &[EntityType] {
        &self.entity_types
    }

    pub fn required_facts(&self) -> &[String] {
        &self.required_facts
    }

    pub fn matches(&self, entity_type: EntityType, known: &KnownData) -> bool {
        self.entity_types.contains(&entity_type)
            && self.required_facts.iter().all(|fact| known.is_set(fact))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSpec {
    pub kind: StageKind,
    pub applies_to: Applicability,
    pub depends_on: Vec<StageKind>,
    /// `None` means successful output never expires; only a forced refresh
    /// runs the stage again.
    pub freshness: Option<Duration>,
}

impl StageSpec {
    pub fn new(kind: StageKind) -> Self {
        Self {
            kind,
            applies_to: Applicability::any_entity(),
            depends_on: Vec::new(),
            freshness: None,
        }
    }

    pub fn applies_to(mut self, applicability: Applicability) -> Self {
        self.applies_to = applicability;
        self
    }

    pub fn depends_on(mut self, dependencies: &[StageKind]) -> Self {
        self.depends_on = dependencies.to_vec();
        self
    }

    pub fn freshness(mut self, window: Duration) -> Self {
        self.freshness = Some(window);
        self
    }

    pub fn applies(&self, entity_type: EntityType, known: &KnownData) -> bool {
        self.applies_to.matches(entity_type, known)
    }
}

/// Validated, ordered set of stage specs. Position in the catalog breaks ties
/// between stages the dependency graph leaves unordered.
#[derive(Debug, Clone)]
pub struct StageCatalog {
    specs: Vec<StageSpec>,
    positions: HashMap<StageKind, usize>,
}

impl StageCatalog {
    pub fn new(specs: Vec<StageSpec>) -> Result<Self, PlanningError> {
        let mut positions = HashMap::with_capacity(specs.len());
        for (position, spec) in specs.iter().enumerate() {
            if positions.insert(spec.kind, position).is_some() {
                return Err(PlanningError::DuplicateStage(spec.kind));
            }
        }

        for spec in &specs {
            if let Some(dependency) = spec
                .depends_on
                .iter()
                .find(|dependency| !positions.contains_key(*dependency))
            {
                return Err(PlanningError::UnknownDependency {
                    stage: spec.kind,
                    dependency: *dependency,
                });
            }
        }

        let catalog = Self { specs, positions };
        catalog.ensure_acyclic()?;
        Ok(catalog)
    }

    /// The school/location catalog used in production.
    pub fn standard() -> Result<Self, PlanningError> {
        let school = &[EntityType::School];
        Self::new(vec![
            StageSpec::new(StageKind::Location).freshness(LOCATION_FRESHNESS),
            StageSpec::new(StageKind::Demographics)
                .depends_on(&[StageKind::Location])
                .freshness(DEMOGRAPHICS_FRESHNESS),
            StageSpec::new(StageKind::Enrollment)
                .applies_to(Applicability::only(school))
                .depends_on(&[StageKind::Location])
                .freshness(ENROLLMENT_FRESHNESS),
            StageSpec::new(StageKind::Projections)
                .applies_to(Applicability::only(school).requires(facts::HAS_ENROLLMENT))
                .depends_on(&[StageKind::Enrollment])
                .freshness(ANALYSIS_FRESHNESS),
            StageSpec::new(StageKind::Metrics)
                .applies_to(Applicability::only(school).requires(facts::HAS_ENROLLMENT))
                .depends_on(&[StageKind::Projections])
                .freshness(ANALYSIS_FRESHNESS),
            StageSpec::new(StageKind::Team)
                .applies_to(Applicability::only(school).requires(facts::TEAM_NAME)),
        ])
    }

    pub fn specs(&self) -> &[StageSpec] {
        &self.specs
    }

    pub fn spec(&self, kind: StageKind) -> Option<&StageSpec> {
        self.positions.get(&kind).map(|&position| &self.specs[position])
    }

    pub fn position(&self, kind: StageKind) -> Option<usize> {
        self.positions.get(&kind).copied()
    }

    pub fn contains(&self, kind: StageKind) -> bool {
        self.positions.contains_key(&kind)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    fn ensure_acyclic(&self) -> Result<(), PlanningError> {
        let mut graph = DiGraph::<StageKind, ()>::with_capacity(self.specs.len(), 0);
        let nodes: Vec<_> = self.specs.iter().map(|spec| graph.add_node(spec.kind)).collect();

        for (position, spec) in self.specs.iter().enumerate() {
            for dependency in &spec.depends_on {
                let from = nodes[self.positions[dependency]];
                graph.add_edge(from, nodes[position], ());
            }
        }

        toposort(&graph, None)
            .map(|_| ())
            .map_err(|cycle| PlanningError::Cycle(graph[cycle.node_id()]))
    }
}
