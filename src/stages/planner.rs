use super::catalog::{PlanningError, StageCatalog};
use super::contract::{EntityType, KnownData, StageKind};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Computes the ordered, applicable stage list for an entity.
///
/// Planning is pure: the caller supplies the [`KnownData`] snapshot and the
/// planner never consults external state, so identical inputs always yield
/// the identical plan.
#[derive(Debug, Clone)]
pub struct StagePlanner {
    catalog: Arc<StageCatalog>,
}

impl StagePlanner {
    pub fn new(catalog: Arc<StageCatalog>) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &StageCatalog {
        &self.catalog
    }

    /// Filters the catalog by applicability and orders the result
    /// topologically. Dependencies outside the filtered set do not constrain
    /// the order; ties go to the stage declared first in the catalog.
    pub fn plan(
        &self,
        entity_type: EntityType,
        known: &KnownData,
    ) -> Result<Vec<StageKind>, PlanningError> {
        let specs = self.catalog.specs();
        let mut in_plan = vec![false; specs.len()];
        let mut selected = Vec::new();
        for (position, spec) in specs.iter().enumerate() {
            if spec.applies(entity_type, known) {
                in_plan[position] = true;
                selected.push(position);
            }
        }

        let mut waiting_on = vec![0usize; specs.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); specs.len()];
        for &position in &selected {
            for dependency in &specs[position].depends_on {
                let Some(dependency) = self.catalog.position(*dependency) else {
                    continue;
                };
                if in_plan[dependency] {
                    waiting_on[position] += 1;
                    dependents[dependency].push(position);
                }
            }
        }

        let mut ready: BTreeSet<usize> = selected
            .iter()
            .copied()
            .filter(|&position| waiting_on[position] == 0)
            .collect();
        let mut order = Vec::with_capacity(selected.len());

        while let Some(position) = ready.pop_first() {
            order.push(specs[position].kind);
            for &dependent in &dependents[position] {
                waiting_on[dependent] -= 1;
                if waiting_on[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        if order.len() != selected.len() {
            let stuck = selected
                .iter()
                .map(|&position| specs[position].kind)
                .find(|kind| !order.contains(kind))
                .unwrap_or(specs[selected[0]].kind);
            return Err(PlanningError::Cycle(stuck));
        }

        Ok(order)
    }

    /// Plans and then keeps only the requested stages, in planner order.
    pub fn plan_requested(
        &self,
        entity_type: EntityType,
        known: &KnownData,
        requested: Option<&[StageKind]>,
    ) -> Result<Vec<StageKind>, PlanningError> {
        let mut plan = self.plan(entity_type, known)?;
        if let Some(requested) = requested {
            plan.retain(|kind| requested.contains(kind));
        }
        Ok(plan)
    }
}
