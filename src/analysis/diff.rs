//! Incremental diff: reuse prior contributions for units that did not change.

use std::collections::{BTreeMap, BTreeSet};

use super::AnalysisData;
use crate::unit::WorkUnit;

/// A caller's split of the current units into unchanged and changed ones.
///
/// The engine cannot verify the split. A unit named in both sets counts as
/// changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitPartition {
    unchanged: BTreeSet<String>,
    changed: BTreeSet<String>,
}

impl UnitPartition {
    pub fn new<U, C>(unchanged: U, changed: C) -> Self
    where
        U: IntoIterator,
        U::Item: Into<String>,
        C: IntoIterator,
        C::Item: Into<String>,
    {
        let changed: BTreeSet<String> = changed.into_iter().map(Into::into).collect();
        let unchanged = unchanged
            .into_iter()
            .map(Into::into)
            .filter(|id| !changed.contains(id))
            .collect();
        Self { unchanged, changed }
    }

    pub fn is_unchanged(&self, unit_id: &str) -> bool {
        self.unchanged.contains(unit_id)
    }

    pub fn unchanged(&self) -> &BTreeSet<String> {
        &self.unchanged
    }

    pub fn changed(&self) -> &BTreeSet<String> {
        &self.changed
    }

    /// Mark the unchanged units of `data` as analyzed, copying their
    /// contribution from `prior`. An unchanged unit without a prior
    /// contribution stays pending and is reprocessed. Returns the number of
    /// units seeded.
    pub fn seed(
        &self,
        data: &mut AnalysisData,
        prior: &BTreeMap<String, serde_json::Value>,
    ) -> usize {
        let mut seeded = 0;
        for unit in &data.units {
            if !self.is_unchanged(&unit.id) {
                continue;
            }
            if let Some(contribution) = prior.get(&unit.id) {
                data.results.insert(unit.id.clone(), contribution.clone());
                data.analyzed_group_ids.insert(unit.id.clone());
                seeded += 1;
            }
        }
        seeded
    }
}

/// Contributions of the current units, in the shape an aggregate stores.
/// Results of units no longer present are dropped; units without a result
/// contribute nothing.
pub fn splice(
    units: &[WorkUnit],
    results: &BTreeMap<String, serde_json::Value>,
) -> BTreeMap<String, serde_json::Value> {
    units
        .iter()
        .filter_map(|unit| {
            results
                .get(&unit.id)
                .map(|result| (unit.id.clone(), result.clone()))
        })
        .collect()
}
