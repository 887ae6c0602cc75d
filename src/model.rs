//! Predicted state of the fleet
//!
//! One entry per node, each behind its own lock. Writers touching different
//! nodes never contend; writers touching the same node are serialized, so an
//! entry never shows a partially applied item.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use tracing::warn;

use crate::fleet::{NodeDirectory, NodeId};
use crate::workload::{WorkItem, WorkItemId};

/// Aggregate state of one node: tracked field -> amount
pub type Aggregate = BTreeMap<String, i64>;

/// Copy of one node's predicted entry
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PredictedEntry {
    /// Predicted value per field (absent fields are zero)
    pub values: Aggregate,
    /// Number of item effects folded into this entry
    pub applied: u64,
    /// Failed items that touch this node, with the field they touch.
    /// The node may or may not have committed them.
    pub indeterminate: Vec<(WorkItemId, String)>,
}

impl PredictedEntry {
    /// Predicted value of a field
    pub fn value(&self, field: &str) -> i64 {
        self.values.get(field).copied().unwrap_or(0)
    }
}

/// Per-node predicted aggregates for one run
pub struct PredictedStateModel {
    entries: HashMap<NodeId, Mutex<PredictedEntry>>,
}

impl PredictedStateModel {
    /// Create a model with an all-zero entry for every node in the directory
    pub fn new(directory: &NodeDirectory) -> Self {
        PredictedStateModel {
            entries: directory
                .ids()
                .map(|id| (id.clone(), Mutex::new(PredictedEntry::default())))
                .collect(),
        }
    }

    /// Replace a node's predicted values with observed ones (run start resync)
    pub fn seed(&self, node: &NodeId, values: Aggregate) {
        if let Some(entry) = self.entries.get(node) {
            let mut entry = entry.lock();
            entry.values = values;
        }
    }

    /// Fold the effects of a successfully executed item
    pub fn apply(&self, item: &WorkItem) {
        for effect in item.effects() {
            match self.entries.get(&effect.node) {
                Some(entry) => {
                    let mut entry = entry.lock();
                    *entry.values.entry(effect.field).or_insert(0) += effect.delta;
                    entry.applied += 1;
                }
                None => warn!(item = %item.id, node = %effect.node, "effect targets unknown node"),
            }
        }
    }

    /// Change one predicted value directly, bypassing execution
    pub fn adjust(&self, node: &NodeId, field: &str, delta: i64) {
        if let Some(entry) = self.entries.get(node) {
            *entry.lock().values.entry(field.to_string()).or_insert(0) += delta;
        }
    }

    /// Remember a failed item whose effects may have reached the nodes anyway
    pub fn mark_indeterminate(&self, item: &WorkItem) {
        for effect in item.effects() {
            if let Some(entry) = self.entries.get(&effect.node) {
                entry.lock().indeterminate.push((item.id, effect.field));
            }
        }
    }

    /// Consistent copy of one node's entry
    pub fn entry(&self, node: &NodeId) -> Option<PredictedEntry> {
        self.entries.get(node).map(|e| e.lock().clone())
    }

    /// Predicted value of one field on one node
    pub fn value(&self, node: &NodeId, field: &str) -> i64 {
        self.entries
            .get(node)
            .map(|e| e.lock().value(field))
            .unwrap_or(0)
    }

    /// Sum of every node's values per field
    pub fn totals(&self) -> Aggregate {
        let mut totals = Aggregate::new();
        for entry in self.entries.values() {
            for (field, amount) in &entry.lock().values {
                *totals.entry(field.clone()).or_insert(0) += amount;
            }
        }
        totals
    }
}
