//! Workload generation
//!
//! A `LoadTest` describes one kind of domain load. It hands out an `ItemSource`
//! per run, and the `WorkloadGenerator` wraps that source with the run's item
//! budget, numbering each `WorkItem` it produces.
//!
//! - `issue::SelfIssueTest`: nodes issue tokens to themselves
//! - `transfer::TransferTest`: issued tokens move between nodes

pub mod issue;
pub mod transfer;

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CollabError;
use crate::fleet::{NodeDirectory, NodeId};

pub use issue::SelfIssueTest;
pub use transfer::TransferTest;

/// Largest amount one item may move. Keeps running sums far from `i64::MAX`.
pub const MAX_ITEM_AMOUNT: i64 = 1 << 40;

/// Check an amount bound taken from configuration
pub(crate) fn validate_max_amount(max_amount: i64) -> Result<(), String> {
    if !(1..=MAX_ITEM_AMOUNT).contains(&max_amount) {
        return Err(format!(
            "max_amount must be within 1..={}, got {}",
            MAX_ITEM_AMOUNT, max_amount
        ));
    }
    Ok(())
}

/// Identifier of a generated work item, unique within a run
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkItemId(pub u64);

impl fmt::Display for WorkItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The domain action a work item performs
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum WorkKind {
    /// `node` issues `amount` of `token` to itself
    Issue {
        node: NodeId,
        token: String,
        amount: i64,
    },
    /// `from` moves `amount` of `token` to `to`
    Transfer {
        from: NodeId,
        to: NodeId,
        token: String,
        amount: i64,
    },
}

/// Predicted change to one tracked field of one node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Effect {
    pub node: NodeId,
    pub field: String,
    pub delta: i64,
}

/// One generated unit of load. Consumed exactly once by a worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,
    /// Set when this item resubmits the action of a failed item
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<WorkItemId>,
    pub kind: WorkKind,
}

impl WorkItem {
    /// Node the action is submitted to
    pub fn executor(&self) -> &NodeId {
        match &self.kind {
            WorkKind::Issue { node, .. } => node,
            WorkKind::Transfer { from, .. } => from,
        }
    }

    /// Every node whose predicted state this item changes
    pub fn targets(&self) -> Vec<&NodeId> {
        match &self.kind {
            WorkKind::Issue { node, .. } => vec![node],
            WorkKind::Transfer { from, to, .. } => vec![from, to],
        }
    }

    /// Effect of a successful execution on the predicted state
    pub fn effects(&self) -> Vec<Effect> {
        match &self.kind {
            WorkKind::Issue {
                node,
                token,
                amount,
            } => vec![Effect {
                node: node.clone(),
                field: token.clone(),
                delta: *amount,
            }],
            WorkKind::Transfer {
                from,
                to,
                token,
                amount,
            } => vec![
                Effect {
                    node: from.clone(),
                    field: token.clone(),
                    delta: -*amount,
                },
                Effect {
                    node: to.clone(),
                    field: token.clone(),
                    delta: *amount,
                },
            ],
        }
    }
}

/// What to do with an item whose execution failed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Submit the same action again under a new item id
    Retry,
    /// Generate a fresh item in its place
    Replace,
    /// Give up on it
    Drop,
}

/// Lazily produces the actions of a test. May be infinite.
pub trait ItemSource: Send {
    /// Next action, or `None` once the source has nothing more to offer
    fn next_kind(&mut self) -> Option<WorkKind>;
}

/// A kind of load test: the domain action and its failure handling
pub trait LoadTest: Send + Sync {
    /// Name used in logs and reports
    fn name(&self) -> &str;

    /// Fresh source of actions for one run
    fn source(&self, directory: &NodeDirectory, seed: u64) -> Box<dyn ItemSource>;

    /// How a failed item is handled. Defaults to generating a replacement.
    fn failure_policy(&self, _item: &WorkItem, _error: &CollabError) -> FailurePolicy {
        FailurePolicy::Replace
    }

    /// Whether execution failures alone leave the verdict passing
    fn tolerates_execution_failures(&self) -> bool {
        true
    }
}

/// Bounded, numbered sequence of work items for one run
pub struct WorkloadGenerator {
    source: Box<dyn ItemSource>,
    /// Maximum number of items to hand out (grows with `extend`)
    budget: u64,
    /// Items handed out so far
    issued: u64,
    /// Actions queued for resubmission
    resubmissions: VecDeque<(WorkItemId, WorkKind)>,
    /// Set once the source returned `None`
    source_exhausted: bool,
}

impl WorkloadGenerator {
    /// Create a generator that hands out at most `limit` items
    pub fn new(source: Box<dyn ItemSource>, limit: u64) -> Self {
        WorkloadGenerator {
            source,
            budget: limit,
            issued: 0,
            resubmissions: VecDeque::new(),
            source_exhausted: false,
        }
    }

    /// Take the next item, or `None` once the budget or the source is used up
    pub fn next_item(&mut self) -> Option<WorkItem> {
        if self.issued >= self.budget {
            return None;
        }

        let (retry_of, kind) = match self.resubmissions.pop_front() {
            Some((original, kind)) => (Some(original), kind),
            None => {
                if self.source_exhausted {
                    return None;
                }
                match self.source.next_kind() {
                    Some(kind) => (None, kind),
                    None => {
                        self.source_exhausted = true;
                        return None;
                    }
                }
            }
        };

        self.issued += 1;
        Some(WorkItem {
            id: WorkItemId(self.issued),
            retry_of,
            kind,
        })
    }

    /// Allow `n` more items to be handed out
    pub fn extend(&mut self, n: u64) {
        self.budget = self.budget.saturating_add(n);
    }

    /// Queue the action of a failed item to be handed out again
    pub fn resubmit(&mut self, item: &WorkItem) {
        let original = item.retry_of.unwrap_or(item.id);
        self.resubmissions.push_back((original, item.kind.clone()));
        self.extend(1);
    }

    /// Number of items handed out so far
    pub fn issued(&self) -> u64 {
        self.issued
    }

    /// True once no further item can be produced
    pub fn is_exhausted(&self) -> bool {
        self.issued >= self.budget || (self.source_exhausted && self.resubmissions.is_empty())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Source that yields a fixed list of issues
    pub(crate) struct FixedSource(pub VecDeque<WorkKind>);

    impl ItemSource for FixedSource {
        fn next_kind(&mut self) -> Option<WorkKind> {
            self.0.pop_front()
        }
    }

    pub(crate) fn issue(node: &str, amount: i64) -> WorkKind {
        WorkKind::Issue {
            node: NodeId::new(node),
            token: "USD".to_string(),
            amount,
        }
    }

    fn fixed(count: i64) -> Box<dyn ItemSource> {
        Box::new(FixedSource((1..=count).map(|i| issue("a", i)).collect()))
    }

    fn drain(gen: &mut WorkloadGenerator) -> Vec<WorkItem> {
        std::iter::from_fn(|| gen.next_item()).collect()
    }

    #[test]
    fn test_yields_at_most_limit() {
        let mut gen = WorkloadGenerator::new(fixed(5), 3);
        let items = drain(&mut gen);
        assert_eq!(items.len(), 3);
        assert!(gen.is_exhausted());
        assert_eq!(gen.next_item(), None);
    }

    #[test]
    fn test_yields_all_available_when_limit_is_larger() {
        let mut gen = WorkloadGenerator::new(fixed(5), 10);
        let items = drain(&mut gen);
        assert_eq!(items.len(), 5);
        assert!(gen.is_exhausted());
    }

    #[test]
    fn test_zero_limit_yields_nothing() {
        let mut gen = WorkloadGenerator::new(fixed(5), 0);
        assert_eq!(gen.next_item(), None);
        assert_eq!(gen.issued(), 0);
    }

    #[test]
    fn test_ids_are_sequential() {
        let mut gen = WorkloadGenerator::new(fixed(3), 3);
        let ids: Vec<u64> = drain(&mut gen).iter().map(|i| i.id.0).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_extend_allows_replacement_items() {
        let mut gen = WorkloadGenerator::new(fixed(5), 2);
        assert_eq!(drain(&mut gen).len(), 2);
        gen.extend(1);
        let extra = gen.next_item().unwrap();
        assert_eq!(extra.id, WorkItemId(3));
        assert_eq!(extra.kind, issue("a", 3));
    }

    #[test]
    fn test_resubmit_reuses_action_under_new_id() {
        let mut gen = WorkloadGenerator::new(fixed(5), 1);
        let first = gen.next_item().unwrap();
        assert!(gen.is_exhausted());

        gen.resubmit(&first);
        let retry = gen.next_item().unwrap();
        assert_eq!(retry.id, WorkItemId(2));
        assert_eq!(retry.retry_of, Some(first.id));
        assert_eq!(retry.kind, first.kind);

        // A retry of a retry still points at the original
        gen.resubmit(&retry);
        let again = gen.next_item().unwrap();
        assert_eq!(again.retry_of, Some(first.id));
    }

    #[test]
    fn test_transfer_effects_balance() {
        let item = WorkItem {
            id: WorkItemId(1),
            retry_of: None,
            kind: WorkKind::Transfer {
                from: NodeId::new("a"),
                to: NodeId::new("b"),
                token: "GBP".to_string(),
                amount: 40,
            },
        };
        let effects = item.effects();
        assert_eq!(effects.iter().map(|e| e.delta).sum::<i64>(), 0);
        assert_eq!(item.executor(), &NodeId::new("a"));
        assert_eq!(item.targets().len(), 2);
    }
}
