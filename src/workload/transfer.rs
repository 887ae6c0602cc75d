//! Transfer load: tokens are issued and then moved between nodes
//!
//! The source keeps its own book of what it has generated so far and only
//! moves amounts the book says the sender holds. The book is optimistic: an
//! issue that later fails on the wire still counts, so a dependent transfer may
//! be refused by the node. Refusals are dropped rather than replaced.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::{
    validate_max_amount, FailurePolicy, ItemSource, LoadTest, WorkItem, WorkKind, MAX_ITEM_AMOUNT,
};
use crate::error::CollabError;
use crate::fleet::{NodeDirectory, NodeFilter, NodeId};

/// Mix of issues and transfers between participants
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferTest {
    /// Tokens in circulation
    pub tokens: Vec<String>,
    /// Largest amount issued by one item
    pub max_amount: i64,
    /// Probability that an item is a transfer when one is possible
    pub transfer_ratio: f64,
    /// Nodes taking part
    pub participants: NodeFilter,
}

impl Default for TransferTest {
    fn default() -> Self {
        TransferTest {
            tokens: vec!["USD".to_string(), "GBP".to_string()],
            max_amount: 1000,
            transfer_ratio: 0.7,
            participants: !NodeFilter::is_network_map(),
        }
    }
}

impl TransferTest {
    /// Reject tunables the source cannot work with
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.transfer_ratio) {
            return Err(format!(
                "transfer_ratio must be within 0..=1, got {}",
                self.transfer_ratio
            ));
        }
        if self.tokens.is_empty() {
            return Err("transfer tokens must not be empty".to_string());
        }
        validate_max_amount(self.max_amount)
    }
}

impl LoadTest for TransferTest {
    fn name(&self) -> &str {
        "transfer"
    }

    fn source(&self, directory: &NodeDirectory, seed: u64) -> Box<dyn ItemSource> {
        Box::new(TransferSource {
            nodes: directory
                .select(&self.participants)
                .into_iter()
                .map(|n| n.id.clone())
                .collect(),
            tokens: self.tokens.clone(),
            max_amount: self.max_amount.clamp(1, MAX_ITEM_AMOUNT),
            // NaN would make `random_bool` panic
            transfer_ratio: if self.transfer_ratio.is_nan() {
                0.0
            } else {
                self.transfer_ratio.clamp(0.0, 1.0)
            },
            rng: StdRng::seed_from_u64(seed),
            book: BTreeMap::new(),
        })
    }

    fn failure_policy(&self, item: &WorkItem, error: &CollabError) -> FailurePolicy {
        match (&item.kind, error) {
            (WorkKind::Transfer { .. }, CollabError::Rejected { .. }) => FailurePolicy::Drop,
            _ => FailurePolicy::Replace,
        }
    }
}

struct TransferSource {
    nodes: Vec<NodeId>,
    tokens: Vec<String>,
    max_amount: i64,
    transfer_ratio: f64,
    rng: StdRng,
    /// Generated balance per (node, token)
    book: BTreeMap<(NodeId, String), i64>,
}

impl TransferSource {
    fn issue(&mut self) -> WorkKind {
        let node = self.nodes[self.rng.random_range(0..self.nodes.len())].clone();
        let token = self.tokens[self.rng.random_range(0..self.tokens.len())].clone();
        let amount = self.rng.random_range(1..=self.max_amount);
        *self.book.entry((node.clone(), token.clone())).or_insert(0) += amount;
        WorkKind::Issue {
            node,
            token,
            amount,
        }
    }

    fn transfer(&mut self) -> Option<WorkKind> {
        let funded: Vec<((NodeId, String), i64)> = self
            .book
            .iter()
            .filter(|(_, &balance)| balance > 0)
            .map(|(k, &v)| (k.clone(), v))
            .collect();
        if funded.is_empty() {
            return None;
        }

        let ((from, token), balance) = funded[self.rng.random_range(0..funded.len())].clone();
        let receivers: Vec<&NodeId> = self.nodes.iter().filter(|n| **n != from).collect();
        let to = receivers[self.rng.random_range(0..receivers.len())].clone();
        let amount = self.rng.random_range(1..=balance);

        *self.book.entry((from.clone(), token.clone())).or_insert(0) -= amount;
        *self.book.entry((to.clone(), token.clone())).or_insert(0) += amount;

        Some(WorkKind::Transfer {
            from,
            to,
            token,
            amount,
        })
    }
}

impl ItemSource for TransferSource {
    fn next_kind(&mut self) -> Option<WorkKind> {
        if self.nodes.is_empty() || self.tokens.is_empty() {
            return None;
        }
        if self.nodes.len() >= 2 && self.rng.random_bool(self.transfer_ratio) {
            if let Some(kind) = self.transfer() {
                return Some(kind);
            }
        }
        Some(self.issue())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::{Node, NodeRole};
    use crate::workload::WorkItemId;

    fn directory() -> NodeDirectory {
        NodeDirectory::new(vec![
            Node::new("map", "h0:1", [NodeRole::NetworkMap]),
            Node::new("bank-a", "h1:1", [NodeRole::Regular]),
            Node::new("bank-b", "h2:1", [NodeRole::Regular]),
            Node::new("bank-c", "h3:1", [NodeRole::Regular]),
        ])
        .unwrap()
    }

    #[test]
    fn test_transfers_never_overdraw_the_book() {
        let test = TransferTest::default();
        let mut source = test.source(&directory(), 99);
        let mut balances: BTreeMap<(String, String), i64> = BTreeMap::new();
        let mut transfers = 0;

        for _ in 0..500 {
            match source.next_kind().unwrap() {
                WorkKind::Issue {
                    node,
                    token,
                    amount,
                } => {
                    assert_ne!(node.as_str(), "map");
                    *balances.entry((node.0, token)).or_insert(0) += amount;
                }
                WorkKind::Transfer {
                    from,
                    to,
                    token,
                    amount,
                } => {
                    transfers += 1;
                    assert_ne!(from, to);
                    let held = balances.entry((from.0, token.clone())).or_insert(0);
                    assert!(*held >= amount, "transfer of {} exceeds {}", amount, held);
                    *held -= amount;
                    *balances.entry((to.0, token)).or_insert(0) += amount;
                }
            }
        }
        assert!(transfers > 0);
    }

    #[test]
    fn test_rejected_transfers_are_dropped() {
        let test = TransferTest::default();
        let item = WorkItem {
            id: WorkItemId(1),
            retry_of: None,
            kind: WorkKind::Transfer {
                from: NodeId::new("bank-a"),
                to: NodeId::new("bank-b"),
                token: "USD".to_string(),
                amount: 5,
            },
        };
        let rejected = CollabError::Rejected {
            status: 409,
            message: "insufficient".to_string(),
        };
        assert_eq!(test.failure_policy(&item, &rejected), FailurePolicy::Drop);
        assert_eq!(
            test.failure_policy(&item, &CollabError::Timeout),
            FailurePolicy::Replace
        );
    }

    #[test]
    fn test_ratio_validation() {
        assert!(TransferTest::default().validate().is_ok());
        for transfer_ratio in [f64::NAN, f64::INFINITY, -0.1, 1.5] {
            let test = TransferTest {
                transfer_ratio,
                ..TransferTest::default()
            };
            assert!(test.validate().is_err(), "accepted {}", transfer_ratio);
        }

        let huge = TransferTest {
            max_amount: i64::MAX,
            ..TransferTest::default()
        };
        assert!(huge.validate().is_err());
    }

    #[test]
    fn test_nan_ratio_source_only_issues() {
        let test = TransferTest {
            transfer_ratio: f64::NAN,
            ..TransferTest::default()
        };
        let mut source = test.source(&directory(), 5);
        for _ in 0..20 {
            assert!(matches!(source.next_kind(), Some(WorkKind::Issue { .. })));
        }
    }

    #[test]
    fn test_single_participant_only_issues() {
        let test = TransferTest {
            participants: NodeFilter::named("bank-a"),
            transfer_ratio: 1.0,
            ..TransferTest::default()
        };
        let mut source = test.source(&directory(), 3);
        for _ in 0..20 {
            assert!(matches!(source.next_kind(), Some(WorkKind::Issue { .. })));
        }
    }
}
