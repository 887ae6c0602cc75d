//! Self-issue load: every item has one node issue tokens to itself

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::{validate_max_amount, ItemSource, LoadTest, WorkKind, MAX_ITEM_AMOUNT};
use crate::fleet::{NodeDirectory, NodeFilter, NodeId};

/// Issues random amounts of random tokens on random nodes
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelfIssueTest {
    /// Tokens to issue
    pub tokens: Vec<String>,
    /// Largest amount issued by one item
    pub max_amount: i64,
    /// Nodes that issue
    pub issuers: NodeFilter,
}

impl Default for SelfIssueTest {
    fn default() -> Self {
        SelfIssueTest {
            tokens: vec!["USD".to_string(), "GBP".to_string(), "CHF".to_string()],
            max_amount: 1000,
            issuers: NodeFilter::All,
        }
    }
}

impl SelfIssueTest {
    /// Reject tunables the source cannot work with
    pub fn validate(&self) -> Result<(), String> {
        if self.tokens.is_empty() {
            return Err("self-issue tokens must not be empty".to_string());
        }
        validate_max_amount(self.max_amount)
    }
}

impl LoadTest for SelfIssueTest {
    fn name(&self) -> &str {
        "self-issue"
    }

    fn source(&self, directory: &NodeDirectory, seed: u64) -> Box<dyn ItemSource> {
        Box::new(SelfIssueSource {
            issuers: directory
                .select(&self.issuers)
                .into_iter()
                .map(|n| n.id.clone())
                .collect(),
            tokens: self.tokens.clone(),
            max_amount: self.max_amount.clamp(1, MAX_ITEM_AMOUNT),
            rng: StdRng::seed_from_u64(seed),
        })
    }
}

struct SelfIssueSource {
    issuers: Vec<NodeId>,
    tokens: Vec<String>,
    max_amount: i64,
    rng: StdRng,
}

impl ItemSource for SelfIssueSource {
    fn next_kind(&mut self) -> Option<WorkKind> {
        if self.issuers.is_empty() || self.tokens.is_empty() {
            return None;
        }
        let node = self.issuers[self.rng.random_range(0..self.issuers.len())].clone();
        let token = self.tokens[self.rng.random_range(0..self.tokens.len())].clone();
        let amount = self.rng.random_range(1..=self.max_amount);
        Some(WorkKind::Issue {
            node,
            token,
            amount,
        })
    }
}
