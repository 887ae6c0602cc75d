//! Composable node predicates
//!
//! Filters are plain values: a small boolean expression over role tags and
//! identities. They can be cloned freely and shared between disruption specs
//! and checks within one run.
//!
//! In a TOML configuration a filter reads as, for example:
//!
//! ```toml
//! filter = { or = [{ role = "network-map" }, { role = "notary" }] }
//! filter = { not = { role = "notary" } }
//! filter = "all"
//! ```

use std::ops::Not;

use serde::{Deserialize, Serialize};

use super::{Node, NodeId, NodeRole};

/// Boolean expression selecting nodes
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeFilter {
    /// Every node
    #[default]
    All,
    /// Nodes carrying the role tag
    Role(NodeRole),
    /// The node with this identity
    Name(NodeId),
    /// Both filters hold
    And(Box<NodeFilter>, Box<NodeFilter>),
    /// Either filter holds
    Or(Box<NodeFilter>, Box<NodeFilter>),
    /// The filter does not hold
    Not(Box<NodeFilter>),
}

impl NodeFilter {
    /// Nodes hosting the network map
    pub fn is_network_map() -> Self {
        NodeFilter::Role(NodeRole::NetworkMap)
    }

    /// Nodes running a notary
    pub fn is_notary() -> Self {
        NodeFilter::Role(NodeRole::Notary)
    }

    /// Ordinary participants
    pub fn is_regular() -> Self {
        NodeFilter::Role(NodeRole::Regular)
    }

    /// A single node by identity
    pub fn named(id: impl Into<String>) -> Self {
        NodeFilter::Name(NodeId::new(id))
    }

    /// Logical AND of two filters
    pub fn and(self, other: NodeFilter) -> Self {
        NodeFilter::And(Box::new(self), Box::new(other))
    }

    /// Logical OR of two filters
    pub fn or(self, other: NodeFilter) -> Self {
        NodeFilter::Or(Box::new(self), Box::new(other))
    }

    /// Evaluate the filter against one node
    pub fn matches(&self, node: &Node) -> bool {
        match self {
            NodeFilter::All => true,
            NodeFilter::Role(role) => node.has_role(*role),
            NodeFilter::Name(id) => node.id == *id,
            NodeFilter::And(a, b) => a.matches(node) && b.matches(node),
            NodeFilter::Or(a, b) => a.matches(node) || b.matches(node),
            NodeFilter::Not(inner) => !inner.matches(node),
        }
    }
}

impl Not for NodeFilter {
    type Output = NodeFilter;

    fn not(self) -> NodeFilter {
        NodeFilter::Not(Box::new(self))
    }
}
