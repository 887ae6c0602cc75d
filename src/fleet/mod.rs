//! Static view of the fleet under test
//!
//! - `Node`: one member of the clustered system (identity, address, roles)
//! - `NodeDirectory`: the read-only set of nodes for a run
//! - `NodeFilter`: composable predicates scoping disruptions and checks

pub mod filter;

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub use filter::NodeFilter;

/// Node identity, unique within a directory
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    /// Create a node ID from any string-like value
    pub fn new(id: impl Into<String>) -> Self {
        NodeId(id.into())
    }

    /// Borrow the identity as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Role a node plays in the cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    /// Hosts the network map service
    NetworkMap,
    /// Runs a notary service
    Notary,
    /// Ordinary participant
    Regular,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::NetworkMap => write!(f, "network-map"),
            NodeRole::Notary => write!(f, "notary"),
            NodeRole::Regular => write!(f, "regular"),
        }
    }
}

/// A member of the fleet. Immutable for the duration of a run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Unique identity
    pub id: NodeId,
    /// Network address (format: "host:port")
    pub address: String,
    /// Role tags
    pub roles: BTreeSet<NodeRole>,
}

impl Node {
    /// Create a node with the given roles
    pub fn new(
        id: impl Into<String>,
        address: impl Into<String>,
        roles: impl IntoIterator<Item = NodeRole>,
    ) -> Self {
        Node {
            id: NodeId::new(id),
            address: address.into(),
            roles: roles.into_iter().collect(),
        }
    }

    /// Check whether the node carries a role tag
    pub fn has_role(&self, role: NodeRole) -> bool {
        self.roles.contains(&role)
    }
}

/// Read-only directory of the nodes targeted by a run
#[derive(Clone, Debug)]
pub struct NodeDirectory {
    nodes: Vec<Node>,
    index: HashMap<NodeId, usize>,
}

impl NodeDirectory {
    /// Build a directory, rejecting duplicate identities
    pub fn new(nodes: Vec<Node>) -> Result<Self, ConfigError> {
        let mut index = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if index.insert(node.id.clone(), i).is_some() {
                return Err(ConfigError::Invalid(format!(
                    "duplicate node identity '{}'",
                    node.id
                )));
            }
        }
        Ok(NodeDirectory { nodes, index })
    }

    /// All nodes, in declaration order
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Look up a node by identity
    pub fn get(&self, id: &NodeId) -> Option<&Node> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    /// Nodes for which the filter holds, in declaration order
    pub fn select(&self, filter: &NodeFilter) -> Vec<&Node> {
        self.nodes.iter().filter(|n| filter.matches(n)).collect()
    }

    /// Identities of all nodes
    pub fn ids(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.iter().map(|n| &n.id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
