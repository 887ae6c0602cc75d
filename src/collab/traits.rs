//! Collaborator abstractions
//!
//! Failures surface as `CollabError` and are recorded by the caller as
//! execution failures, unreachable nodes or disruption failures.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::CollabError;
use crate::fleet::Node;
use crate::model::Aggregate;
use crate::workload::WorkItem;

/// Provides live RPC handles to fleet nodes
#[async_trait]
pub trait NodeConnector: Send + Sync {
    /// Return a handle for the node, connecting if needed
    async fn connect(&self, node: &Node) -> Result<Arc<dyn NodeRpc>, CollabError>;
}

/// RPC handle to one node
#[async_trait]
pub trait NodeRpc: Send + Sync {
    /// Execute a work item's domain action on the node
    async fn execute(&self, item: &WorkItem) -> Result<(), CollabError>;

    /// Current observable aggregate state of the node
    async fn snapshot(&self) -> Result<Aggregate, CollabError>;

    /// Clear the node's persisted state
    async fn reset(&self) -> Result<(), CollabError>;
}

/// Infrastructure-level fault injection
#[async_trait]
pub trait DisruptionActuator: Send + Sync {
    /// Suspend the node's processing for `duration`, then resume it
    async fn hang(&self, node: &Node, duration: Duration) -> Result<(), CollabError>;

    /// Forcibly terminate the node process. Restarting is not our job.
    async fn kill(&self, node: &Node) -> Result<(), CollabError>;

    /// Run `parallelism` busy loops on the node's host for `duration`
    async fn strain_cpu(
        &self,
        node: &Node,
        parallelism: u32,
        duration: Duration,
    ) -> Result<(), CollabError>;
}
