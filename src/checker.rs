//! Invariant checker
//!
//! Compares every node's observed aggregate state with the predicted model.
//! Nodes are queried concurrently, each under its own timeout. A node that
//! cannot be queried is reported as unreachable and skipped; the pass still
//! completes for the others. The checker only reads the model.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::collab::NodeConnector;
use crate::error::CollabError;
use crate::fleet::{NodeDirectory, NodeId};
use crate::model::{Aggregate, PredictedStateModel};
use crate::report::{RunClock, Unreachable, Violation};

/// Result of one check pass
#[derive(Debug, Default)]
pub struct CheckOutcome {
    /// Mismatches, in directory order then field order
    pub violations: Vec<Violation>,
    /// Nodes that could not be queried
    pub unreachable: Vec<Unreachable>,
    /// Nodes that were queried and compared
    pub nodes_checked: usize,
}

impl CheckOutcome {
    /// True when every reachable node matched its prediction
    pub fn is_consistent(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Reconciles predicted and observed state
pub struct InvariantChecker {
    connector: Arc<dyn NodeConnector>,
    timeout: Duration,
    clock: RunClock,
}

impl InvariantChecker {
    /// Create a checker bounding each node query by `timeout`
    pub fn new(connector: Arc<dyn NodeConnector>, timeout: Duration, clock: RunClock) -> Self {
        InvariantChecker {
            connector,
            timeout,
            clock,
        }
    }

    /// Run one pass over every node of the directory
    pub async fn check(
        &self,
        predicted: &PredictedStateModel,
        directory: &NodeDirectory,
        pass: u32,
    ) -> CheckOutcome {
        let mut observed = self.fetch_all(directory).await;
        let mut outcome = CheckOutcome::default();

        for node in directory.nodes() {
            let snapshot = observed
                .remove(&node.id)
                .unwrap_or_else(|| Err(CollabError::ConnectionFailed("no answer".to_string())));

            let actual = match snapshot {
                Ok(actual) => actual,
                Err(e) => {
                    warn!(pass, node = %node.id, error = %e, "node unreachable during check");
                    outcome.unreachable.push(Unreachable {
                        node: node.id.clone(),
                        error: e.to_string(),
                        pass,
                        at: self.clock.now(),
                    });
                    continue;
                }
            };

            let entry = predicted.entry(&node.id).unwrap_or_default();
            outcome.nodes_checked += 1;

            let fields: BTreeSet<&String> = entry.values.keys().chain(actual.keys()).collect();
            for field in fields {
                let expected = entry.value(field);
                let got = actual.get(field).copied().unwrap_or(0);
                if expected == got {
                    continue;
                }

                let suspects = entry
                    .indeterminate
                    .iter()
                    .filter(|(_, f)| f == field)
                    .map(|(id, _)| *id)
                    .collect::<Vec<_>>();
                warn!(
                    pass,
                    node = %node.id,
                    field = %field,
                    expected,
                    observed = got,
                    suspects = suspects.len(),
                    "predicted state mismatch"
                );
                outcome.violations.push(Violation {
                    node: node.id.clone(),
                    field: field.clone(),
                    expected,
                    observed: got,
                    pass,
                    at: self.clock.now(),
                    suspects,
                });
            }
        }

        debug!(
            pass,
            checked = outcome.nodes_checked,
            violations = outcome.violations.len(),
            unreachable = outcome.unreachable.len(),
            "check pass complete"
        );
        outcome
    }

    /// Query every node concurrently
    async fn fetch_all(
        &self,
        directory: &NodeDirectory,
    ) -> HashMap<NodeId, Result<Aggregate, CollabError>> {
        let mut queries = JoinSet::new();
        for node in directory.nodes() {
            let node = node.clone();
            let connector = self.connector.clone();
            let timeout = self.timeout;
            queries.spawn(async move {
                let query = async {
                    let rpc = connector.connect(&node).await?;
                    rpc.snapshot().await
                };
                let result = match tokio::time::timeout(timeout, query).await {
                    Ok(result) => result,
                    Err(_) => Err(CollabError::Timeout),
                };
                (node.id, result)
            });
        }

        let mut results = HashMap::with_capacity(directory.len());
        while let Some(joined) = queries.join_next().await {
            match joined {
                Ok((id, result)) => {
                    results.insert(id, result);
                }
                Err(e) => warn!(error = %e, "state query task failed"),
            }
        }
        results
    }
}
