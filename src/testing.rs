//! Testing utilities for coordinator integration tests
//!
//! Provides `SimulatedFleet`, an in-process fleet that implements every
//! collaborator seam (`NodeConnector`, `NodeRpc`, `DisruptionActuator`) and
//! records what was done to it: concurrent executions, state queries and
//! disruption applications. All timing uses `tokio::time`, so tests can run
//! with a paused clock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::collab::{DisruptionActuator, NodeConnector, NodeRpc};
use crate::error::CollabError;
use crate::fleet::{Node, NodeDirectory, NodeId, NodeRole};
use crate::model::Aggregate;
use crate::workload::{WorkItem, WorkKind};

/// Timing of the simulated nodes
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Time taken by one execution (default: 1ms)
    pub execution_latency: Duration,
    /// Time taken by one state query (default: 0)
    pub snapshot_latency: Duration,
    /// How long a killed node stays down (default: 50ms)
    pub restart_after: Duration,
    /// Extra execution latency while a node is CPU-strained (default: 5ms)
    pub strain_penalty: Duration,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            execution_latency: Duration::from_millis(1),
            snapshot_latency: Duration::ZERO,
            restart_after: Duration::from_millis(50),
            strain_penalty: Duration::from_millis(5),
        }
    }
}

/// A disruption the fleet received
#[derive(Debug, Clone)]
pub struct AppliedDisruption {
    pub node: NodeId,
    /// "hang", "kill" or "strain-cpu"
    pub kind: &'static str,
    pub at: Instant,
}

#[derive(Default)]
struct SimNode {
    state: Aggregate,
    down_until: Option<Instant>,
    hung_until: Option<Instant>,
    strained_until: Option<Instant>,
}

/// Faults queued for upcoming executions, consumed in arrival order
#[derive(Default)]
struct PendingFaults {
    /// Never answer
    stall: u32,
    /// Refuse without applying
    reject: u32,
    /// Apply, then report a timeout
    commit_then_fail: u32,
}

struct FleetState {
    config: SimConfig,
    nodes: Mutex<HashMap<NodeId, SimNode>>,
    faults: Mutex<PendingFaults>,
    failing_actuator: Mutex<bool>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    executions: AtomicU64,
    snapshots_in_flight: AtomicUsize,
    max_snapshots_in_flight: AtomicUsize,
    snapshots: AtomicU64,
    resets: AtomicU64,
    disruptions: Mutex<Vec<AppliedDisruption>>,
}

/// In-process fleet for tests
#[derive(Clone)]
pub struct SimulatedFleet {
    inner: Arc<FleetState>,
}

impl SimulatedFleet {
    /// Create a fleet with one simulated node per directory entry
    pub fn new(directory: &NodeDirectory) -> Self {
        Self::with_config(directory, SimConfig::default())
    }

    /// Create a fleet with custom timing
    pub fn with_config(directory: &NodeDirectory, config: SimConfig) -> Self {
        let nodes = directory
            .ids()
            .map(|id| (id.clone(), SimNode::default()))
            .collect();
        SimulatedFleet {
            inner: Arc::new(FleetState {
                config,
                nodes: Mutex::new(nodes),
                faults: Mutex::new(PendingFaults::default()),
                failing_actuator: Mutex::new(false),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                executions: AtomicU64::new(0),
                snapshots_in_flight: AtomicUsize::new(0),
                max_snapshots_in_flight: AtomicUsize::new(0),
                snapshots: AtomicU64::new(0),
                resets: AtomicU64::new(0),
                disruptions: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Directory of `count` nodes: one network map, one notary, the rest regular
    pub fn directory(count: usize) -> NodeDirectory {
        let nodes = (0..count)
            .map(|i| {
                let (name, role) = match i {
                    0 => ("network-map".to_string(), NodeRole::NetworkMap),
                    1 => ("notary".to_string(), NodeRole::Notary),
                    _ => (format!("bank-{}", i - 1), NodeRole::Regular),
                };
                Node::new(name, format!("127.0.0.1:{}", 10000 + i), [role])
            })
            .collect();
        // Names are unique by construction
        NodeDirectory::new(nodes).unwrap_or_else(|_| unreachable!())
    }

    /// Current observed value of one field
    pub fn value(&self, node: &NodeId, field: &str) -> i64 {
        self.inner
            .nodes
            .lock()
            .get(node)
            .and_then(|n| n.state.get(field).copied())
            .unwrap_or(0)
    }

    /// Current observed state of one node
    pub fn state(&self, node: &NodeId) -> Aggregate {
        self.inner
            .nodes
            .lock()
            .get(node)
            .map(|n| n.state.clone())
            .unwrap_or_default()
    }

    /// Overwrite one field on a node, bypassing execution
    pub fn set_value(&self, node: &NodeId, field: &str, value: i64) {
        if let Some(n) = self.inner.nodes.lock().get_mut(node) {
            n.state.insert(field.to_string(), value);
        }
    }

    /// Take a node down for `duration`, as if it crashed
    pub fn take_down(&self, node: &NodeId, duration: Duration) {
        if let Some(n) = self.inner.nodes.lock().get_mut(node) {
            n.down_until = Some(Instant::now() + duration);
        }
    }

    /// The next `n` executions never answer
    pub fn stall_next(&self, n: u32) {
        self.inner.faults.lock().stall += n;
    }

    /// The next `n` executions are refused
    pub fn reject_next(&self, n: u32) {
        self.inner.faults.lock().reject += n;
    }

    /// The next `n` executions commit but report a timeout
    pub fn commit_then_fail_next(&self, n: u32) {
        self.inner.faults.lock().commit_then_fail += n;
    }

    /// Make every actuator call fail
    pub fn fail_actuator(&self, failing: bool) {
        *self.inner.failing_actuator.lock() = failing;
    }

    /// Highest number of executions observed in flight at once
    pub fn max_in_flight(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }

    /// Executions that reached a node
    pub fn executions(&self) -> u64 {
        self.inner.executions.load(Ordering::SeqCst)
    }

    /// State queries served
    pub fn snapshots(&self) -> u64 {
        self.inner.snapshots.load(Ordering::SeqCst)
    }

    /// Highest number of state queries observed in flight at once
    pub fn max_snapshots_in_flight(&self) -> usize {
        self.inner.max_snapshots_in_flight.load(Ordering::SeqCst)
    }

    /// State resets served
    pub fn resets(&self) -> u64 {
        self.inner.resets.load(Ordering::SeqCst)
    }

    /// Every disruption received, in order
    pub fn disruptions(&self) -> Vec<AppliedDisruption> {
        self.inner.disruptions.lock().clone()
    }

    fn handle(&self, id: NodeId) -> SimNodeHandle {
        SimNodeHandle {
            fleet: self.inner.clone(),
            id,
        }
    }
}

impl FleetState {
    /// Wait out a hang; fail if the node is down or unknown
    async fn wait_available(&self, id: &NodeId) -> Result<(), CollabError> {
        loop {
            let hung_until = {
                let nodes = self.nodes.lock();
                let node = nodes
                    .get(id)
                    .ok_or_else(|| CollabError::ConnectionFailed(format!("unknown node {}", id)))?;
                let now = Instant::now();
                if node.down_until.is_some_and(|t| t > now) {
                    return Err(CollabError::ConnectionFailed(format!("node {} is down", id)));
                }
                match node.hung_until {
                    Some(t) if t > now => t,
                    _ => return Ok(()),
                }
            };
            tokio::time::sleep_until(hung_until).await;
        }
    }

    fn strain_penalty(&self, id: &NodeId) -> Duration {
        let nodes = self.nodes.lock();
        match nodes.get(id).and_then(|n| n.strained_until) {
            Some(t) if t > Instant::now() => self.config.strain_penalty,
            _ => Duration::ZERO,
        }
    }

    fn record(&self, node: &NodeId, kind: &'static str) {
        self.disruptions.lock().push(AppliedDisruption {
            node: node.clone(),
            kind,
            at: Instant::now(),
        });
    }

    fn actuator_check(&self) -> Result<(), CollabError> {
        if *self.failing_actuator.lock() {
            return Err(CollabError::Command("actuator unavailable".to_string()));
        }
        Ok(())
    }

    /// Apply an item's action to the fleet state
    fn commit(&self, item: &WorkItem) -> Result<(), CollabError> {
        let mut nodes = self.nodes.lock();
        match &item.kind {
            WorkKind::Issue {
                node,
                token,
                amount,
            } => {
                let target = nodes
                    .get_mut(node)
                    .ok_or_else(|| CollabError::ConnectionFailed(format!("unknown node {}", node)))?;
                *target.state.entry(token.clone()).or_insert(0) += amount;
            }
            WorkKind::Transfer {
                from,
                to,
                token,
                amount,
            } => {
                if !nodes.contains_key(to) {
                    return Err(CollabError::Rejected {
                        status: 404,
                        message: format!("unknown receiver {}", to),
                    });
                }
                let sender = nodes
                    .get_mut(from)
                    .ok_or_else(|| CollabError::ConnectionFailed(format!("unknown node {}", from)))?;
                let held = sender.state.get(token).copied().unwrap_or(0);
                if held < *amount {
                    return Err(CollabError::Rejected {
                        status: 409,
                        message: format!("insufficient {}: {} < {}", token, held, amount),
                    });
                }
                sender.state.insert(token.clone(), held - amount);
                if let Some(receiver) = nodes.get_mut(to) {
                    *receiver.state.entry(token.clone()).or_insert(0) += amount;
                }
            }
        }
        Ok(())
    }
}

/// Decrements a gauge when dropped, including on cancellation
struct GaugeGuard<'a>(&'a AtomicUsize);

impl<'a> GaugeGuard<'a> {
    fn enter(gauge: &'a AtomicUsize, max: &AtomicUsize) -> Self {
        let current = gauge.fetch_add(1, Ordering::SeqCst) + 1;
        max.fetch_max(current, Ordering::SeqCst);
        GaugeGuard(gauge)
    }
}

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// RPC handle to one simulated node
struct SimNodeHandle {
    fleet: Arc<FleetState>,
    id: NodeId,
}

#[async_trait]
impl NodeRpc for SimNodeHandle {
    async fn execute(&self, item: &WorkItem) -> Result<(), CollabError> {
        let fleet = &self.fleet;
        let _in_flight = GaugeGuard::enter(&fleet.in_flight, &fleet.max_in_flight);

        fleet.wait_available(&self.id).await?;
        fleet.executions.fetch_add(1, Ordering::SeqCst);

        let latency = fleet.config.execution_latency + fleet.strain_penalty(&self.id);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let (stall, reject, commit_then_fail) = {
            let mut faults = fleet.faults.lock();
            if faults.stall > 0 {
                faults.stall -= 1;
                (true, false, false)
            } else if faults.reject > 0 {
                faults.reject -= 1;
                (false, true, false)
            } else if faults.commit_then_fail > 0 {
                faults.commit_then_fail -= 1;
                (false, false, true)
            } else {
                (false, false, false)
            }
        };

        if stall {
            std::future::pending::<()>().await;
        }
        if reject {
            return Err(CollabError::Rejected {
                status: 503,
                message: "injected rejection".to_string(),
            });
        }

        fleet.commit(item)?;
        if commit_then_fail {
            return Err(CollabError::Timeout);
        }
        Ok(())
    }

    async fn snapshot(&self) -> Result<Aggregate, CollabError> {
        let fleet = &self.fleet;
        let _in_flight = GaugeGuard::enter(&fleet.snapshots_in_flight, &fleet.max_snapshots_in_flight);

        fleet.wait_available(&self.id).await?;
        if !fleet.config.snapshot_latency.is_zero() {
            tokio::time::sleep(fleet.config.snapshot_latency).await;
        }
        fleet.snapshots.fetch_add(1, Ordering::SeqCst);

        let nodes = fleet.nodes.lock();
        Ok(nodes
            .get(&self.id)
            .map(|n| n.state.clone())
            .unwrap_or_default())
    }

    async fn reset(&self) -> Result<(), CollabError> {
        self.fleet.wait_available(&self.id).await?;
        self.fleet.resets.fetch_add(1, Ordering::SeqCst);
        if let Some(node) = self.fleet.nodes.lock().get_mut(&self.id) {
            node.state.clear();
        }
        Ok(())
    }
}

#[async_trait]
impl NodeConnector for SimulatedFleet {
    async fn connect(&self, node: &Node) -> Result<Arc<dyn NodeRpc>, CollabError> {
        if !self.inner.nodes.lock().contains_key(&node.id) {
            return Err(CollabError::ConnectionFailed(format!(
                "unknown node {}",
                node.id
            )));
        }
        Ok(Arc::new(self.handle(node.id.clone())))
    }
}

#[async_trait]
impl DisruptionActuator for SimulatedFleet {
    async fn hang(&self, node: &Node, duration: Duration) -> Result<(), CollabError> {
        self.inner.actuator_check()?;
        if let Some(n) = self.inner.nodes.lock().get_mut(&node.id) {
            n.hung_until = Some(Instant::now() + duration);
        }
        self.inner.record(&node.id, "hang");
        tokio::time::sleep(duration).await;
        Ok(())
    }

    async fn kill(&self, node: &Node) -> Result<(), CollabError> {
        self.inner.actuator_check()?;
        let restart_after = self.inner.config.restart_after;
        if let Some(n) = self.inner.nodes.lock().get_mut(&node.id) {
            n.down_until = Some(Instant::now() + restart_after);
        }
        self.inner.record(&node.id, "kill");
        Ok(())
    }

    async fn strain_cpu(
        &self,
        node: &Node,
        _parallelism: u32,
        duration: Duration,
    ) -> Result<(), CollabError> {
        self.inner.actuator_check()?;
        if let Some(n) = self.inner.nodes.lock().get_mut(&node.id) {
            n.strained_until = Some(Instant::now() + duration);
        }
        self.inner.record(&node.id, "strain-cpu");
        tokio::time::sleep(duration).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::WorkItemId;

    fn issue(node: &str, amount: i64) -> WorkItem {
        WorkItem {
            id: WorkItemId(1),
            retry_of: None,
            kind: WorkKind::Issue {
                node: NodeId::new(node),
                token: "USD".to_string(),
                amount,
            },
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_and_snapshot() {
        let dir = SimulatedFleet::directory(3);
        let fleet = SimulatedFleet::new(&dir);
        let node = dir.get(&NodeId::new("bank-1")).unwrap();
        let rpc = fleet.connect(node).await.unwrap();

        rpc.execute(&issue("bank-1", 25)).await.unwrap();
        let state = rpc.snapshot().await.unwrap();
        assert_eq!(state.get("USD"), Some(&25));
        assert_eq!(fleet.executions(), 1);

        rpc.reset().await.unwrap();
        assert!(rpc.snapshot().await.unwrap().is_empty());
        assert_eq!(fleet.resets(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_killed_node_refuses_until_restart() {
        let dir = SimulatedFleet::directory(3);
        let fleet = SimulatedFleet::new(&dir);
        let node = dir.get(&NodeId::new("notary")).unwrap();

        fleet.kill(node).await.unwrap();
        let rpc = fleet.connect(node).await.unwrap();
        assert!(matches!(
            rpc.snapshot().await,
            Err(CollabError::ConnectionFailed(_))
        ));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rpc.snapshot().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hang_delays_calls() {
        let dir = SimulatedFleet::directory(3);
        let fleet = SimulatedFleet::new(&dir);
        let node = dir.get(&NodeId::new("bank-1")).unwrap().clone();

        let actuator = fleet.clone();
        let hung = node.clone();
        tokio::spawn(async move { actuator.hang(&hung, Duration::from_millis(500)).await });
        tokio::task::yield_now().await;

        let start = Instant::now();
        let rpc = fleet.connect(&node).await.unwrap();
        rpc.snapshot().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(500));
        assert_eq!(fleet.disruptions().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transfer_rejected_without_funds() {
        let dir = SimulatedFleet::directory(4);
        let fleet = SimulatedFleet::new(&dir);
        let node = dir.get(&NodeId::new("bank-1")).unwrap();
        let rpc = fleet.connect(node).await.unwrap();

        let transfer = WorkItem {
            id: WorkItemId(2),
            retry_of: None,
            kind: WorkKind::Transfer {
                from: NodeId::new("bank-1"),
                to: NodeId::new("bank-2"),
                token: "USD".to_string(),
                amount: 10,
            },
        };
        assert!(matches!(
            rpc.execute(&transfer).await,
            Err(CollabError::Rejected { status: 409, .. })
        ));

        rpc.execute(&issue("bank-1", 30)).await.unwrap();
        rpc.execute(&transfer).await.unwrap();
        assert_eq!(fleet.value(&NodeId::new("bank-1"), "USD"), 20);
        assert_eq!(fleet.value(&NodeId::new("bank-2"), "USD"), 10);
    }
}
