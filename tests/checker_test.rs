//! Tests for the invariant checker.
//!
//! These drive the checker directly against a simulated fleet with a
//! hand-built predicted model, without running a coordinator.

use std::sync::Arc;
use std::time::Duration;

use ledger_loadtest::collab::DisruptionActuator;
use ledger_loadtest::model::PredictedStateModel;
use ledger_loadtest::report::RunClock;
use ledger_loadtest::testing::{SimConfig, SimulatedFleet};
use ledger_loadtest::workload::{WorkItem, WorkItemId, WorkKind};
use ledger_loadtest::{InvariantChecker, NodeId};

fn checker(fleet: &SimulatedFleet, timeout: Duration) -> InvariantChecker {
    InvariantChecker::new(Arc::new(fleet.clone()), timeout, RunClock::start())
}

fn issue(id: u64, node: &str, amount: i64) -> WorkItem {
    WorkItem {
        id: WorkItemId(id),
        retry_of: None,
        kind: WorkKind::Issue {
            node: NodeId::new(node),
            token: "USD".to_string(),
            amount,
        },
    }
}

/// Matching state yields a clean pass.
#[tokio::test]
async fn test_matching_state_is_consistent() {
    let directory = SimulatedFleet::directory(4);
    let fleet = SimulatedFleet::new(&directory);
    let model = PredictedStateModel::new(&directory);

    fleet.set_value(&NodeId::new("bank-1"), "USD", 40);
    model.apply(&issue(1, "bank-1", 40));

    let outcome = checker(&fleet, Duration::from_secs(1))
        .check(&model, &directory, 1)
        .await;
    assert!(outcome.is_consistent());
    assert_eq!(outcome.nodes_checked, 4);
    assert!(outcome.unreachable.is_empty());
}

/// A single diverging field yields exactly one violation.
#[tokio::test]
async fn test_single_mismatch_is_one_violation() {
    let directory = SimulatedFleet::directory(4);
    let fleet = SimulatedFleet::new(&directory);
    let model = PredictedStateModel::new(&directory);

    model.apply(&issue(1, "bank-1", 40));
    model.apply(&issue(2, "bank-2", 15));
    fleet.set_value(&NodeId::new("bank-1"), "USD", 40);
    fleet.set_value(&NodeId::new("bank-2"), "USD", 14);

    let outcome = checker(&fleet, Duration::from_secs(1))
        .check(&model, &directory, 3)
        .await;
    assert_eq!(outcome.violations.len(), 1);

    let violation = &outcome.violations[0];
    assert_eq!(violation.node, NodeId::new("bank-2"));
    assert_eq!(violation.field, "USD");
    assert_eq!(violation.expected, 15);
    assert_eq!(violation.observed, 14);
    assert_eq!(violation.pass, 3);
    assert!(violation.suspects.is_empty());
}

/// Fields present on only one side compare against zero.
#[tokio::test]
async fn test_missing_fields_count_as_zero() {
    let directory = SimulatedFleet::directory(3);
    let fleet = SimulatedFleet::new(&directory);
    let model = PredictedStateModel::new(&directory);

    fleet.set_value(&NodeId::new("notary"), "GBP", 0);
    fleet.set_value(&NodeId::new("bank-1"), "CHF", 7);

    let outcome = checker(&fleet, Duration::from_secs(1))
        .check(&model, &directory, 1)
        .await;
    assert_eq!(outcome.violations.len(), 1);
    assert_eq!(outcome.violations[0].field, "CHF");
    assert_eq!(outcome.violations[0].expected, 0);
    assert_eq!(outcome.violations[0].observed, 7);
}

/// Failed items touching the diverging field are listed as suspects.
#[tokio::test]
async fn test_indeterminate_items_are_suspects() {
    let directory = SimulatedFleet::directory(3);
    let fleet = SimulatedFleet::new(&directory);
    let model = PredictedStateModel::new(&directory);

    model.mark_indeterminate(&issue(9, "bank-1", 25));
    fleet.set_value(&NodeId::new("bank-1"), "USD", 25);

    let outcome = checker(&fleet, Duration::from_secs(1))
        .check(&model, &directory, 1)
        .await;
    assert_eq!(outcome.violations.len(), 1);
    assert_eq!(outcome.violations[0].suspects, vec![WorkItemId(9)]);
}

/// A node that is down is reported and skipped; the others are still checked.
#[tokio::test]
async fn test_unreachable_node_is_skipped() {
    let directory = SimulatedFleet::directory(4);
    let fleet = SimulatedFleet::new(&directory);
    let model = PredictedStateModel::new(&directory);

    let notary = NodeId::new("notary");
    fleet.take_down(&notary, Duration::from_secs(60));
    fleet.set_value(&notary, "USD", 99);

    let outcome = checker(&fleet, Duration::from_secs(1))
        .check(&model, &directory, 2)
        .await;
    assert!(outcome.is_consistent());
    assert_eq!(outcome.nodes_checked, 3);
    assert_eq!(outcome.unreachable.len(), 1);
    assert_eq!(outcome.unreachable[0].node, notary);
    assert_eq!(outcome.unreachable[0].pass, 2);
}

/// A hung node is bounded by the check timeout.
#[tokio::test(start_paused = true)]
async fn test_hung_node_times_out() {
    let directory = SimulatedFleet::directory(3);
    let fleet = SimulatedFleet::new(&directory);
    let model = PredictedStateModel::new(&directory);

    let bank = directory.get(&NodeId::new("bank-1")).unwrap().clone();
    let actuator = fleet.clone();
    let hang = tokio::spawn(async move { actuator.hang(&bank, Duration::from_secs(30)).await });
    tokio::task::yield_now().await;

    let start = tokio::time::Instant::now();
    let outcome = checker(&fleet, Duration::from_millis(500))
        .check(&model, &directory, 1)
        .await;
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(outcome.unreachable.len(), 1);
    assert_eq!(outcome.unreachable[0].error, "timed out");
    assert_eq!(outcome.nodes_checked, 2);

    hang.await.unwrap().unwrap();
}

/// Every node is queried concurrently.
#[tokio::test(start_paused = true)]
async fn test_nodes_are_queried_concurrently() {
    let directory = SimulatedFleet::directory(5);
    let config = SimConfig {
        snapshot_latency: Duration::from_millis(100),
        ..SimConfig::default()
    };
    let fleet = SimulatedFleet::with_config(&directory, config);
    let model = PredictedStateModel::new(&directory);

    let start = tokio::time::Instant::now();
    let outcome = checker(&fleet, Duration::from_secs(1))
        .check(&model, &directory, 1)
        .await;
    assert!(outcome.is_consistent());
    assert!(start.elapsed() < Duration::from_millis(200));
    assert_eq!(fleet.max_snapshots_in_flight(), 5);
}
