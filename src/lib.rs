//! Load and disruption orchestration for clustered ledger fleets
//!
//! Drives a configurable load test against a fleet of ledger nodes while
//! injecting infrastructure faults, keeps a model of the state each node
//! should be in, and periodically checks the fleet against that model.

pub mod checker;
pub mod collab;
pub mod config;
pub mod disruption;
pub mod error;
pub mod fleet;
pub mod model;
pub mod report;
pub mod runner;
pub mod workload;

/// Testing utilities for integration tests.
pub mod testing;

pub use checker::{CheckOutcome, InvariantChecker};
pub use config::{CoordinatorConfig, LoadTestConfig, RunParameters};
pub use disruption::{Disruption, DisruptionPattern, DisruptionSpec, MsRange};
pub use error::{CollabError, ConfigError, LoadTestError};
pub use fleet::{Node, NodeDirectory, NodeFilter, NodeId, NodeRole};
pub use report::RunResult;
pub use runner::RunCoordinator;
pub use workload::{FailurePolicy, LoadTest, SelfIssueTest, TransferTest};
