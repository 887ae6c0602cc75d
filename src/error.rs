//! Error types
//!
//! Only `LoadTestError` escapes a run, and only for setup failures. Every other
//! problem found during a run is recorded in the `RunResult`.

use thiserror::Error;

use crate::fleet::NodeId;

/// Failure reported by an external collaborator (RPC handle, actuator)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollabError {
    /// Connection to the node failed
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    /// The call did not complete within its deadline
    #[error("timed out")]
    Timeout,
    /// The node answered but refused the request
    #[error("rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },
    /// The node answered with something we could not interpret
    #[error("protocol error: {0}")]
    Protocol(String),
    /// An infrastructure command failed
    #[error("command failed: {0}")]
    Command(String),
}

/// Errors raised while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read
    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),
    /// The configuration is not valid TOML or does not match the schema
    #[error("cannot parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    /// The configuration parsed but violates a constraint
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Setup failures that abort a run before any work starts
#[derive(Debug, Error)]
pub enum LoadTestError {
    /// Run parameters violate their invariants
    #[error("invalid run parameters: {0}")]
    InvalidParameters(String),
    /// Configuration could not be resolved
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Clearing a node's state before the run failed
    #[error("failed to reset node {node}: {source}")]
    Reset {
        node: NodeId,
        #[source]
        source: CollabError,
    },
    /// Reading a node's state to seed the prediction failed
    #[error("failed to resync predicted state from node {node}: {source}")]
    Resync {
        node: NodeId,
        #[source]
        source: CollabError,
    },
}
