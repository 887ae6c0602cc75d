//! Configuration
//!
//! - `RunParameters`: the knobs of one run (parallelism, item count, ...)
//! - `CoordinatorConfig`: timeouts, limits and seed used by the coordinator
//! - `LoadTestConfig`: the run configuration file, merged over `reference.toml`

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::disruption::{DisruptionPattern, DisruptionSpec};
use crate::error::{ConfigError, LoadTestError};
use crate::fleet::{Node, NodeDirectory, NodeId, NodeRole};
use crate::workload::{LoadTest, SelfIssueTest, TransferTest};

/// Embedded defaults, overridden by the run configuration file
pub const REFERENCE_CONFIG: &str = include_str!("reference.toml");

/// Failed executions after which a run stops admitting work
pub const DEFAULT_MAX_EXECUTION_FAILURES: u64 = 1000;

/// Parameters of one run
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunParameters {
    /// Maximum number of work items in flight at once
    pub parallelism: usize,
    /// Number of successful work items after which the run ends
    pub generate_count: u64,
    /// Reset every node's persisted state before the run
    pub clear_database_before_run: bool,
    /// Successful completions between two check passes
    pub gather_frequency: u64,
}

impl Default for RunParameters {
    fn default() -> Self {
        RunParameters {
            parallelism: 4,
            generate_count: 1000,
            clear_database_before_run: false,
            gather_frequency: 100,
        }
    }
}

impl RunParameters {
    /// Check `parallelism >= 1` and `gather_frequency >= 1`
    pub fn validate(&self) -> Result<(), LoadTestError> {
        if self.parallelism == 0 {
            return Err(LoadTestError::InvalidParameters(
                "parallelism must be at least 1".to_string(),
            ));
        }
        if self.gather_frequency == 0 {
            return Err(LoadTestError::InvalidParameters(
                "gather_frequency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Timing configuration for the run coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Bound on one work item execution (default: 10s)
    pub execution_timeout: Duration,
    /// Bound on one node's state query during a check pass (default: 5s)
    pub check_timeout: Duration,
    /// Bound on one node's state reset before the run (default: 30s)
    pub reset_timeout: Duration,
    /// Pause between stopping disruptions and the final check (default: 0)
    pub settle_time: Duration,
    /// Pause a worker takes after an execution failed to reach its node
    /// (connection failure or timeout) (default: 100ms)
    pub failure_backoff: Duration,
    /// Seed for generators and disruption windows; random when `None`
    pub seed: Option<u64>,
    /// Stop admitting work after this many failed executions; unbounded when `None`
    /// (default: 1000)
    pub max_execution_failures: Option<u64>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            execution_timeout: Duration::from_secs(10),
            check_timeout: Duration::from_secs(5),
            reset_timeout: Duration::from_secs(30),
            settle_time: Duration::ZERO,
            failure_backoff: Duration::from_millis(100),
            seed: None,
            max_execution_failures: Some(DEFAULT_MAX_EXECUTION_FAILURES),
        }
    }
}

impl CoordinatorConfig {
    /// Create a new config with a custom execution timeout
    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    /// Create a new config with a custom check timeout
    pub fn with_check_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout = timeout;
        self
    }

    /// Create a new config with a custom reset timeout
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Create a new config with a custom settle time
    pub fn with_settle_time(mut self, settle: Duration) -> Self {
        self.settle_time = settle;
        self
    }

    /// Create a new config with a custom pause after unreachable-node failures
    pub fn with_failure_backoff(mut self, backoff: Duration) -> Self {
        self.failure_backoff = backoff;
        self
    }

    /// Create a new config with a fixed seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Create a new config that gives up after `limit` failed executions
    pub fn with_max_execution_failures(mut self, limit: u64) -> Self {
        self.max_execution_failures = Some(limit);
        self
    }

    /// Create a new config that never stops on failed executions
    pub fn without_failure_limit(mut self) -> Self {
        self.max_execution_failures = None;
        self
    }
}

/// One node entry of the `[fleet]` section
#[derive(Clone, Debug, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub roles: Vec<NodeRole>,
    /// Container name; defaults to `container_prefix` + `name`
    #[serde(default)]
    pub container: Option<String>,
}

/// The `[fleet]` section
#[derive(Clone, Debug, Deserialize)]
pub struct FleetConfig {
    /// Identity presented to the nodes
    pub operator: String,
    pub container_prefix: String,
    pub nodes: Vec<NodeConfig>,
}

/// The `[timeouts]` section, in milliseconds
#[derive(Clone, Debug, Deserialize)]
pub struct TimeoutConfig {
    pub execution_ms: u64,
    pub check_ms: u64,
    pub reset_ms: u64,
    pub settle_ms: u64,
    pub backoff_ms: u64,
}

/// The `[test]` section: which load test to run and its tunables
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TestSpec {
    SelfIssue(SelfIssueTest),
    Transfer(TransferTest),
}

impl TestSpec {
    /// Instantiate the load test
    pub fn build(&self) -> Arc<dyn LoadTest> {
        match self {
            TestSpec::SelfIssue(test) => Arc::new(test.clone()),
            TestSpec::Transfer(test) => Arc::new(test.clone()),
        }
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            TestSpec::SelfIssue(test) => test.validate(),
            TestSpec::Transfer(test) => test.validate(),
        }
    }
}

/// One `[[patterns]]` entry
#[derive(Clone, Debug, Deserialize)]
pub struct PatternConfig {
    pub name: String,
    #[serde(default)]
    pub disruptions: Vec<DisruptionSpec>,
}

/// Fully resolved run configuration
#[derive(Clone, Debug, Deserialize)]
pub struct LoadTestConfig {
    pub fleet: FleetConfig,
    pub run: RunParameters,
    pub timeouts: TimeoutConfig,
    pub test: TestSpec,
    #[serde(default)]
    pub seed: Option<u64>,
    /// Failed executions after which a run stops admitting work
    pub max_execution_failures: u64,
    pub include_control_run: bool,
    pub patterns: Vec<PatternConfig>,
}

impl LoadTestConfig {
    /// Load a run configuration file and merge it over the reference config
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Parse a run configuration and merge it over the reference config
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let mut merged: toml::Table = REFERENCE_CONFIG.parse()?;
        let overrides: toml::Table = text.parse()?;
        merge_tables(&mut merged, overrides);

        let config: LoadTestConfig = toml::Value::Table(merged).try_into()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.fleet.nodes.is_empty() {
            return Err(ConfigError::Invalid("fleet.nodes must not be empty".to_string()));
        }
        self.run
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        self.test
            .validate()
            .map_err(|reason| ConfigError::Invalid(format!("test: {}", reason)))?;
        if self.max_execution_failures == 0 {
            return Err(ConfigError::Invalid(
                "max_execution_failures must be at least 1".to_string(),
            ));
        }

        let mut names = std::collections::HashSet::new();
        for pattern in &self.patterns {
            if !names.insert(pattern.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate pattern name '{}'",
                    pattern.name
                )));
            }
            for spec in &pattern.disruptions {
                spec.validate().map_err(|reason| {
                    ConfigError::Invalid(format!("pattern '{}': {}", pattern.name, reason))
                })?;
            }
        }
        Ok(())
    }

    /// Build the node directory from the fleet section
    pub fn directory(&self) -> Result<NodeDirectory, ConfigError> {
        NodeDirectory::new(
            self.fleet
                .nodes
                .iter()
                .map(|n| {
                    let roles = if n.roles.is_empty() {
                        vec![NodeRole::Regular]
                    } else {
                        n.roles.clone()
                    };
                    Node::new(n.name.clone(), format!("{}:{}", n.host, n.port), roles)
                })
                .collect(),
        )
    }

    /// Container name of every node
    pub fn containers(&self) -> HashMap<NodeId, String> {
        self.fleet
            .nodes
            .iter()
            .map(|n| {
                let container = n
                    .container
                    .clone()
                    .unwrap_or_else(|| format!("{}{}", self.fleet.container_prefix, n.name));
                (NodeId::new(n.name.clone()), container)
            })
            .collect()
    }

    /// Coordinator timing derived from the timeouts section
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        let config = CoordinatorConfig::default()
            .with_execution_timeout(Duration::from_millis(self.timeouts.execution_ms))
            .with_check_timeout(Duration::from_millis(self.timeouts.check_ms))
            .with_reset_timeout(Duration::from_millis(self.timeouts.reset_ms))
            .with_settle_time(Duration::from_millis(self.timeouts.settle_ms))
            .with_failure_backoff(Duration::from_millis(self.timeouts.backoff_ms))
            .with_max_execution_failures(self.max_execution_failures);
        match self.seed {
            Some(seed) => config.with_seed(seed),
            None => config,
        }
    }

    /// Patterns to run, the control run first when enabled
    pub fn patterns(&self) -> Vec<DisruptionPattern> {
        let mut patterns = Vec::with_capacity(self.patterns.len() + 1);
        if self.include_control_run {
            patterns.push(DisruptionPattern::control());
        }
        patterns.extend(
            self.patterns
                .iter()
                .map(|p| DisruptionPattern::new(p.name.clone(), p.disruptions.clone())),
        );
        patterns
    }
}

/// Recursively merge `overrides` into `base`; override values win
fn merge_tables(base: &mut toml::Table, overrides: toml::Table) {
    for (key, value) in overrides {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}
