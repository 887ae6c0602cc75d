//! Disruption engine
//!
//! Each `DisruptionSpec` of the active pattern gets its own loop: wait a quiet
//! period drawn from its window, apply the disruption to every node the
//! filter selects, repeat until shut down. Loops know nothing about each other
//! and may target the same nodes.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collab::DisruptionActuator;
use crate::error::CollabError;
use crate::fleet::{Node, NodeDirectory, NodeFilter};
use crate::report::{DisruptionRecord, ResultSink, RunEvent, TaskFailure};

/// Inclusive range of milliseconds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsRange {
    pub min: u64,
    pub max: u64,
}

impl MsRange {
    pub fn new(min: u64, max: u64) -> Self {
        MsRange { min, max }
    }

    /// Uniformly random duration within the range
    pub fn draw(&self, rng: &mut StdRng) -> Duration {
        let (lo, hi) = if self.min <= self.max {
            (self.min, self.max)
        } else {
            (self.max, self.min)
        };
        Duration::from_millis(rng.random_range(lo..=hi))
    }
}

/// Fault-injection action, with its parameters
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Disruption {
    /// Suspend the node for a duration drawn from `min_ms..=max_ms`
    Hang { min_ms: u64, max_ms: u64 },
    /// Terminate the node process
    Kill,
    /// Spin `parallelism` busy loops on the node for `duration_secs`
    StrainCpu { parallelism: u32, duration_secs: u64 },
}

impl Disruption {
    pub fn hang(min_ms: u64, max_ms: u64) -> Self {
        Disruption::Hang { min_ms, max_ms }
    }

    pub fn kill() -> Self {
        Disruption::Kill
    }

    pub fn strain_cpu(parallelism: u32, duration_secs: u64) -> Self {
        Disruption::StrainCpu {
            parallelism,
            duration_secs,
        }
    }

    /// Draw the random parameters of one application
    pub fn resolve(&self, rng: &mut StdRng) -> Fault {
        match self {
            Disruption::Hang { min_ms, max_ms } => {
                Fault::Hang(MsRange::new(*min_ms, *max_ms).draw(rng))
            }
            Disruption::Kill => Fault::Kill,
            Disruption::StrainCpu {
                parallelism,
                duration_secs,
            } => Fault::StrainCpu {
                parallelism: *parallelism,
                duration: Duration::from_secs(*duration_secs),
            },
        }
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            Disruption::Hang { min_ms, max_ms } if min_ms > max_ms => {
                Err(format!("hang range {}..={} is empty", min_ms, max_ms))
            }
            Disruption::StrainCpu { parallelism: 0, .. } => {
                Err("strain-cpu parallelism must be at least 1".to_string())
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Disruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disruption::Hang { min_ms, max_ms } => write!(f, "hang({}..={}ms)", min_ms, max_ms),
            Disruption::Kill => write!(f, "kill"),
            Disruption::StrainCpu {
                parallelism,
                duration_secs,
            } => write!(f, "strain-cpu({}x{}s)", parallelism, duration_secs),
        }
    }
}

/// A disruption with its random parameters drawn, ready to apply
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    Hang(Duration),
    Kill,
    StrainCpu { parallelism: u32, duration: Duration },
}

impl Fault {
    /// Apply to one node through the actuator
    pub async fn apply(
        &self,
        actuator: &dyn DisruptionActuator,
        node: &Node,
    ) -> Result<(), CollabError> {
        match *self {
            Fault::Hang(duration) => actuator.hang(node, duration).await,
            Fault::Kill => actuator.kill(node).await,
            Fault::StrainCpu {
                parallelism,
                duration,
            } => actuator.strain_cpu(node, parallelism, duration).await,
        }
    }
}

/// A disruption, the nodes it targets and its quiet-period window
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisruptionSpec {
    pub disruption: Disruption,
    #[serde(default)]
    pub filter: NodeFilter,
    /// Quiet period before each application is drawn from this range
    pub window_ms: MsRange,
}

impl DisruptionSpec {
    pub fn new(disruption: Disruption, filter: NodeFilter, window_ms: MsRange) -> Self {
        DisruptionSpec {
            disruption,
            filter,
            window_ms,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.window_ms.min > self.window_ms.max {
            return Err(format!(
                "window {}..={}ms is empty",
                self.window_ms.min, self.window_ms.max
            ));
        }
        self.disruption.validate()
    }
}

/// Disruption specs active together during one run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DisruptionPattern {
    pub name: String,
    pub specs: Vec<DisruptionSpec>,
}

impl DisruptionPattern {
    pub fn new(name: impl Into<String>, specs: Vec<DisruptionSpec>) -> Self {
        DisruptionPattern {
            name: name.into(),
            specs,
        }
    }

    /// The empty pattern: no injected failures
    pub fn control() -> Self {
        DisruptionPattern::new("control", Vec::new())
    }

    pub fn is_control(&self) -> bool {
        self.specs.is_empty()
    }
}

/// Starts disruption loops for a run
pub struct DisruptionEngine {
    directory: Arc<NodeDirectory>,
    actuator: Arc<dyn DisruptionActuator>,
    sink: ResultSink,
}

impl DisruptionEngine {
    pub fn new(
        directory: Arc<NodeDirectory>,
        actuator: Arc<dyn DisruptionActuator>,
        sink: ResultSink,
    ) -> Self {
        DisruptionEngine {
            directory,
            actuator,
            sink,
        }
    }

    /// Spawn one loop per spec of the pattern
    pub fn start(&self, pattern: &DisruptionPattern, seed: u64) -> DisruptionLoops {
        let shutdown = CancellationToken::new();
        let mut tasks = JoinSet::new();

        for (index, spec) in pattern.specs.iter().enumerate() {
            let disruption_loop = DisruptionLoop {
                index,
                spec: spec.clone(),
                directory: self.directory.clone(),
                actuator: self.actuator.clone(),
                sink: self.sink.clone(),
                rng: StdRng::seed_from_u64(seed.wrapping_add(index as u64)),
                shutdown: shutdown.clone(),
            };
            tasks.spawn(disruption_loop.run());
        }

        if !pattern.is_control() {
            info!(pattern = %pattern.name, loops = pattern.specs.len(), "disruption loops started");
        }

        DisruptionLoops {
            tasks,
            shutdown,
            sink: self.sink.clone(),
        }
    }
}

/// Handle on the running loops of one pattern
pub struct DisruptionLoops {
    tasks: JoinSet<u64>,
    shutdown: CancellationToken,
    sink: ResultSink,
}

impl DisruptionLoops {
    /// Signal every loop to stop and wait for their current step to finish.
    /// Returns the number of node applications performed.
    pub async fn stop(mut self) -> u64 {
        self.shutdown.cancel();
        let mut applied = 0;
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(count) => applied += count,
                Err(e) => {
                    warn!(error = %e, "disruption loop task failed");
                    record_task_failure(&self.sink, &e);
                }
            }
        }
        applied
    }
}

struct DisruptionLoop {
    index: usize,
    spec: DisruptionSpec,
    directory: Arc<NodeDirectory>,
    actuator: Arc<dyn DisruptionActuator>,
    sink: ResultSink,
    rng: StdRng,
    shutdown: CancellationToken,
}

impl DisruptionLoop {
    async fn run(mut self) -> u64 {
        let mut applied = 0;

        loop {
            let quiet = self.spec.window_ms.draw(&mut self.rng);
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(quiet) => {}
            }

            applied += self.apply_once().await;
        }

        debug!(spec = self.index, applied, "disruption loop stopped");
        applied
    }

    /// Apply the disruption to every selected node, concurrently, and wait
    /// for all of them
    async fn apply_once(&mut self) -> u64 {
        let targets: Vec<Node> = self
            .directory
            .select(&self.spec.filter)
            .into_iter()
            .cloned()
            .collect();

        let mut applications = JoinSet::new();
        for node in targets {
            let fault = self.spec.disruption.resolve(&mut self.rng);
            let actuator = self.actuator.clone();
            let at = self.sink.now();
            applications.spawn(async move {
                let outcome = fault.apply(actuator.as_ref(), &node).await;
                (node, at, outcome)
            });
        }

        let name = self.spec.disruption.to_string();
        let mut applied = 0;
        while let Some(joined) = applications.join_next().await {
            let (node, at, outcome) = match joined {
                Ok(done) => done,
                Err(e) => {
                    warn!(spec = self.index, error = %e, "disruption task failed");
                    record_task_failure(&self.sink, &e);
                    continue;
                }
            };
            let error = match outcome {
                Ok(()) => {
                    applied += 1;
                    debug!(spec = self.index, node = %node.id, disruption = %name, "disruption applied");
                    None
                }
                Err(e) => {
                    warn!(spec = self.index, node = %node.id, disruption = %name, error = %e, "disruption failed");
                    Some(e.to_string())
                }
            };
            self.sink.record(RunEvent::Disruption(DisruptionRecord {
                spec: self.index,
                disruption: name.clone(),
                node: node.id,
                at,
                error,
            }));
        }
        applied
    }
}

fn record_task_failure(sink: &ResultSink, error: &tokio::task::JoinError) {
    sink.record(RunEvent::Task(TaskFailure {
        task: "disruption",
        error: error.to_string(),
        at: sink.now(),
    }));
}
