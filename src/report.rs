//! Run bookkeeping and the run report
//!
//! Tasks never share a mutable result list. Each one holds a `ResultSink`
//! and sends records over a channel; the coordinator drains the channel into
//! a `RunResult` once every task has finished.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::RunParameters;
use crate::fleet::NodeId;
use crate::workload::{FailurePolicy, WorkItemId};

/// Microsecond timestamp relative to run start
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Create a timestamp from microseconds
    pub fn from_micros(micros: u64) -> Self {
        Timestamp(micros)
    }

    /// Get the value in microseconds
    pub fn as_micros(&self) -> u64 {
        self.0
    }
}

/// Clock shared by every task of a run
#[derive(Clone, Copy, Debug)]
pub struct RunClock {
    start: Instant,
}

impl RunClock {
    pub fn start() -> Self {
        RunClock {
            start: Instant::now(),
        }
    }

    /// Current time relative to run start
    pub fn now(&self) -> Timestamp {
        Timestamp(self.start.elapsed().as_micros() as u64)
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

/// A work item whose execution failed or timed out
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExecutionFailure {
    pub item: WorkItemId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<WorkItemId>,
    /// Node the item was submitted to
    pub node: NodeId,
    pub error: String,
    /// What the test decided to do about it
    pub policy: FailurePolicy,
    pub at: Timestamp,
}

/// Predicted and observed values disagree
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Violation {
    pub node: NodeId,
    pub field: String,
    pub expected: i64,
    pub observed: i64,
    /// Check pass that found it (1-based)
    pub pass: u32,
    pub at: Timestamp,
    /// Failed items touching this node and field, which the node may have
    /// committed regardless
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub suspects: Vec<WorkItemId>,
}

/// A node could not be queried during a check pass
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Unreachable {
    pub node: NodeId,
    pub error: String,
    pub pass: u32,
    pub at: Timestamp,
}

/// One application of a disruption to one node
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DisruptionRecord {
    /// Index of the spec within its pattern
    pub spec: usize,
    pub disruption: String,
    pub node: NodeId,
    pub at: Timestamp,
    /// Set when the actuator failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A task of the run (worker, check task, disruption loop) panicked or was
/// cancelled before it finished
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TaskFailure {
    /// "worker", "checks" or "disruption"
    pub task: &'static str,
    pub error: String,
    pub at: Timestamp,
}

/// Outcome of one check pass
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CheckSummary {
    pub pass: u32,
    /// Successful completions when the pass started
    pub completions: u64,
    pub nodes_checked: usize,
    pub violations: usize,
    pub unreachable: usize,
    pub is_final: bool,
    pub at: Timestamp,
}

/// Record sent from a task to the coordinator
#[derive(Clone, Debug)]
pub enum RunEvent {
    Failure(ExecutionFailure),
    Violation(Violation),
    Unreachable(Unreachable),
    Disruption(DisruptionRecord),
    Check(CheckSummary),
    Task(TaskFailure),
}

/// Sending half of the result log, cloned into every task
#[derive(Clone, Debug)]
pub struct ResultSink {
    tx: mpsc::UnboundedSender<RunEvent>,
    clock: RunClock,
}

impl ResultSink {
    /// Create a sink and the receiving log
    pub fn channel(clock: RunClock) -> (ResultSink, ResultLog) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ResultSink { tx, clock }, ResultLog { rx })
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Append a record. Never blocks.
    pub fn record(&self, event: RunEvent) {
        // The log outlives every task of the run
        let _ = self.tx.send(event);
    }
}

/// Receiving half of the result log
pub struct ResultLog {
    rx: mpsc::UnboundedReceiver<RunEvent>,
}

impl ResultLog {
    /// Take every record sent so far, in arrival order
    pub fn drain(&mut self) -> Vec<RunEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Report of one run
#[derive(Clone, Debug, Serialize)]
pub struct RunResult {
    pub test: String,
    pub pattern: String,
    pub params: RunParameters,
    pub passed: bool,
    /// Successfully executed items
    pub successes: u64,
    /// Items handed out by the generator
    pub items_generated: u64,
    pub violations: Vec<Violation>,
    pub execution_failures: Vec<ExecutionFailure>,
    pub unreachable: Vec<Unreachable>,
    pub disruptions: Vec<DisruptionRecord>,
    /// Tasks that died; any entry fails the run
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub task_failures: Vec<TaskFailure>,
    /// Successful disruption applications
    pub disruptions_applied: u64,
    pub checks: Vec<CheckSummary>,
    pub duration_ms: u64,
}

impl RunResult {
    /// Report of a run that executed nothing
    pub fn empty(test: &str, pattern: &str, params: RunParameters) -> Self {
        RunResult {
            test: test.to_string(),
            pattern: pattern.to_string(),
            params,
            passed: true,
            successes: 0,
            items_generated: 0,
            violations: Vec::new(),
            execution_failures: Vec::new(),
            unreachable: Vec::new(),
            disruptions: Vec::new(),
            task_failures: Vec::new(),
            disruptions_applied: 0,
            checks: Vec::new(),
            duration_ms: 0,
        }
    }

    /// Sort drained records into their lists
    pub fn absorb(&mut self, events: Vec<RunEvent>) {
        for event in events {
            match event {
                RunEvent::Failure(f) => self.execution_failures.push(f),
                RunEvent::Violation(v) => self.violations.push(v),
                RunEvent::Unreachable(u) => self.unreachable.push(u),
                RunEvent::Disruption(d) => self.disruptions.push(d),
                RunEvent::Check(c) => self.checks.push(c),
                RunEvent::Task(t) => self.task_failures.push(t),
            }
        }
    }

    /// Compute the verdict from the recorded contents
    pub fn conclude(&mut self, tolerates_execution_failures: bool) {
        self.passed = self.violations.is_empty()
            && self.task_failures.is_empty()
            && (tolerates_execution_failures || self.execution_failures.is_empty());
    }

    /// Disruption applications that failed
    pub fn disruption_failures(&self) -> impl Iterator<Item = &DisruptionRecord> {
        self.disruptions.iter().filter(|d| d.error.is_some())
    }

    /// Violations found by the final pass only
    pub fn final_violations(&self) -> impl Iterator<Item = &Violation> {
        let last = self
            .checks
            .iter()
            .filter(|c| c.is_final)
            .map(|c| c.pass)
            .max();
        self.violations
            .iter()
            .filter(move |v| Some(v.pass) == last)
    }
}
