//! Run coordinator
//!
//! Orchestrates one test run against one disruption pattern:
//! prepares the fleet, drives `parallelism` workers that execute generated
//! items, keeps the disruption loops and periodic check passes running
//! alongside, then tears everything down and runs a final check.
//!
//! Check passes are quiescent. Workers hold the read side of `gate` while an
//! item is in flight; a pass takes the write side, so it never observes a node
//! halfway through an item the model has not folded yet.
//!
//! Workers stay in the pool until admission stops. A worker that finds the
//! generator spent while other items are still in flight waits for them: a
//! failure among them may extend the budget.

use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{Notify, RwLock};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::checker::InvariantChecker;
use crate::collab::{DisruptionActuator, NodeConnector};
use crate::config::{CoordinatorConfig, RunParameters};
use crate::disruption::{DisruptionEngine, DisruptionPattern};
use crate::error::{CollabError, LoadTestError};
use crate::fleet::{Node, NodeDirectory, NodeId};
use crate::model::PredictedStateModel;
use crate::report::{
    CheckSummary, ExecutionFailure, ResultSink, RunClock, RunEvent, RunResult, TaskFailure,
};
use crate::workload::{FailurePolicy, LoadTest, WorkItem, WorkloadGenerator};

/// Drives runs against one fleet
pub struct RunCoordinator {
    directory: Arc<NodeDirectory>,
    connector: Arc<dyn NodeConnector>,
    actuator: Arc<dyn DisruptionActuator>,
    config: CoordinatorConfig,
}

impl RunCoordinator {
    pub fn new(
        directory: Arc<NodeDirectory>,
        connector: Arc<dyn NodeConnector>,
        actuator: Arc<dyn DisruptionActuator>,
        config: CoordinatorConfig,
    ) -> Self {
        RunCoordinator {
            directory,
            connector,
            actuator,
            config,
        }
    }

    pub fn directory(&self) -> &NodeDirectory {
        &self.directory
    }

    /// Run `test` under `pattern` until `generate_count` items have succeeded
    /// or the generator is exhausted.
    ///
    /// Only invalid parameters and a failed reset or resync are fatal. Every
    /// other failure (item execution, disruption application, unreachable
    /// node, a panicked task) is recorded in the result.
    pub async fn run(
        &self,
        test: Arc<dyn LoadTest>,
        params: &RunParameters,
        pattern: &DisruptionPattern,
    ) -> Result<RunResult, LoadTestError> {
        params.validate()?;

        if params.generate_count == 0 {
            info!(test = test.name(), pattern = %pattern.name, "generate_count is 0, nothing to run");
            return Ok(RunResult::empty(test.name(), &pattern.name, params.clone()));
        }

        let seed = self.config.seed.unwrap_or_else(|| rand::rng().random());
        let clock = RunClock::start();
        let (sink, mut log) = ResultSink::channel(clock);

        info!(
            test = test.name(),
            pattern = %pattern.name,
            parallelism = params.parallelism,
            generate_count = params.generate_count,
            gather_frequency = params.gather_frequency,
            seed,
            "starting run"
        );

        let model = PredictedStateModel::new(&self.directory);
        if params.clear_database_before_run {
            self.reset_fleet().await?;
        } else {
            self.resync(&model).await?;
        }

        let generator = WorkloadGenerator::new(
            test.source(&self.directory, seed),
            params.generate_count,
        );
        let ctx = Arc::new(RunContext {
            test: test.clone(),
            params: params.clone(),
            directory: self.directory.clone(),
            connector: self.connector.clone(),
            execution_timeout: self.config.execution_timeout,
            failure_backoff: self.config.failure_backoff,
            max_failures: self.config.max_execution_failures,
            model,
            work: Mutex::new(Admission {
                generator,
                in_flight: 0,
            }),
            work_available: Notify::new(),
            sink: sink.clone(),
            gate: RwLock::new(()),
            check_requested: Notify::new(),
            admission: CancellationToken::new(),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            passes: AtomicU32::new(0),
        });
        let checker = Arc::new(InvariantChecker::new(
            self.connector.clone(),
            self.config.check_timeout,
            clock,
        ));

        // Disruptions, periodic checks and workers all run concurrently
        let engine = DisruptionEngine::new(self.directory.clone(), self.actuator.clone(), sink);
        let disruptions = engine.start(pattern, seed ^ DISRUPTION_SEED_SALT);

        let checker_shutdown = CancellationToken::new();
        let periodic_checks = tokio::spawn(run_periodic_checks(
            ctx.clone(),
            checker.clone(),
            checker_shutdown.clone(),
        ));

        let mut workers = JoinSet::new();
        for worker in 0..params.parallelism {
            workers.spawn(run_worker(ctx.clone(), worker));
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "worker task failed");
                ctx.record_task_failure("worker", &e);
                // The run is already failed; stop the remaining workers
                ctx.admission.cancel();
            }
        }
        debug!(
            successes = ctx.successes.load(Ordering::SeqCst),
            "all workers finished"
        );

        // Teardown: no disruption may outlive the run
        let applied = disruptions.stop().await;
        checker_shutdown.cancel();
        if let Err(e) = periodic_checks.await {
            warn!(error = %e, "check task failed");
            ctx.record_task_failure("checks", &e);
        }

        if !self.config.settle_time.is_zero() {
            debug!(settle_ms = self.config.settle_time.as_millis() as u64, "settling before final check");
            tokio::time::sleep(self.config.settle_time).await;
        }
        ctx.check_pass(&checker, true).await;

        let mut result = RunResult::empty(test.name(), &pattern.name, params.clone());
        result.absorb(log.drain());
        result.successes = ctx.successes.load(Ordering::SeqCst);
        result.items_generated = ctx.work.lock().generator.issued();
        result.disruptions_applied = applied;
        result.duration_ms = clock.elapsed().as_millis() as u64;
        result.conclude(test.tolerates_execution_failures());

        info!(
            test = test.name(),
            pattern = %pattern.name,
            passed = result.passed,
            successes = result.successes,
            items = result.items_generated,
            failures = result.execution_failures.len(),
            violations = result.violations.len(),
            disruptions = applied,
            duration_ms = result.duration_ms,
            "run complete"
        );
        Ok(result)
    }

    /// Reset every node's persisted state. A node that refuses is asked again
    /// until `reset_timeout` runs out.
    async fn reset_fleet(&self) -> Result<(), LoadTestError> {
        for node in self.directory.nodes() {
            retry_within(self.config.reset_timeout, move || async move {
                let rpc = self.connector.connect(node).await?;
                rpc.reset().await
            })
            .await
                .map_err(|source| LoadTestError::Reset {
                    node: node.id.clone(),
                    source,
                })?;
            debug!(node = %node.id, "node state reset");
        }
        info!(nodes = self.directory.len(), "fleet state reset");
        Ok(())
    }

    /// Seed the model with every node's current state. A node still coming
    /// back from a kill is polled until `reset_timeout` runs out.
    async fn resync(&self, model: &PredictedStateModel) -> Result<(), LoadTestError> {
        for node in self.directory.nodes() {
            let values = retry_within(self.config.reset_timeout, move || async move {
                let rpc = self.connector.connect(node).await?;
                rpc.snapshot().await
            })
            .await
                .map_err(|source| LoadTestError::Resync {
                    node: node.id.clone(),
                    source,
                })?;
            debug!(node = %node.id, fields = values.len(), "node state resynced");
            model.seed(&node.id, values);
        }
        Ok(())
    }
}

const DISRUPTION_SEED_SALT: u64 = 0x9e37_79b9_7f4a_7c15;

/// Pause between two attempts of a reset or resync call
const SETUP_RETRY_INTERVAL: Duration = Duration::from_millis(250);

/// The generator and the items it handed out that have not completed
struct Admission {
    generator: WorkloadGenerator,
    in_flight: usize,
}

/// What a worker gets when it asks for work
enum Next {
    Item(WorkItem),
    /// Nothing now; an item in flight may still extend the budget
    Wait,
    /// Nothing will ever be available
    Done,
}

/// State shared by the tasks of one run
struct RunContext {
    test: Arc<dyn LoadTest>,
    params: RunParameters,
    directory: Arc<NodeDirectory>,
    connector: Arc<dyn NodeConnector>,
    execution_timeout: Duration,
    failure_backoff: Duration,
    max_failures: Option<u64>,
    model: PredictedStateModel,
    work: Mutex<Admission>,
    /// Signalled every time an item completes
    work_available: Notify,
    sink: ResultSink,
    /// Read: an item is in flight. Write: a check pass is running.
    gate: RwLock<()>,
    check_requested: Notify,
    /// Cancelled once no more items may be taken
    admission: CancellationToken,
    successes: AtomicU64,
    failures: AtomicU64,
    passes: AtomicU32,
}

impl RunContext {
    fn take(&self) -> Next {
        let mut work = self.work.lock();
        match work.generator.next_item() {
            Some(item) => {
                work.in_flight += 1;
                Next::Item(item)
            }
            None if work.in_flight == 0 => Next::Done,
            None => Next::Wait,
        }
    }

    /// Fold the outcome of an item taken with `take`. Returns how long the
    /// worker should pause before taking another.
    fn complete(
        &self,
        item: &WorkItem,
        node: &NodeId,
        outcome: Result<(), CollabError>,
    ) -> Option<Duration> {
        let backoff = match outcome {
            Ok(()) => {
                self.on_success(item);
                None
            }
            Err(error) => {
                let unreachable =
                    matches!(error, CollabError::ConnectionFailed(_) | CollabError::Timeout);
                self.on_failure(item, node, error);
                unreachable.then_some(self.failure_backoff)
            }
        };

        self.work.lock().in_flight -= 1;
        self.work_available.notify_waiters();
        backoff.filter(|pause| !pause.is_zero())
    }

    async fn execute(&self, node: &Node, item: &WorkItem) -> Result<(), CollabError> {
        let call = async {
            let rpc = self.connector.connect(node).await?;
            rpc.execute(item).await
        };
        bounded(self.execution_timeout, call).await
    }

    fn on_success(&self, item: &WorkItem) {
        self.model.apply(item);
        let done = self.successes.fetch_add(1, Ordering::SeqCst) + 1;

        if done % self.params.gather_frequency == 0 {
            // Coalesces: at most one pending request
            self.check_requested.notify_one();
        }
        if done >= self.params.generate_count {
            self.admission.cancel();
        }
    }

    fn on_failure(&self, item: &WorkItem, node: &NodeId, error: CollabError) {
        self.model.mark_indeterminate(item);
        let policy = self.test.failure_policy(item, &error);
        {
            let mut work = self.work.lock();
            match policy {
                FailurePolicy::Retry => work.generator.resubmit(item),
                FailurePolicy::Replace => work.generator.extend(1),
                FailurePolicy::Drop => {}
            }
        }

        warn!(item = %item.id, node = %node, error = %error, ?policy, "item execution failed");
        self.sink.record(RunEvent::Failure(ExecutionFailure {
            item: item.id,
            retry_of: item.retry_of,
            node: node.clone(),
            error: error.to_string(),
            policy,
            at: self.sink.now(),
        }));

        let failed = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(limit) = self.max_failures {
            if failed >= limit && !self.admission.is_cancelled() {
                warn!(failed, limit, "execution failure limit reached, stopping admission");
                self.admission.cancel();
            }
        }
    }

    fn record_task_failure(&self, task: &'static str, error: &JoinError) {
        self.sink.record(RunEvent::Task(TaskFailure {
            task,
            error: error.to_string(),
            at: self.sink.now(),
        }));
    }

    /// One check pass while no item is in flight
    async fn check_pass(&self, checker: &InvariantChecker, is_final: bool) {
        let _quiet = self.gate.write().await;
        let pass = self.passes.fetch_add(1, Ordering::SeqCst) + 1;
        let completions = self.successes.load(Ordering::SeqCst);
        let at = self.sink.now();

        let outcome = checker.check(&self.model, &self.directory, pass).await;

        let summary = CheckSummary {
            pass,
            completions,
            nodes_checked: outcome.nodes_checked,
            violations: outcome.violations.len(),
            unreachable: outcome.unreachable.len(),
            is_final,
            at,
        };
        for violation in outcome.violations {
            self.sink.record(RunEvent::Violation(violation));
        }
        for unreachable in outcome.unreachable {
            self.sink.record(RunEvent::Unreachable(unreachable));
        }

        info!(
            pass,
            completions,
            is_final,
            checked = summary.nodes_checked,
            violations = summary.violations,
            unreachable = summary.unreachable,
            "check pass"
        );
        self.sink.record(RunEvent::Check(summary));
    }
}

/// Take items and execute them until admission stops
async fn run_worker(ctx: Arc<RunContext>, worker: usize) {
    let mut executed = 0u64;

    while !ctx.admission.is_cancelled() {
        // Created before looking at the generator, so a completion in between
        // still wakes us
        let more_work = ctx.work_available.notified();
        tokio::pin!(more_work);

        let in_flight = ctx.gate.read().await;
        // A check pass may have run while we waited
        if ctx.admission.is_cancelled() {
            break;
        }
        let item = match ctx.take() {
            Next::Item(item) => item,
            Next::Done => {
                debug!(worker, "no more items");
                ctx.admission.cancel();
                break;
            }
            Next::Wait => {
                drop(in_flight);
                tokio::select! {
                    _ = ctx.admission.cancelled() => break,
                    _ = &mut more_work => continue,
                }
            }
        };

        let executor = item.executor().clone();
        let outcome = match ctx.directory.get(&executor) {
            Some(node) => ctx.execute(node, &item).await,
            None => Err(CollabError::ConnectionFailed(format!("unknown node {}", executor))),
        };
        let backoff = ctx.complete(&item, &executor, outcome);
        drop(in_flight);
        executed += 1;

        if let Some(pause) = backoff {
            tokio::select! {
                _ = ctx.admission.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    debug!(worker, executed, "worker stopped");
}

/// Trigger a check pass every time workers request one, until shut down
async fn run_periodic_checks(
    ctx: Arc<RunContext>,
    checker: Arc<InvariantChecker>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ctx.check_requested.notified() => {}
        }
        ctx.check_pass(&checker, false).await;
    }
}

/// Repeat a setup call until it succeeds or `limit` runs out. Returns the
/// last error.
async fn retry_within<T, F, Fut>(limit: Duration, mut attempt: F) -> Result<T, CollabError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CollabError>>,
{
    let deadline = Instant::now() + limit;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match bounded(remaining, attempt()).await {
            Ok(value) => return Ok(value),
            Err(error) if Instant::now() + SETUP_RETRY_INTERVAL < deadline => {
                debug!(error = %error, "setup call failed, retrying");
                tokio::time::sleep(SETUP_RETRY_INTERVAL).await;
            }
            Err(error) => return Err(error),
        }
    }
}

/// Bound a collaborator call; elapsed time maps to `CollabError::Timeout`
async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, CollabError>
where
    F: Future<Output = Result<T, CollabError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(CollabError::Timeout),
    }
}
