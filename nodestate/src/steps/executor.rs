//! Asynchronous execution of external steps and reconciliation of their
//! outcomes into node status.

use super::http::HttpRunner;
use super::rpc::RpcRunner;
use super::{Outcome, OutcomeStore, StepKey, StepPayload, StepRunner, StepWorkItem, WorkQueue};
use crate::cancellation::CancellationToken;
use crate::config::StepExecutorConfig;
use crate::core::{NodePhase, NodeStatus, Workflow};
use crate::errors::{ErrorKind, Result};
use crate::objectstore::TransientClassifier;
use crate::observability::OperationTimer;
use crate::retry::with_retry_cancellable;
use crate::substrate::SecretStore;
use crate::sync::ConcurrentMap;
use crate::utils::{Clock, SystemClock};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What the reconciler saw for one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    /// No outcome yet.
    Pending,
    /// The node was moved to Succeeded.
    Succeeded,
    /// The node was moved to Failed.
    Failed,
    /// The node was already terminal and left alone.
    Terminal,
    /// The workflow has no such node.
    Unknown,
}

/// Runs HTTP and plugin steps off the reconcile path.
///
/// [`StepExecutor::execute`] marks the node Pending and queues the step;
/// workers run it and record an [`Outcome`]; a later
/// [`StepExecutor::reconcile_node`] consumes the outcome and moves the node
/// to its terminal phase.
pub struct StepExecutor {
    queue: WorkQueue,
    outcomes: OutcomeStore,
    http: Arc<dyn StepRunner>,
    plugin: Arc<dyn StepRunner>,
    config: StepExecutorConfig,
    classifier: TransientClassifier,
    clock: Arc<dyn Clock>,
    panicked: ConcurrentMap<StepKey, ()>,
}

impl StepExecutor {
    /// Creates an executor with the bundled HTTP and JSON-RPC runners.
    #[must_use]
    pub fn new(config: StepExecutorConfig, secrets: Arc<dyn SecretStore>) -> Self {
        let client = reqwest::Client::new();
        let http = HttpRunner::new(client.clone(), secrets).with_default_timeout(config.default_timeout());
        let plugin = RpcRunner::new(client).with_default_timeout(config.default_timeout());
        Self {
            queue: WorkQueue::new(config.queue_capacity),
            outcomes: OutcomeStore::new(),
            http: Arc::new(http),
            plugin: Arc::new(plugin),
            config,
            classifier: TransientClassifier::new(),
            clock: Arc::new(SystemClock),
            panicked: ConcurrentMap::new(),
        }
    }

    /// Replaces the runner for HTTP steps.
    #[must_use]
    pub fn with_http_runner(mut self, runner: Arc<dyn StepRunner>) -> Self {
        self.http = runner;
        self
    }

    /// Replaces the runner for plugin steps.
    #[must_use]
    pub fn with_plugin_runner(mut self, runner: Arc<dyn StepRunner>) -> Self {
        self.plugin = runner;
        self
    }

    /// Replaces the transient-error classifier.
    #[must_use]
    pub fn with_classifier(mut self, classifier: TransientClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Sets the clock used for node timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The executor configuration.
    #[must_use]
    pub fn config(&self) -> &StepExecutorConfig {
        &self.config
    }

    /// Number of steps queued or running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.queue.len()
    }

    /// Number of outcomes not yet reconciled.
    #[must_use]
    pub fn unconsumed_outcomes(&self) -> usize {
        self.outcomes.len()
    }

    /// Spawns the configured number of workers. They stop when `token` is
    /// cancelled.
    pub fn start(self: &Arc<Self>, token: Arc<CancellationToken>) -> Vec<JoinHandle<()>> {
        let workers = self.config.workers.max(1);
        info!(workers = workers, "Starting step executor");
        (0..workers)
            .map(|worker| {
                let executor = Arc::clone(self);
                let token = Arc::clone(&token);
                tokio::spawn(async move { executor.worker_loop(worker, token).await })
            })
            .collect()
    }

    async fn worker_loop(&self, worker: usize, token: Arc<CancellationToken>) {
        loop {
            let item = tokio::select! {
                () = token.cancelled() => break,
                item = self.queue.next() => match item {
                    Some(item) => item,
                    None => break,
                },
            };
            self.process(item, &token).await;
        }
        debug!(worker = worker, "Step worker stopped");
    }

    fn runner_for(&self, payload: &StepPayload) -> Arc<dyn StepRunner> {
        match payload {
            StepPayload::Http(_) => Arc::clone(&self.http),
            StepPayload::Plugin(_) => Arc::clone(&self.plugin),
        }
    }

    async fn run_with_retry(&self, item: &StepWorkItem, token: &CancellationToken) -> Result<Outcome> {
        let runner = self.runner_for(&item.payload);
        let name = format!("step {}", item.key);
        with_retry_cancellable(
            &self.config.retry,
            &name,
            Some(token),
            |e| self.classifier.is_transient(e),
            || runner.run(item),
        )
        .await
    }

    async fn process(&self, item: StepWorkItem, token: &CancellationToken) {
        let key = item.key.clone();
        let timer = OperationTimer::start("step");

        let result = AssertUnwindSafe(self.run_with_retry(&item, token)).catch_unwind().await;
        let outcome = match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) if e.kind() == ErrorKind::Cancelled => {
                debug!(key = %key, "Step abandoned on shutdown");
                self.queue.done(&key);
                return;
            }
            Ok(Err(e)) => {
                warn!(key = %key, error = %e, "Step failed after retries");
                Outcome::failed(e.to_string())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                if self.panicked.load_or_store(key.clone(), ()).1 {
                    error!(key = %key, panic = %message, "Step panicked twice, failing it");
                    Outcome::failed(format!("step executor panicked: {message}"))
                } else {
                    warn!(key = %key, panic = %message, "Step panicked, requeueing once");
                    match self.queue.requeue(item) {
                        Ok(()) => return,
                        Err(e) => {
                            error!(key = %key, error = %e, "Could not requeue step");
                            Outcome::failed(format!("step executor panicked: {message}"))
                        }
                    }
                }
            }
        };

        self.panicked.delete(&key);
        debug!(
            key = %key,
            success = outcome.is_success(),
            duration_ms = timer.elapsed_ms(),
            "Step finished"
        );
        self.outcomes.record(key.clone(), outcome);
        self.queue.done(&key);
    }

    /// Starts the step `node_id` of `workflow` unless it already ran.
    ///
    /// Creates the node as Pending when absent. Returns true if the step was
    /// queued; false if the node is terminal, an outcome is waiting, or the
    /// step is already queued or running.
    pub fn execute(&self, workflow: &mut Workflow, node_id: &str, payload: StepPayload) -> Result<bool> {
        let key = StepKey::for_node(workflow, node_id);
        match workflow.node(node_id) {
            Some(node) if node.phase.is_terminal() => return Ok(false),
            Some(_) => {}
            None => {
                let mut node = NodeStatus::new(node_id, payload.node_type()).with_phase(NodePhase::Pending);
                node.started_at = Some(self.clock.now());
                workflow.status.nodes.insert(node_id.to_string(), node);
            }
        }

        // Workers record the outcome before releasing the key, so the outcome
        // check is only reliable while holding the claim.
        if !self.queue.claim(&key) {
            return Ok(false);
        }
        if self.outcomes.contains(&key) {
            self.queue.done(&key);
            return Ok(false);
        }
        self.queue.push_claimed(StepWorkItem {
            key: key.clone(),
            payload,
        })?;
        debug!(key = %key, "Queued external step");
        Ok(true)
    }

    /// Applies a waiting outcome to `node_id`, consuming it.
    pub fn reconcile_node(&self, workflow: &mut Workflow, node_id: &str) -> StepState {
        let key = StepKey::for_node(workflow, node_id);
        let now = self.clock.now();
        let Some(node) = workflow.node_mut(node_id) else {
            return StepState::Unknown;
        };
        if node.phase.is_terminal() {
            return StepState::Terminal;
        }
        match self.outcomes.take(&key) {
            None => StepState::Pending,
            Some(Outcome::Succeeded(outputs)) => {
                node.phase = NodePhase::Succeeded;
                node.outputs = Some(outputs);
                node.finished_at = Some(now);
                info!(key = %key, "External step succeeded");
                StepState::Succeeded
            }
            Some(Outcome::Failed(message)) => {
                node.phase = NodePhase::Failed;
                node.message = message;
                node.finished_at = Some(now);
                info!(key = %key, message = %node.message, "External step failed");
                StepState::Failed
            }
        }
    }

    /// Reconciles every non-terminal HTTP and plugin node; returns how many
    /// reached a terminal phase.
    pub fn reconcile(&self, workflow: &mut Workflow) -> usize {
        let candidates: Vec<String> = workflow
            .status
            .nodes
            .values()
            .filter(|n| n.node_type.is_external() && !n.phase.is_terminal())
            .map(|n| n.id.clone())
            .collect();
        candidates
            .iter()
            .filter(|id| {
                matches!(
                    self.reconcile_node(workflow, id),
                    StepState::Succeeded | StepState::Failed
                )
            })
            .count()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl std::fmt::Debug for StepExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepExecutor")
            .field("config", &self.config)
            .field("queue", &self.queue)
            .field("outcomes", &self.outcomes.len())
            .finish_non_exhaustive()
    }
}
