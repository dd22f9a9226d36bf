//! Workflow executor.
//!
//! Drives one workflow at a time per task: every ready step is dispatched
//! to its agent concurrently (bounded by `max_parallel`), attempts race a
//! per-step timeout, failed attempts are retried after an exponential
//! backoff and every transition is written back to the store before the
//! matching event is published.
//!
//! A run that errors after the workflow started closes it as failed, so a
//! stored workflow is never left running without a task behind it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tessera_core::{
    log_agent_activity, AgentType, ExecutionStatus, FailureOutcome, Result, StepId, TesseraError,
    WorkflowExecution, WorkflowId,
};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::agent::{AgentRegistry, AgentRequest};
use crate::events::{EventBus, EventKind, WorkflowEvent};
use crate::store::{StoredWorkflow, WorkflowStore};

const COMPONENT: &str = "WorkflowExecutor";

/// Configuration for the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Maximum steps of one workflow in flight at once.
    pub max_parallel: usize,

    /// Per-attempt timeout in milliseconds.
    pub step_timeout_ms: u64,

    /// Delay before the first retry.
    pub backoff_base_ms: u64,

    /// Upper bound for the retry delay.
    pub backoff_max_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            step_timeout_ms: 30_000,
            backoff_base_ms: 200,
            backoff_max_ms: 10_000,
        }
    }
}

impl ExecutorConfig {
    /// Reject settings under which no step could ever run.
    pub fn validate(&self) -> Result<()> {
        if self.max_parallel == 0 {
            return Err(TesseraError::InvalidConfig(
                "max_parallel must be at least 1".to_string(),
            ));
        }
        if self.step_timeout_ms == 0 {
            return Err(TesseraError::InvalidConfig(
                "step_timeout_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Delay before attempt `retry_count + 1`: zero for the first attempt,
    /// then `base * 2^(retry_count - 1)` capped at `backoff_max_ms`.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }
        let factor = 1u64 << (retry_count - 1).min(32);
        let delay = self.backoff_base_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }
}

type Attempt = BoxFuture<'static, (StepId, Result<serde_json::Value>)>;

/// Handles held for a workflow while a task drives it.
struct RunHandle {
    cancel: watch::Sender<Option<String>>,
    /// Closed once the driving task has written its final state.
    finished: watch::Receiver<()>,
}

/// Task side of a [`RunHandle`].
struct RunSignals {
    cancel_rx: watch::Receiver<Option<String>>,
    finished_tx: watch::Sender<()>,
}

type RunningMap = Arc<RwLock<HashMap<WorkflowId, RunHandle>>>;

/// Runs compiled workflows against registered agents.
pub struct Executor {
    config: ExecutorConfig,
    agents: AgentRegistry,
    store: Arc<dyn WorkflowStore>,
    events: EventBus,
    running: RunningMap,
}

impl Executor {
    /// Create an executor with default configuration.
    pub fn new(agents: AgentRegistry, store: Arc<dyn WorkflowStore>) -> Self {
        Self::build(ExecutorConfig::default(), agents, store)
    }

    /// Create an executor with custom configuration.
    pub fn with_config(
        config: ExecutorConfig,
        agents: AgentRegistry,
        store: Arc<dyn WorkflowStore>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config, agents, store))
    }

    fn build(config: ExecutorConfig, agents: AgentRegistry, store: Arc<dyn WorkflowStore>) -> Self {
        Self {
            config,
            agents,
            store,
            events: EventBus::default(),
            running: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Publish on an existing bus instead of a private one.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    /// Agent types with a registered handler.
    pub fn agent_types(&self) -> Vec<AgentType> {
        self.agents.agent_types()
    }

    /// Validate and store a pending workflow without running it.
    pub async fn submit(&self, workflow: WorkflowExecution) -> Result<WorkflowId> {
        workflow.validate_graph()?;
        let id = workflow.id.clone();
        self.store.insert(workflow).await?;
        debug!(workflow_id = %id, "Workflow submitted");
        Ok(id)
    }

    /// Store `workflow` and drive it to a terminal status.
    pub async fn run(&self, workflow: WorkflowExecution) -> Result<WorkflowExecution> {
        let id = self.submit(workflow).await?;
        self.run_stored(&id).await
    }

    /// Drive an already stored, pending workflow to a terminal status.
    pub async fn run_stored(&self, id: &WorkflowId) -> Result<WorkflowExecution> {
        let signals = self.register(id).await?;
        let result = self.drive(id, signals.cancel_rx).await;
        self.running.write().await.remove(id);
        drop(signals.finished_tx);
        result
    }

    /// Drive a stored workflow on a background task.
    ///
    /// The cancellation handle is registered before this returns, so a
    /// `cancel` issued right after always reaches the running task.
    pub async fn spawn(
        self: &Arc<Self>,
        id: WorkflowId,
    ) -> Result<JoinHandle<Result<WorkflowExecution>>> {
        let signals = self.register(&id).await?;
        let executor = Arc::clone(self);

        Ok(tokio::spawn(async move {
            let result = executor.drive(&id, signals.cancel_rx).await;
            executor.running.write().await.remove(&id);
            drop(signals.finished_tx);
            if let Err(ref e) = result {
                warn!(workflow_id = %id, error = %e, "Workflow run aborted");
            }
            result
        }))
    }

    /// Cancel a workflow.
    ///
    /// A workflow being driven is signalled and cancelled by its own task,
    /// and this waits for that task to write its final state. A signal that
    /// arrives while the last step is being recorded loses to it: the
    /// workflow ends completed (or failed) and this returns
    /// [`TesseraError::WorkflowTerminal`] with that status. A stored
    /// workflow that is not running is cancelled in place.
    pub async fn cancel(&self, id: &WorkflowId, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();

        let stored = self.stored(id).await?;
        if stored.workflow.status.is_terminal() {
            return Err(TesseraError::WorkflowTerminal {
                workflow_id: id.to_string(),
                status: stored.workflow.status,
            });
        }

        let finished = self.running.read().await.get(id).map(|run| {
            info!(workflow_id = %id, reason = %reason, "Signalling cancellation");
            // The receiver lives as long as the map entry.
            let _ = run.cancel.send(Some(reason.clone()));
            run.finished.clone()
        });

        let stored = match finished {
            Some(mut finished) => {
                // Errors once the driving task drops its sender.
                let _ = finished.changed().await;
                let stored = self.stored(id).await?;
                match stored.workflow.status {
                    ExecutionStatus::Cancelled => return Ok(()),
                    status if status.is_terminal() => {
                        info!(workflow_id = %id, ?status, "Workflow finished before cancellation");
                        return Err(TesseraError::WorkflowTerminal {
                            workflow_id: id.to_string(),
                            status,
                        });
                    }
                    // The task stopped before starting the workflow.
                    _ => stored,
                }
            }
            None => stored,
        };

        let mut workflow = stored.workflow;
        workflow.cancel(reason.clone())?;
        self.store.save(&workflow, stored.version).await?;

        self.publish(&workflow, EventKind::WorkflowCancelled { reason });
        log_agent_activity(
            COMPONENT,
            "Workflow cancelled",
            &serde_json::json!({ "workflowId": id }),
        );
        Ok(())
    }

    /// Whether a task is currently driving the workflow.
    pub async fn is_running(&self, id: &WorkflowId) -> bool {
        self.running.read().await.contains_key(id)
    }

    async fn stored(&self, id: &WorkflowId) -> Result<StoredWorkflow> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| TesseraError::WorkflowNotFound(id.to_string()))
    }

    async fn register(&self, id: &WorkflowId) -> Result<RunSignals> {
        let mut running = self.running.write().await;
        if running.contains_key(id) {
            return Err(TesseraError::InvalidTransition {
                subject: format!("workflow {}", id),
                from: ExecutionStatus::Running,
                to: ExecutionStatus::Running,
            });
        }

        let (cancel, cancel_rx) = watch::channel(None);
        let (finished_tx, finished) = watch::channel(());
        running.insert(id.clone(), RunHandle { cancel, finished });
        Ok(RunSignals {
            cancel_rx,
            finished_tx,
        })
    }

    async fn drive(
        &self,
        id: &WorkflowId,
        cancel_rx: watch::Receiver<Option<String>>,
    ) -> Result<WorkflowExecution> {
        let stored = self.stored(id).await?;
        let mut workflow = stored.workflow;
        let mut version = stored.version;

        workflow.validate_graph()?;
        workflow.start()?;
        if !self.persist(&mut workflow, &mut version).await? {
            return Ok(workflow);
        }
        self.publish(&workflow, EventKind::WorkflowStarted);
        log_agent_activity(
            COMPONENT,
            "Workflow started",
            &serde_json::json!({
                "workflowId": workflow.id,
                "stepCount": workflow.steps.len(),
                "failurePolicy": workflow.failure_policy,
            }),
        );

        match self.run_steps(&mut workflow, &mut version, cancel_rx).await {
            Ok(()) => Ok(workflow),
            Err(err) => {
                if let Err(close_err) = self.close_after_error(&mut workflow, version, &err).await {
                    error!(
                        workflow_id = %id,
                        error = %close_err,
                        "Could not close workflow after a failed run"
                    );
                }
                Err(err)
            }
        }
    }

    /// Dispatch and record steps until the workflow is terminal.
    async fn run_steps(
        &self,
        workflow: &mut WorkflowExecution,
        version: &mut u64,
        mut cancel_rx: watch::Receiver<Option<String>>,
    ) -> Result<()> {
        let mut in_flight: FuturesUnordered<Attempt> = FuturesUnordered::new();
        let mut pending: Vec<EventKind> = Vec::new();

        while !workflow.status.is_terminal() {
            for step_id in workflow.ready_steps() {
                if in_flight.len() >= self.config.max_parallel || workflow.status.is_terminal() {
                    break;
                }
                if let Some(attempt) = self.dispatch(workflow, &step_id, &mut pending)? {
                    in_flight.push(attempt);
                }
            }
            if !pending.is_empty() && !self.persist_and_publish(workflow, version, &mut pending).await? {
                return Ok(());
            }
            if workflow.status.is_terminal() {
                break;
            }

            if in_flight.is_empty() {
                return Err(TesseraError::Internal(format!(
                    "workflow {} has no runnable steps but is {:?}",
                    workflow.id, workflow.status
                )));
            }

            tokio::select! {
                Some((step_id, result)) = in_flight.next() => {
                    self.record(workflow, &step_id, result, &mut pending)?;
                    if !self.persist_and_publish(workflow, version, &mut pending).await? {
                        return Ok(());
                    }
                }
                Ok(()) = cancel_rx.changed() => {
                    let reason = cancel_rx
                        .borrow()
                        .clone()
                        .unwrap_or_else(|| "cancelled".to_string());
                    // Dropping the set drops every outstanding agent call,
                    // including attempts still waiting out their backoff.
                    in_flight.clear();
                    workflow.cancel(reason.clone())?;
                    pending.push(EventKind::WorkflowCancelled { reason });
                    if self.persist_and_publish(workflow, version, &mut pending).await? {
                        log_agent_activity(
                            COMPONENT,
                            "Workflow cancelled",
                            &serde_json::json!({ "workflowId": workflow.id }),
                        );
                    }
                    return Ok(());
                }
                else => break,
            }
        }

        self.announce_outcome(workflow);
        Ok(())
    }

    /// Mark a workflow whose run errored as failed and write it back.
    async fn close_after_error(
        &self,
        workflow: &mut WorkflowExecution,
        version: u64,
        err: &TesseraError,
    ) -> Result<()> {
        warn!(workflow_id = %workflow.id, error = %err, "Workflow run errored, closing it");
        if !workflow.status.is_terminal() {
            workflow.fail(err.to_string())?;
        }

        match self.store.save(workflow, version).await {
            Ok(_) => {}
            Err(TesseraError::VersionConflict { .. }) => {
                let stored = self.stored(&workflow.id).await?;
                if stored.workflow.status.is_terminal() {
                    *workflow = stored.workflow;
                    return Ok(());
                }
                let mut latest = stored.workflow;
                latest.fail(err.to_string())?;
                self.store.save(&latest, stored.version).await?;
                *workflow = latest;
            }
            Err(e) => return Err(e),
        }

        self.announce_outcome(workflow);
        Ok(())
    }

    /// Start a step and build its attempt. Returns `None` when the step
    /// failed immediately because no agent serves its type.
    fn dispatch(
        &self,
        workflow: &mut WorkflowExecution,
        step_id: &StepId,
        events: &mut Vec<EventKind>,
    ) -> Result<Option<Attempt>> {
        workflow.start_step(step_id)?;

        let step = workflow
            .step(step_id)
            .ok_or_else(|| TesseraError::StepNotFound {
                workflow_id: workflow.id.to_string(),
                step_id: step_id.to_string(),
            })?;
        let agent_type = step.agent_type;
        let retry_count = step.retry_count;

        events.push(EventKind::StepStarted {
            step_id: step_id.clone(),
            agent_type,
            attempt: retry_count + 1,
        });

        let Some(agent) = self.agents.get(agent_type) else {
            let error = TesseraError::AgentNotFound(agent_type).to_string();
            warn!(workflow_id = %workflow.id, step_id = %step_id, %agent_type, "No agent registered");
            workflow.abort_step(step_id, error.clone())?;
            events.push(EventKind::StepFailed {
                step_id: step_id.clone(),
                error,
            });
            return Ok(None);
        };

        let dependency_outputs: BTreeMap<StepId, serde_json::Value> = workflow
            .dependencies_of(step_id)
            .iter()
            .filter_map(|producer| {
                let output = workflow.step(producer)?.output.clone()?;
                Some((producer.clone(), output))
            })
            .collect();

        let request = AgentRequest {
            workflow_id: workflow.id.clone(),
            step_id: step_id.clone(),
            step_name: step.name.clone(),
            user_id: workflow.user_id.clone(),
            attempt: retry_count + 1,
            input: step.input.clone(),
            dependency_outputs,
        };

        log_agent_activity(
            COMPONENT,
            "Step dispatched",
            &serde_json::json!({
                "workflowId": workflow.id,
                "stepId": step_id,
                "agentType": agent_type,
                "attempt": retry_count + 1,
            }),
        );

        let delay = self.config.backoff(retry_count);
        let timeout = self.config.step_timeout();
        let id = step_id.clone();

        Ok(Some(Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let result = match tokio::time::timeout(timeout, agent.execute(request)).await {
                Ok(result) => result,
                Err(_) => Err(TesseraError::Timeout {
                    duration_ms: timeout.as_millis() as u64,
                    message: format!("step {} did not answer", id),
                }),
            };
            (id, result)
        })))
    }

    /// Apply the result of one attempt to the workflow.
    fn record(
        &self,
        workflow: &mut WorkflowExecution,
        step_id: &StepId,
        result: Result<serde_json::Value>,
        events: &mut Vec<EventKind>,
    ) -> Result<()> {
        match result {
            Ok(output) => {
                workflow.complete_step(step_id, output)?;
                let duration_ms = workflow.step(step_id).and_then(|s| s.duration_ms());
                debug!(workflow_id = %workflow.id, step_id = %step_id, ?duration_ms, "Step completed");
                events.push(EventKind::StepCompleted {
                    step_id: step_id.clone(),
                    duration_ms,
                });
            }
            Err(err) if err.is_recoverable() => {
                let error = err.to_string();
                match workflow.fail_step(step_id, error.clone())? {
                    FailureOutcome::Retrying { retry_count } => {
                        warn!(
                            workflow_id = %workflow.id,
                            step_id = %step_id,
                            retry_count,
                            error = %error,
                            "Step failed, retrying"
                        );
                        events.push(EventKind::StepRetrying {
                            step_id: step_id.clone(),
                            retry_count,
                            error,
                        });
                    }
                    FailureOutcome::Exhausted => {
                        warn!(workflow_id = %workflow.id, step_id = %step_id, error = %error, "Step exhausted its retries");
                        events.push(EventKind::StepFailed {
                            step_id: step_id.clone(),
                            error,
                        });
                    }
                }
            }
            Err(err) => {
                let error = err.to_string();
                warn!(workflow_id = %workflow.id, step_id = %step_id, error = %error, "Step failed permanently");
                workflow.abort_step(step_id, error.clone())?;
                events.push(EventKind::StepFailed {
                    step_id: step_id.clone(),
                    error,
                });
            }
        }
        Ok(())
    }

    /// Persist, then publish the events collected since the last write.
    /// Events of a write that lost to a concurrent close are dropped.
    async fn persist_and_publish(
        &self,
        workflow: &mut WorkflowExecution,
        version: &mut u64,
        events: &mut Vec<EventKind>,
    ) -> Result<bool> {
        let written = self.persist(workflow, version).await?;
        if !written {
            events.clear();
            return Ok(false);
        }
        for kind in events.drain(..) {
            self.publish(workflow, kind);
        }
        Ok(true)
    }

    /// Write the workflow back. Returns `false` when the stored record was
    /// closed by someone else in the meantime, in which case `workflow` is
    /// replaced by the stored state.
    async fn persist(&self, workflow: &mut WorkflowExecution, version: &mut u64) -> Result<bool> {
        match self.store.save(workflow, *version).await {
            Ok(next) => {
                *version = next;
                Ok(true)
            }
            Err(TesseraError::VersionConflict { .. }) => {
                let stored = self.stored(&workflow.id).await?;
                if stored.workflow.status.is_terminal() {
                    info!(
                        workflow_id = %workflow.id,
                        status = ?stored.workflow.status,
                        "Workflow closed elsewhere, stopping"
                    );
                    *workflow = stored.workflow;
                    *version = stored.version;
                    return Ok(false);
                }
                Err(TesseraError::VersionConflict {
                    workflow_id: workflow.id.to_string(),
                    expected: *version,
                    actual: stored.version,
                })
            }
            Err(e) => Err(e),
        }
    }

    fn announce_outcome(&self, workflow: &WorkflowExecution) {
        let kind = match workflow.status {
            ExecutionStatus::Completed => EventKind::WorkflowCompleted,
            ExecutionStatus::Failed => EventKind::WorkflowFailed {
                error: workflow.error.clone().unwrap_or_default(),
            },
            ExecutionStatus::Cancelled => EventKind::WorkflowCancelled {
                reason: workflow.error.clone().unwrap_or_default(),
            },
            _ => return,
        };

        info!(
            workflow_id = %workflow.id,
            status = ?workflow.status,
            duration_ms = ?workflow.total_duration_ms,
            "Workflow finished"
        );
        log_agent_activity(
            COMPONENT,
            "Workflow finished",
            &serde_json::json!({
                "workflowId": workflow.id,
                "status": workflow.status,
                "completedSteps": workflow.metadata.completed_steps,
                "failedSteps": workflow.metadata.failed_steps,
                "error": workflow.error,
            }),
        );
        self.publish(workflow, kind);
    }

    fn publish(&self, workflow: &WorkflowExecution, kind: EventKind) {
        self.events.publish(WorkflowEvent::new(workflow, kind));
    }
}
