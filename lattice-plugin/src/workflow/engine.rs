//! Workflow execution
//!
//! Each instance is driven by its own task. Every tick the scheduler picks
//! the stages whose predecessors have settled, runs the parallel-eligible
//! ones concurrently and the rest in declaration order. Scheduling decisions
//! and result recording go through one per-instance mutex, so completion
//! order, and with it rollback order, is deterministic.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinSet;
use uuid::Uuid;

use lattice_config::{BackoffKind, FailurePolicy, WorkflowConfig};
use lattice_resilience::{RetryExecutor, RetryPolicy, Retryable};

use crate::error::{PluginError, PluginResult};
use crate::events::{EventBus, LifecycleEvent};
use crate::registry::Registry;

use super::definition::WorkflowDefinition;
use super::instance::{FailureKind, StageFailure, StageStatus, WorkflowInstance, WorkflowStatus};
use super::transaction::{RollbackManager, RollbackReport, TransactionLog};

/// Outcome of a single stage attempt
#[derive(Debug, Clone)]
enum StageAttemptError {
    Timeout(Duration),
    Failed { message: String, retryable: bool },
}

impl fmt::Display for StageAttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageAttemptError::Timeout(limit) => write!(f, "timed out after {:?}", limit),
            StageAttemptError::Failed { message, .. } => f.write_str(message),
        }
    }
}

impl Retryable for StageAttemptError {
    fn is_retryable(&self) -> bool {
        match self {
            StageAttemptError::Timeout(_) => true,
            StageAttemptError::Failed { retryable, .. } => *retryable,
        }
    }
}

enum Schedule {
    Ready(Vec<String>),
    Finished,
    Deadlock(Vec<String>),
}

struct RunState {
    instance: WorkflowInstance,
    log: TransactionLog,
}

struct InstanceEntry {
    definition: Arc<WorkflowDefinition>,
    run: Mutex<RunState>,
    cancel: watch::Sender<bool>,
    done: watch::Sender<bool>,
}

struct EngineInner {
    registry: Arc<Registry>,
    config: WorkflowConfig,
    events: Arc<EventBus>,
    rollback: RollbackManager,
    instances: RwLock<HashMap<Uuid, Arc<InstanceEntry>>>,
}

/// Runs workflows against the plugins of a registry
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    pub fn new(registry: Arc<Registry>, config: WorkflowConfig) -> Self {
        let events = registry.events().clone();
        let rollback = RollbackManager::new(registry.clone(), config.compensation_timeout, events.clone());

        Self {
            inner: Arc::new(EngineInner {
                registry,
                config,
                events,
                rollback,
                instances: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.inner.config
    }

    /// Validate the definition and start running it in the background
    pub async fn start_workflow(
        &self,
        definition: WorkflowDefinition,
        input: Value,
    ) -> PluginResult<WorkflowRun> {
        definition.validate()?;

        let instance = WorkflowInstance::new(&definition, input);
        let instance_id = instance.id;
        let (cancel, _) = watch::channel(false);
        let (done, _) = watch::channel(false);

        let entry = Arc::new(InstanceEntry {
            definition: Arc::new(definition),
            run: Mutex::new(RunState {
                instance,
                log: TransactionLog::new(),
            }),
            cancel,
            done,
        });

        self.inner
            .instances
            .write()
            .await
            .insert(instance_id, entry.clone());

        tracing::info!(
            target: "workflow_engine",
            workflow = %entry.definition.name,
            instance_id = %instance_id,
            stages = entry.definition.stages.len(),
            "Workflow started"
        );

        tokio::spawn(self.inner.clone().drive(entry.clone()));

        Ok(WorkflowRun { instance_id, entry })
    }

    /// Start a workflow and wait for it to reach a terminal status
    pub async fn run_workflow(
        &self,
        definition: WorkflowDefinition,
        input: Value,
    ) -> PluginResult<WorkflowReport> {
        Ok(self.start_workflow(definition, input).await?.wait().await)
    }

    /// Snapshot of an instance
    pub async fn instance(&self, instance_id: Uuid) -> Option<WorkflowInstance> {
        let entry = self.inner.instances.read().await.get(&instance_id).cloned()?;
        let run = entry.run.lock().await;
        Some(run.instance.clone())
    }

    /// Request cancellation of a running instance
    pub async fn cancel(&self, instance_id: Uuid) -> PluginResult<()> {
        let entry = self.inner.entry(instance_id).await?;
        entry.cancel.send_replace(true);
        Ok(())
    }

    /// Compensate whatever a failed instance still has pending.
    ///
    /// Stages already compensated are never run again, so calling this on a
    /// rolled back instance does nothing.
    pub async fn rollback(&self, instance_id: Uuid) -> PluginResult<RollbackReport> {
        let entry = self.inner.entry(instance_id).await?;
        let mut guard = entry.run.lock().await;
        let run = &mut *guard;

        match run.instance.status {
            WorkflowStatus::Failed | WorkflowStatus::RolledBack => {}
            other => {
                return Err(PluginError::invalid_workflow(
                    &run.instance.workflow,
                    format!("cannot roll back an instance that is {:?}", other),
                ))
            }
        }

        let report = self
            .inner
            .rollback
            .rollback(&mut run.instance, &mut run.log)
            .await;
        self.inner.apply_rollback(&mut run.instance, report.clone());
        Ok(report)
    }

    /// Drop finished instances beyond the retention limit, oldest first.
    /// Returns how many were removed.
    pub async fn prune_terminal(&self) -> usize {
        self.inner.prune_terminal().await
    }
}

impl EngineInner {
    async fn entry(&self, instance_id: Uuid) -> PluginResult<Arc<InstanceEntry>> {
        self.instances
            .read()
            .await
            .get(&instance_id)
            .cloned()
            .ok_or(PluginError::WorkflowNotFound { instance_id })
    }

    fn default_policy(&self) -> RetryPolicy {
        let attempts = self.config.default_max_attempts;
        let delay = self.config.default_retry_delay;
        match self.config.backoff {
            BackoffKind::Fixed => RetryPolicy::fixed(attempts, delay),
            BackoffKind::Exponential => {
                RetryPolicy::exponential(attempts, delay, self.config.default_stage_timeout)
            }
        }
    }

    async fn drive(self: Arc<Self>, entry: Arc<InstanceEntry>) {
        let cancel = entry.cancel.subscribe();
        {
            let mut run = entry.run.lock().await;
            self.set_status(&mut run.instance, WorkflowStatus::Running);
        }

        let mut failed = false;
        loop {
            if *cancel.borrow() {
                break;
            }

            let schedule = {
                let mut run = entry.run.lock().await;
                self.schedule(&entry.definition, &mut run.instance)
            };

            match schedule {
                Schedule::Finished => break,
                Schedule::Deadlock(pending) => {
                    let mut run = entry.run.lock().await;
                    tracing::error!(
                        target: "workflow_engine",
                        workflow = %run.instance.workflow,
                        instance_id = %run.instance.id,
                        pending = ?pending,
                        "Workflow deadlocked"
                    );
                    run.instance.deadlock = Some(pending);
                    failed = true;
                    break;
                }
                Schedule::Ready(stages) => {
                    if !self.run_tick(&entry, stages, &cancel).await {
                        failed = true;
                        break;
                    }
                }
            }
        }

        self.finish(&entry, failed).await;
        entry.done.send_replace(true);
        self.prune_terminal().await;
    }

    /// Propagate skips, then collect the stages that may run now
    fn schedule(&self, definition: &WorkflowDefinition, instance: &mut WorkflowInstance) -> Schedule {
        let settled = |status: Option<StageStatus>| {
            matches!(status, Some(StageStatus::Completed) | Some(StageStatus::Skipped))
        };

        loop {
            let mut changed = false;
            for stage in &definition.stages {
                if instance.status_of(&stage.id) != Some(StageStatus::Pending) {
                    continue;
                }
                let predecessors = definition.predecessors(&stage.id);
                if predecessors.is_empty() {
                    continue;
                }
                let all_skipped = predecessors
                    .iter()
                    .all(|p| instance.status_of(p) == Some(StageStatus::Skipped));
                if all_skipped {
                    instance.set_stage(&stage.id, StageStatus::Skipped);
                    self.emit_stage(instance, &stage.id, StageStatus::Skipped);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        let ready: Vec<String> = definition
            .stages
            .iter()
            .filter(|stage| instance.status_of(&stage.id) == Some(StageStatus::Pending))
            .filter(|stage| {
                let predecessors = definition.predecessors(&stage.id);
                predecessors.iter().all(|p| settled(instance.status_of(p)))
                    && (predecessors.is_empty()
                        || predecessors
                            .iter()
                            .any(|p| instance.status_of(p) == Some(StageStatus::Completed)))
            })
            .map(|stage| stage.id.clone())
            .collect();

        if !ready.is_empty() {
            return Schedule::Ready(ready);
        }

        let pending = instance.pending_stages();
        if pending.is_empty() {
            Schedule::Finished
        } else {
            Schedule::Deadlock(pending)
        }
    }

    /// Run one tick's ready stages; `false` if any of them failed
    async fn run_tick(
        self: &Arc<Self>,
        entry: &Arc<InstanceEntry>,
        ready: Vec<String>,
        cancel: &watch::Receiver<bool>,
    ) -> bool {
        let fail_fast = self.config.failure_policy == FailurePolicy::FailFast;
        let limit = self.config.max_parallel_stages.max(1);
        let (parallel, sequential): (Vec<String>, Vec<String>) = ready
            .into_iter()
            .partition(|id| entry.definition.stage(id).is_some_and(|s| s.parallel));

        let mut ok = true;
        let mut running = JoinSet::new();

        for stage_id in parallel {
            while running.len() >= limit {
                if let Some(joined) = running.join_next().await {
                    ok &= Self::joined(joined);
                }
            }
            if *cancel.borrow() || (fail_fast && !ok) {
                break;
            }
            let engine = self.clone();
            let entry = entry.clone();
            running.spawn(async move { engine.run_stage(&entry, &stage_id).await });
        }

        for stage_id in sequential {
            if *cancel.borrow() || (fail_fast && !ok) {
                break;
            }
            ok &= self.run_stage(entry, &stage_id).await;
        }

        while let Some(joined) = running.join_next().await {
            ok &= Self::joined(joined);
        }
        ok
    }

    fn joined(result: Result<bool, tokio::task::JoinError>) -> bool {
        result.unwrap_or_else(|err| {
            tracing::error!(target: "workflow_engine", error = %err, "Stage task aborted");
            false
        })
    }

    /// Execute one stage with its retry policy and record the outcome
    async fn run_stage(&self, entry: &InstanceEntry, stage_id: &str) -> bool {
        let Some(stage) = entry.definition.stage(stage_id) else {
            return false;
        };

        let input = {
            let mut run = entry.run.lock().await;
            match stage.resolve_input(&run.instance.input, &run.instance.stage_results) {
                Ok(input) => {
                    run.instance.set_stage(stage_id, StageStatus::Running);
                    self.emit_stage(&run.instance, stage_id, StageStatus::Running);
                    input
                }
                Err(err) => {
                    self.record_failure(
                        &mut run.instance,
                        StageFailure {
                            stage_id: stage_id.to_string(),
                            attempts: 0,
                            kind: FailureKind::Failed,
                            message: err.to_string(),
                            timeout: None,
                        },
                    );
                    return false;
                }
            }
        };

        let limit = stage.timeout.unwrap_or(self.config.default_stage_timeout);
        let policy = stage
            .retry_policy
            .clone()
            .unwrap_or_else(|| self.default_policy());
        let registry = &self.registry;
        let mut last_attempt = 0;

        let outcome = RetryExecutor::new(policy)
            .execute_with_context(|attempt| {
                last_attempt = attempt;
                let input = input.clone();
                async move {
                    let call = registry.execute(&stage.target_plugin_id, &stage.operation, input);
                    match tokio::time::timeout(limit, call).await {
                        Ok(Ok(value)) => Ok(value),
                        Ok(Err(err)) => Err(StageAttemptError::Failed {
                            retryable: err.is_transient(),
                            message: err.to_string(),
                        }),
                        Err(_) => Err(StageAttemptError::Timeout(limit)),
                    }
                }
            })
            .await;

        let mut guard = entry.run.lock().await;
        let run = &mut *guard;

        match outcome {
            Ok(result) => {
                run.instance
                    .stage_retry_counts
                    .insert(stage_id.to_string(), last_attempt.saturating_sub(1));
                run.instance.record_completion(stage_id, input, result);
                if let Err(err) = run.log.append(&run.instance, stage) {
                    tracing::error!(
                        target: "workflow_engine",
                        stage_id = %stage_id,
                        error = %err,
                        "Could not record compensation"
                    );
                }
                self.emit_stage(&run.instance, stage_id, StageStatus::Completed);
                self.apply_branch(entry, &mut run.instance, stage_id);
                true
            }
            Err(err) => {
                let attempts = err.attempts();
                run.instance
                    .stage_retry_counts
                    .insert(stage_id.to_string(), attempts.saturating_sub(1));

                let failure = match err.into_inner() {
                    StageAttemptError::Timeout(limit) => StageFailure {
                        stage_id: stage_id.to_string(),
                        attempts,
                        kind: FailureKind::Timeout,
                        message: format!("timed out after {:?}", limit),
                        timeout: Some(limit),
                    },
                    StageAttemptError::Failed { message, .. } => StageFailure {
                        stage_id: stage_id.to_string(),
                        attempts,
                        kind: FailureKind::Failed,
                        message,
                        timeout: None,
                    },
                };
                self.record_failure(&mut run.instance, failure);
                false
            }
        }
    }

    /// Skip the successor a branch did not select
    fn apply_branch(&self, entry: &InstanceEntry, instance: &mut WorkflowInstance, stage_id: &str) {
        let Some(branch) = entry.definition.branch_of(stage_id) else {
            return;
        };

        let chosen = branch.predicate.evaluate(&instance.results_value());
        let rejected = if chosen { &branch.if_false } else { &branch.if_true };

        tracing::debug!(
            target: "workflow_engine",
            instance_id = %instance.id,
            stage_id = %stage_id,
            predicate = chosen,
            skipped = %rejected,
            "Branch evaluated"
        );

        if instance.status_of(rejected) == Some(StageStatus::Pending) {
            instance.set_stage(rejected, StageStatus::Skipped);
            self.emit_stage(instance, rejected, StageStatus::Skipped);
        }
    }

    fn record_failure(&self, instance: &mut WorkflowInstance, failure: StageFailure) {
        tracing::warn!(
            target: "workflow_engine",
            workflow = %instance.workflow,
            instance_id = %instance.id,
            stage_id = %failure.stage_id,
            attempts = failure.attempts,
            reason = %failure.message,
            "Stage failed"
        );
        instance.set_stage(&failure.stage_id, StageStatus::Failed);
        self.emit_stage(instance, &failure.stage_id, StageStatus::Failed);
        instance.failures.push(failure);
    }

    async fn finish(&self, entry: &InstanceEntry, failed: bool) {
        let mut guard = entry.run.lock().await;
        let run = &mut *guard;

        for stage_id in run.instance.pending_stages() {
            run.instance.set_stage(&stage_id, StageStatus::Skipped);
            self.emit_stage(&run.instance, &stage_id, StageStatus::Skipped);
        }

        let cancelled = *entry.cancel.borrow();
        run.instance.cancel_requested = cancelled;
        let failed = failed || !run.instance.failures.is_empty() || run.instance.deadlock.is_some();

        if failed {
            self.set_status(&mut run.instance, WorkflowStatus::Failed);
            let report = self.rollback.rollback(&mut run.instance, &mut run.log).await;
            self.apply_rollback(&mut run.instance, report);
        } else if cancelled {
            self.set_status(&mut run.instance, WorkflowStatus::Cancelled);
        } else {
            self.set_status(&mut run.instance, WorkflowStatus::Completed);
        }

        tracing::info!(
            target: "workflow_engine",
            workflow = %run.instance.workflow,
            instance_id = %run.instance.id,
            status = ?run.instance.status,
            completed = ?run.instance.completed_stages,
            "Workflow finished"
        );
    }

    fn apply_rollback(&self, instance: &mut WorkflowInstance, report: RollbackReport) {
        let complete = report.is_complete();
        instance.rollback = Some(report);
        if complete && instance.status == WorkflowStatus::Failed {
            self.set_status(instance, WorkflowStatus::RolledBack);
        }
    }

    fn set_status(&self, instance: &mut WorkflowInstance, to: WorkflowStatus) {
        let from = instance.status;
        instance.status = to;
        if to.is_terminal() {
            instance.finished_at = Some(chrono::Utc::now());
        }
        self.events.emit(LifecycleEvent::Workflow {
            workflow: instance.workflow.clone(),
            instance_id: instance.id,
            from,
            to,
            timestamp: chrono::Utc::now(),
        });
    }

    fn emit_stage(&self, instance: &WorkflowInstance, stage_id: &str, status: StageStatus) {
        self.events.emit(LifecycleEvent::Stage {
            workflow: instance.workflow.clone(),
            instance_id: instance.id,
            stage_id: stage_id.to_string(),
            status,
            timestamp: chrono::Utc::now(),
        });
    }

    async fn prune_terminal(&self) -> usize {
        let mut instances = self.instances.write().await;

        let mut finished: Vec<(chrono::DateTime<chrono::Utc>, Uuid)> = instances
            .iter()
            .filter_map(|(id, entry)| {
                let run = entry.run.try_lock().ok()?;
                let finished_at = run.instance.finished_at?;
                // a Failed instance still owes compensation and stays for rollback
                let prunable =
                    run.instance.is_terminal() && run.instance.status != WorkflowStatus::Failed;
                prunable.then_some((finished_at, *id))
            })
            .collect();

        if finished.len() <= self.config.retained_instances {
            return 0;
        }

        finished.sort();
        let excess = finished.len() - self.config.retained_instances;
        for (_, id) in finished.iter().take(excess) {
            instances.remove(id);
        }

        tracing::debug!(target: "workflow_engine", pruned = excess, "Pruned finished workflow instances");
        excess
    }
}

/// Handle on a started workflow instance
pub struct WorkflowRun {
    instance_id: Uuid,
    entry: Arc<InstanceEntry>,
}

impl WorkflowRun {
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Skip every stage not yet started; in-flight stages finish normally
    pub fn cancel(&self) {
        tracing::info!(
            target: "workflow_engine",
            instance_id = %self.instance_id,
            "Workflow cancellation requested"
        );
        self.entry.cancel.send_replace(true);
    }

    /// Wait for the instance to reach a terminal status
    pub async fn wait(self) -> WorkflowReport {
        let mut done = self.entry.done.subscribe();
        // the sender lives in the entry we hold, so this only ends on completion
        let _ = done.wait_for(|finished| *finished).await;

        let run = self.entry.run.lock().await;
        WorkflowReport {
            instance: run.instance.clone(),
        }
    }
}

/// Final state of a workflow run
#[derive(Debug, Clone)]
pub struct WorkflowReport {
    pub instance: WorkflowInstance,
}

impl WorkflowReport {
    pub fn status(&self) -> WorkflowStatus {
        self.instance.status
    }

    pub fn result(&self, stage_id: &str) -> Option<&Value> {
        self.instance.result(stage_id)
    }

    /// The instance when it completed, otherwise the error that best
    /// describes why it did not. Incomplete rollbacks take precedence.
    pub fn into_result(self) -> PluginResult<WorkflowInstance> {
        let instance = self.instance;
        let workflow = instance.workflow.clone();

        match instance.status {
            WorkflowStatus::Completed => Ok(instance),
            WorkflowStatus::Cancelled => Err(PluginError::WorkflowCancelled {
                workflow,
                instance_id: instance.id,
            }),
            WorkflowStatus::Pending | WorkflowStatus::Running => Err(PluginError::invalid_workflow(
                workflow,
                "instance has not finished",
            )),
            WorkflowStatus::Failed | WorkflowStatus::RolledBack => {
                if let Some(report) = instance.rollback.as_ref().filter(|r| !r.is_complete()) {
                    return Err(PluginError::RollbackIncomplete {
                        workflow,
                        instance_id: instance.id,
                        failed_stage_ids: report.failed_stage_ids(),
                    });
                }
                if let Some(pending) = instance.deadlock.clone() {
                    return Err(PluginError::WorkflowDeadlock {
                        workflow,
                        instance_id: instance.id,
                        pending_stages: pending,
                    });
                }
                match instance.failures.first() {
                    Some(failure) if failure.kind == FailureKind::Timeout => Err(PluginError::StageTimeout {
                        workflow,
                        stage_id: failure.stage_id.clone(),
                        timeout: failure.timeout.unwrap_or_default(),
                    }),
                    Some(failure) => Err(PluginError::StageFailed {
                        workflow,
                        stage_id: failure.stage_id.clone(),
                        attempts: failure.attempts,
                        reason: failure.message.clone(),
                    }),
                    None => Err(PluginError::invalid_workflow(workflow, "failed without a recorded cause")),
                }
            }
        }
    }
}
