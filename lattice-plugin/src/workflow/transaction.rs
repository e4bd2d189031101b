//! Transaction log and compensation
//!
//! Completed stages that declare a compensating action are appended to the
//! log. Rollback walks the log backwards and runs each action once; an
//! action that fails stays pending so a later rollback retries only it.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use crate::error::{PluginError, PluginResult};
use crate::events::{EventBus, LifecycleEvent};
use crate::registry::Registry;

use super::definition::Stage;
use super::instance::{StageStatus, WorkflowInstance};

/// A compensating action with its target and input fixed at append time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedCompensation {
    pub target_plugin_id: String,
    pub operation: String,
    pub input: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionEntry {
    pub stage_id: String,
    pub action: ResolvedCompensation,
    pub compensated: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionLog {
    entries: Vec<TransactionEntry>,
}

impl TransactionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the compensation for a completed stage. Stages without a
    /// compensating action add nothing. Returns whether an entry was added.
    pub fn append(&mut self, instance: &WorkflowInstance, stage: &Stage) -> PluginResult<bool> {
        if !instance.completed_stages.iter().any(|id| id == &stage.id) {
            return Err(PluginError::invalid_workflow(
                &instance.workflow,
                format!("stage '{}' has not completed", stage.id),
            ));
        }
        if self.entries.iter().any(|e| e.stage_id == stage.id) {
            return Ok(false);
        }
        let Some(action) = &stage.compensation else {
            return Ok(false);
        };

        let input = action.input.clone().unwrap_or_else(|| {
            json!({
                "input": instance.stage_inputs.get(&stage.id).cloned().unwrap_or(Value::Null),
                "result": instance.stage_results.get(&stage.id).cloned().unwrap_or(Value::Null),
            })
        });

        self.entries.push(TransactionEntry {
            stage_id: stage.id.clone(),
            action: ResolvedCompensation {
                target_plugin_id: action
                    .target_plugin_id
                    .clone()
                    .unwrap_or_else(|| stage.target_plugin_id.clone()),
                operation: action.operation.clone(),
                input,
            },
            compensated: false,
        });
        Ok(true)
    }

    pub fn entries(&self) -> &[TransactionEntry] {
        &self.entries
    }

    /// Entries still waiting for compensation, in append order
    pub fn pending(&self) -> Vec<&TransactionEntry> {
        self.entries.iter().filter(|e| !e.compensated).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationFailure {
    pub stage_id: String,
    pub reason: String,
}

/// What one rollback sweep did
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RollbackReport {
    /// Stages compensated by this sweep, in the order it ran them
    pub compensated: Vec<String>,
    pub failed: Vec<CompensationFailure>,
}

impl RollbackReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_stage_ids(&self) -> Vec<String> {
        self.failed.iter().map(|f| f.stage_id.clone()).collect()
    }
}

pub struct RollbackManager {
    registry: Arc<Registry>,
    compensation_timeout: Duration,
    events: Arc<EventBus>,
}

impl RollbackManager {
    pub fn new(registry: Arc<Registry>, compensation_timeout: Duration, events: Arc<EventBus>) -> Self {
        Self {
            registry,
            compensation_timeout,
            events,
        }
    }

    /// Run every pending compensation in strict reverse order. A failure is
    /// recorded and the sweep carries on.
    pub async fn rollback(
        &self,
        instance: &mut WorkflowInstance,
        log: &mut TransactionLog,
    ) -> RollbackReport {
        let mut report = RollbackReport::default();

        tracing::info!(
            target: "rollback",
            workflow = %instance.workflow,
            instance_id = %instance.id,
            pending = log.pending().len(),
            "Starting rollback"
        );

        for entry in log.entries.iter_mut().rev() {
            if entry.compensated {
                continue;
            }

            let action = &entry.action;
            let outcome = timeout(
                self.compensation_timeout,
                self.registry
                    .execute(&action.target_plugin_id, &action.operation, action.input.clone()),
            )
            .await;

            let status = match outcome {
                Ok(Ok(_)) => {
                    entry.compensated = true;
                    report.compensated.push(entry.stage_id.clone());
                    tracing::debug!(
                        target: "rollback",
                        instance_id = %instance.id,
                        stage_id = %entry.stage_id,
                        "Stage compensated"
                    );
                    StageStatus::Compensated
                }
                Ok(Err(err)) => {
                    report.failed.push(self.failure(instance, &entry.stage_id, err.to_string()));
                    StageStatus::CompensationFailed
                }
                Err(_) => {
                    let reason = format!("compensation timed out after {:?}", self.compensation_timeout);
                    report.failed.push(self.failure(instance, &entry.stage_id, reason));
                    StageStatus::CompensationFailed
                }
            };

            instance.set_stage(&entry.stage_id, status);
            self.events.emit(LifecycleEvent::Stage {
                workflow: instance.workflow.clone(),
                instance_id: instance.id,
                stage_id: entry.stage_id.clone(),
                status,
                timestamp: chrono::Utc::now(),
            });
        }

        report
    }

    fn failure(&self, instance: &WorkflowInstance, stage_id: &str, reason: String) -> CompensationFailure {
        tracing::warn!(
            target: "rollback",
            workflow = %instance.workflow,
            instance_id = %instance.id,
            stage_id = %stage_id,
            reason = %reason,
            "Compensation failed"
        );
        CompensationFailure {
            stage_id: stage_id.to_string(),
            reason,
        }
    }
}
