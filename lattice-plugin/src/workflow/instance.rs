//! Mutable run state of a workflow

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

use super::definition::WorkflowDefinition;
use super::transaction::RollbackReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    RolledBack,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, WorkflowStatus::Pending | WorkflowStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// Not selected by a branch, or never reached
    Skipped,
    Compensated,
    CompensationFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Failed,
}

/// Why a stage gave up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageFailure {
    pub stage_id: String,
    pub attempts: u32,
    pub kind: FailureKind,
    pub message: String,
    /// Per-attempt budget, for timeouts
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub workflow: String,
    pub status: WorkflowStatus,
    pub input: Value,
    pub stage_status: BTreeMap<String, StageStatus>,
    /// In completion order; rollback walks it backwards
    pub completed_stages: Vec<String>,
    pub stage_results: BTreeMap<String, Value>,
    /// Resolved input each stage ran with
    pub stage_inputs: BTreeMap<String, Value>,
    /// Retries used, not counting the first attempt
    pub stage_retry_counts: BTreeMap<String, u32>,
    pub failures: Vec<StageFailure>,
    /// Stages left pending when the scheduler found nothing runnable
    pub deadlock: Option<Vec<String>>,
    pub rollback: Option<RollbackReport>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowInstance {
    pub fn new(definition: &WorkflowDefinition, input: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow: definition.name.clone(),
            status: WorkflowStatus::Pending,
            input,
            stage_status: definition
                .stages
                .iter()
                .map(|s| (s.id.clone(), StageStatus::Pending))
                .collect(),
            completed_stages: Vec::new(),
            stage_results: BTreeMap::new(),
            stage_inputs: BTreeMap::new(),
            stage_retry_counts: BTreeMap::new(),
            failures: Vec::new(),
            deadlock: None,
            rollback: None,
            cancel_requested: false,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn status_of(&self, stage_id: &str) -> Option<StageStatus> {
        self.stage_status.get(stage_id).copied()
    }

    pub fn pending_stages(&self) -> Vec<String> {
        self.stage_status
            .iter()
            .filter(|(_, status)| **status == StageStatus::Pending)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Results keyed by stage id, as one JSON object for branch predicates
    pub fn results_value(&self) -> Value {
        Value::Object(
            self.stage_results
                .iter()
                .map(|(id, result)| (id.clone(), result.clone()))
                .collect(),
        )
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn result(&self, stage_id: &str) -> Option<&Value> {
        self.stage_results.get(stage_id)
    }

    pub(crate) fn set_stage(&mut self, stage_id: &str, status: StageStatus) {
        self.stage_status.insert(stage_id.to_string(), status);
    }

    /// Record a successful stage; the result is stored before the stage is
    /// listed as completed
    pub(crate) fn record_completion(&mut self, stage_id: &str, input: Value, result: Value) {
        self.stage_inputs.insert(stage_id.to_string(), input);
        self.stage_results.insert(stage_id.to_string(), result);
        self.completed_stages.push(stage_id.to_string());
        self.set_stage(stage_id, StageStatus::Completed);
    }
}
