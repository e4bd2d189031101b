//! Workflow definitions: stages, precedence edges and branches

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use lattice_resilience::RetryPolicy;

use crate::error::{PluginError, PluginResult};

/// Where a bound input field takes its value from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum BindingSource {
    /// The input the workflow was started with
    WorkflowInput {
        #[serde(default)]
        pointer: Option<String>,
    },
    /// The result of an earlier stage
    StageResult {
        stage: String,
        #[serde(default)]
        pointer: Option<String>,
    },
    Literal { value: Value },
}

/// Sets `field` of the stage input from `source`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputBinding {
    pub field: String,
    pub source: BindingSource,
}

/// The undo for a completed stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensatingAction {
    /// Plugin to call; the stage's own target when absent
    #[serde(default)]
    pub target_plugin_id: Option<String>,
    pub operation: String,
    /// Fixed input; when absent the action receives the stage's input and result
    #[serde(default)]
    pub input: Option<Value>,
}

impl CompensatingAction {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            target_plugin_id: None,
            operation: operation.into(),
            input: None,
        }
    }

    pub fn on(mut self, target_plugin_id: impl Into<String>) -> Self {
        self.target_plugin_id = Some(target_plugin_id.into());
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }
}

/// One plugin operation in a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub id: String,
    pub target_plugin_id: String,
    pub operation: String,
    /// Static input, extended by `input_bindings`
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub input_bindings: Vec<InputBinding>,
    /// Per-attempt timeout; the engine default when absent
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    /// The engine default when absent
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    /// May run concurrently with other ready parallel stages
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub compensation: Option<CompensatingAction>,
}

impl Stage {
    pub fn new(
        id: impl Into<String>,
        target_plugin_id: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            target_plugin_id: target_plugin_id.into(),
            operation: operation.into(),
            input: Value::Null,
            input_bindings: Vec::new(),
            timeout: None,
            retry_policy: None,
            parallel: false,
            compensation: None,
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn bind(mut self, field: impl Into<String>, source: BindingSource) -> Self {
        self.input_bindings.push(InputBinding {
            field: field.into(),
            source,
        });
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn parallel(mut self) -> Self {
        self.parallel = true;
        self
    }

    pub fn compensate_with(mut self, action: CompensatingAction) -> Self {
        self.compensation = Some(action);
        self
    }

    /// Build the input for this stage from the workflow input and the
    /// results recorded so far. Missing pointers resolve to `null`.
    pub fn resolve_input(
        &self,
        workflow_input: &Value,
        results: &BTreeMap<String, Value>,
    ) -> PluginResult<Value> {
        if self.input_bindings.is_empty() {
            return Ok(self.input.clone());
        }

        let mut object = match &self.input {
            Value::Null => serde_json::Map::new(),
            Value::Object(map) => map.clone(),
            _ => {
                return Err(PluginError::invalid_workflow(
                    &self.id,
                    "input must be an object when bindings are declared",
                ))
            }
        };

        for binding in &self.input_bindings {
            let value = match &binding.source {
                BindingSource::WorkflowInput { pointer } => lookup(workflow_input, pointer.as_deref()),
                BindingSource::StageResult { stage, pointer } => {
                    let result = results.get(stage).ok_or_else(|| {
                        PluginError::invalid_workflow(
                            &self.id,
                            format!("binding '{}' reads stage '{}' which has no result", binding.field, stage),
                        )
                    })?;
                    lookup(result, pointer.as_deref())
                }
                BindingSource::Literal { value } => value.clone(),
            };
            object.insert(binding.field.clone(), value);
        }

        Ok(Value::Object(object))
    }
}

fn lookup(value: &Value, pointer: Option<&str>) -> Value {
    match pointer {
        None | Some("") => value.clone(),
        Some(pointer) => value.pointer(pointer).cloned().unwrap_or(Value::Null),
    }
}

/// Condition evaluated over the results recorded so far, keyed by stage id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BranchPredicate {
    Equals { pointer: String, value: Value },
    Exists { pointer: String },
    Truthy { pointer: String },
}

impl BranchPredicate {
    pub fn evaluate(&self, results: &Value) -> bool {
        match self {
            BranchPredicate::Equals { pointer, value } => results.pointer(pointer) == Some(value),
            BranchPredicate::Exists { pointer } => results.pointer(pointer).is_some(),
            BranchPredicate::Truthy { pointer } => match results.pointer(pointer) {
                None | Some(Value::Null) | Some(Value::Bool(false)) => false,
                Some(Value::Number(n)) => n.as_f64() != Some(0.0),
                Some(Value::String(s)) => !s.is_empty(),
                Some(Value::Array(a)) => !a.is_empty(),
                Some(Value::Object(o)) => !o.is_empty(),
                Some(Value::Bool(true)) => true,
            },
        }
    }
}

/// After `stage_id` completes, only one of two successors stays schedulable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub stage_id: String,
    pub predicate: BranchPredicate,
    pub if_true: String,
    pub if_false: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
}

/// A named graph of stages. Immutable once an instance has started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    pub stages: Vec<Stage>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub branches: Vec<Branch>,
}

impl WorkflowDefinition {
    pub fn builder(name: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder {
            definition: WorkflowDefinition {
                name: name.into(),
                stages: Vec::new(),
                edges: Vec::new(),
                branches: Vec::new(),
            },
        }
    }

    pub fn stage(&self, stage_id: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.id == stage_id)
    }

    pub fn predecessors(&self, stage_id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.to == stage_id)
            .map(|e| e.from.as_str())
            .collect()
    }

    pub fn successors(&self, stage_id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.from == stage_id)
            .map(|e| e.to.as_str())
            .collect()
    }

    pub fn branch_of(&self, stage_id: &str) -> Option<&Branch> {
        self.branches.iter().find(|b| b.stage_id == stage_id)
    }

    /// Structural checks. Precedence cycles are not detected here; a cycle
    /// shows up as a deadlock when the workflow runs.
    pub fn validate(&self) -> PluginResult<()> {
        let invalid = |reason: String| PluginError::invalid_workflow(&self.name, reason);

        if self.name.trim().is_empty() {
            return Err(invalid("name cannot be empty".to_string()));
        }
        if self.stages.is_empty() {
            return Err(invalid("workflow has no stages".to_string()));
        }

        let mut ids = HashSet::new();
        for stage in &self.stages {
            if stage.id.trim().is_empty() {
                return Err(invalid("stage id cannot be empty".to_string()));
            }
            if !ids.insert(stage.id.as_str()) {
                return Err(invalid(format!("duplicate stage '{}'", stage.id)));
            }
            if stage.target_plugin_id.is_empty() || stage.operation.is_empty() {
                return Err(invalid(format!("stage '{}' needs a target and an operation", stage.id)));
            }
            if stage.timeout == Some(Duration::ZERO) {
                return Err(invalid(format!("stage '{}' has a zero timeout", stage.id)));
            }
            if !stage.input_bindings.is_empty() && !matches!(stage.input, Value::Null | Value::Object(_)) {
                return Err(invalid(format!(
                    "stage '{}' declares bindings but its input is not an object",
                    stage.id
                )));
            }
        }

        for stage in &self.stages {
            for binding in &stage.input_bindings {
                if let BindingSource::StageResult { stage: source, .. } = &binding.source {
                    if source == &stage.id || !ids.contains(source.as_str()) {
                        return Err(invalid(format!(
                            "stage '{}' binds '{}' to unknown stage '{}'",
                            stage.id, binding.field, source
                        )));
                    }
                }
            }
        }

        for edge in &self.edges {
            if !ids.contains(edge.from.as_str()) || !ids.contains(edge.to.as_str()) {
                return Err(invalid(format!("edge {} -> {} references an unknown stage", edge.from, edge.to)));
            }
            if edge.from == edge.to {
                return Err(invalid(format!("stage '{}' precedes itself", edge.from)));
            }
        }

        let mut branching = HashSet::new();
        for branch in &self.branches {
            if !ids.contains(branch.stage_id.as_str()) {
                return Err(invalid(format!("branch on unknown stage '{}'", branch.stage_id)));
            }
            if !branching.insert(branch.stage_id.as_str()) {
                return Err(invalid(format!("stage '{}' has more than one branch", branch.stage_id)));
            }
            if branch.if_true == branch.if_false {
                return Err(invalid(format!("branch on '{}' selects the same stage twice", branch.stage_id)));
            }
            let successors = self.successors(&branch.stage_id);
            for target in [&branch.if_true, &branch.if_false] {
                if !successors.contains(&target.as_str()) {
                    return Err(invalid(format!(
                        "branch target '{}' is not a successor of '{}'",
                        target, branch.stage_id
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Builder for [`WorkflowDefinition`]
pub struct WorkflowBuilder {
    definition: WorkflowDefinition,
}

impl WorkflowBuilder {
    pub fn stage(mut self, stage: Stage) -> Self {
        self.definition.stages.push(stage);
        self
    }

    pub fn edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.definition.edges.push(Edge {
            from: from.into(),
            to: to.into(),
        });
        self
    }

    /// Chain the given stages one after another
    pub fn sequence(mut self, stage_ids: &[&str]) -> Self {
        for pair in stage_ids.windows(2) {
            self = self.edge(pair[0], pair[1]);
        }
        self
    }

    pub fn branch(
        mut self,
        stage_id: impl Into<String>,
        predicate: BranchPredicate,
        if_true: impl Into<String>,
        if_false: impl Into<String>,
    ) -> Self {
        self.definition.branches.push(Branch {
            stage_id: stage_id.into(),
            predicate,
            if_true: if_true.into(),
            if_false: if_false.into(),
        });
        self
    }

    pub fn build(self) -> PluginResult<WorkflowDefinition> {
        self.definition.validate()?;
        Ok(self.definition)
    }
}
