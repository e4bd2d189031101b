//! Plugin host error types

use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::types::PluginState;

/// Plugin host result type
pub type PluginResult<T> = Result<T, PluginError>;

/// Plugin host errors
#[derive(Error, Debug)]
pub enum PluginError {
    /// A version constraint could not be parsed
    #[error("Malformed version constraint '{constraint}': {reason}")]
    MalformedConstraint { constraint: String, reason: String },

    /// Inserting the plugin would close a dependency cycle
    #[error("Plugin '{plugin_id}' would introduce a dependency cycle: {}", .cycle.join(" -> "))]
    CyclicDependency { plugin_id: String, cycle: Vec<String> },

    /// A non-optional dependency is missing or has the wrong version
    #[error(
        "Plugin '{plugin_id}' requires '{target_id}' {required}, found {}",
        .actual.as_deref().unwrap_or("nothing")
    )]
    UnsatisfiedDependency {
        plugin_id: String,
        target_id: String,
        required: String,
        actual: Option<String>,
    },

    /// The loader could not produce a live plugin instance
    #[error("Plugin '{plugin_id}' failed to load: {reason}")]
    LoadFailed { plugin_id: String, reason: String },

    /// The requested lifecycle transition is not permitted
    #[error("Plugin '{plugin_id}' cannot transition from {from} to {to}")]
    InvalidStateTransition {
        plugin_id: String,
        from: PluginState,
        to: PluginState,
    },

    /// The init or start hook failed
    #[error("Plugin '{plugin_id}' initialization failed: {reason}")]
    InitFailed { plugin_id: String, reason: String },

    /// Plugins depending on this one are still active
    #[error("Plugin '{plugin_id}' has active dependents: {}", .dependents.join(", "))]
    DependentsActive {
        plugin_id: String,
        dependents: Vec<String>,
    },

    /// No stage can run but the workflow has not finished
    #[error("Workflow '{workflow}' ({instance_id}) deadlocked with pending stages: {}", .pending_stages.join(", "))]
    WorkflowDeadlock {
        workflow: String,
        instance_id: Uuid,
        pending_stages: Vec<String>,
    },

    /// A stage's last attempt ran out of time
    #[error("Stage '{stage_id}' of workflow '{workflow}' timed out after {timeout:?}")]
    StageTimeout {
        workflow: String,
        stage_id: String,
        timeout: Duration,
    },

    /// A stage failed after exhausting its retry policy
    #[error("Stage '{stage_id}' of workflow '{workflow}' failed after {attempts} attempt(s): {reason}")]
    StageFailed {
        workflow: String,
        stage_id: String,
        attempts: u32,
        reason: String,
    },

    /// Some compensating actions failed during rollback
    #[error("Rollback of workflow '{workflow}' ({instance_id}) incomplete, failed stages: {}", .failed_stage_ids.join(", "))]
    RollbackIncomplete {
        workflow: String,
        instance_id: Uuid,
        failed_stage_ids: Vec<String>,
    },

    /// Plugin not found
    #[error("Plugin '{plugin_id}' not found")]
    PluginNotFound { plugin_id: String },

    /// Plugin already registered
    #[error("Plugin '{plugin_id}' is already registered")]
    AlreadyRegistered { plugin_id: String },

    /// A non-optional dependency is registered but not running
    #[error("Plugin '{plugin_id}' cannot start: dependency '{dependency_id}' is {state}")]
    DependencyNotRunning {
        plugin_id: String,
        dependency_id: String,
        state: PluginState,
    },

    /// The plugin cannot serve requests right now
    #[error("Plugin '{plugin_id}' is unavailable: {reason}")]
    PluginUnavailable { plugin_id: String, reason: String },

    /// A plugin operation returned an error
    #[error("Plugin '{plugin_id}' operation '{operation}' failed: {reason}")]
    OperationFailed {
        plugin_id: String,
        operation: String,
        reason: String,
    },

    /// Workflow definition is structurally invalid
    #[error("Invalid workflow '{workflow}': {reason}")]
    InvalidWorkflow { workflow: String, reason: String },

    /// Unknown workflow instance
    #[error("Workflow instance {instance_id} not found")]
    WorkflowNotFound { instance_id: Uuid },

    /// Workflow was cancelled before completing
    #[error("Workflow '{workflow}' ({instance_id}) was cancelled")]
    WorkflowCancelled { workflow: String, instance_id: Uuid },

    /// Invalid plugin manifest
    #[error("Invalid plugin manifest {location}: {reason}")]
    InvalidManifest { location: String, reason: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] lattice_config::ConfigError),

    /// File watcher error
    #[cfg(feature = "watcher")]
    #[error("Watcher error: {0}")]
    Watcher(#[from] notify::Error),
}

impl PluginError {
    /// Create an operation failure, the usual error a plugin returns from `execute`
    pub fn operation_failed(
        plugin_id: impl Into<String>,
        operation: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::OperationFailed {
            plugin_id: plugin_id.into(),
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    pub fn not_found(plugin_id: impl Into<String>) -> Self {
        Self::PluginNotFound {
            plugin_id: plugin_id.into(),
        }
    }

    pub fn unavailable(plugin_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PluginUnavailable {
            plugin_id: plugin_id.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_workflow(workflow: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidWorkflow {
            workflow: workflow.into(),
            reason: reason.into(),
        }
    }

    /// Whether retrying the same call could plausibly succeed
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            PluginError::PluginNotFound { .. }
                | PluginError::MalformedConstraint { .. }
                | PluginError::InvalidWorkflow { .. }
                | PluginError::Serialization(_)
        )
    }
}
