//! Plugin metadata, lifecycle states and records

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::PluginResult;
use crate::version::VersionConstraint;

/// Lifecycle state of a plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    Unloaded,
    Loading,
    Loaded,
    Initializing,
    Running,
    Paused,
    Stopping,
    Stopped,
    Reloading,
    Error,
}

impl PluginState {
    /// Whether the state machine permits moving from `self` to `next`
    pub fn can_transition_to(self, next: PluginState) -> bool {
        use PluginState::*;

        match (self, next) {
            (Unloaded, Loading) => true,
            (Loading, Loaded) | (Loading, Error) => true,
            (Loaded, Initializing) | (Loaded, Stopping) | (Loaded, Error) => true,
            (Initializing, Running) | (Initializing, Error) => true,
            (Running, Paused) | (Running, Stopping) | (Running, Reloading) | (Running, Error) => {
                true
            }
            (Paused, Running) | (Paused, Stopping) | (Paused, Reloading) | (Paused, Error) => true,
            (Stopping, Stopped) | (Stopping, Error) => true,
            (Stopped, Unloaded) | (Stopped, Loading) => true,
            (Reloading, Running) | (Reloading, Error) => true,
            // explicit restart only
            (Error, Loading) => true,
            _ => false,
        }
    }

    /// A plugin instance exists and has not been shut down
    pub fn is_active(self) -> bool {
        matches!(
            self,
            PluginState::Loaded
                | PluginState::Initializing
                | PluginState::Running
                | PluginState::Paused
                | PluginState::Reloading
        )
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unloaded => "unloaded",
            Self::Loading => "loading",
            Self::Loaded => "loaded",
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Reloading => "reloading",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// A declared dependency on another plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    /// Id of the plugin depended upon
    pub target_id: String,
    /// Versions of the target that are acceptable
    #[serde(default)]
    pub constraint: VersionConstraint,
    /// Optional dependencies never block lifecycle progression
    #[serde(default)]
    pub optional: bool,
}

impl Dependency {
    /// A non-optional dependency
    pub fn required(target_id: impl Into<String>, constraint: &str) -> PluginResult<Self> {
        Ok(Self {
            target_id: target_id.into(),
            constraint: VersionConstraint::parse(constraint)?,
            optional: false,
        })
    }

    /// An optional dependency
    pub fn optional(target_id: impl Into<String>, constraint: &str) -> PluginResult<Self> {
        Ok(Self {
            optional: true,
            ..Self::required(target_id, constraint)?
        })
    }
}

/// An interface a plugin implements, at a given version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    pub interface_id: String,
    pub version: Version,
}

/// What the host knows about a plugin before loading it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginMetadata {
    /// Plugin unique identifier
    pub id: String,
    pub version: Version,
    /// What the loader opens; the id when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locator: Option<String>,
    /// Declared dependencies, in declaration order
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    /// Whether the plugin may be paused while a dependency hot reloads
    #[serde(default = "default_pausable")]
    pub pausable: bool,
    /// Opaque configuration handed to the plugin's init hook
    #[serde(default)]
    pub config: serde_json::Value,
}

fn default_pausable() -> bool {
    true
}

impl PluginMetadata {
    pub fn new(id: impl Into<String>, version: Version) -> Self {
        Self {
            id: id.into(),
            version,
            locator: None,
            dependencies: Vec::new(),
            capabilities: Vec::new(),
            pausable: true,
            config: serde_json::Value::Null,
        }
    }

    /// Add a dependency to this plugin
    pub fn with_dependency(mut self, dependency: Dependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    /// Shorthand for a non-optional dependency
    pub fn depends_on(self, target_id: &str, constraint: &str) -> PluginResult<Self> {
        Ok(self.with_dependency(Dependency::required(target_id, constraint)?))
    }

    pub fn with_capability(mut self, interface_id: impl Into<String>, version: Version) -> Self {
        self.capabilities.push(Capability {
            interface_id: interface_id.into(),
            version,
        });
        self
    }

    pub fn with_locator(mut self, locator: impl Into<String>) -> Self {
        self.locator = Some(locator.into());
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_pausable(mut self, pausable: bool) -> Self {
        self.pausable = pausable;
        self
    }

    pub fn locator(&self) -> &str {
        self.locator.as_deref().unwrap_or(&self.id)
    }
}

/// The authoritative host-side view of one plugin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginRecord {
    pub metadata: PluginMetadata,
    pub state: PluginState,
    /// When the plugin last reached `Running`
    pub load_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Identifies the live instance; changes on every load and reload
    pub instance_id: Option<Uuid>,
    pub state_changed_at: DateTime<Utc>,
}

impl PluginRecord {
    pub fn new(metadata: PluginMetadata) -> Self {
        Self {
            metadata,
            state: PluginState::Unloaded,
            load_time: None,
            last_error: None,
            instance_id: None,
            state_changed_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    pub fn version(&self) -> &Version {
        &self.metadata.version
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.metadata.dependencies
    }

    pub fn is_running(&self) -> bool {
        self.state == PluginState::Running
    }

    /// Whether the plugin declares `interface_id` at a version matching `constraint`
    pub fn supports(&self, interface_id: &str, constraint: &VersionConstraint) -> bool {
        self.metadata
            .capabilities
            .iter()
            .any(|c| c.interface_id == interface_id && constraint.matches(&c.version))
    }

    /// Seconds since the plugin last reached `Running`
    pub fn uptime_seconds(&self) -> Option<f64> {
        self.load_time.map(|loaded_at| {
            Utc::now()
                .signed_duration_since(loaded_at)
                .num_milliseconds() as f64
                / 1000.0
        })
    }
}
