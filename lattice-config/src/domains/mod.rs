//! Domain-specific configuration modules

pub mod discovery;
pub mod hot_reload;
pub mod logging;
pub mod registry;
pub mod utils;
pub mod workflow;

use crate::error::ConfigResult;
use crate::validation::Validatable;
use serde::{Deserialize, Serialize};

/// Main Lattice configuration combining all domains
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LatticeConfig {
    /// Plugin registry and lifecycle configuration
    #[serde(default)]
    pub registry: registry::RegistryConfig,

    /// Workflow engine configuration
    #[serde(default)]
    pub workflow: workflow::WorkflowConfig,

    /// Hot reload configuration
    #[serde(default)]
    pub hot_reload: hot_reload::HotReloadConfig,

    /// Manifest discovery configuration
    #[serde(default)]
    pub discovery: discovery::DiscoveryConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: logging::LoggingConfig,
}

impl LatticeConfig {
    /// Validate all domain configurations
    pub fn validate_all(&self) -> ConfigResult<()> {
        self.registry.validate()?;
        self.workflow.validate()?;
        self.hot_reload.validate()?;
        self.discovery.validate()?;
        self.logging.validate()?;

        Ok(())
    }

    /// Generate a sample configuration file
    pub fn generate_sample() -> String {
        let config = LatticeConfig::default();
        serde_yaml::to_string(&config)
            .unwrap_or_else(|_| "# Failed to generate sample config".to_string())
    }
}
