//! Configuration loading and environment variable handling

use crate::domains::LatticeConfig;
use crate::error::{ConfigError, ConfigResult};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Configuration loader with environment variable support
pub struct ConfigLoader {
    /// Environment variable prefix
    prefix: String,
}

impl ConfigLoader {
    /// Create a new config loader with default prefix
    pub fn new() -> Self {
        Self {
            prefix: "LATTICE".to_string(),
        }
    }

    /// Create a new config loader with custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Load configuration from a YAML (or `.json`) file with environment overrides
    pub fn from_file(&self, path: impl AsRef<Path>) -> ConfigResult<LatticeConfig> {
        let path = path.as_ref();
        log::debug!("Loading configuration from {}", path.display());

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: LatticeConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            _ => serde_yaml::from_str(&content)?,
        };

        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env(&self) -> ConfigResult<LatticeConfig> {
        let mut config = LatticeConfig::default();
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load configuration with fallback chain
    pub fn load(&self, config_path: Option<impl AsRef<Path>>) -> ConfigResult<LatticeConfig> {
        match config_path {
            Some(path) => self.from_file(path),
            None => self.from_env(),
        }
    }

    /// Apply environment variable overrides to configuration
    fn apply_env_overrides(&self, config: &mut LatticeConfig) -> ConfigResult<()> {
        self.apply_registry_overrides(&mut config.registry)?;
        self.apply_workflow_overrides(&mut config.workflow)?;
        self.apply_hot_reload_overrides(&mut config.hot_reload)?;
        self.apply_logging_overrides(&mut config.logging)?;
        Ok(())
    }

    fn apply_registry_overrides(
        &self,
        config: &mut crate::domains::registry::RegistryConfig,
    ) -> ConfigResult<()> {
        if let Some(timeout) = self.parse_millis("LOAD_TIMEOUT_MS")? {
            config.load_timeout = timeout;
        }
        if let Some(cascade) = self.parse_var("FORCE_CASCADE")? {
            config.allow_force_cascade = cascade;
        }
        Ok(())
    }

    fn apply_workflow_overrides(
        &self,
        config: &mut crate::domains::workflow::WorkflowConfig,
    ) -> ConfigResult<()> {
        if let Some(timeout) = self.parse_millis("STAGE_TIMEOUT_MS")? {
            config.default_stage_timeout = timeout;
        }
        if let Some(attempts) = self.parse_var("STAGE_MAX_ATTEMPTS")? {
            config.default_max_attempts = attempts;
        }
        Ok(())
    }

    fn apply_hot_reload_overrides(
        &self,
        config: &mut crate::domains::hot_reload::HotReloadConfig,
    ) -> ConfigResult<()> {
        if let Some(enabled) = self.parse_var("HOT_RELOAD_ENABLED")? {
            config.enabled = enabled;
        }
        Ok(())
    }

    fn apply_logging_overrides(
        &self,
        config: &mut crate::domains::logging::LoggingConfig,
    ) -> ConfigResult<()> {
        if let Some(level) = self.parse_var("LOG_LEVEL")? {
            config.level = level;
        }
        if let Some(format) = self.parse_var("LOG_FORMAT")? {
            config.format = format;
        }
        Ok(())
    }

    fn parse_millis(&self, name: &str) -> ConfigResult<Option<Duration>> {
        Ok(self.parse_var::<u64>(name)?.map(Duration::from_millis))
    }

    /// `None` when the prefixed variable is unset
    fn parse_var<T>(&self, name: &str) -> ConfigResult<Option<T>>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        let var = format!("{}_{}", self.prefix, name);
        match std::env::var(&var) {
            Ok(value) => value
                .trim()
                .parse()
                .map(Some)
                .map_err(|e: T::Err| ConfigError::Env {
                    var,
                    reason: e.to_string(),
                }),
            Err(_) => Ok(None),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
