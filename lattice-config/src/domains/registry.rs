//! Plugin registry and lifecycle configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigResult;
use crate::validation::{validate_duration, Validatable};

/// Timeouts applied at every lifecycle suspension point, plus unload policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// How long the loader may take to hand back a plugin instance
    #[serde(with = "humantime_serde", default = "default_load_timeout")]
    pub load_timeout: Duration,

    /// Time budget for a plugin's init hook
    #[serde(with = "humantime_serde", default = "default_hook_timeout")]
    pub init_timeout: Duration,

    /// Time budget for a plugin's start hook
    #[serde(with = "humantime_serde", default = "default_hook_timeout")]
    pub start_timeout: Duration,

    /// Time budget for pause and resume hooks
    #[serde(with = "humantime_serde", default = "default_pause_timeout")]
    pub pause_timeout: Duration,

    /// Time budget for a stop hook before the plugin is forcibly considered stopped
    #[serde(with = "humantime_serde", default = "default_stop_timeout")]
    pub stop_timeout: Duration,

    /// Whether `unload(id, force = true)` may cascade to running dependents
    #[serde(default = "crate::domains::utils::default_true")]
    pub allow_force_cascade: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            load_timeout: default_load_timeout(),
            init_timeout: default_hook_timeout(),
            start_timeout: default_hook_timeout(),
            pause_timeout: default_pause_timeout(),
            stop_timeout: default_stop_timeout(),
            allow_force_cascade: true,
        }
    }
}

impl Validatable for RegistryConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_duration(self.load_timeout, "load_timeout", self.domain_name())?;
        validate_duration(self.init_timeout, "init_timeout", self.domain_name())?;
        validate_duration(self.start_timeout, "start_timeout", self.domain_name())?;
        validate_duration(self.pause_timeout, "pause_timeout", self.domain_name())?;
        validate_duration(self.stop_timeout, "stop_timeout", self.domain_name())?;
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "registry"
    }
}

fn default_load_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_hook_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_pause_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_stop_timeout() -> Duration {
    Duration::from_secs(10)
}
