//! Hot reload configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigResult;
use crate::validation::{validate_positive, Validatable};

/// Hot reload configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HotReloadConfig {
    /// Whether manifest watching is enabled
    #[serde(default = "crate::domains::utils::default_false")]
    pub enabled: bool,

    /// Directories watched for manifest changes
    #[serde(default)]
    pub watch_paths: Vec<PathBuf>,

    /// Quiet period before a burst of file events becomes a reload
    #[serde(with = "humantime_serde", default = "default_debounce")]
    pub debounce: Duration,

    /// Capacity of the reload request queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for HotReloadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            watch_paths: Vec::new(),
            debounce: default_debounce(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Validatable for HotReloadConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_positive(self.queue_capacity, "queue_capacity", self.domain_name())?;

        if self.enabled && self.watch_paths.is_empty() {
            return Err(self.validation_error("watch_paths must not be empty when enabled"));
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "hot_reload"
    }
}

fn default_debounce() -> Duration {
    Duration::from_millis(500)
}

fn default_queue_capacity() -> usize {
    64
}
