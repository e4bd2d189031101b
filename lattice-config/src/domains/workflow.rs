//! Workflow engine configuration

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigResult;
use crate::validation::{validate_duration, validate_positive, Validatable};

/// Workflow engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Timeout for a stage that does not declare its own
    #[serde(with = "humantime_serde", default = "default_stage_timeout")]
    pub default_stage_timeout: Duration,

    /// Timeout for a single compensating action during rollback
    #[serde(with = "humantime_serde", default = "default_compensation_timeout")]
    pub compensation_timeout: Duration,

    /// Attempts for a stage that does not declare a retry policy
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,

    /// Delay between attempts for the default retry policy
    #[serde(with = "humantime_serde", default = "default_retry_delay")]
    pub default_retry_delay: Duration,

    /// Backoff applied to the default retry delay
    #[serde(default)]
    pub backoff: BackoffKind,

    /// Upper bound on parallel-eligible stages running at once
    #[serde(default = "default_max_parallel_stages")]
    pub max_parallel_stages: usize,

    /// What happens to other ready stages once one stage has failed
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Number of finished instances kept for inspection before pruning
    #[serde(default = "default_retained_instances")]
    pub retained_instances: usize,
}

/// Backoff applied between stage attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
}

/// Failure handling for fan-out stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Keep running the stages that were already ready and collect every failure
    #[default]
    ContinueAndCollect,
    /// Start nothing new once a stage has failed
    FailFast,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            default_stage_timeout: default_stage_timeout(),
            compensation_timeout: default_compensation_timeout(),
            default_max_attempts: default_max_attempts(),
            default_retry_delay: default_retry_delay(),
            backoff: BackoffKind::default(),
            max_parallel_stages: default_max_parallel_stages(),
            failure_policy: FailurePolicy::default(),
            retained_instances: default_retained_instances(),
        }
    }
}

impl FromStr for BackoffKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fixed" => Ok(BackoffKind::Fixed),
            "exponential" => Ok(BackoffKind::Exponential),
            _ => Err(format!("Invalid backoff: {}", s)),
        }
    }
}

impl Validatable for WorkflowConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_duration(
            self.default_stage_timeout,
            "default_stage_timeout",
            self.domain_name(),
        )?;
        validate_duration(
            self.compensation_timeout,
            "compensation_timeout",
            self.domain_name(),
        )?;
        validate_positive(
            self.default_max_attempts,
            "default_max_attempts",
            self.domain_name(),
        )?;
        validate_positive(
            self.max_parallel_stages,
            "max_parallel_stages",
            self.domain_name(),
        )?;
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "workflow"
    }
}

fn default_stage_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_compensation_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay() -> Duration {
    Duration::from_millis(200)
}

fn default_max_parallel_stages() -> usize {
    8
}

fn default_retained_instances() -> usize {
    256
}
