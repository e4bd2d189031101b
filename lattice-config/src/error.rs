//! Configuration error types

use std::path::PathBuf;
use thiserror::Error;

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON config: {0}")]
    Json(#[from] serde_json::Error),

    /// An override variable was set but could not be parsed
    #[error("Invalid value for {var}: {reason}")]
    Env { var: String, reason: String },

    /// A domain failed validation
    #[error("Invalid {domain} configuration: {message}")]
    Invalid { domain: String, message: String },
}
