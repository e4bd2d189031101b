//! Domain-driven configuration management for Lattice
//!
//! This crate provides modular configuration split by functional domains,
//! with validation, defaults, and environment variable support.

pub mod error;
pub mod loader;
pub mod validation;

// Domain-specific configuration modules
pub mod domains;

// Re-export main types
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;
pub use validation::Validatable;

// Re-export domain configurations
pub use domains::{
    discovery::DiscoveryConfig,
    hot_reload::HotReloadConfig,
    logging::{LogFormat, LogLevel, LoggingConfig},
    registry::RegistryConfig,
    workflow::{BackoffKind, FailurePolicy, WorkflowConfig},
    LatticeConfig,
};
