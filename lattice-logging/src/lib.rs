//! Logging initialisation for Lattice
//!
//! Every Lattice crate emits through `tracing` (or `log`, which is bridged);
//! this crate installs the global subscriber described by a [`LoggingConfig`].

pub mod init;

pub use init::{build_env_filter, init_logging_from_config, init_simple_tracing};
pub use lattice_config::{LogFormat, LogLevel, LoggingConfig};
