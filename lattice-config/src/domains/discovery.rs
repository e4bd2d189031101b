//! Manifest discovery configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::ConfigResult;
use crate::validation::{validate_required_string, Validatable};

/// Where and how plugin manifests are searched for
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Paths to search for manifests
    #[serde(default = "default_search_paths")]
    pub search_paths: Vec<PathBuf>,

    /// File name a manifest must have
    #[serde(default = "default_manifest_file_name")]
    pub manifest_file_name: String,

    /// Maximum search depth
    #[serde(default)]
    pub max_depth: Option<usize>,

    /// Whether to follow symbolic links
    #[serde(default = "crate::domains::utils::default_false")]
    pub follow_symlinks: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            search_paths: default_search_paths(),
            manifest_file_name: default_manifest_file_name(),
            max_depth: Some(3),
            follow_symlinks: false,
        }
    }
}

impl Validatable for DiscoveryConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_required_string(
            &self.manifest_file_name,
            "manifest_file_name",
            self.domain_name(),
        )?;

        if self.max_depth == Some(0) {
            return Err(self.validation_error("max_depth must be at least 1"));
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "discovery"
    }
}

fn default_search_paths() -> Vec<PathBuf> {
    vec![PathBuf::from("./plugins")]
}

fn default_manifest_file_name() -> String {
    "plugin.json".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discovery_defaults() {
        let config = DiscoveryConfig::default();
        assert_eq!(config.manifest_file_name, "plugin.json");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_discovery_rejects_empty_file_name() {
        let config = DiscoveryConfig {
            manifest_file_name: String::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
