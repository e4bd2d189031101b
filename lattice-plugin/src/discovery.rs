//! Plugin discovery: where plugin metadata comes from
//!
//! The host only ever reads metadata. A [`MetadataSource`] hands back
//! `PluginMetadata`; the directory source reads JSON manifests from disk.

use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use lattice_config::DiscoveryConfig;

use crate::error::{PluginError, PluginResult};
use crate::types::PluginMetadata;

/// Read-only supplier of plugin metadata
#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn discover(&self) -> PluginResult<Vec<PluginMetadata>>;

    fn source_type(&self) -> &'static str;
}

/// Metadata known up front
#[derive(Debug, Clone, Default)]
pub struct StaticMetadataSource {
    plugins: Vec<PluginMetadata>,
}

impl StaticMetadataSource {
    pub fn new(plugins: Vec<PluginMetadata>) -> Self {
        Self { plugins }
    }

    pub fn with_plugin(mut self, metadata: PluginMetadata) -> Self {
        self.plugins.push(metadata);
        self
    }
}

#[async_trait]
impl MetadataSource for StaticMetadataSource {
    async fn discover(&self) -> PluginResult<Vec<PluginMetadata>> {
        Ok(self.plugins.clone())
    }

    fn source_type(&self) -> &'static str {
        "static"
    }
}

/// A manifest read from disk
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredManifest {
    pub metadata: PluginMetadata,
    pub path: PathBuf,
    /// SHA-256 of the manifest file, hex encoded
    pub checksum: String,
}

/// Read and parse one manifest file
pub async fn read_manifest(path: &Path) -> PluginResult<DiscoveredManifest> {
    let content = tokio::fs::read(path).await?;

    let metadata: PluginMetadata =
        serde_json::from_slice(&content).map_err(|e| PluginError::InvalidManifest {
            location: path.display().to_string(),
            reason: e.to_string(),
        })?;

    if metadata.id.trim().is_empty() {
        return Err(PluginError::InvalidManifest {
            location: path.display().to_string(),
            reason: "plugin id cannot be empty".to_string(),
        });
    }

    Ok(DiscoveredManifest {
        metadata,
        path: path.to_path_buf(),
        checksum: checksum(&content),
    })
}

fn checksum(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

/// Walks the configured search paths for manifest files
pub struct ManifestDirectorySource {
    config: DiscoveryConfig,
}

impl ManifestDirectorySource {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Every readable manifest under the search paths, first occurrence of
    /// each id wins
    pub async fn scan(&self) -> PluginResult<Vec<DiscoveredManifest>> {
        let mut discovered = Vec::new();
        let mut seen = HashSet::new();

        for search_path in &self.config.search_paths {
            if !search_path.exists() {
                tracing::debug!(
                    target: "plugin_discovery",
                    path = ?search_path,
                    "Search path does not exist, skipping"
                );
                continue;
            }

            for manifest in self.scan_path(search_path).await {
                if !seen.insert(manifest.metadata.id.clone()) {
                    tracing::warn!(
                        target: "plugin_discovery",
                        plugin_id = %manifest.metadata.id,
                        path = ?manifest.path,
                        "Duplicate plugin manifest ignored"
                    );
                    continue;
                }
                discovered.push(manifest);
            }
        }

        Ok(discovered)
    }

    async fn scan_path(&self, root: &Path) -> Vec<DiscoveredManifest> {
        let mut walker = WalkDir::new(root)
            .follow_links(self.config.follow_symlinks)
            .sort_by_file_name();
        if let Some(max_depth) = self.config.max_depth {
            walker = walker.max_depth(max_depth);
        }

        let candidates: Vec<PathBuf> = walker
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| e.file_name().to_str() == Some(self.config.manifest_file_name.as_str()))
            .map(|e| e.into_path())
            .collect();

        let mut manifests = Vec::with_capacity(candidates.len());
        for path in candidates {
            match read_manifest(&path).await {
                Ok(manifest) => manifests.push(manifest),
                Err(e) => {
                    tracing::warn!(
                        target: "plugin_discovery",
                        file = ?path,
                        error = %e,
                        "Failed to read plugin manifest"
                    );
                }
            }
        }

        tracing::info!(
            target: "plugin_discovery",
            path = ?root,
            count = manifests.len(),
            "Plugin discovery completed"
        );
        manifests
    }
}

#[async_trait]
impl MetadataSource for ManifestDirectorySource {
    async fn discover(&self) -> PluginResult<Vec<PluginMetadata>> {
        Ok(self.scan().await?.into_iter().map(|m| m.metadata).collect())
    }

    fn source_type(&self) -> &'static str {
        "manifest_directory"
    }
}
