//! Plugin host: one registry, workflow engine and reload loop per process
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use lattice_config::{LatticeConfig, Validatable};

use crate::discovery::{ManifestDirectorySource, MetadataSource};
use crate::error::{PluginError, PluginResult};
use crate::events::{EventBus, EventSink, TracingEventSink};
use crate::hot_reload::{HotReloadCoordinator, ReloadLoop, ReloadOutcome, ReloadRequest, ReloadSender};
use crate::loader::PluginLoader;
use crate::registry::Registry;
use crate::types::PluginState;
use crate::workflow::WorkflowEngine;

#[cfg(feature = "watcher")]
use crate::hot_reload::ManifestWatcher;

/// Default capacity of the lifecycle event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// The assembled plugin host
pub struct PluginHost {
    config: LatticeConfig,
    registry: Arc<Registry>,
    workflows: WorkflowEngine,
    reloads: ReloadSender,
    reload_loop: Mutex<Option<ReloadLoop>>,
    /// Manifest path to content checksum, for change detection
    checksums: RwLock<HashMap<PathBuf, String>>,
    #[cfg(feature = "watcher")]
    watcher: Mutex<Option<ManifestWatcher>>,
}

impl PluginHost {
    pub fn builder(loader: Arc<dyn PluginLoader>) -> PluginHostBuilder {
        PluginHostBuilder::new(loader)
    }

    pub fn config(&self) -> &LatticeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn workflows(&self) -> &WorkflowEngine {
        &self.workflows
    }

    /// Handle for enqueueing reloads
    pub fn reloads(&self) -> &ReloadSender {
        &self.reloads
    }

    /// Reload through the queue and wait for the outcome
    pub async fn reload(&self, request: ReloadRequest) -> PluginResult<ReloadOutcome> {
        self.reloads.request(request).await
    }

    /// Register everything a metadata source yields. Plugins that are
    /// already registered or fail to register are logged and skipped.
    pub async fn discover(&self, source: &dyn MetadataSource) -> PluginResult<Vec<String>> {
        let discovered = source.discover().await?;
        let mut registered = Vec::with_capacity(discovered.len());

        for metadata in discovered {
            let plugin_id = metadata.id.clone();
            match self.registry.register(metadata).await {
                Ok(()) => registered.push(plugin_id),
                Err(PluginError::AlreadyRegistered { .. }) => {
                    tracing::debug!(
                        target: "plugin_discovery",
                        plugin_id = %plugin_id,
                        "Plugin already registered"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        target: "plugin_discovery",
                        plugin_id = %plugin_id,
                        source = source.source_type(),
                        error = %err,
                        "Discovered plugin rejected"
                    );
                }
            }
        }

        tracing::info!(
            target: "plugin_discovery",
            source = source.source_type(),
            registered = registered.len(),
            "Registered discovered plugins"
        );
        Ok(registered)
    }

    /// Scan the configured search paths, register what is found and
    /// remember each manifest's checksum
    pub async fn discover_manifests(&self) -> PluginResult<Vec<String>> {
        let source = ManifestDirectorySource::new(self.config.discovery.clone());
        let manifests = source.scan().await?;
        let mut registered = Vec::new();

        let mut checksums = self.checksums.write().await;
        for manifest in manifests {
            let plugin_id = manifest.metadata.id.clone();
            match self.registry.register(manifest.metadata).await {
                Ok(()) => {
                    checksums.insert(manifest.path, manifest.checksum);
                    registered.push(plugin_id);
                }
                Err(err) => {
                    tracing::warn!(
                        target: "plugin_discovery",
                        plugin_id = %plugin_id,
                        path = ?manifest.path,
                        error = %err,
                        "Manifest plugin rejected"
                    );
                }
            }
        }

        Ok(registered)
    }

    /// Load every registered plugin that is not already up, in load order
    pub async fn load_all(&self) -> PluginResult<()> {
        for plugin_id in self.registry.load_order().await? {
            let up = matches!(
                self.registry.state_of(&plugin_id).await,
                Some(PluginState::Running) | Some(PluginState::Paused)
            );
            if !up {
                self.registry.load(&plugin_id).await?;
            }
        }
        Ok(())
    }

    /// Start the manifest watcher. Returns `false` when hot reload is
    /// disabled in the configuration.
    #[cfg(feature = "watcher")]
    pub async fn watch_manifests(&self) -> PluginResult<bool> {
        if !self.config.hot_reload.enabled {
            tracing::info!(target: "hot_reload", "Hot reload disabled, not watching manifests");
            return Ok(false);
        }

        let mut slot = self.watcher.lock().await;
        if slot.is_some() {
            return Ok(true);
        }

        let checksums = self.checksums.read().await.clone();
        *slot = Some(ManifestWatcher::start(
            &self.config.hot_reload,
            &self.config.discovery.manifest_file_name,
            checksums,
            self.reloads.clone(),
        )?);
        Ok(true)
    }

    #[cfg(feature = "watcher")]
    async fn stop_watching(&self) {
        if let Some(watcher) = self.watcher.lock().await.take() {
            watcher.stop();
        }
    }

    #[cfg(not(feature = "watcher"))]
    async fn stop_watching(&self) {}

    /// Stop watching, drain the reload loop and unload every plugin
    pub async fn shutdown(&self) {
        tracing::info!(target: "plugin_registry", "Shutting down plugin host");

        self.stop_watching().await;

        if let Some(reload_loop) = self.reload_loop.lock().await.take() {
            reload_loop.shutdown().await;
        }

        self.registry.shutdown().await;
    }
}

/// Builder for [`PluginHost`]
pub struct PluginHostBuilder {
    loader: Arc<dyn PluginLoader>,
    config: LatticeConfig,
    sinks: Vec<Arc<dyn EventSink>>,
    event_capacity: usize,
}

impl PluginHostBuilder {
    pub fn new(loader: Arc<dyn PluginLoader>) -> Self {
        Self {
            loader,
            config: LatticeConfig::default(),
            sinks: Vec::new(),
            event_capacity: EVENT_CHANNEL_CAPACITY,
        }
    }

    pub fn with_config(mut self, config: LatticeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Mirror every lifecycle event into the log
    pub fn with_tracing_events(self) -> Self {
        self.with_sink(Arc::new(TracingEventSink))
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Validate the configuration and assemble the host. Spawns the reload
    /// loop, so it must run inside a Tokio runtime.
    pub async fn build(self) -> PluginResult<PluginHost> {
        self.config.validate_all()?;
        tracing::debug!(
            target: "plugin_registry",
            domain = self.config.registry.domain_name(),
            "Configuration validated"
        );

        let events = Arc::new(
            self.sinks
                .into_iter()
                .fold(EventBus::new(self.event_capacity), |bus, sink| bus.with_sink(sink)),
        );

        let registry = Arc::new(Registry::with_events(
            self.loader,
            self.config.registry.clone(),
            events,
        ));
        let workflows = WorkflowEngine::new(registry.clone(), self.config.workflow.clone());
        let (reloads, reload_loop) =
            HotReloadCoordinator::new(registry.clone()).spawn(self.config.hot_reload.queue_capacity);

        tracing::info!(
            target: "plugin_registry",
            hot_reload = self.config.hot_reload.enabled,
            "Plugin host ready"
        );

        Ok(PluginHost {
            config: self.config,
            registry,
            workflows,
            reloads,
            reload_loop: Mutex::new(Some(reload_loop)),
            checksums: RwLock::new(HashMap::new()),
            #[cfg(feature = "watcher")]
            watcher: Mutex::new(None),
        })
    }
}
