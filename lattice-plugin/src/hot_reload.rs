//! Replace a running plugin in place
//!
//! A reload is validated before anything is touched, then runs entirely under
//! the registry's exclusive section: the plugin moves to `Reloading`, its
//! running dependents are paused, the old instance is shut down, a new one is
//! brought up and the dependents are resumed. If the new instance fails to
//! come up the plugin is left in `Error` and its dependents stay paused.

use semver::Version;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{PluginError, PluginResult};
use crate::registry::{Registry, RegistryState};
use crate::types::{PluginMetadata, PluginState};

/// Ask for `plugin_id` to be reloaded, optionally with new metadata
#[derive(Debug, Clone)]
pub struct ReloadRequest {
    pub plugin_id: String,
    pub metadata: Option<PluginMetadata>,
}

impl ReloadRequest {
    /// Reload the same build location with the same metadata
    pub fn new(plugin_id: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            metadata: None,
        }
    }

    /// Reload with updated metadata (new version, locator or dependencies)
    pub fn with_metadata(metadata: PluginMetadata) -> Self {
        Self {
            plugin_id: metadata.id.clone(),
            metadata: Some(metadata),
        }
    }
}

/// What a successful reload did
#[derive(Debug, Clone, Serialize)]
pub struct ReloadOutcome {
    pub plugin_id: String,
    pub old_version: Version,
    pub new_version: Version,
    pub instance_id: Uuid,
    /// Dependents paused for the reload, most dependent first
    pub paused: Vec<String>,
    pub resumed: Vec<String>,
    /// Dependents whose resume hook failed, with the reason
    pub resume_failures: Vec<(String, String)>,
}

pub struct HotReloadCoordinator {
    registry: Arc<Registry>,
}

impl HotReloadCoordinator {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Perform one reload
    pub async fn reload(&self, request: ReloadRequest) -> PluginResult<ReloadOutcome> {
        tracing::info!(
            target: "hot_reload",
            plugin_id = %request.plugin_id,
            new_metadata = request.metadata.is_some(),
            "Hot reload requested"
        );

        let mut guard = self.registry.write_state().await;
        let result = self.reload_locked(&mut guard, request).await;
        if result.is_ok() {
            guard.stats.total_reloads += 1;
        }
        drop(guard);
        self.registry.notify_changed();

        match &result {
            Ok(outcome) => tracing::info!(
                target: "hot_reload",
                plugin_id = %outcome.plugin_id,
                old_version = %outcome.old_version,
                new_version = %outcome.new_version,
                paused = ?outcome.paused,
                "Hot reload completed"
            ),
            Err(err) => tracing::warn!(
                target: "hot_reload",
                error = %err,
                "Hot reload failed"
            ),
        }
        result
    }

    async fn reload_locked(
        &self,
        state: &mut RegistryState,
        request: ReloadRequest,
    ) -> PluginResult<ReloadOutcome> {
        let plugin_id = request.plugin_id.as_str();
        let lifecycle = self.registry.lifecycle();

        let previous = state
            .state_of(plugin_id)
            .ok_or_else(|| PluginError::not_found(plugin_id))?;
        if !matches!(previous, PluginState::Running | PluginState::Paused) {
            return Err(PluginError::InvalidStateTransition {
                plugin_id: plugin_id.to_string(),
                from: previous,
                to: PluginState::Reloading,
            });
        }

        if let Some(metadata) = &request.metadata {
            Self::validate_replacement(state, plugin_id, metadata)?;
        }

        let dependents = state.graph.transitive_dependents(plugin_id)?;
        let mut to_pause = Vec::new();
        let mut blocking = Vec::new();
        for dependent in &dependents {
            let Some(record) = state.records.get(dependent) else {
                continue;
            };
            if record.state != PluginState::Running {
                continue;
            }
            if record.metadata.pausable {
                to_pause.push(dependent.clone());
            } else {
                blocking.push(dependent.clone());
            }
        }
        if !blocking.is_empty() {
            return Err(PluginError::DependentsActive {
                plugin_id: plugin_id.to_string(),
                dependents: blocking,
            });
        }

        let old_handle = state
            .handles
            .get(plugin_id)
            .cloned()
            .ok_or_else(|| PluginError::unavailable(plugin_id, "no live instance"))?;
        let record = state
            .records
            .get_mut(plugin_id)
            .ok_or_else(|| PluginError::not_found(plugin_id))?;
        let old_version = record.version().clone();
        lifecycle.transition(record, PluginState::Reloading)?;

        let mut paused: Vec<String> = Vec::new();
        for dependent in &to_pause {
            if let Err(err) = self.pause_dependent(state, dependent).await {
                tracing::warn!(
                    target: "hot_reload",
                    plugin_id = %plugin_id,
                    dependent = %dependent,
                    error = %err,
                    "Could not pause dependent, abandoning reload"
                );
                for already in paused.iter().rev() {
                    let _ = self.resume_dependent(state, already).await;
                }
                self.restore(state, plugin_id, previous).await;
                return Err(err);
            }
            paused.push(dependent.clone());
        }

        state.handles.remove(plugin_id);
        lifecycle.shutdown_instance(plugin_id, &old_handle).await;
        state.graph.mark_inactive(plugin_id);

        let record = state
            .records
            .get_mut(plugin_id)
            .ok_or_else(|| PluginError::not_found(plugin_id))?;

        if let Some(metadata) = request.metadata {
            if let Err(err) = state.graph.replace_plugin(&metadata) {
                lifecycle.fail(record, &err);
                return Err(err);
            }
            record.metadata = metadata;
        }

        // on failure the plugin is in Error and dependents stay paused
        let new_handle = lifecycle.reinitialize(record).await?;
        let new_version = record.version().clone();
        let instance_id = new_handle.instance_id();

        state.handles.insert(plugin_id.to_string(), new_handle);
        state.graph.mark_active(plugin_id);

        let mut resumed = Vec::new();
        let mut resume_failures = Vec::new();
        for dependent in paused.iter().rev() {
            match self.resume_dependent(state, dependent).await {
                Ok(()) => resumed.push(dependent.clone()),
                Err(err) => {
                    tracing::warn!(
                        target: "hot_reload",
                        plugin_id = %plugin_id,
                        dependent = %dependent,
                        error = %err,
                        "Dependent did not resume after reload"
                    );
                    resume_failures.push((dependent.clone(), err.to_string()));
                }
            }
        }

        Ok(ReloadOutcome {
            plugin_id: plugin_id.to_string(),
            old_version,
            new_version,
            instance_id,
            paused,
            resumed,
            resume_failures,
        })
    }

    /// Checks that must pass before new metadata replaces the old
    fn validate_replacement(
        state: &RegistryState,
        plugin_id: &str,
        metadata: &PluginMetadata,
    ) -> PluginResult<()> {
        if metadata.id != plugin_id {
            return Err(PluginError::InvalidManifest {
                location: metadata.locator().to_string(),
                reason: format!(
                    "reload of '{}' supplied metadata for '{}'",
                    plugin_id, metadata.id
                ),
            });
        }

        state.graph.check_acyclic(plugin_id, &metadata.dependencies)?;
        state
            .graph
            .validate_dependencies(plugin_id, &metadata.dependencies)?;
        state.require_running(plugin_id, &metadata.dependencies)?;

        for dependent in state.graph.required_dependents_of(plugin_id) {
            let Some(edge) = state.graph.edge(&dependent, plugin_id) else {
                continue;
            };
            if !edge.constraint.matches(&metadata.version) {
                return Err(PluginError::UnsatisfiedDependency {
                    plugin_id: dependent,
                    target_id: plugin_id.to_string(),
                    required: edge.constraint.to_string(),
                    actual: Some(metadata.version.to_string()),
                });
            }
        }
        Ok(())
    }

    async fn pause_dependent(&self, state: &mut RegistryState, plugin_id: &str) -> PluginResult<()> {
        let handle = state
            .handles
            .get(plugin_id)
            .cloned()
            .ok_or_else(|| PluginError::unavailable(plugin_id, "no live instance"))?;
        let record = state
            .records
            .get_mut(plugin_id)
            .ok_or_else(|| PluginError::not_found(plugin_id))?;
        self.registry.lifecycle().pause(record, &handle).await
    }

    async fn resume_dependent(&self, state: &mut RegistryState, plugin_id: &str) -> PluginResult<()> {
        let handle = state
            .handles
            .get(plugin_id)
            .cloned()
            .ok_or_else(|| PluginError::unavailable(plugin_id, "no live instance"))?;
        let record = state
            .records
            .get_mut(plugin_id)
            .ok_or_else(|| PluginError::not_found(plugin_id))?;
        self.registry.lifecycle().resume(record, &handle).await
    }

    /// Undo the `Reloading` mark after an abandoned reload
    async fn restore(&self, state: &mut RegistryState, plugin_id: &str, previous: PluginState) {
        let lifecycle = self.registry.lifecycle();
        let handle = state.handles.get(plugin_id).cloned();
        let Some(record) = state.records.get_mut(plugin_id) else {
            return;
        };

        if let Err(err) = lifecycle.transition(record, PluginState::Running) {
            tracing::error!(target: "hot_reload", plugin_id = %plugin_id, error = %err, "Could not restore plugin");
            return;
        }
        if previous == PluginState::Paused {
            if let Some(handle) = handle {
                let _ = lifecycle.pause(record, &handle).await;
            }
        }
    }

    /// Run reloads from a queue on a background task
    pub fn spawn(self, capacity: usize) -> (ReloadSender, ReloadLoop) {
        let (sender, mut receiver) = mpsc::channel::<ReloadCommand>(capacity.max(1));
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    command = receiver.recv() => {
                        let Some(command) = command else { break };
                        let result = self.reload(command.request).await;
                        if let Some(reply) = command.reply {
                            // requester may have gone away
                            let _ = reply.send(result);
                        }
                    }
                }
            }
            tracing::debug!(target: "hot_reload", "Reload loop stopped");
        });

        (ReloadSender { sender }, ReloadLoop { shutdown, task })
    }
}

struct ReloadCommand {
    request: ReloadRequest,
    reply: Option<oneshot::Sender<PluginResult<ReloadOutcome>>>,
}

/// Enqueues reloads for the background loop
#[derive(Clone)]
pub struct ReloadSender {
    sender: mpsc::Sender<ReloadCommand>,
}

impl ReloadSender {
    /// Enqueue a reload and wait for its outcome
    pub async fn request(&self, request: ReloadRequest) -> PluginResult<ReloadOutcome> {
        let plugin_id = request.plugin_id.clone();
        let (reply, outcome) = oneshot::channel();

        self.sender
            .send(ReloadCommand {
                request,
                reply: Some(reply),
            })
            .await
            .map_err(|_| PluginError::unavailable(&plugin_id, "reload queue closed"))?;

        outcome
            .await
            .map_err(|_| PluginError::unavailable(&plugin_id, "reload loop stopped"))?
    }

    /// Enqueue a reload without waiting for it
    pub async fn submit(&self, request: ReloadRequest) -> PluginResult<()> {
        let plugin_id = request.plugin_id.clone();
        self.sender
            .send(ReloadCommand {
                request,
                reply: None,
            })
            .await
            .map_err(|_| PluginError::unavailable(&plugin_id, "reload queue closed"))
    }
}

/// The background reload task
pub struct ReloadLoop {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReloadLoop {
    /// Stop after the reload in progress, if any
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            tracing::warn!(target: "hot_reload", error = %err, "Reload loop ended abnormally");
        }
    }
}

#[cfg(feature = "watcher")]
pub use watcher::ManifestWatcher;

#[cfg(feature = "watcher")]
mod watcher {
    use notify::{RecursiveMode, Watcher};
    use std::collections::{BTreeSet, HashMap};
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    use lattice_config::HotReloadConfig;

    use super::{ReloadRequest, ReloadSender};
    use crate::discovery::read_manifest;
    use crate::error::PluginResult;

    /// Watches manifest files and enqueues a reload when one changes
    ///
    /// Bursts of file events are debounced, and a manifest whose content
    /// checksum did not change is ignored.
    pub struct ManifestWatcher {
        _watcher: notify::RecommendedWatcher,
        task: JoinHandle<()>,
    }

    impl ManifestWatcher {
        /// `checksums` maps already-known manifest paths to their content hash
        pub fn start(
            config: &HotReloadConfig,
            manifest_file_name: &str,
            checksums: HashMap<PathBuf, String>,
            reloads: ReloadSender,
        ) -> PluginResult<Self> {
            let (tx, rx) = mpsc::unbounded_channel::<PathBuf>();

            let mut watcher = notify::recommended_watcher(
                move |result: notify::Result<notify::Event>| match result {
                    Ok(event) if event.kind.is_create() || event.kind.is_modify() => {
                        for path in event.paths {
                            let _ = tx.send(path);
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(target: "hot_reload", error = %err, "File watcher error");
                    }
                },
            )?;

            for path in &config.watch_paths {
                watcher.watch(path, RecursiveMode::Recursive)?;
                tracing::info!(
                    target: "hot_reload",
                    path = %path.display(),
                    "Watching for manifest changes"
                );
            }

            let task = tokio::spawn(run(
                rx,
                config.debounce,
                manifest_file_name.to_string(),
                checksums,
                reloads,
            ));

            Ok(Self {
                _watcher: watcher,
                task,
            })
        }

        pub fn stop(self) {
            self.task.abort();
        }
    }

    async fn run(
        mut rx: mpsc::UnboundedReceiver<PathBuf>,
        debounce: Duration,
        manifest_file_name: String,
        mut checksums: HashMap<PathBuf, String>,
        reloads: ReloadSender,
    ) {
        while let Some(first) = rx.recv().await {
            let mut changed = BTreeSet::from([first]);
            while let Ok(Some(path)) = tokio::time::timeout(debounce, rx.recv()).await {
                changed.insert(path);
            }

            for path in changed {
                if path.file_name().and_then(|n| n.to_str()) != Some(manifest_file_name.as_str()) {
                    continue;
                }

                let manifest = match read_manifest(&path).await {
                    Ok(manifest) => manifest,
                    Err(err) => {
                        tracing::warn!(
                            target: "hot_reload",
                            path = %path.display(),
                            error = %err,
                            "Ignoring unreadable manifest"
                        );
                        continue;
                    }
                };

                if checksums.get(&path) == Some(&manifest.checksum) {
                    continue;
                }
                checksums.insert(path.clone(), manifest.checksum.clone());

                tracing::info!(
                    target: "hot_reload",
                    plugin_id = %manifest.metadata.id,
                    path = %path.display(),
                    "Manifest changed, enqueueing reload"
                );
                if reloads
                    .submit(ReloadRequest::with_metadata(manifest.metadata))
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Plugin;
    use crate::loader::StaticPluginLoader;
    use async_trait::async_trait;
    use lattice_config::RegistryConfig;
    use std::any::Any;

    struct Versioned(&'static str);

    #[async_trait]
    impl Plugin for Versioned {
        async fn execute(
            &mut self,
            _operation: &str,
            _input: serde_json::Value,
        ) -> PluginResult<serde_json::Value> {
            Ok(serde_json::json!(self.0))
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    async fn setup() -> (Arc<Registry>, Arc<StaticPluginLoader>) {
        let loader = Arc::new(
            StaticPluginLoader::new()
                .with_factory("core", || Box::new(Versioned("v1")))
                .with_factory("app", || Box::new(Versioned("app"))),
        );
        let registry = Arc::new(Registry::new(loader.clone(), RegistryConfig::default()));
        registry
            .register(PluginMetadata::new("core", Version::new(1, 0, 0)))
            .await
            .unwrap();
        registry
            .register(
                PluginMetadata::new("app", Version::new(1, 0, 0))
                    .depends_on("core", "^1.0.0")
                    .unwrap(),
            )
            .await
            .unwrap();
        registry.load("app").await.unwrap();
        (registry, loader)
    }

    #[tokio::test]
    async fn test_reload_swaps_instance() {
        let (registry, loader) = setup().await;
        loader.register("core", || Box::new(Versioned("v2"))).await;

        let coordinator = HotReloadCoordinator::new(registry.clone());
        let outcome = coordinator.reload(ReloadRequest::new("core")).await.unwrap();

        assert_eq!(outcome.paused, vec!["app"]);
        assert_eq!(outcome.resumed, vec!["app"]);
        assert_eq!(
            registry.execute("core", "get", serde_json::Value::Null).await.unwrap(),
            "v2"
        );
        assert_eq!(registry.state_of("app").await, Some(PluginState::Running));
    }

    #[tokio::test]
    async fn test_incompatible_version_rejected_before_change() {
        let (registry, _) = setup().await;
        let before = registry.get("core").await.unwrap().instance_id;

        let coordinator = HotReloadCoordinator::new(registry.clone());
        let err = coordinator
            .reload(ReloadRequest::with_metadata(PluginMetadata::new(
                "core",
                Version::new(2, 0, 0),
            )))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PluginError::UnsatisfiedDependency { ref plugin_id, .. } if plugin_id == "app"
        ));
        let record = registry.get("core").await.unwrap();
        assert_eq!(record.state, PluginState::Running);
        assert_eq!(record.instance_id, before);
    }

    #[tokio::test]
    async fn test_reload_of_unloaded_plugin_rejected() {
        let (registry, _) = setup().await;
        registry.unload("core", true).await.unwrap();

        let coordinator = HotReloadCoordinator::new(registry);
        assert!(matches!(
            coordinator.reload(ReloadRequest::new("core")).await,
            Err(PluginError::InvalidStateTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_queue_replies_and_shuts_down() {
        let (registry, _) = setup().await;
        let (sender, reload_loop) = HotReloadCoordinator::new(registry).spawn(4);

        let outcome = sender.request(ReloadRequest::new("core")).await.unwrap();
        assert_eq!(outcome.new_version, Version::new(1, 0, 0));

        reload_loop.shutdown().await;
        assert!(sender.request(ReloadRequest::new("core")).await.is_err());
    }
}
