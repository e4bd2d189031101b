//! Plugin registry: the single owner of every plugin record
//!
//! All mutations of plugin state and of the dependency graph happen while
//! holding the registry's write lock, so the graph, the records and the live
//! instances are never observed out of step. Queries take the read lock.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Notify, RwLock, RwLockWriteGuard};

use lattice_config::RegistryConfig;

use crate::core::PluginHandle;
use crate::error::{PluginError, PluginResult};
use crate::events::{EventBus, LifecycleEvent};
use crate::graph::DependencyGraph;
use crate::lifecycle::LifecycleController;
use crate::loader::PluginLoader;
use crate::types::{PluginMetadata, PluginRecord, PluginState};
use crate::version::VersionConstraint;

/// Registry statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryStats {
    /// Number of registered plugins
    pub registered: usize,
    /// Plugins currently holding a live instance
    pub active: usize,
    /// Plugins brought to `Running` by `load`
    pub total_loads: u64,
    /// Plugins taken down to `Unloaded`
    pub total_unloads: u64,
    /// `load` calls that unwound their batch
    pub failed_loads: u64,
    /// Successful hot reloads
    pub total_reloads: u64,
}

pub(crate) struct RegistryState {
    pub(crate) records: HashMap<String, PluginRecord>,
    pub(crate) graph: DependencyGraph,
    pub(crate) handles: HashMap<String, PluginHandle>,
    pub(crate) stats: RegistryStats,
}

impl RegistryState {
    fn new() -> Self {
        Self {
            records: HashMap::new(),
            graph: DependencyGraph::new(),
            handles: HashMap::new(),
            stats: RegistryStats::default(),
        }
    }

    pub(crate) fn state_of(&self, plugin_id: &str) -> Option<PluginState> {
        self.records.get(plugin_id).map(|r| r.state)
    }

    /// Fail unless every non-optional dependency in `dependencies` is running
    pub(crate) fn require_running(
        &self,
        plugin_id: &str,
        dependencies: &[crate::types::Dependency],
    ) -> PluginResult<()> {
        for dep in dependencies.iter().filter(|d| !d.optional) {
            let state = self.state_of(&dep.target_id).unwrap_or(PluginState::Unloaded);
            if state != PluginState::Running {
                return Err(PluginError::DependencyNotRunning {
                    plugin_id: plugin_id.to_string(),
                    dependency_id: dep.target_id.clone(),
                    state,
                });
            }
        }
        Ok(())
    }

    fn refresh_active(&mut self) {
        self.stats.active = self.handles.len();
        self.stats.registered = self.records.len();
    }
}

/// Plugin registry for managing plugin lifecycle and dependencies
pub struct Registry {
    state: RwLock<RegistryState>,
    lifecycle: LifecycleController,
    events: Arc<EventBus>,
    /// Woken after every mutation; callers waiting on a paused plugin re-check
    state_changed: Notify,
}

impl Registry {
    pub fn new(loader: Arc<dyn PluginLoader>, config: RegistryConfig) -> Self {
        Self::with_events(loader, config, Arc::new(EventBus::default()))
    }

    pub fn with_events(
        loader: Arc<dyn PluginLoader>,
        config: RegistryConfig,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            state: RwLock::new(RegistryState::new()),
            lifecycle: LifecycleController::new(loader, config, events.clone()),
            events,
            state_changed: Notify::new(),
        }
    }

    /// Add a plugin to the graph in `Unloaded`
    pub async fn register(&self, metadata: PluginMetadata) -> PluginResult<()> {
        let mut state = self.state.write().await;
        state.graph.add_plugin(&metadata)?;

        let plugin_id = metadata.id.clone();
        state.records.insert(plugin_id.clone(), PluginRecord::new(metadata));
        state.refresh_active();

        tracing::info!(
            target: "plugin_registry",
            plugin_id = %plugin_id,
            "Plugin registered"
        );
        Ok(())
    }

    /// Remove an unloaded (or failed) plugin nobody else requires
    pub async fn deregister(&self, plugin_id: &str) -> PluginResult<PluginRecord> {
        let mut state = self.state.write().await;
        let current = state
            .state_of(plugin_id)
            .ok_or_else(|| PluginError::not_found(plugin_id))?;

        if !matches!(current, PluginState::Unloaded | PluginState::Error) {
            return Err(PluginError::InvalidStateTransition {
                plugin_id: plugin_id.to_string(),
                from: current,
                to: PluginState::Unloaded,
            });
        }

        state.graph.remove_plugin(plugin_id)?;
        let record = state
            .records
            .remove(plugin_id)
            .ok_or_else(|| PluginError::not_found(plugin_id))?;
        state.refresh_active();

        tracing::info!(
            target: "plugin_registry",
            plugin_id = %plugin_id,
            "Plugin deregistered"
        );
        Ok(record)
    }

    /// Bring `plugin_id` and its non-optional dependency closure to `Running`.
    ///
    /// The batch is atomic: if any plugin fails, every plugin started by this
    /// call is taken back down to `Unloaded` and the failing plugin is left in
    /// `Error`. Constraint failures are reported before anything changes.
    pub async fn load(&self, plugin_id: &str) -> PluginResult<PluginHandle> {
        let mut guard = self.state.write().await;
        let result = self.load_locked(&mut guard, plugin_id).await;
        guard.refresh_active();
        drop(guard);
        self.state_changed.notify_waiters();
        result
    }

    async fn load_locked(&self, state: &mut RegistryState, plugin_id: &str) -> PluginResult<PluginHandle> {
        let order = state.graph.load_order_for(&[plugin_id])?;
        for id in &order {
            state.graph.validate_constraints(id)?;
        }

        tracing::debug!(
            target: "plugin_registry",
            plugin_id = %plugin_id,
            order = ?order,
            "Loading plugin batch"
        );

        let mut started: Vec<String> = Vec::new();
        for id in &order {
            match self.bring_up(state, id).await {
                Ok(true) => started.push(id.clone()),
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(
                        target: "plugin_registry",
                        plugin_id = %plugin_id,
                        failed = %id,
                        unwinding = ?started,
                        error = %err,
                        "Load batch failed, unwinding"
                    );
                    for started_id in started.iter().rev() {
                        if let Err(unwind_err) = self.tear_down(state, started_id).await {
                            tracing::error!(
                                target: "plugin_registry",
                                plugin_id = %started_id,
                                error = %unwind_err,
                                "Failed to unwind plugin"
                            );
                        }
                    }
                    state.stats.failed_loads += 1;
                    return Err(err);
                }
            }
        }

        state
            .handles
            .get(plugin_id)
            .cloned()
            .ok_or_else(|| PluginError::unavailable(plugin_id, "no live instance after load"))
    }

    /// Drive one plugin to `Running`; `false` when it already was
    async fn bring_up(&self, state: &mut RegistryState, plugin_id: &str) -> PluginResult<bool> {
        let record = state
            .records
            .get(plugin_id)
            .ok_or_else(|| PluginError::not_found(plugin_id))?;

        match record.state {
            PluginState::Running | PluginState::Paused => return Ok(false),
            PluginState::Unloaded | PluginState::Stopped | PluginState::Error => {}
            from => {
                return Err(PluginError::InvalidStateTransition {
                    plugin_id: plugin_id.to_string(),
                    from,
                    to: PluginState::Loading,
                })
            }
        }

        state.require_running(plugin_id, record.dependencies())?;

        let record = state
            .records
            .get_mut(plugin_id)
            .ok_or_else(|| PluginError::not_found(plugin_id))?;
        let handle = self.lifecycle.load(record).await?;
        self.lifecycle.start(record, &handle).await?;

        state.handles.insert(plugin_id.to_string(), handle);
        state.graph.mark_active(plugin_id);
        state.stats.total_loads += 1;

        tracing::info!(
            target: "plugin_registry",
            plugin_id = %plugin_id,
            "Plugin running"
        );
        Ok(true)
    }

    /// Take a plugin down to `Unloaded` from any state that allows it
    async fn tear_down(&self, state: &mut RegistryState, plugin_id: &str) -> PluginResult<()> {
        let record = state
            .records
            .get_mut(plugin_id)
            .ok_or_else(|| PluginError::not_found(plugin_id))?;

        match record.state {
            PluginState::Unloaded => return Ok(()),
            PluginState::Stopped => {}
            from if from.is_active() => {
                let handle = state.handles.remove(plugin_id).ok_or_else(|| {
                    PluginError::unavailable(plugin_id, "active plugin without an instance")
                })?;
                self.lifecycle.stop(record, &handle).await?;
                state.graph.mark_inactive(plugin_id);
            }
            from => {
                return Err(PluginError::InvalidStateTransition {
                    plugin_id: plugin_id.to_string(),
                    from,
                    to: PluginState::Stopping,
                })
            }
        }

        self.lifecycle.unload(record)?;
        state.stats.total_unloads += 1;

        tracing::info!(
            target: "plugin_registry",
            plugin_id = %plugin_id,
            "Plugin unloaded"
        );
        Ok(())
    }

    /// Stop and unload a plugin.
    ///
    /// Active plugins that require it block the unload unless `force` is set
    /// and the registry allows cascading, in which case they are unloaded
    /// first, most dependent first.
    pub async fn unload(&self, plugin_id: &str, force: bool) -> PluginResult<()> {
        let mut guard = self.state.write().await;
        let result = self.unload_locked(&mut guard, plugin_id, force).await;
        guard.refresh_active();
        drop(guard);
        self.state_changed.notify_waiters();
        result
    }

    async fn unload_locked(
        &self,
        state: &mut RegistryState,
        plugin_id: &str,
        force: bool,
    ) -> PluginResult<()> {
        let current = state
            .state_of(plugin_id)
            .ok_or_else(|| PluginError::not_found(plugin_id))?;

        match current {
            PluginState::Unloaded => return Ok(()),
            PluginState::Error => {
                return Err(PluginError::InvalidStateTransition {
                    plugin_id: plugin_id.to_string(),
                    from: current,
                    to: PluginState::Stopping,
                })
            }
            _ => {}
        }

        let dependents = state.graph.transitive_dependents(plugin_id)?;
        let active: Vec<String> = dependents
            .iter()
            .filter(|id| state.state_of(id).is_some_and(PluginState::is_active))
            .cloned()
            .collect();

        if !active.is_empty() {
            if !force || !self.lifecycle.config().allow_force_cascade {
                return Err(PluginError::DependentsActive {
                    plugin_id: plugin_id.to_string(),
                    dependents: active,
                });
            }

            tracing::info!(
                target: "plugin_registry",
                plugin_id = %plugin_id,
                cascade = ?dependents,
                "Forced unload cascading to dependents"
            );
            for dependent in &dependents {
                if state.state_of(dependent) == Some(PluginState::Error) {
                    continue;
                }
                self.tear_down(state, dependent).await?;
            }
        }

        self.tear_down(state, plugin_id).await
    }

    /// Pause a running plugin; pausing a paused plugin is a no-op
    pub async fn pause(&self, plugin_id: &str) -> PluginResult<()> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let record = state
            .records
            .get_mut(plugin_id)
            .ok_or_else(|| PluginError::not_found(plugin_id))?;

        let result = match state.handles.get(plugin_id) {
            Some(handle) => self.lifecycle.pause(record, handle).await,
            None => Err(PluginError::InvalidStateTransition {
                plugin_id: plugin_id.to_string(),
                from: record.state,
                to: PluginState::Paused,
            }),
        };
        drop(guard);
        self.state_changed.notify_waiters();
        result
    }

    /// Resume a paused plugin; resuming a running plugin is a no-op
    pub async fn resume(&self, plugin_id: &str) -> PluginResult<()> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let record = state
            .records
            .get_mut(plugin_id)
            .ok_or_else(|| PluginError::not_found(plugin_id))?;

        let result = match state.handles.get(plugin_id) {
            Some(handle) => self.lifecycle.resume(record, handle).await,
            None => Err(PluginError::InvalidStateTransition {
                plugin_id: plugin_id.to_string(),
                from: record.state,
                to: PluginState::Running,
            }),
        };
        drop(guard);
        self.state_changed.notify_waiters();
        result
    }

    /// Run an operation on a plugin.
    ///
    /// While the plugin is paused or reloading the call waits for it to come
    /// back; any other state that is not `Running` is rejected.
    pub async fn execute(
        &self,
        plugin_id: &str,
        operation: &str,
        input: serde_json::Value,
    ) -> PluginResult<serde_json::Value> {
        loop {
            let changed = self.state_changed.notified();

            let handle = {
                let state = self.state.read().await;
                let current = state
                    .state_of(plugin_id)
                    .ok_or_else(|| PluginError::not_found(plugin_id))?;

                match current {
                    PluginState::Running => state.handles.get(plugin_id).cloned(),
                    PluginState::Paused | PluginState::Reloading => None,
                    other => {
                        return Err(PluginError::unavailable(
                            plugin_id,
                            format!("plugin is {}", other),
                        ))
                    }
                }
            };

            match handle {
                Some(handle) => {
                    if let Some(result) = handle.try_execute(operation, input.clone()).await {
                        return result;
                    }
                    // instance was swapped out underneath us
                }
                None => {
                    tracing::trace!(
                        target: "plugin_registry",
                        plugin_id = %plugin_id,
                        operation = %operation,
                        "Waiting for plugin to resume"
                    );
                    changed.await;
                }
            }
        }
    }

    /// Get a snapshot of one record
    pub async fn get(&self, plugin_id: &str) -> Option<PluginRecord> {
        self.state.read().await.records.get(plugin_id).cloned()
    }

    /// Snapshot of every record, ordered by id
    pub async fn all(&self) -> Vec<PluginRecord> {
        let state = self.state.read().await;
        let mut records: Vec<PluginRecord> = state.records.values().cloned().collect();
        records.sort_by(|a, b| a.id().cmp(b.id()));
        records
    }

    pub async fn state_of(&self, plugin_id: &str) -> Option<PluginState> {
        self.state.read().await.state_of(plugin_id)
    }

    /// The live instance, if the plugin has one
    pub async fn handle(&self, plugin_id: &str) -> Option<PluginHandle> {
        self.state.read().await.handles.get(plugin_id).cloned()
    }

    /// Load order over every registered plugin
    pub async fn load_order(&self) -> PluginResult<Vec<String>> {
        self.state.read().await.graph.compute_load_order()
    }

    /// Unload order over every registered plugin
    pub async fn unload_order(&self) -> PluginResult<Vec<String>> {
        self.state.read().await.graph.compute_unload_order()
    }

    /// Direct dependents of a plugin
    pub async fn dependents_of(&self, plugin_id: &str) -> Vec<String> {
        self.state.read().await.graph.dependents_of(plugin_id)
    }

    pub async fn dependencies_of(&self, plugin_id: &str) -> Vec<String> {
        self.state.read().await.graph.dependencies_of(plugin_id)
    }

    /// Plugins declaring `interface_id` at a version matching `constraint`
    pub async fn find_by_capability(
        &self,
        interface_id: &str,
        constraint: &VersionConstraint,
    ) -> Vec<PluginRecord> {
        let state = self.state.read().await;
        let mut records: Vec<PluginRecord> = state
            .records
            .values()
            .filter(|r| r.supports(interface_id, constraint))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.id().cmp(b.id()));
        records
    }

    pub async fn stats(&self) -> RegistryStats {
        self.state.read().await.stats.clone()
    }

    /// Stop and unload every plugin, dependents first. Failures are logged
    /// and the sweep continues.
    pub async fn shutdown(&self) {
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        let order = match state.graph.compute_unload_order() {
            Ok(order) => order,
            Err(err) => {
                tracing::error!(
                    target: "plugin_registry",
                    error = %err,
                    "Could not compute unload order, using registration ids"
                );
                let mut ids: Vec<String> = state.records.keys().cloned().collect();
                ids.sort();
                ids
            }
        };

        for plugin_id in &order {
            if state.state_of(plugin_id) == Some(PluginState::Error) {
                continue;
            }
            if let Err(err) = self.tear_down(state, plugin_id).await {
                tracing::warn!(
                    target: "plugin_registry",
                    plugin_id = %plugin_id,
                    error = %err,
                    "Plugin did not shut down cleanly"
                );
            }
        }

        state.refresh_active();
        drop(guard);
        self.state_changed.notify_waiters();

        tracing::info!(target: "plugin_registry", "Registry shut down");
    }

    /// Lifecycle events from this registry
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn config(&self) -> &RegistryConfig {
        self.lifecycle.config()
    }

    pub(crate) async fn write_state(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().await
    }

    pub(crate) fn lifecycle(&self) -> &LifecycleController {
        &self.lifecycle
    }

    pub(crate) fn notify_changed(&self) {
        self.state_changed.notify_waiters();
    }
}
