//! Core plugin trait, context and handle definitions

use async_trait::async_trait;
use semver::Version;
use serde::Deserialize;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{PluginError, PluginResult};
use crate::types::PluginMetadata;

/// Context handed to a plugin's init hook
#[derive(Debug, Clone)]
pub struct PluginContext {
    pub plugin_id: String,
    /// Identifies this particular instance; a reload gets a new one
    pub instance_id: Uuid,
    pub version: Version,
    /// Plugin configuration from its metadata
    pub config: serde_json::Value,
    /// Span the host records this plugin's lifecycle under
    pub span: tracing::Span,
}

impl PluginContext {
    pub fn new(metadata: &PluginMetadata, instance_id: Uuid) -> Self {
        Self {
            plugin_id: metadata.id.clone(),
            instance_id,
            version: metadata.version.clone(),
            config: metadata.config.clone(),
            span: tracing::info_span!(
                "plugin",
                plugin_id = %metadata.id,
                instance_id = %instance_id
            ),
        }
    }

    /// Get plugin configuration as a specific type
    pub fn config_as<T>(&self) -> PluginResult<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        serde_json::from_value(self.config.clone()).map_err(PluginError::from)
    }
}

/// Core plugin trait that all plugins must implement
///
/// Only `execute` and `as_any` are mandatory. Hooks are awaited under the
/// host's timeouts; `stop` must not fail, and a panic inside it is contained.
#[async_trait]
pub trait Plugin: Send + Sync {
    async fn init(&mut self, context: &PluginContext) -> PluginResult<()> {
        tracing::debug!(target: "plugin_lifecycle", plugin_id = %context.plugin_id, "Default init");
        Ok(())
    }

    async fn start(&mut self) -> PluginResult<()> {
        Ok(())
    }

    async fn pause(&mut self) -> PluginResult<()> {
        Ok(())
    }

    async fn resume(&mut self) -> PluginResult<()> {
        Ok(())
    }

    /// Release resources. Never reports failure.
    async fn stop(&mut self) {}

    /// Run an operation
    async fn execute(
        &mut self,
        operation: &str,
        input: serde_json::Value,
    ) -> PluginResult<serde_json::Value>;

    /// Convert to Any for downcasting
    fn as_any(&self) -> &dyn Any;
}

/// Shared handle to a live plugin instance
///
/// Cloning is cheap. Once the instance is released (closed by the loader or
/// shut down by the host) every call on any clone reports the plugin as
/// unavailable.
#[derive(Clone)]
pub struct PluginHandle {
    plugin_id: Arc<str>,
    instance_id: Uuid,
    inner: Arc<Mutex<Option<Box<dyn Plugin>>>>,
}

impl fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginHandle")
            .field("plugin_id", &self.plugin_id)
            .field("instance_id", &self.instance_id)
            .finish()
    }
}

impl PluginHandle {
    pub fn new(plugin_id: &str, plugin: Box<dyn Plugin>) -> Self {
        Self {
            plugin_id: Arc::from(plugin_id),
            instance_id: Uuid::new_v4(),
            inner: Arc::new(Mutex::new(Some(plugin))),
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Whether both handles refer to the same instance
    pub fn same_instance(&self, other: &PluginHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub async fn is_open(&self) -> bool {
        self.inner.lock().await.is_some()
    }

    /// Run an operation on the instance
    pub async fn execute(
        &self,
        operation: &str,
        input: serde_json::Value,
    ) -> PluginResult<serde_json::Value> {
        self.try_execute(operation, input)
            .await
            .unwrap_or_else(|| Err(PluginError::unavailable(self.plugin_id(), "instance closed")))
    }

    /// `None` when the instance has already been released
    pub(crate) async fn try_execute(
        &self,
        operation: &str,
        input: serde_json::Value,
    ) -> Option<PluginResult<serde_json::Value>> {
        let mut guard = self.inner.lock().await;
        let plugin = guard.as_mut()?;
        Some(plugin.execute(operation, input).await)
    }

    /// Run `f` against the concrete plugin type, if it is a `T`
    pub async fn with_plugin<T, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R>
    where
        T: 'static,
    {
        let guard = self.inner.lock().await;
        guard
            .as_ref()
            .and_then(|plugin| plugin.as_any().downcast_ref::<T>())
            .map(f)
    }

    pub(crate) async fn init(&self, context: &PluginContext) -> PluginResult<()> {
        let mut guard = self.inner.lock().await;
        match guard.as_mut() {
            Some(plugin) => plugin.init(context).await,
            None => Err(self.closed()),
        }
    }

    pub(crate) async fn start(&self) -> PluginResult<()> {
        let mut guard = self.inner.lock().await;
        match guard.as_mut() {
            Some(plugin) => plugin.start().await,
            None => Err(self.closed()),
        }
    }

    pub(crate) async fn pause(&self) -> PluginResult<()> {
        let mut guard = self.inner.lock().await;
        match guard.as_mut() {
            Some(plugin) => plugin.pause().await,
            None => Err(self.closed()),
        }
    }

    pub(crate) async fn resume(&self) -> PluginResult<()> {
        let mut guard = self.inner.lock().await;
        match guard.as_mut() {
            Some(plugin) => plugin.resume().await,
            None => Err(self.closed()),
        }
    }

    pub(crate) async fn stop(&self) {
        let mut guard = self.inner.lock().await;
        if let Some(plugin) = guard.as_mut() {
            plugin.stop().await;
        }
    }

    /// Take the instance out of the handle. Later calls return `None`.
    pub async fn release(&self) -> Option<Box<dyn Plugin>> {
        self.inner.lock().await.take()
    }

    /// Non-blocking release, for when the instance may still be busy
    pub(crate) fn try_release(&self) -> Option<Box<dyn Plugin>> {
        self.inner.try_lock().ok().and_then(|mut guard| guard.take())
    }

    fn closed(&self) -> PluginError {
        PluginError::unavailable(self.plugin_id(), "instance closed")
    }
}
