//! Plugin loading
//!
//! The host never opens modules itself. A [`PluginLoader`] turns a locator
//! into a live instance and disposes of it again.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::core::{Plugin, PluginHandle};
use crate::error::{PluginError, PluginResult};

/// Plugin loader trait for different loading strategies
#[async_trait]
pub trait PluginLoader: Send + Sync {
    /// Produce a fresh instance for the given locator
    async fn open(&self, locator: &str) -> PluginResult<Box<dyn Plugin>>;

    /// Dispose of an instance. Calling it again for the same handle is a no-op.
    async fn close(&self, handle: &PluginHandle) {
        if handle.release().await.is_some() {
            tracing::debug!(
                target: "plugin_lifecycle",
                plugin_id = %handle.plugin_id(),
                loader = self.loader_type(),
                "Plugin instance closed"
            );
        }
    }

    /// Get loader name/type
    fn loader_type(&self) -> &'static str;
}

/// Builds a new plugin instance
pub type PluginFactory = Arc<dyn Fn() -> Box<dyn Plugin> + Send + Sync>;

/// Loader for plugins compiled into the binary, keyed by locator
///
/// Factories can be swapped at runtime, which is how a new build of a
/// plugin is simulated for hot reload.
#[derive(Default)]
pub struct StaticPluginLoader {
    factories: RwLock<HashMap<String, PluginFactory>>,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

impl StaticPluginLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style registration
    pub fn with_factory<F>(mut self, locator: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Plugin> + Send + Sync + 'static,
    {
        self.factories
            .get_mut()
            .insert(locator.into(), Arc::new(factory));
        self
    }

    /// Register or replace the factory for a locator
    pub async fn register<F>(&self, locator: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Plugin> + Send + Sync + 'static,
    {
        let locator = locator.into();
        let replaced = self
            .factories
            .write()
            .await
            .insert(locator.clone(), Arc::new(factory))
            .is_some();

        tracing::debug!(
            target: "plugin_lifecycle",
            locator = %locator,
            replaced,
            "Static plugin factory registered"
        );
    }

    pub async fn contains(&self, locator: &str) -> bool {
        self.factories.read().await.contains_key(locator)
    }

    /// Number of instances opened so far
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::Relaxed)
    }

    /// Number of instances actually closed so far
    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl PluginLoader for StaticPluginLoader {
    async fn open(&self, locator: &str) -> PluginResult<Box<dyn Plugin>> {
        let factory = self
            .factories
            .read()
            .await
            .get(locator)
            .cloned()
            .ok_or_else(|| PluginError::not_found(locator))?;

        self.opened.fetch_add(1, Ordering::Relaxed);
        Ok(factory())
    }

    async fn close(&self, handle: &PluginHandle) {
        if handle.release().await.is_some() {
            self.closed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn loader_type(&self) -> &'static str {
        "static"
    }
}
