//! Per-plugin lifecycle state machine
//!
//! The controller owns no state of its own. It is handed a [`PluginRecord`]
//! by the registry, which holds its exclusive section for the duration of
//! every call, and it moves that record through the lifecycle while invoking
//! the loader and the plugin's hooks under the configured timeouts.

use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use lattice_config::RegistryConfig;

use crate::core::{PluginContext, PluginHandle};
use crate::error::{PluginError, PluginResult};
use crate::events::{EventBus, LifecycleEvent};
use crate::loader::PluginLoader;
use crate::types::{PluginMetadata, PluginRecord, PluginState};

pub struct LifecycleController {
    loader: Arc<dyn PluginLoader>,
    config: RegistryConfig,
    events: Arc<EventBus>,
}

impl LifecycleController {
    pub fn new(loader: Arc<dyn PluginLoader>, config: RegistryConfig, events: Arc<EventBus>) -> Self {
        Self {
            loader,
            config,
            events,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn loader(&self) -> &Arc<dyn PluginLoader> {
        &self.loader
    }

    /// Move the record to `to` if the state machine allows it
    pub fn transition(&self, record: &mut PluginRecord, to: PluginState) -> PluginResult<()> {
        let from = record.state;
        if !from.can_transition_to(to) {
            return Err(PluginError::InvalidStateTransition {
                plugin_id: record.id().to_string(),
                from,
                to,
            });
        }

        record.state = to;
        record.state_changed_at = Utc::now();

        tracing::debug!(
            target: "plugin_lifecycle",
            plugin_id = %record.id(),
            from = %from,
            to = %to,
            "Plugin state transition"
        );
        self.events.emit(LifecycleEvent::plugin(record.id(), from, to));
        Ok(())
    }

    /// Record the error and park the plugin in `Error` where that is allowed
    pub fn fail(&self, record: &mut PluginRecord, error: &PluginError) {
        record.last_error = Some(error.to_string());
        record.instance_id = None;
        record.load_time = None;

        if record.state.can_transition_to(PluginState::Error) {
            let _ = self.transition(record, PluginState::Error);
        }

        tracing::error!(
            target: "plugin_lifecycle",
            plugin_id = %record.id(),
            state = %record.state,
            error = %error,
            "Plugin lifecycle failure"
        );
    }

    /// `Loading → Loaded`: ask the loader for a fresh instance
    pub async fn load(&self, record: &mut PluginRecord) -> PluginResult<PluginHandle> {
        self.transition(record, PluginState::Loading)?;

        match self.open(&record.metadata).await {
            Ok(handle) => {
                record.instance_id = Some(handle.instance_id());
                record.last_error = None;
                self.transition(record, PluginState::Loaded)?;
                Ok(handle)
            }
            Err(err) => {
                self.fail(record, &err);
                Err(err)
            }
        }
    }

    /// `Loaded → Initializing → Running`. On failure the instance is shut
    /// down and closed before the record moves to `Error`.
    pub async fn start(&self, record: &mut PluginRecord, handle: &PluginHandle) -> PluginResult<()> {
        self.transition(record, PluginState::Initializing)?;

        if let Err(err) = self.init_and_start(&record.metadata, handle).await {
            self.shutdown_instance(record.id(), handle).await;
            self.fail(record, &err);
            return Err(err);
        }

        self.transition(record, PluginState::Running)?;
        record.load_time = Some(Utc::now());
        Ok(())
    }

    /// Pause a running plugin. Pausing a paused plugin does nothing; a failing
    /// hook leaves the plugin running.
    pub async fn pause(&self, record: &mut PluginRecord, handle: &PluginHandle) -> PluginResult<()> {
        match record.state {
            PluginState::Paused => return Ok(()),
            PluginState::Running => {}
            from => {
                return Err(PluginError::InvalidStateTransition {
                    plugin_id: record.id().to_string(),
                    from,
                    to: PluginState::Paused,
                })
            }
        }

        bounded(self.config.pause_timeout, "pause", handle.pause())
            .await
            .map_err(|reason| PluginError::operation_failed(record.id(), "pause", reason))?;

        self.transition(record, PluginState::Paused)
    }

    /// Symmetric to [`pause`](Self::pause)
    pub async fn resume(&self, record: &mut PluginRecord, handle: &PluginHandle) -> PluginResult<()> {
        match record.state {
            PluginState::Running => return Ok(()),
            PluginState::Paused => {}
            from => {
                return Err(PluginError::InvalidStateTransition {
                    plugin_id: record.id().to_string(),
                    from,
                    to: PluginState::Running,
                })
            }
        }

        bounded(self.config.pause_timeout, "resume", handle.resume())
            .await
            .map_err(|reason| PluginError::operation_failed(record.id(), "resume", reason))?;

        self.transition(record, PluginState::Running)
    }

    /// `Stopping → Stopped`. Always completes once the first transition is
    /// accepted.
    pub async fn stop(&self, record: &mut PluginRecord, handle: &PluginHandle) -> PluginResult<()> {
        self.transition(record, PluginState::Stopping)?;
        self.shutdown_instance(record.id(), handle).await;

        record.instance_id = None;
        record.load_time = None;
        self.transition(record, PluginState::Stopped)
    }

    /// `Stopped → Unloaded`
    pub fn unload(&self, record: &mut PluginRecord) -> PluginResult<()> {
        self.transition(record, PluginState::Unloaded)
    }

    /// Bring up a fresh instance for a plugin in `Reloading` and return it
    /// to `Running`. Failure leaves the plugin in `Error`.
    pub async fn reinitialize(&self, record: &mut PluginRecord) -> PluginResult<PluginHandle> {
        if record.state != PluginState::Reloading {
            return Err(PluginError::InvalidStateTransition {
                plugin_id: record.id().to_string(),
                from: record.state,
                to: PluginState::Running,
            });
        }

        let handle = match self.open(&record.metadata).await {
            Ok(handle) => handle,
            Err(err) => {
                self.fail(record, &err);
                return Err(err);
            }
        };

        if let Err(err) = self.init_and_start(&record.metadata, &handle).await {
            self.shutdown_instance(record.id(), &handle).await;
            self.fail(record, &err);
            return Err(err);
        }

        record.instance_id = Some(handle.instance_id());
        record.last_error = None;
        self.transition(record, PluginState::Running)?;
        record.load_time = Some(Utc::now());
        Ok(handle)
    }

    /// Run the plugin's stop hook and close the instance. Panics and timeouts
    /// in the hook are logged and never reach the caller.
    pub async fn shutdown_instance(&self, plugin_id: &str, handle: &PluginHandle) {
        let stopping = handle.clone();
        let mut task = tokio::spawn(async move { stopping.stop().await });

        match timeout(self.config.stop_timeout, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(join_error)) if join_error.is_panic() => {
                tracing::warn!(
                    target: "plugin_lifecycle",
                    plugin_id = %plugin_id,
                    "Plugin panicked in stop hook"
                );
            }
            Ok(Err(join_error)) => {
                tracing::warn!(
                    target: "plugin_lifecycle",
                    plugin_id = %plugin_id,
                    error = %join_error,
                    "Stop hook did not complete"
                );
            }
            Err(_) => {
                task.abort();
                tracing::warn!(
                    target: "plugin_lifecycle",
                    plugin_id = %plugin_id,
                    timeout = ?self.config.stop_timeout,
                    "Stop hook timed out"
                );
            }
        }

        if timeout(self.config.stop_timeout, self.loader.close(handle))
            .await
            .is_err()
        {
            // instance still busy, drop it without waiting
            handle.try_release();
            tracing::warn!(
                target: "plugin_lifecycle",
                plugin_id = %plugin_id,
                "Loader close timed out"
            );
        }
    }

    async fn open(&self, metadata: &PluginMetadata) -> PluginResult<PluginHandle> {
        let locator = metadata.locator();

        match timeout(self.config.load_timeout, self.loader.open(locator)).await {
            Ok(Ok(plugin)) => {
                tracing::debug!(
                    target: "plugin_lifecycle",
                    plugin_id = %metadata.id,
                    locator = %locator,
                    loader = self.loader.loader_type(),
                    "Plugin instance opened"
                );
                Ok(PluginHandle::new(&metadata.id, plugin))
            }
            Ok(Err(err)) => Err(PluginError::LoadFailed {
                plugin_id: metadata.id.clone(),
                reason: err.to_string(),
            }),
            Err(_) => Err(PluginError::LoadFailed {
                plugin_id: metadata.id.clone(),
                reason: format!("loader timed out after {:?}", self.config.load_timeout),
            }),
        }
    }

    async fn init_and_start(&self, metadata: &PluginMetadata, handle: &PluginHandle) -> PluginResult<()> {
        let context = PluginContext::new(metadata, handle.instance_id());
        let init_failed = |reason| PluginError::InitFailed {
            plugin_id: metadata.id.clone(),
            reason,
        };

        bounded(self.config.init_timeout, "init", handle.init(&context))
            .await
            .map_err(init_failed)?;
        bounded(self.config.start_timeout, "start", handle.start())
            .await
            .map_err(init_failed)
    }
}

/// Await a hook under a time budget, flattening both failure modes into a reason
async fn bounded<F>(limit: Duration, hook: &str, fut: F) -> Result<(), String>
where
    F: Future<Output = PluginResult<()>>,
{
    match timeout(limit, fut).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(format!("{} hook failed: {}", hook, err)),
        Err(_) => Err(format!("{} hook timed out after {:?}", hook, limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Plugin;
    use crate::loader::StaticPluginLoader;
    use async_trait::async_trait;
    use semver::Version;
    use std::any::Any;

    #[derive(Default)]
    struct Scripted {
        fail_init: bool,
        hang_pause: bool,
        panic_on_stop: bool,
    }

    #[async_trait]
    impl Plugin for Scripted {
        async fn init(&mut self, _context: &PluginContext) -> PluginResult<()> {
            if self.fail_init {
                return Err(PluginError::operation_failed("scripted", "init", "boom"));
            }
            Ok(())
        }

        async fn pause(&mut self) -> PluginResult<()> {
            if self.hang_pause {
                std::future::pending::<()>().await;
            }
            Ok(())
        }

        async fn stop(&mut self) {
            if self.panic_on_stop {
                panic!("stop exploded");
            }
        }

        async fn execute(
            &mut self,
            _operation: &str,
            input: serde_json::Value,
        ) -> PluginResult<serde_json::Value> {
            Ok(input)
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn controller(loader: StaticPluginLoader) -> (LifecycleController, Arc<StaticPluginLoader>) {
        let loader = Arc::new(loader);
        let config = RegistryConfig {
            pause_timeout: Duration::from_millis(50),
            stop_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let controller = LifecycleController::new(loader.clone(), config, Arc::new(EventBus::default()));
        (controller, loader)
    }

    fn record() -> PluginRecord {
        PluginRecord::new(PluginMetadata::new("scripted", Version::new(1, 0, 0)))
    }

    #[tokio::test]
    async fn test_load_and_start_reaches_running() {
        let (controller, _) =
            controller(StaticPluginLoader::new().with_factory("scripted", || Box::<Scripted>::default()));
        let mut record = record();

        let handle = controller.load(&mut record).await.unwrap();
        assert_eq!(record.state, PluginState::Loaded);
        assert_eq!(record.instance_id, Some(handle.instance_id()));

        controller.start(&mut record, &handle).await.unwrap();
        assert_eq!(record.state, PluginState::Running);
        assert!(record.load_time.is_some());
    }

    #[tokio::test]
    async fn test_missing_module_is_load_failed() {
        let (controller, _) = controller(StaticPluginLoader::new());
        let mut record = record();

        let err = controller.load(&mut record).await.unwrap_err();
        assert!(matches!(err, PluginError::LoadFailed { .. }));
        assert_eq!(record.state, PluginState::Error);
        assert!(record.last_error.is_some());
    }

    #[tokio::test]
    async fn test_init_failure_releases_instance() {
        let (controller, loader) = controller(StaticPluginLoader::new().with_factory("scripted", || {
            Box::new(Scripted {
                fail_init: true,
                ..Default::default()
            })
        }));
        let mut record = record();

        let handle = controller.load(&mut record).await.unwrap();
        let err = controller.start(&mut record, &handle).await.unwrap_err();

        assert!(matches!(err, PluginError::InitFailed { .. }));
        assert_eq!(record.state, PluginState::Error);
        assert!(!handle.is_open().await);
        assert_eq!(loader.closed(), 1);
    }

    #[tokio::test]
    async fn test_pause_is_idempotent_and_timeout_keeps_running() {
        let (controller, _) = controller(StaticPluginLoader::new().with_factory("scripted", || {
            Box::new(Scripted {
                hang_pause: true,
                ..Default::default()
            })
        }));
        let mut record = record();
        let handle = controller.load(&mut record).await.unwrap();
        controller.start(&mut record, &handle).await.unwrap();

        let err = controller.pause(&mut record, &handle).await.unwrap_err();
        assert!(matches!(err, PluginError::OperationFailed { .. }));
        assert_eq!(record.state, PluginState::Running);

        // resume of a running plugin is a no-op
        controller.resume(&mut record, &handle).await.unwrap();
        assert_eq!(record.state, PluginState::Running);
    }

    #[tokio::test]
    async fn test_panic_in_stop_is_contained() {
        let (controller, loader) = controller(StaticPluginLoader::new().with_factory("scripted", || {
            Box::new(Scripted {
                panic_on_stop: true,
                ..Default::default()
            })
        }));
        let mut record = record();
        let handle = controller.load(&mut record).await.unwrap();
        controller.start(&mut record, &handle).await.unwrap();

        controller.stop(&mut record, &handle).await.unwrap();
        assert_eq!(record.state, PluginState::Stopped);
        assert_eq!(loader.closed(), 1);

        controller.unload(&mut record).unwrap();
        assert_eq!(record.state, PluginState::Unloaded);
    }

    #[tokio::test]
    async fn test_error_rejects_everything_but_loading() {
        let (controller, _) = controller(StaticPluginLoader::new());
        let mut record = record();
        let _ = controller.load(&mut record).await;
        assert_eq!(record.state, PluginState::Error);

        assert!(matches!(
            controller.transition(&mut record, PluginState::Running),
            Err(PluginError::InvalidStateTransition { .. })
        ));
        controller.transition(&mut record, PluginState::Loading).unwrap();
    }
}
