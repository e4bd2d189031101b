//! Shared fixtures: a scriptable plugin and a journal of everything it did

#![allow(dead_code)]

use async_trait::async_trait;
use lattice_config::RegistryConfig;
use lattice_plugin::{
    Plugin, PluginContext, PluginError, PluginMetadata, PluginResult, Registry, StaticPluginLoader,
};
use semver::Version;
use serde_json::{json, Value};
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Calls made on every mock plugin, in the order they happened
#[derive(Default)]
pub struct Journal {
    entries: Mutex<Vec<String>>,
}

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.entries.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    /// Entries with the given suffix, e.g. `.undo`
    pub fn matching(&self, suffix: &str) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|e| e.ends_with(suffix))
            .collect()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| *e == entry).count()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}

/// Failure script shared by every instance a factory builds
#[derive(Default)]
pub struct Script {
    pub fail_init: AtomicBool,
    pub fail_start: AtomicBool,
    pub fail_pause: AtomicBool,
    pub fail_resume: AtomicBool,
    pub panic_on_stop: AtomicBool,
    /// Operation name to number of calls that fail before it succeeds
    failures: Mutex<HashMap<String, u32>>,
    delays: Mutex<HashMap<String, Duration>>,
}

impl Script {
    pub fn fail_operation(&self, operation: &str, times: u32) {
        self.failures
            .lock()
            .unwrap()
            .insert(operation.to_string(), times);
    }

    pub fn always_fail(&self, operation: &str) {
        self.fail_operation(operation, u32::MAX);
    }

    /// Delay an operation, or a hook when named `init`/`start`/`pause`
    pub fn delay(&self, operation: &str, delay: Duration) {
        self.delays
            .lock()
            .unwrap()
            .insert(operation.to_string(), delay);
    }

    fn should_fail(&self, operation: &str) -> bool {
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(operation) {
            Some(0) | None => false,
            Some(remaining) => {
                if *remaining != u32::MAX {
                    *remaining -= 1;
                }
                true
            }
        }
    }

    fn delay_for(&self, operation: &str) -> Option<Duration> {
        self.delays.lock().unwrap().get(operation).copied()
    }
}

pub struct MockPlugin {
    id: String,
    build: u32,
    script: Arc<Script>,
    journal: Arc<Journal>,
}

impl MockPlugin {
    async fn hook(&self, name: &str, fail: &AtomicBool) -> PluginResult<()> {
        if let Some(delay) = self.script.delay_for(name) {
            tokio::time::sleep(delay).await;
        }
        self.journal.record(format!("{}.{}", self.id, name));
        if fail.load(Ordering::SeqCst) {
            return Err(PluginError::operation_failed(&self.id, name, "scripted failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl Plugin for MockPlugin {
    async fn init(&mut self, _context: &PluginContext) -> PluginResult<()> {
        self.hook("init", &self.script.fail_init).await
    }

    async fn start(&mut self) -> PluginResult<()> {
        self.hook("start", &self.script.fail_start).await
    }

    async fn pause(&mut self) -> PluginResult<()> {
        self.hook("pause", &self.script.fail_pause).await
    }

    async fn resume(&mut self) -> PluginResult<()> {
        self.hook("resume", &self.script.fail_resume).await
    }

    async fn stop(&mut self) {
        self.journal.record(format!("{}.stop", self.id));
        if self.script.panic_on_stop.load(Ordering::SeqCst) {
            panic!("{} exploded while stopping", self.id);
        }
    }

    async fn execute(&mut self, operation: &str, input: Value) -> PluginResult<Value> {
        if let Some(delay) = self.script.delay_for(operation) {
            tokio::time::sleep(delay).await;
        }
        self.journal.record(format!("{}.{}", self.id, operation));
        if self.script.should_fail(operation) {
            return Err(PluginError::operation_failed(&self.id, operation, "scripted failure"));
        }
        Ok(json!({
            "plugin": self.id,
            "build": self.build,
            "operation": operation,
            "input": input,
        }))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A loader with one mock factory per plugin id
pub struct Harness {
    pub loader: Arc<StaticPluginLoader>,
    pub journal: Arc<Journal>,
    scripts: HashMap<String, Arc<Script>>,
}

impl Harness {
    pub fn new(ids: &[&str]) -> Self {
        let _ = lattice_logging::init_simple_tracing("warn");
        let journal = Arc::new(Journal::default());
        let mut scripts = HashMap::new();
        let mut loader = StaticPluginLoader::new();

        for id in ids {
            let script = Arc::new(Script::default());
            scripts.insert(id.to_string(), script.clone());
            loader = loader.with_factory(*id, factory(id, 1, script, journal.clone()));
        }

        Self {
            loader: Arc::new(loader),
            journal,
            scripts,
        }
    }

    pub fn script(&self, id: &str) -> Arc<Script> {
        self.scripts[id].clone()
    }

    /// Swap in a new build for `id`, with its own script
    pub async fn rebuild(&self, id: &str, build: u32) -> Arc<Script> {
        let script = Arc::new(Script::default());
        self.loader
            .register(id, factory(id, build, script.clone(), self.journal.clone()))
            .await;
        script
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry_with(RegistryConfig::default())
    }

    pub fn registry_with(&self, config: RegistryConfig) -> Arc<Registry> {
        Arc::new(Registry::new(self.loader.clone(), config))
    }
}

fn factory(
    id: &str,
    build: u32,
    script: Arc<Script>,
    journal: Arc<Journal>,
) -> impl Fn() -> Box<dyn Plugin> + Send + Sync + 'static {
    let id = id.to_string();
    move || {
        Box::new(MockPlugin {
            id: id.clone(),
            build,
            script: script.clone(),
            journal: journal.clone(),
        }) as Box<dyn Plugin>
    }
}

pub fn meta(id: &str, version: &str) -> PluginMetadata {
    PluginMetadata::new(id, Version::parse(version).unwrap())
}

/// Register every plugin
pub async fn register_all(registry: &Registry, plugins: Vec<PluginMetadata>) {
    for metadata in plugins {
        registry.register(metadata).await.unwrap();
    }
}
