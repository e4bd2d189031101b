//! Plugin host core for Lattice
//!
//! Resolves plugin dependencies into a safe load and unload order, drives
//! each plugin through its lifecycle, orchestrates multi-plugin workflows
//! with compensation on failure, and swaps running plugins in place without
//! breaking their dependents.

pub mod core;
pub mod discovery;
pub mod error;
pub mod events;
pub mod graph;
pub mod hot_reload;
pub mod lifecycle;
pub mod loader;
pub mod manager;
pub mod registry;
pub mod types;
pub mod version;
pub mod workflow;

// Re-export main types
pub use core::{Plugin, PluginContext, PluginHandle};
pub use discovery::{
    read_manifest, DiscoveredManifest, ManifestDirectorySource, MetadataSource,
    StaticMetadataSource,
};
pub use error::{PluginError, PluginResult};
pub use events::{EventBus, EventSink, LifecycleEvent, NullEventSink, TracingEventSink};
pub use graph::DependencyGraph;
pub use hot_reload::{HotReloadCoordinator, ReloadLoop, ReloadOutcome, ReloadRequest, ReloadSender};
pub use lifecycle::LifecycleController;
pub use loader::{PluginFactory, PluginLoader, StaticPluginLoader};
pub use manager::{PluginHost, PluginHostBuilder};
pub use registry::{Registry, RegistryStats};
pub use types::{Capability, Dependency, PluginMetadata, PluginRecord, PluginState};
pub use version::VersionConstraint;
pub use workflow::{
    RollbackManager, RollbackReport, Stage, StageStatus, TransactionLog, WorkflowDefinition,
    WorkflowEngine, WorkflowInstance, WorkflowReport, WorkflowRun, WorkflowStatus,
};

#[cfg(feature = "watcher")]
pub use hot_reload::ManifestWatcher;

/// Plugin host version
pub const HOST_VERSION: &str = env!("CARGO_PKG_VERSION");
