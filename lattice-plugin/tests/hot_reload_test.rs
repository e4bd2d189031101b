//! Hot reload integration tests: dependents pause around the swap

mod common;

use common::{meta, register_all, Harness};
use lattice_plugin::{
    HotReloadCoordinator, LifecycleEvent, PluginError, PluginState, ReloadRequest, Registry,
};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// `d` depends on `p`, both running
async fn setup() -> (Harness, Arc<Registry>, Arc<HotReloadCoordinator>) {
    let harness = Harness::new(&["p", "d"]);
    let registry = harness.registry();
    register_all(
        &registry,
        vec![meta("p", "1.0.0"), meta("d", "1.0.0").depends_on("p", "^1.0.0").unwrap()],
    )
    .await;
    registry.load("d").await.unwrap();
    let coordinator = Arc::new(HotReloadCoordinator::new(registry.clone()));
    (harness, registry, coordinator)
}

#[tokio::test]
async fn test_dependent_paused_for_the_reload_window() {
    let (harness, registry, coordinator) = setup().await;
    harness.rebuild("p", 2).await;
    harness.journal.clear();
    let mut events = registry.subscribe();

    let outcome = coordinator.reload(ReloadRequest::new("p")).await.unwrap();
    assert_eq!(outcome.paused, vec!["d"]);
    assert_eq!(outcome.resumed, vec!["d"]);
    assert!(outcome.resume_failures.is_empty());

    let mut d_states = Vec::new();
    let mut p_states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let LifecycleEvent::Plugin { plugin_id, to, .. } = event {
            match plugin_id.as_str() {
                "d" => d_states.push(to),
                "p" => p_states.push(to),
                _ => {}
            }
        }
    }
    assert_eq!(d_states, vec![PluginState::Paused, PluginState::Running]);
    assert_eq!(p_states, vec![PluginState::Reloading, PluginState::Running]);

    // d was paused before the old p went away, and resumed only after the new one started
    let journal = &harness.journal;
    assert!(journal.position("d.pause").unwrap() < journal.position("p.stop").unwrap());
    assert!(journal.position("p.start").unwrap() < journal.position("d.resume").unwrap());

    let result = registry.execute("p", "version", json!(null)).await.unwrap();
    assert_eq!(result["build"], 2);
    assert_eq!(registry.stats().await.total_reloads, 1);
}

#[tokio::test]
async fn test_requests_during_reload_wait_for_new_instance() {
    let (harness, registry, coordinator) = setup().await;
    let script = harness.rebuild("p", 2).await;
    script.delay("init", Duration::from_millis(100));

    let reload = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.reload(ReloadRequest::new("p")).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let request = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.execute("p", "lookup", json!(null)).await })
    };

    reload.await.unwrap().unwrap();
    let served = request.await.unwrap().unwrap();
    assert_eq!(served["build"], 2);

    // never served by the torn-down instance
    let journal = &harness.journal;
    assert!(journal.position("p.lookup").unwrap() > journal.position("d.resume").unwrap());
}

#[tokio::test]
async fn test_unpausable_dependent_blocks_reload() {
    let harness = Harness::new(&["p", "d"]);
    let registry = harness.registry();
    register_all(
        &registry,
        vec![
            meta("p", "1.0.0"),
            meta("d", "1.0.0")
                .depends_on("p", "*")
                .unwrap()
                .with_pausable(false),
        ],
    )
    .await;
    registry.load("d").await.unwrap();
    harness.journal.clear();

    let coordinator = HotReloadCoordinator::new(registry.clone());
    match coordinator.reload(ReloadRequest::new("p")).await {
        Err(PluginError::DependentsActive { dependents, .. }) => assert_eq!(dependents, vec!["d"]),
        other => panic!("expected DependentsActive, got {:?}", other),
    }

    assert_eq!(registry.state_of("p").await, Some(PluginState::Running));
    assert_eq!(registry.state_of("d").await, Some(PluginState::Running));
    assert!(harness.journal.entries().is_empty());
}

#[tokio::test]
async fn test_broken_build_leaves_dependents_paused() {
    let (harness, registry, coordinator) = setup().await;
    let script = harness.rebuild("p", 2).await;
    script.fail_init.store(true, Ordering::SeqCst);

    let result = coordinator.reload(ReloadRequest::new("p")).await;
    assert!(matches!(result, Err(PluginError::InitFailed { .. })));

    assert_eq!(registry.state_of("p").await, Some(PluginState::Error));
    assert_eq!(registry.state_of("d").await, Some(PluginState::Paused));
    assert_eq!(harness.journal.count("d.resume"), 0);
    assert_eq!(registry.stats().await.total_reloads, 0);
}

#[tokio::test]
async fn test_failed_pause_abandons_reload() {
    let (harness, registry, coordinator) = setup().await;
    harness.script("d").fail_pause.store(true, Ordering::SeqCst);

    assert!(coordinator.reload(ReloadRequest::new("p")).await.is_err());
    assert_eq!(registry.state_of("p").await, Some(PluginState::Running));
    assert_eq!(registry.state_of("d").await, Some(PluginState::Running));
    assert_eq!(harness.journal.count("p.stop"), 0);

    // the original instance still serves
    let result = registry.execute("p", "ping", json!(null)).await.unwrap();
    assert_eq!(result["build"], 1);
}

#[tokio::test]
async fn test_reload_with_new_metadata() {
    let (harness, registry, coordinator) = setup().await;
    harness.rebuild("p", 2).await;

    let outcome = coordinator
        .reload(ReloadRequest::with_metadata(meta("p", "1.1.0")))
        .await
        .unwrap();
    assert_eq!(outcome.old_version.to_string(), "1.0.0");
    assert_eq!(outcome.new_version.to_string(), "1.1.0");
    assert_eq!(registry.get("p").await.unwrap().version().to_string(), "1.1.0");

    match coordinator
        .reload(ReloadRequest::with_metadata(meta("p", "2.0.0")))
        .await
    {
        Err(PluginError::UnsatisfiedDependency { plugin_id, actual, .. }) => {
            assert_eq!(plugin_id, "d");
            assert_eq!(actual.as_deref(), Some("2.0.0"));
        }
        other => panic!("expected UnsatisfiedDependency, got {:?}", other),
    }
    assert_eq!(registry.state_of("p").await, Some(PluginState::Running));
}

#[tokio::test]
async fn test_reload_of_paused_plugin_comes_back_running() {
    let (_harness, registry, coordinator) = setup().await;
    registry.pause("d").await.unwrap();

    let outcome = coordinator.reload(ReloadRequest::new("d")).await.unwrap();
    assert!(outcome.paused.is_empty());
    // reinitialising brings the new instance up running
    assert_eq!(registry.state_of("d").await, Some(PluginState::Running));
}

#[cfg(feature = "watcher")]
mod watching {
    use super::*;
    use lattice_config::HotReloadConfig;
    use lattice_plugin::{read_manifest, ManifestWatcher};
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_manifest_change_triggers_reload() {
        let (_harness, registry, coordinator) = setup().await;
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("plugin.json");
        std::fs::write(&manifest, r#"{"id": "p", "version": "1.0.0"}"#).unwrap();

        let known = read_manifest(&manifest).await.unwrap();
        let checksums = HashMap::from([(manifest.clone(), known.checksum)]);

        let config = HotReloadConfig {
            enabled: true,
            watch_paths: vec![dir.path().to_path_buf()],
            debounce: Duration::from_millis(50),
            ..Default::default()
        };
        let coordinator = Arc::try_unwrap(coordinator).ok().unwrap();
        let (sender, reload_loop) = coordinator.spawn(8);
        let watcher = ManifestWatcher::start(&config, "plugin.json", checksums, sender).unwrap();

        std::fs::write(&manifest, r#"{"id": "p", "version": "1.0.1"}"#).unwrap();

        let mut reloaded = false;
        for _ in 0..60 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if registry.get("p").await.unwrap().version().to_string() == "1.0.1" {
                reloaded = true;
                break;
            }
        }
        assert!(reloaded, "manifest change was not picked up");
        assert_eq!(registry.state_of("d").await, Some(PluginState::Running));

        watcher.stop();
        reload_loop.shutdown().await;
    }
}
