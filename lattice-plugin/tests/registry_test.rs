//! Registry integration tests: load order, batch atomicity, unload policy

mod common;

use common::{meta, register_all, Harness};
use lattice_config::RegistryConfig;
use lattice_plugin::{
    EventBus, EventSink, LifecycleEvent, PluginError, PluginState, Registry, VersionConstraint,
};
use semver::Version;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_dependency_loads_first() {
    let harness = Harness::new(&["a", "b"]);
    let registry = harness.registry();
    register_all(
        &registry,
        vec![meta("a", "1.0.0").depends_on("b", "^1.0.0").unwrap(), meta("b", "1.4.0")],
    )
    .await;

    assert_eq!(registry.load_order().await.unwrap(), vec!["b", "a"]);

    registry.load("a").await.unwrap();
    assert_eq!(registry.state_of("a").await, Some(PluginState::Running));
    assert_eq!(registry.state_of("b").await, Some(PluginState::Running));

    // b was fully up before a began initializing
    let b_started = harness.journal.position("b.start").unwrap();
    let a_init = harness.journal.position("a.init").unwrap();
    assert!(b_started < a_init);
}

#[tokio::test]
async fn test_unsatisfied_constraint_changes_nothing() {
    let harness = Harness::new(&["a", "b"]);
    let registry = harness.registry();
    register_all(
        &registry,
        vec![meta("a", "1.0.0").depends_on("b", "^2.0.0").unwrap(), meta("b", "1.0.0")],
    )
    .await;

    match registry.load("a").await {
        Err(PluginError::UnsatisfiedDependency {
            plugin_id,
            target_id,
            required,
            actual,
        }) => {
            assert_eq!(plugin_id, "a");
            assert_eq!(target_id, "b");
            assert_eq!(required, "^2.0.0");
            assert_eq!(actual.as_deref(), Some("1.0.0"));
        }
        other => panic!("expected UnsatisfiedDependency, got {:?}", other),
    }

    assert_eq!(registry.state_of("a").await, Some(PluginState::Unloaded));
    assert_eq!(registry.state_of("b").await, Some(PluginState::Unloaded));
    assert!(harness.journal.entries().is_empty());
}

#[tokio::test]
async fn test_missing_dependency_is_reported() {
    let harness = Harness::new(&["a"]);
    let registry = harness.registry();
    register_all(&registry, vec![meta("a", "1.0.0").depends_on("db", "*").unwrap()]).await;

    assert!(matches!(
        registry.load("a").await,
        Err(PluginError::UnsatisfiedDependency { actual: None, .. })
    ));
}

#[tokio::test]
async fn test_cyclic_registration_is_rejected() {
    let harness = Harness::new(&["a", "b"]);
    let registry = harness.registry();
    register_all(&registry, vec![meta("a", "1.0.0").depends_on("b", "*").unwrap()]).await;

    let result = registry
        .register(meta("b", "1.0.0").depends_on("a", "*").unwrap())
        .await;
    assert!(matches!(result, Err(PluginError::CyclicDependency { .. })));
    assert!(registry.get("b").await.is_none());
}

#[tokio::test]
async fn test_failed_batch_is_unwound() {
    let harness = Harness::new(&["a", "b", "c"]);
    harness.script("c").fail_start.store(true, Ordering::SeqCst);

    let registry = harness.registry();
    register_all(
        &registry,
        vec![
            meta("a", "1.0.0"),
            meta("b", "1.0.0").depends_on("a", "*").unwrap(),
            meta("c", "1.0.0").depends_on("b", "*").unwrap(),
        ],
    )
    .await;

    let result = registry.load("c").await;
    assert!(matches!(result, Err(PluginError::InitFailed { ref plugin_id, .. }) if plugin_id == "c"));

    assert_eq!(registry.state_of("a").await, Some(PluginState::Unloaded));
    assert_eq!(registry.state_of("b").await, Some(PluginState::Unloaded));
    assert_eq!(registry.state_of("c").await, Some(PluginState::Error));

    // c's partial instance was released, then b and a in reverse
    let stops = harness.journal.matching(".stop");
    assert_eq!(stops, vec!["c.stop", "b.stop", "a.stop"]);

    let stats = registry.stats().await;
    assert_eq!(stats.failed_loads, 1);
    assert_eq!(stats.active, 0);
    assert!(registry.get("c").await.unwrap().last_error.is_some());
}

#[tokio::test]
async fn test_error_state_restarts_through_load() {
    let harness = Harness::new(&["a"]);
    let script = harness.script("a");
    script.fail_init.store(true, Ordering::SeqCst);

    let registry = harness.registry();
    register_all(&registry, vec![meta("a", "1.0.0")]).await;

    assert!(registry.load("a").await.is_err());
    assert_eq!(registry.state_of("a").await, Some(PluginState::Error));

    // only an explicit reload leaves Error
    assert!(matches!(
        registry.unload("a", false).await,
        Err(PluginError::InvalidStateTransition { .. })
    ));
    assert!(registry.pause("a").await.is_err());

    script.fail_init.store(false, Ordering::SeqCst);
    registry.load("a").await.unwrap();
    assert_eq!(registry.state_of("a").await, Some(PluginState::Running));
    assert!(registry.get("a").await.unwrap().last_error.is_none());
}

#[tokio::test]
async fn test_loader_failure_is_load_failed() {
    let harness = Harness::new(&[]);
    let registry = harness.registry();
    register_all(&registry, vec![meta("ghost", "1.0.0")]).await;

    assert!(matches!(
        registry.load("ghost").await,
        Err(PluginError::LoadFailed { .. })
    ));
    assert_eq!(registry.state_of("ghost").await, Some(PluginState::Error));

    let record = registry.deregister("ghost").await.unwrap();
    assert_eq!(record.id(), "ghost");
    assert!(registry.all().await.is_empty());
}

#[tokio::test]
async fn test_unload_blocked_by_running_dependent() {
    let harness = Harness::new(&["a", "b"]);
    let registry = harness.registry();
    register_all(
        &registry,
        vec![meta("a", "1.0.0").depends_on("b", "*").unwrap(), meta("b", "1.0.0")],
    )
    .await;
    registry.load("a").await.unwrap();

    match registry.unload("b", false).await {
        Err(PluginError::DependentsActive { dependents, .. }) => assert_eq!(dependents, vec!["a"]),
        other => panic!("expected DependentsActive, got {:?}", other),
    }
    assert_eq!(registry.state_of("b").await, Some(PluginState::Running));

    registry.unload("b", true).await.unwrap();
    assert_eq!(registry.state_of("a").await, Some(PluginState::Unloaded));
    assert_eq!(registry.state_of("b").await, Some(PluginState::Unloaded));
    assert_eq!(harness.journal.matching(".stop"), vec!["a.stop", "b.stop"]);
}

#[tokio::test]
async fn test_force_cascade_can_be_disabled() {
    let harness = Harness::new(&["a", "b"]);
    let registry = harness.registry_with(RegistryConfig {
        allow_force_cascade: false,
        ..Default::default()
    });
    register_all(
        &registry,
        vec![meta("a", "1.0.0").depends_on("b", "*").unwrap(), meta("b", "1.0.0")],
    )
    .await;
    registry.load("a").await.unwrap();

    assert!(matches!(
        registry.unload("b", true).await,
        Err(PluginError::DependentsActive { .. })
    ));
    assert_eq!(registry.state_of("a").await, Some(PluginState::Running));
}

#[tokio::test]
async fn test_optional_dependency_never_blocks() {
    let harness = Harness::new(&["app", "metrics"]);
    let registry = harness.registry();
    let app = meta("app", "1.0.0").with_dependency(
        lattice_plugin::Dependency::optional("metrics", "^1.0.0").unwrap(),
    );
    register_all(&registry, vec![app, meta("metrics", "1.0.0")]).await;

    registry.load("app").await.unwrap();
    assert_eq!(registry.state_of("metrics").await, Some(PluginState::Unloaded));

    // and an optional dependent does not hold the target up
    registry.load("metrics").await.unwrap();
    registry.unload("metrics", false).await.unwrap();
    assert_eq!(registry.state_of("app").await, Some(PluginState::Running));
}

#[tokio::test]
async fn test_pause_and_resume_are_idempotent() {
    let harness = Harness::new(&["a"]);
    let registry = harness.registry();
    register_all(&registry, vec![meta("a", "1.0.0")]).await;
    registry.load("a").await.unwrap();

    registry.pause("a").await.unwrap();
    registry.pause("a").await.unwrap();
    assert_eq!(registry.state_of("a").await, Some(PluginState::Paused));
    assert_eq!(harness.journal.count("a.pause"), 1);

    registry.resume("a").await.unwrap();
    registry.resume("a").await.unwrap();
    assert_eq!(registry.state_of("a").await, Some(PluginState::Running));
    assert_eq!(harness.journal.count("a.resume"), 1);
}

#[tokio::test]
async fn test_failed_pause_keeps_plugin_running() {
    let harness = Harness::new(&["a"]);
    harness.script("a").fail_pause.store(true, Ordering::SeqCst);
    let registry = harness.registry();
    register_all(&registry, vec![meta("a", "1.0.0")]).await;
    registry.load("a").await.unwrap();

    assert!(registry.pause("a").await.is_err());
    assert_eq!(registry.state_of("a").await, Some(PluginState::Running));
}

#[tokio::test]
async fn test_execute_waits_while_paused() {
    let harness = Harness::new(&["a"]);
    let registry = harness.registry();
    register_all(&registry, vec![meta("a", "1.0.0")]).await;
    registry.load("a").await.unwrap();
    registry.pause("a").await.unwrap();

    let caller = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.execute("a", "ping", json!({"n": 1})).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!caller.is_finished());
    assert_eq!(harness.journal.count("a.ping"), 0);

    registry.resume("a").await.unwrap();
    let result = caller.await.unwrap().unwrap();
    assert_eq!(result["input"], json!({"n": 1}));
}

#[tokio::test]
async fn test_execute_rejects_stopped_plugin() {
    let harness = Harness::new(&["a"]);
    let registry = harness.registry();
    register_all(&registry, vec![meta("a", "1.0.0")]).await;

    assert!(matches!(
        registry.execute("a", "ping", json!(null)).await,
        Err(PluginError::PluginUnavailable { .. })
    ));
    assert!(matches!(
        registry.execute("nobody", "ping", json!(null)).await,
        Err(PluginError::PluginNotFound { .. })
    ));
}

#[tokio::test]
async fn test_panic_in_stop_is_contained() {
    let harness = Harness::new(&["a"]);
    harness.script("a").panic_on_stop.store(true, Ordering::SeqCst);
    let registry = harness.registry();
    register_all(&registry, vec![meta("a", "1.0.0")]).await;
    registry.load("a").await.unwrap();

    registry.unload("a", false).await.unwrap();
    assert_eq!(registry.state_of("a").await, Some(PluginState::Unloaded));
    assert_eq!(harness.loader.closed(), 1);
}

#[tokio::test]
async fn test_lifecycle_events_in_order() {
    let harness = Harness::new(&["a"]);
    let registry = harness.registry();
    let mut events = registry.subscribe();
    register_all(&registry, vec![meta("a", "1.0.0")]).await;
    registry.load("a").await.unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let LifecycleEvent::Plugin { plugin_id, to, .. } = event {
            assert_eq!(plugin_id, "a");
            seen.push(to);
        }
    }
    assert_eq!(
        seen,
        vec![
            PluginState::Loading,
            PluginState::Loaded,
            PluginState::Initializing,
            PluginState::Running
        ]
    );
}

#[tokio::test]
async fn test_capability_query() {
    let harness = Harness::new(&["json", "yaml"]);
    let registry = harness.registry();
    register_all(
        &registry,
        vec![
            meta("json", "1.0.0").with_capability("codec", Version::new(2, 1, 0)),
            meta("yaml", "1.0.0").with_capability("codec", Version::new(1, 0, 0)),
        ],
    )
    .await;

    let constraint = VersionConstraint::parse("^2.0.0").unwrap();
    let found: Vec<String> = registry
        .find_by_capability("codec", &constraint)
        .await
        .into_iter()
        .map(|r| r.id().to_string())
        .collect();
    assert_eq!(found, vec!["json"]);
}

#[tokio::test]
async fn test_shutdown_unloads_dependents_first() {
    let harness = Harness::new(&["a", "b", "c"]);
    let registry = harness.registry();
    register_all(
        &registry,
        vec![
            meta("a", "1.0.0"),
            meta("b", "1.0.0").depends_on("a", "*").unwrap(),
            meta("c", "1.0.0").depends_on("b", "*").unwrap(),
        ],
    )
    .await;
    registry.load("c").await.unwrap();

    registry.shutdown().await;
    assert_eq!(harness.journal.matching(".stop"), vec!["c.stop", "b.stop", "a.stop"]);
    for record in registry.all().await {
        assert_eq!(record.state, PluginState::Unloaded);
    }
}

#[tokio::test]
async fn test_paused_dependency_blocks_initialization() {
    let harness = Harness::new(&["a", "b"]);
    let registry = harness.registry();
    register_all(
        &registry,
        vec![meta("a", "1.0.0").depends_on("b", "^1.0.0").unwrap(), meta("b", "1.0.0")],
    )
    .await;
    registry.load("b").await.unwrap();
    registry.pause("b").await.unwrap();

    let mut events = registry.subscribe();
    match registry.load("a").await {
        Err(PluginError::DependencyNotRunning {
            plugin_id,
            dependency_id,
            state,
        }) => {
            assert_eq!(plugin_id, "a");
            assert_eq!(dependency_id, "b");
            assert_eq!(state, PluginState::Paused);
        }
        other => panic!("expected DependencyNotRunning, got {:?}", other),
    }

    while let Ok(event) = events.try_recv() {
        if let LifecycleEvent::Plugin { plugin_id, .. } = event {
            assert_ne!(plugin_id, "a", "a must not leave Unloaded");
        }
    }
    assert_eq!(registry.state_of("a").await, Some(PluginState::Unloaded));
    assert_eq!(harness.journal.position("a.init"), None);
}

struct SlowSink(Arc<AtomicUsize>);

impl EventSink for SlowSink {
    fn emit(&self, _event: &LifecycleEvent) {
        std::thread::sleep(Duration::from_millis(100));
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slow_event_sink_does_not_hold_up_load() {
    let harness = Harness::new(&["a"]);
    let delivered = Arc::new(AtomicUsize::new(0));
    let events = EventBus::new(16).with_sink(Arc::new(SlowSink(delivered.clone())));
    let registry = Registry::with_events(
        harness.loader.clone(),
        RegistryConfig::default(),
        Arc::new(events),
    );
    register_all(&registry, vec![meta("a", "1.0.0")]).await;

    let started = std::time::Instant::now();
    registry.load("a").await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(100));
    assert_eq!(registry.state_of("a").await, Some(PluginState::Running));

    // the sink still sees all four transitions, just later
    for _ in 0..100 {
        if delivered.load(Ordering::SeqCst) == 4 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(delivered.load(Ordering::SeqCst), 4);
}
