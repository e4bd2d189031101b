//! Lifecycle and workflow transition events
//!
//! Delivery is fire-and-forget: emitting never waits on a subscriber or a
//! sink. A subscriber that falls behind loses the oldest events, and a sink
//! whose queue is full loses the newest.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::types::PluginState;
use crate::workflow::instance::{StageStatus, WorkflowStatus};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Plugin {
        plugin_id: String,
        from: PluginState,
        to: PluginState,
        timestamp: DateTime<Utc>,
    },
    Workflow {
        workflow: String,
        instance_id: Uuid,
        from: WorkflowStatus,
        to: WorkflowStatus,
        timestamp: DateTime<Utc>,
    },
    Stage {
        workflow: String,
        instance_id: Uuid,
        stage_id: String,
        status: StageStatus,
        timestamp: DateTime<Utc>,
    },
}

impl LifecycleEvent {
    pub fn plugin(plugin_id: &str, from: PluginState, to: PluginState) -> Self {
        Self::Plugin {
            plugin_id: plugin_id.to_string(),
            from,
            to,
            timestamp: Utc::now(),
        }
    }
}

/// Receives events from the host on a task of its own
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &LifecycleEvent);
}

/// Writes every event as a tracing record
#[derive(Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: &LifecycleEvent) {
        match event {
            LifecycleEvent::Plugin {
                plugin_id, from, to, ..
            } => tracing::info!(
                target: "plugin_lifecycle",
                plugin_id = %plugin_id,
                from = %from,
                to = %to,
                "Plugin state changed"
            ),
            LifecycleEvent::Workflow {
                workflow,
                instance_id,
                from,
                to,
                ..
            } => tracing::info!(
                target: "workflow_engine",
                workflow = %workflow,
                instance_id = %instance_id,
                from = ?from,
                to = ?to,
                "Workflow status changed"
            ),
            LifecycleEvent::Stage {
                workflow,
                instance_id,
                stage_id,
                status,
                ..
            } => tracing::debug!(
                target: "workflow_engine",
                workflow = %workflow,
                instance_id = %instance_id,
                stage_id = %stage_id,
                status = ?status,
                "Stage status changed"
            ),
        }
    }
}

/// Discards every event
#[derive(Debug, Default)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _event: &LifecycleEvent) {}
}

/// Fans events out to broadcast subscribers and any attached sinks
pub struct EventBus {
    sender: broadcast::Sender<LifecycleEvent>,
    capacity: usize,
    sinks: Vec<mpsc::Sender<LifecycleEvent>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            sinks: Vec::new(),
        }
    }

    /// Attach a sink, drained by a spawned task until the bus is dropped.
    /// Must be called from within a tokio runtime.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        let (tx, mut rx) = mpsc::channel::<LifecycleEvent>(self.capacity);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                sink.emit(&event);
            }
        });
        self.sinks.push(tx);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: LifecycleEvent) {
        for sink in &self.sinks {
            if let Err(mpsc::error::TrySendError::Full(_)) = sink.try_send(event.clone()) {
                tracing::debug!(target: "plugin_lifecycle", "Event sink queue full, dropping event");
            }
        }
        // no subscribers is not an error
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
