use crate::core::workflow::executor::human::HumanReviewRequest;
use crate::core::workflow::state::RunResult;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

pub const RUN_COMPLETED: &str = "workflow_completed";
pub const REVIEW_REQUESTED: &str = "human_review_requested";

/// Notifications published by the engine and its executors.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum WorkflowEvent {
    RunCompleted(Box<RunResult>),
    ReviewRequested(HumanReviewRequest),
}

impl WorkflowEvent {
    pub fn name(&self) -> &'static str {
        match self {
            WorkflowEvent::RunCompleted(_) => RUN_COMPLETED,
            WorkflowEvent::ReviewRequested(_) => REVIEW_REQUESTED,
        }
    }
}

/// Destination for workflow events, injected into the engine at construction.
pub trait EventSink: Send + Sync + 'static {
    fn emit(&self, event: WorkflowEvent);
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _event: WorkflowEvent) {}
}

pub type Listener = Arc<dyn Fn(&WorkflowEvent) + Send + Sync>;

/// Callback registry keyed by event name.
#[derive(Default)]
pub struct ListenerEventSink {
    listeners: RwLock<HashMap<String, Vec<Listener>>>,
}

impl ListenerEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for `event_name` (`workflow_completed`, `human_review_requested`).
    pub fn on<F>(&self, event_name: &str, listener: F)
    where
        F: Fn(&WorkflowEvent) + Send + Sync + 'static,
    {
        let mut guard = self
            .listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard
            .entry(event_name.to_string())
            .or_default()
            .push(Arc::new(listener));
    }

    pub fn listener_count(&self, event_name: &str) -> usize {
        let guard = self
            .listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.get(event_name).map(Vec::len).unwrap_or(0)
    }
}

impl EventSink for ListenerEventSink {
    fn emit(&self, event: WorkflowEvent) {
        // Clone out of the lock so listeners may register further listeners.
        let listeners = {
            let guard = self
                .listeners
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.get(event.name()).cloned().unwrap_or_default()
        };
        for listener in listeners {
            listener(&event);
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EmitError {
    #[error("no subscribers for {0}")]
    NoSubscribers(&'static str),
}

/// Fan-out over a tokio broadcast channel for hosts that prefer receivers to callbacks.
#[derive(Clone)]
pub struct BroadcastEventSink {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }

    /// Send to current subscribers, returning how many received it.
    pub fn try_emit(&self, event: WorkflowEvent) -> Result<usize, EmitError> {
        let name = event.name();
        self.sender
            .send(event)
            .map_err(|_| EmitError::NoSubscribers(name))
    }
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventSink for BroadcastEventSink {
    fn emit(&self, event: WorkflowEvent) {
        if let Err(err) = self.try_emit(event) {
            tracing::debug!("event dropped: {}", err);
        }
    }
}
