//! Engine event system for observability.
//!
//! Emits [`EngineEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! external observers (audit logs, metrics collectors, dashboards) can follow
//! conversation turns without coupling to the engine internals.

use serde::{Deserialize, Serialize};

/// Events emitted while a turn executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    TurnStarted {
        conversation: String,
        event_id: String,
        flow_id: String,
        flow_version: u64,
        resumed: bool,
    },
    StepStarted {
        conversation: String,
        node_id: String,
        node_type: String,
    },
    StepCompleted {
        conversation: String,
        node_id: String,
        directive: String,
        duration_ms: u64,
    },
    EdgeSelected {
        conversation: String,
        from_node: String,
        to_node: String,
        edge_id: String,
    },
    VariableMissing {
        conversation: String,
        node_id: String,
        path: String,
    },
    TurnSuspended {
        conversation: String,
        node_id: String,
        steps: usize,
    },
    TurnTerminated {
        conversation: String,
        node_id: String,
        steps: usize,
    },
    TurnFailed {
        conversation: String,
        node_id: String,
        error: String,
    },
    DuplicateIgnored {
        conversation: String,
        event_id: String,
    },
    StateSaved {
        conversation: String,
        version: u64,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<EngineEvent>,
}

impl EventEmitter {
    /// Create a new emitter with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    ///
    /// If there are no active receivers the event is silently dropped.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
