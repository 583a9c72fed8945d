use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Events fanned out to UI subscribers. Payloads are full snapshots, never
/// deltas; a lagging subscriber that drops old events only misses stale state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordinatorEvent {
    InitProgress,
    WorkspaceRemoved,
    SessionStarted,
    SessionStopped,
    SessionError,
}

impl CoordinatorEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoordinatorEvent::InitProgress => "superset:init-progress",
            CoordinatorEvent::WorkspaceRemoved => "superset:workspace-removed",
            CoordinatorEvent::SessionStarted => "superset:session-started",
            CoordinatorEvent::SessionStopped => "superset:session-stopped",
            CoordinatorEvent::SessionError => "superset:session-error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub event: CoordinatorEvent,
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionErrorPayload {
    pub session_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionLifecyclePayload {
    pub session_id: String,
}

const EVENT_BUS_CAPACITY: usize = 256;

/// Process-wide broadcaster. Emission is synchronous, so events for the same
/// entity reach a given subscriber in emission order.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    /// Publishing with no subscribers is a no-op, not an error.
    pub fn publish<T: Serialize>(&self, event: CoordinatorEvent, payload: &T) {
        let payload = match serde_json::to_value(payload) {
            Ok(value) => value,
            Err(err) => {
                warn!("Dropping unserializable {} event: {err}", event.as_str());
                return;
            }
        };
        let _ = self.tx.send(EventEnvelope { event, payload });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
