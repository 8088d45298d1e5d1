//! Event types: inbound business events and engine notifications.
//!
//! `InboundEvent` arrives from the external event bus and is matched against
//! waiting `event_wait` steps. `EngineEvent` is broadcast on the in-process
//! bus for observers (CLI `--wait`, logging, tests).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::breaker::BreakerState;
use crate::instance::StateLogEntry;

/// An asynchronous event delivered by the event bus collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Producer-assigned id, if any. Informational only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    /// Event type (e.g. "task.completed").
    pub event_type: String,
    /// Event body. Correlation filters address fields inside it.
    #[serde(default)]
    pub payload: Value,
}

impl InboundEvent {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_id: None,
            event_type: event_type.into(),
            payload,
        }
    }

    /// Look up a dotted field path (`task.id`) inside the payload.
    pub fn field(&self, path: &str) -> Option<&Value> {
        path.split('.')
            .try_fold(&self.payload, |value, segment| match value {
                Value::Object(map) => map.get(segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            })
    }
}

/// Notifications emitted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A transition was durably appended to an instance's state log.
    Transition { entry: StateLogEntry },

    /// A `notify` handler signalled a permanent step failure.
    StepFailureSignalled {
        instance_id: Uuid,
        correlation_id: String,
        step: String,
        error: String,
    },

    /// An inbound event matched no waiting step and was dropped.
    EventUnmatched { event_type: String },

    /// A circuit breaker changed state.
    BreakerTransition {
        target: String,
        from: BreakerState,
        to: BreakerState,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn field_walks_dotted_paths() {
        let event = InboundEvent::new(
            "task.completed",
            json!({"correlationId": "c-1", "task": {"id": "t1", "tags": ["a", "b"]}}),
        );
        assert_eq!(event.field("correlationId"), Some(&json!("c-1")));
        assert_eq!(event.field("task.id"), Some(&json!("t1")));
        assert_eq!(event.field("task.tags.1"), Some(&json!("b")));
        assert_eq!(event.field("task.missing"), None);
        assert_eq!(event.field("correlationId.deeper"), None);
    }

    #[test]
    fn inbound_event_payload_defaults_to_null() {
        let event: InboundEvent = serde_json::from_value(json!({"event_type": "ping"})).unwrap();
        assert_eq!(event.payload, Value::Null);
        assert!(event.event_id.is_none());
    }
}
