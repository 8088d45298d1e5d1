//! Event correlation: matching inbound events to the steps awaiting them.
//!
//! Each waiting `event_wait` attempt registers a `{field: value}` equality
//! filter under its step-execution id. `deliver` checks an event against
//! every outstanding filter, so any number of steps across instances can be
//! resumed by one event. A waiter is removed the moment it is resolved,
//! whether by delivery, timeout or cancellation, which makes each wait
//! resolve exactly once and makes duplicate deliveries harmless.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use conflux_types::event::{EngineEvent, InboundEvent};
use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::event::EventBus;

/// Event ids remembered for duplicate suppression.
const SEEN_EVENT_CAPACITY: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CorrelationError {
    #[error("timed out waiting for '{event_type}'")]
    TimedOut { event_type: String },

    #[error("wait '{0}' was cancelled")]
    Cancelled(String),

    #[error("wait '{0}' is already registered")]
    AlreadyWaiting(String),
}

struct Waiter {
    event_type: String,
    filter: BTreeMap<String, Value>,
    tx: oneshot::Sender<InboundEvent>,
}

impl Waiter {
    fn matches(&self, event: &InboundEvent) -> bool {
        self.event_type == event.event_type
            && self
                .filter
                .iter()
                .all(|(field, expected)| event.field(field) == Some(expected))
    }
}

#[derive(Default)]
struct SeenEvents {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl SeenEvents {
    /// Returns false if the id was already seen.
    fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() >= SEEN_EVENT_CAPACITY {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
        self.order.push_back(id.to_string());
        self.ids.insert(id.to_string());
        true
    }
}

/// Registry of outstanding event waits.
pub struct CorrelationManager {
    waiters: DashMap<String, Waiter>,
    seen: Mutex<SeenEvents>,
    events: Option<EventBus>,
}

impl CorrelationManager {
    pub fn new() -> Self {
        Self {
            waiters: DashMap::new(),
            seen: Mutex::new(SeenEvents::default()),
            events: None,
        }
    }

    /// Publish `EventUnmatched` for events that resume nothing.
    pub fn with_events(mut self, bus: EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    /// Register a wait. The returned handle must be awaited to receive the event.
    ///
    /// Registration is synchronous so that an event delivered right after the
    /// call is never missed.
    pub fn register(
        &self,
        step_execution_id: impl Into<String>,
        event_type: impl Into<String>,
        filter: BTreeMap<String, Value>,
    ) -> Result<PendingWait<'_>, CorrelationError> {
        let id = step_execution_id.into();
        let event_type = event_type.into();
        let (tx, rx) = oneshot::channel();
        match self.waiters.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(CorrelationError::AlreadyWaiting(id));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Waiter {
                    event_type: event_type.clone(),
                    filter,
                    tx,
                });
            }
        }
        tracing::debug!(wait_id = %id, event_type = %event_type, "registered event wait");
        Ok(PendingWait {
            manager: self,
            id,
            event_type,
            rx,
        })
    }

    /// Wait for an event matching `filter`, or fail after `timeout`.
    pub async fn await_event(
        &self,
        step_execution_id: impl Into<String>,
        event_type: impl Into<String>,
        filter: BTreeMap<String, Value>,
        timeout: Duration,
    ) -> Result<InboundEvent, CorrelationError> {
        self.register(step_execution_id, event_type, filter)?
            .wait_until(Instant::now() + timeout)
            .await
    }

    /// Offer an event to every outstanding wait. Returns how many resumed.
    ///
    /// An event whose `event_id` was already delivered is ignored.
    pub fn deliver(&self, event: &InboundEvent) -> usize {
        if let Some(id) = &event.event_id {
            let fresh = self
                .seen
                .lock()
                .map(|mut seen| seen.insert(id))
                .unwrap_or(true);
            if !fresh {
                tracing::debug!(event_id = %id, "ignoring duplicate event delivery");
                return 0;
            }
        }

        let matched: Vec<String> = self
            .waiters
            .iter()
            .filter(|w| w.value().matches(event))
            .map(|w| w.key().clone())
            .collect();

        let mut resumed = 0;
        for id in matched {
            // Whoever removes the waiter owns its resolution.
            if let Some((_, waiter)) = self.waiters.remove(&id) {
                if waiter.tx.send(event.clone()).is_ok() {
                    resumed += 1;
                    tracing::debug!(wait_id = %id, event_type = %event.event_type, "event matched wait");
                }
            }
        }

        if resumed == 0 {
            tracing::debug!(event_type = %event.event_type, "dropping unmatched event");
            if let Some(bus) = &self.events {
                bus.publish(EngineEvent::EventUnmatched {
                    event_type: event.event_type.clone(),
                });
            }
        }
        resumed
    }

    /// Cancel a wait. Returns whether it was still outstanding.
    pub fn cancel(&self, step_execution_id: &str) -> bool {
        self.waiters.remove(step_execution_id).is_some()
    }

    /// Event types with at least one outstanding wait.
    pub fn awaited_event_types(&self) -> BTreeSet<String> {
        self.waiters
            .iter()
            .map(|w| w.value().event_type.clone())
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.waiters.len()
    }
}

impl Default for CorrelationManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CorrelationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationManager")
            .field("pending", &self.waiters.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// PendingWait
// ---------------------------------------------------------------------------

/// A registered wait. Dropping it deregisters the filter.
pub struct PendingWait<'a> {
    manager: &'a CorrelationManager,
    id: String,
    event_type: String,
    rx: oneshot::Receiver<InboundEvent>,
}

impl PendingWait<'_> {
    /// Resolve with the matching event, or time out at `deadline`.
    ///
    /// The timeout fires at most once: if a delivery claimed the waiter at
    /// the same instant, the event wins.
    pub async fn wait_until(mut self, deadline: Instant) -> Result<InboundEvent, CorrelationError> {
        match tokio::time::timeout_at(deadline, &mut self.rx).await {
            Ok(Ok(event)) => Ok(event),
            Ok(Err(_)) => Err(CorrelationError::Cancelled(self.id.clone())),
            Err(_) => {
                if self.manager.waiters.remove(&self.id).is_some() {
                    tracing::debug!(wait_id = %self.id, "event wait timed out");
                    return Err(CorrelationError::TimedOut {
                        event_type: self.event_type.clone(),
                    });
                }
                self.rx.try_recv().map_err(|_| CorrelationError::TimedOut {
                    event_type: self.event_type.clone(),
                })
            }
        }
    }
}

impl Drop for PendingWait<'_> {
    fn drop(&mut self) {
        self.manager.waiters.remove(&self.id);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn filter(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn resumes_only_on_exact_match() {
        let manager = CorrelationManager::new();
        let wait = manager
            .register(
                "i1-wait-1",
                "task.completed",
                filter(&[("correlationId", json!("X")), ("taskId", json!("Y"))]),
            )
            .unwrap();

        let partial = InboundEvent::new("task.completed", json!({"correlationId": "X", "taskId": "Z"}));
        assert_eq!(manager.deliver(&partial), 0);
        let wrong_type = InboundEvent::new("task.failed", json!({"correlationId": "X", "taskId": "Y"}));
        assert_eq!(manager.deliver(&wrong_type), 0);
        assert_eq!(manager.pending_count(), 1);

        let exact = InboundEvent::new("task.completed", json!({"correlationId": "X", "taskId": "Y"}));
        assert_eq!(manager.deliver(&exact), 1);

        let event = wait
            .wait_until(Instant::now() + Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(event.payload["taskId"], "Y");
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn one_event_resumes_every_matching_waiter() {
        let manager = CorrelationManager::new();
        let f = filter(&[("correlationId", json!("X"))]);
        let a = manager.register("a", "done", f.clone()).unwrap();
        let b = manager.register("b", "done", f).unwrap();

        let event = InboundEvent::new("done", json!({"correlationId": "X"}));
        assert_eq!(manager.deliver(&event), 2);
        let deadline = Instant::now() + Duration::from_secs(1);
        assert!(a.wait_until(deadline).await.is_ok());
        assert!(b.wait_until(deadline).await.is_ok());

        // redelivery finds nobody
        assert_eq!(manager.deliver(&event), 0);
    }

    #[tokio::test]
    async fn duplicate_event_ids_are_ignored() {
        let manager = CorrelationManager::new();
        let f = filter(&[("k", json!(1))]);
        let _first = manager.register("a", "e", f.clone()).unwrap();

        let mut event = InboundEvent::new("e", json!({"k": 1}));
        event.event_id = Some("evt-1".to_string());
        assert_eq!(manager.deliver(&event), 1);

        let _second = manager.register("b", "e", f).unwrap();
        assert_eq!(manager.deliver(&event), 0);
        assert_eq!(manager.pending_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fires_once_and_deregisters() {
        let manager = CorrelationManager::new();
        let result = manager
            .await_event(
                "w",
                "task.completed",
                filter(&[("taskId", json!("t1"))]),
                Duration::from_secs(3600),
            )
            .await;
        assert_eq!(
            result,
            Err(CorrelationError::TimedOut {
                event_type: "task.completed".to_string()
            })
        );
        assert_eq!(manager.pending_count(), 0);
        let late = InboundEvent::new("task.completed", json!({"taskId": "t1"}));
        assert_eq!(manager.deliver(&late), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_resolves_the_wait() {
        let manager = Arc::new(CorrelationManager::new());
        let m = manager.clone();
        let task = tokio::spawn(async move {
            m.await_event("w", "e", filter(&[("k", json!(1))]), Duration::from_secs(60))
                .await
        });
        tokio::task::yield_now().await;
        assert_eq!(manager.awaited_event_types().into_iter().collect::<Vec<_>>(), vec!["e"]);
        assert!(manager.cancel("w"));
        assert_eq!(task.await.unwrap(), Err(CorrelationError::Cancelled("w".to_string())));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let manager = CorrelationManager::new();
        let _w = manager.register("w", "e", filter(&[("k", json!(1))])).unwrap();
        assert!(matches!(
            manager.register("w", "e", filter(&[("k", json!(1))])),
            Err(CorrelationError::AlreadyWaiting(_))
        ));
    }

    #[test]
    fn unmatched_events_are_published() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let manager = CorrelationManager::new().with_events(bus);
        manager.deliver(&InboundEvent::new("orphan", json!({})));
        assert!(matches!(
            rx.try_recv().unwrap(),
            EngineEvent::EventUnmatched { event_type } if event_type == "orphan"
        ));
    }
}
