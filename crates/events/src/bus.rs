//! The event bus.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::mpsc;

use mx_domain::event::EventEnvelope;

/// Buffered events per subscriber before fan-out starts dropping.
const SUBSCRIBER_CAPACITY: usize = 256;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// EventBus
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Process-wide event bus.
///
/// Session-scoped events are fanned out to that session's subscribers and
/// to every service-level subscriber. Publishing never blocks: a full
/// subscriber channel drops the event with a warning.
pub struct EventBus {
    id: String,
    service: RwLock<Vec<mpsc::Sender<EventEnvelope>>>,
    sessions: RwLock<HashMap<String, Vec<mpsc::Sender<EventEnvelope>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            service: RwLock::new(Vec::new()),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Subscribe to every event published on this bus.
    pub fn subscribe_service(&self) -> mpsc::Receiver<EventEnvelope> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        self.service.write().push(tx);
        rx
    }

    /// Subscribe to one session's events only.
    pub fn subscribe_session(&self, session_id: &str) -> mpsc::Receiver<EventEnvelope> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        self.sessions
            .write()
            .entry(session_id.to_owned())
            .or_default()
            .push(tx);
        rx
    }

    /// Publish a process-scoped event.
    pub fn emit_service(&self, event_type: &str, data: Value) {
        let envelope = EventEnvelope::new(event_type, data).with_source(self.id.clone());
        self.fan_out_service(&envelope);
    }

    /// Publish an event scoped to a session.
    pub fn emit_session(&self, session_id: &str, event_type: &str, data: Value) {
        let envelope = EventEnvelope::new(event_type, data)
            .with_session(session_id)
            .with_source(self.id.clone());

        {
            let mut sessions = self.sessions.write();
            let drained = match sessions.get_mut(session_id) {
                Some(subs) => {
                    deliver(subs, &envelope);
                    subs.is_empty()
                }
                None => false,
            };
            if drained {
                sessions.remove(session_id);
            }
        }
        self.fan_out_service(&envelope);
    }

    /// Drop all subscribers for a session (called on disconnect).
    pub fn drop_session(&self, session_id: &str) {
        self.sessions.write().remove(session_id);
    }

    fn fan_out_service(&self, envelope: &EventEnvelope) {
        let mut subs = self.service.write();
        deliver(&mut subs, envelope);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Send to every live subscriber without blocking; prune closed channels.
fn deliver(subs: &mut Vec<mpsc::Sender<EventEnvelope>>, envelope: &EventEnvelope) {
    subs.retain(|tx| {
        if tx.is_closed() {
            return false;
        }
        match tx.try_send(envelope.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    event_type = %envelope.event_type,
                    "event subscriber is lagging, dropping event"
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn service_subscriber_sees_all_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_service();

        bus.emit_service("llm:responseStarted", serde_json::json!({"id": 1}));
        bus.emit_session("s1", "llm:thinking", serde_json::json!({}));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.event_type, "llm:responseStarted");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.event_type, "llm:thinking");
        assert_eq!(second.metadata.session_id.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn session_subscriber_is_scoped() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_session("s1");

        bus.emit_session("s2", "llm:thinking", serde_json::json!({}));
        bus.emit_session("s1", "llm:responseCompleted", serde_json::json!({}));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, "llm:responseCompleted");
    }

    #[tokio::test]
    async fn full_subscriber_never_blocks_publisher() {
        let bus = EventBus::new();
        let _rx = bus.subscribe_service();
        // Far more events than the channel holds; emit must not deadlock.
        for i in 0..(SUBSCRIBER_CAPACITY * 2) {
            bus.emit_service("tool:executed", serde_json::json!({"i": i}));
        }
    }

    #[tokio::test]
    async fn dropped_subscriber_is_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe_service();
        drop(rx);
        bus.emit_service("session:created", serde_json::json!({}));
        assert!(bus.service.read().is_empty());
    }
}
