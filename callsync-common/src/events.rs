//! Event types for the CallSync realtime event system
//!
//! Provides the shared event enum and the broadcast `EventBus` used to push
//! call updates to realtime subscribers (SSE clients, collaborators).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::db::CallRecord;

/// CallSync event types
///
/// Events are broadcast via EventBus and serialized for SSE transmission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CallSyncEvent {
    /// A call record changed state or attributes
    ///
    /// Emitted after the write committed, by the inbox worker and by the
    /// reconciliation tiers alike.
    CallUpdated {
        event_id: Uuid,
        record: CallRecord,
        timestamp: DateTime<Utc>,
    },

    /// An inbox row failed processing and needs attention
    InboxEventFailed {
        event_id: Uuid,
        event_key: String,
        error: String,
        retryable: bool,
        timestamp: DateTime<Utc>,
    },

    /// A reconciliation tier finished one run
    ReconcileCompleted {
        event_id: Uuid,
        tier: String,
        checked: usize,
        applied: usize,
        failed: usize,
        timestamp: DateTime<Utc>,
    },
}

impl CallSyncEvent {
    pub fn call_updated(record: CallRecord) -> Self {
        CallSyncEvent::CallUpdated {
            event_id: Uuid::new_v4(),
            record,
            timestamp: Utc::now(),
        }
    }

    /// Event name used as the SSE `event:` field
    pub fn event_type(&self) -> &'static str {
        match self {
            CallSyncEvent::CallUpdated { .. } => "CallUpdated",
            CallSyncEvent::InboxEventFailed { .. } => "InboxEventFailed",
            CallSyncEvent::ReconcileCompleted { .. } => "ReconcileCompleted",
        }
    }
}

/// Broadcast bus for CallSync events
///
/// Cloning shares the underlying channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CallSyncEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// Slow subscribers lose the oldest events once `capacity` is exceeded.
    ///
    /// # Examples
    ///
    /// ```
    /// use callsync_common::events::EventBus;
    ///
    /// let event_bus = EventBus::new(100);
    /// assert_eq!(event_bus.capacity(), 100);
    /// ```
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<CallSyncEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: CallSyncEvent,
    ) -> Result<usize, broadcast::error::SendError<CallSyncEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: CallSyncEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_emitted_event() {
        let bus = EventBus::new(10);
        let mut rx = bus.subscribe();

        bus.emit_lossy(CallSyncEvent::ReconcileCompleted {
            event_id: Uuid::new_v4(),
            tier: "hot".to_string(),
            checked: 3,
            applied: 1,
            failed: 0,
            timestamp: Utc::now(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type(), "ReconcileCompleted");
    }

    #[test]
    fn test_emit_without_subscribers_errors() {
        let bus = EventBus::new(10);
        let result = bus.emit(CallSyncEvent::InboxEventFailed {
            event_id: Uuid::new_v4(),
            event_key: "k".to_string(),
            error: "boom".to_string(),
            retryable: true,
            timestamp: Utc::now(),
        });
        assert!(result.is_err());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = CallSyncEvent::InboxEventFailed {
            event_id: Uuid::new_v4(),
            event_key: "k".to_string(),
            error: "boom".to_string(),
            retryable: false,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "InboxEventFailed");
        assert_eq!(json["retryable"], false);
    }
}
