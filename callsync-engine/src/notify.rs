//! Realtime notifier
//!
//! Fire-and-forget publication of call updates to whoever renders them. The
//! core only depends on the trait; delivery is not guaranteed.

use callsync_common::db::CallRecord;
use callsync_common::events::{CallSyncEvent, EventBus};

pub trait RealtimeNotifier: Send + Sync {
    fn publish_call_update(&self, record: &CallRecord);
}

/// Publishes onto the in-process event bus (consumed by the SSE stream)
#[derive(Clone)]
pub struct EventBusNotifier {
    bus: EventBus,
}

impl EventBusNotifier {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }
}

impl RealtimeNotifier for EventBusNotifier {
    fn publish_call_update(&self, record: &CallRecord) {
        tracing::debug!(
            call_sid = %record.call_sid,
            status = %record.status,
            subscribers = self.bus.subscriber_count(),
            "Publishing call update"
        );
        self.bus.emit_lossy(CallSyncEvent::call_updated(record.clone()));
    }
}

/// Discards every update
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl RealtimeNotifier for NoopNotifier {
    fn publish_call_update(&self, _record: &CallRecord) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use callsync_common::time::now;
    use callsync_common::{CallStatus, SyncState};

    fn record() -> CallRecord {
        let ts = now();
        CallRecord {
            id: 1,
            call_sid: "CA1".into(),
            parent_call_sid: None,
            status: CallStatus::Ringing,
            is_final: false,
            finalized_at: None,
            sync_state: SyncState::Active,
            direction: "inbound".into(),
            from_number: None,
            to_number: None,
            duration_sec: 0,
            answered_at: None,
            started_at: None,
            ended_at: None,
            price: None,
            price_unit: None,
            last_event_time: ts,
            verified_at: None,
            timeline_id: None,
            version: 0,
            created_at: ts,
            updated_at: ts,
        }
    }

    #[tokio::test]
    async fn test_event_bus_notifier_emits_call_updated() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let notifier = EventBusNotifier::new(bus);

        notifier.publish_call_update(&record());

        match rx.recv().await.unwrap() {
            CallSyncEvent::CallUpdated { record, .. } => assert_eq!(record.call_sid, "CA1"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let notifier = EventBusNotifier::new(EventBus::new(8));
        notifier.publish_call_update(&record());
    }
}
