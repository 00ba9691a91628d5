//! Inbox worker
//!
//! Drains the inbox asynchronously: classify, normalize, apply under the
//! ordering guard, then mark the row. Different calls are processed in
//! parallel up to the configured concurrency; events for one call are applied
//! one after another in arrival order.

use callsync_common::db::InboxEvent;
use callsync_common::events::{CallSyncEvent, EventBus};
use callsync_common::EventSource;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::inbox::InboxStore;
use crate::normalize::{normalize, CallEventKind, ProviderPayload};
use crate::notify::RealtimeNotifier;
use crate::state_machine::TransitionMode;
use crate::store::{ApplyOutcome, CallStore};

/// Result of processing one inbox row
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessResult {
    pub success: bool,
    pub call_record_id: Option<i64>,
}

/// Worker tuning
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub batch_size: i64,
    pub poll_interval: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            batch_size: 100,
            poll_interval: Duration::from_secs(2),
        }
    }
}

pub struct InboxWorker {
    inbox: InboxStore,
    store: CallStore,
    notifier: Arc<dyn RealtimeNotifier>,
    events: EventBus,
    settings: WorkerSettings,
    wake: Arc<Notify>,
}

impl InboxWorker {
    pub fn new(
        inbox: InboxStore,
        store: CallStore,
        notifier: Arc<dyn RealtimeNotifier>,
        events: EventBus,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            inbox,
            store,
            notifier,
            events,
            settings,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Handle used by ingest paths to start processing without waiting for the poll
    pub fn wake_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    /// Process one inbox row and record the outcome on it
    pub async fn process_event(&self, event: &InboxEvent) -> ProcessResult {
        match self.handle(event).await {
            Ok(record_id) => {
                if let Err(e) = self.inbox.mark_processed(event.id).await {
                    error!(event_key = %event.event_key, error = %e, "Failed to mark inbox event processed");
                    return ProcessResult {
                        success: false,
                        call_record_id: record_id,
                    };
                }
                ProcessResult {
                    success: true,
                    call_record_id: record_id,
                }
            }
            Err(e) => {
                let retryable = e.is_retryable();
                if matches!(e, Error::UnknownSource(_)) {
                    error!(event_key = %event.event_key, source = %event.source, "Unknown inbox event source");
                } else {
                    warn!(
                        event_key = %event.event_key,
                        attempts = event.attempts + 1,
                        retryable,
                        error = %e,
                        "Inbox event failed"
                    );
                }

                if let Err(mark_err) = self.inbox.mark_failed(event.id, &e.to_string(), retryable).await {
                    error!(event_key = %event.event_key, error = %mark_err, "Failed to mark inbox event failed");
                }

                self.events.emit_lossy(CallSyncEvent::InboxEventFailed {
                    event_id: Uuid::new_v4(),
                    event_key: event.event_key.clone(),
                    error: e.to_string(),
                    retryable,
                    timestamp: chrono::Utc::now(),
                });

                ProcessResult {
                    success: false,
                    call_record_id: None,
                }
            }
        }
    }

    async fn handle(&self, event: &InboxEvent) -> Result<Option<i64>> {
        let source: EventSource = event
            .source
            .parse()
            .map_err(|_| Error::UnknownSource(event.source.clone()))?;

        let payload = ProviderPayload::from_inbox(source, &event.event_type, &event.payload)?;
        let call_event = normalize(&payload)?;
        let at = call_event.event_time.unwrap_or(event.received_at);

        match call_event.kind {
            CallEventKind::CallStatus => {
                let outcome = self
                    .store
                    .apply_event(&call_event, TransitionMode::Strict, at)
                    .await?;

                debug!(
                    event_key = %event.event_key,
                    call_sid = %call_event.call_sid,
                    outcome = outcome.label(),
                    "Inbox event applied"
                );

                if outcome.changed() {
                    self.notifier.publish_call_update(outcome.record());
                }
                if let ApplyOutcome::Stale(_) = outcome {
                    info!(event_key = %event.event_key, "Out-of-order event absorbed by ordering guard");
                }
                Ok(Some(outcome.record().id))
            }
            CallEventKind::Recording | CallEventKind::Transcription => {
                let call = self.store.apply_satellite(&call_event).await?;
                Ok(Some(call.id))
            }
            CallEventKind::Informational => {
                debug!(event_key = %event.event_key, "Informational event, nothing to apply");
                Ok(None)
            }
        }
    }

    /// Process one batch; returns the number of rows that succeeded
    pub async fn run_once(&self) -> Result<usize> {
        let batch = self.inbox.next_batch(self.settings.batch_size).await?;
        if batch.is_empty() {
            return Ok(0);
        }

        let total = batch.len();
        let groups = group_by_call(batch);

        let succeeded: usize = stream::iter(groups)
            .map(|group| async move {
                let mut ok = 0;
                for event in &group {
                    if self.process_event(event).await.success {
                        ok += 1;
                    }
                }
                ok
            })
            .buffer_unordered(self.settings.concurrency.max(1))
            .fold(0, |acc, ok| async move { acc + ok })
            .await;

        debug!(total, succeeded, "Inbox batch processed");
        Ok(succeeded)
    }

    /// Worker loop; exits when `shutdown` flips to true
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            concurrency = self.settings.concurrency,
            poll_ms = self.settings.poll_interval.as_millis() as u64,
            "Inbox worker started"
        );

        loop {
            let succeeded = match self.run_once().await {
                Ok(succeeded) => succeeded,
                Err(e) => {
                    error!(error = %e, "Inbox worker batch failed");
                    0
                }
            };

            // A full batch of successes means more rows are probably waiting;
            // failures wait for the next tick instead of spinning
            if succeeded as i64 >= self.settings.batch_size && !*shutdown.borrow() {
                continue;
            }

            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                _ = shutdown.changed() => {}
            }

            if *shutdown.borrow() {
                info!("Inbox worker stopping");
                break;
            }
        }
    }
}

/// Split a batch into per-call groups, keeping arrival order within and across groups
fn group_by_call(batch: Vec<InboxEvent>) -> Vec<Vec<InboxEvent>> {
    let mut groups: Vec<(Option<String>, Vec<InboxEvent>)> = Vec::new();
    for event in batch {
        match groups.iter_mut().find(|(sid, _)| *sid == event.call_sid) {
            Some((_, group)) => group.push(event),
            None => groups.push((event.call_sid.clone(), vec![event])),
        }
    }
    groups.into_iter().map(|(_, group)| group).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inbox::NewInboxEvent;
    use crate::normalize::{FieldMap, WebhookKind};
    use crate::notify::NoopNotifier;
    use crate::state_machine::StateMachine;
    use callsync_common::db::init_memory_database;
    use callsync_common::{CallStatus, InboxStatus};
    use serde_json::Value;

    async fn setup() -> (InboxWorker, InboxStore, CallStore) {
        let pool = init_memory_database().await.unwrap();
        let inbox = InboxStore::new(pool.clone(), 5);
        let store = CallStore::new(pool, StateMachine::default());
        let worker = InboxWorker::new(
            inbox.clone(),
            store.clone(),
            Arc::new(NoopNotifier),
            EventBus::new(16),
            WorkerSettings::default(),
        );
        (worker, inbox, store)
    }

    async fn ingest(inbox: &InboxStore, pairs: &[(&str, &str)], delivery: &str) -> String {
        let fields: FieldMap = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let payload = ProviderPayload::from_form(WebhookKind::VoiceStatus, fields).unwrap();
        let event =
            NewInboxEvent::from_payload("telephony", "call", &payload, Some(delivery), Value::Null)
                .unwrap();
        inbox.ingest(&event).await.unwrap();
        event.event_key
    }

    #[tokio::test]
    async fn test_run_once_applies_and_marks_processed() {
        let (worker, inbox, store) = setup().await;
        let key = ingest(&inbox, &[("CallSid", "CA1"), ("CallStatus", "ringing")], "d1").await;

        assert_eq!(worker.run_once().await.unwrap(), 1);
        assert_eq!(worker.run_once().await.unwrap(), 0);

        let row = inbox.get(&key).await.unwrap().unwrap();
        assert_eq!(row.status, InboxStatus::Processed);
        assert_eq!(store.get("CA1").await.unwrap().unwrap().status, CallStatus::Ringing);
    }

    #[tokio::test]
    async fn test_unknown_source_is_fatal() {
        let (worker, inbox, _) = setup().await;
        let key = ingest(&inbox, &[("CallSid", "CA1"), ("CallStatus", "ringing")], "d1").await;
        sqlx::query("UPDATE inbox_events SET source = 'sms' WHERE event_key = ?")
            .bind(&key)
            .execute(worker.store.pool())
            .await
            .unwrap();

        let row = inbox.get(&key).await.unwrap().unwrap();
        let result = worker.process_event(&row).await;
        assert!(!result.success);

        let row = inbox.get(&key).await.unwrap().unwrap();
        assert_eq!(row.status, InboxStatus::Failed);
        assert!(!row.retryable);
        assert_eq!(row.attempts, 1);
        assert!(row.error_text.unwrap().contains("Unknown event source"));
    }

    #[tokio::test]
    async fn test_same_call_events_apply_in_order() {
        let (worker, inbox, store) = setup().await;
        ingest(&inbox, &[("CallSid", "CA1"), ("CallStatus", "ringing")], "d1").await;
        ingest(&inbox, &[("CallSid", "CA1"), ("CallStatus", "in-progress")], "d2").await;
        ingest(&inbox, &[("CallSid", "CA1"), ("CallStatus", "completed")], "d3").await;
        ingest(&inbox, &[("CallSid", "CA2"), ("CallStatus", "busy")], "d4").await;

        assert_eq!(worker.run_once().await.unwrap(), 4);

        assert_eq!(store.get("CA1").await.unwrap().unwrap().status, CallStatus::Completed);
        assert_eq!(store.get("CA2").await.unwrap().unwrap().status, CallStatus::Busy);
        assert_eq!(inbox.stats().await.unwrap().processed, 4);
    }

    #[test]
    fn test_group_by_call_keeps_order() {
        let event = |id: i64, sid: &str| InboxEvent {
            id,
            event_key: format!("k{}", id),
            source: "voice".into(),
            event_type: "call.ringing".into(),
            call_sid: Some(sid.into()),
            payload: Value::Null,
            headers: Value::Null,
            status: InboxStatus::Pending,
            attempts: 0,
            retryable: true,
            error_text: None,
            received_at: chrono::Utc::now(),
            processed_at: None,
        };

        let groups = group_by_call(vec![event(1, "A"), event(2, "B"), event(3, "A")]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].iter().map(|e| e.id).collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(groups[1][0].id, 2);
    }
}
