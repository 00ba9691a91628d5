//! Integration tests for the webhook inbox and the inbox worker
//!
//! Tests cover:
//! - Webhook acknowledgement, signature validation and payload validation
//! - Idempotent ingestion of duplicate deliveries
//! - Strict state-machine enforcement on the worker path
//! - Ordering guard against out-of-order delivery
//! - Dial-action child legs and recording satellites

mod helpers;

use axum::http::StatusCode;
use callsync_common::events::CallSyncEvent;
use callsync_common::{CallStatus, InboxStatus, SatelliteStatus};
use tower::util::ServiceExt; // for `oneshot` method

use helpers::*;

// =============================================================================
// Webhook boundary
// =============================================================================

#[tokio::test]
async fn test_voice_status_acknowledged_with_empty_body() {
    let engine = TestEngine::new().await;

    let request = webhook_request(
        "/webhooks/voice-status",
        &voice_fields("CA100", "ringing", 0),
        None,
        Some("d-1"),
    );
    let response = engine.router().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(extract_text(response.into_body()).await.is_empty());

    let row = engine
        .inbox
        .get("telephony:call.ringing:CA100:d-1")
        .await
        .unwrap()
        .expect("Webhook should land in the inbox");
    assert_eq!(row.status, InboxStatus::Pending);
    assert_eq!(row.source, "voice");
    assert_eq!(row.call_sid.as_deref(), Some("CA100"));
    assert_eq!(row.payload["CallStatus"], "ringing");
    assert_eq!(row.headers["x-provider-delivery-id"], "d-1");
}

#[tokio::test]
async fn test_dial_action_acknowledged_with_xml() {
    let engine = TestEngine::new().await;

    let mut fields = voice_fields("CA200", "in-progress", 0);
    fields.insert("DialCallSid".into(), "CA200c".into());
    fields.insert("DialCallStatus".into(), "completed".into());
    fields.insert("DialCallDuration".into(), "42".into());

    let response = engine
        .router()
        .oneshot(webhook_request("/webhooks/dial-action", &fields, None, None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/xml"
    );
    let body = extract_text(response.into_body()).await;
    assert!(body.contains("<Response/>"));
}

#[tokio::test]
async fn test_unknown_webhook_path_is_not_found() {
    let engine = TestEngine::new().await;

    let response = engine
        .router()
        .oneshot(webhook_request(
            "/webhooks/sms-status",
            &voice_fields("CA1", "ringing", 0),
            None,
            None,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_missing_call_sid_rejected() {
    let engine = TestEngine::new().await;

    let mut fields = voice_fields("CA1", "ringing", 0);
    fields.remove("CallSid");

    let response = engine
        .router()
        .oneshot(webhook_request("/webhooks/voice-status", &fields, None, None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = extract_json(response.into_body()).await;
    assert_eq!(body["error"]["code"], "BAD_REQUEST");
    assert_eq!(engine.inbox.stats().await.unwrap().pending, 0);
}

#[tokio::test]
async fn test_signed_webhook_accepted() {
    let engine = TestEngine::new().await.with_signing_token("secret");

    let response = engine
        .router()
        .oneshot(webhook_request(
            "/webhooks/voice-status",
            &voice_fields("CA300", "ringing", 0),
            Some("secret"),
            None,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(engine.inbox.count_for_call("CA300").await.unwrap(), 1);
}

#[tokio::test]
async fn test_bad_signature_rejected() {
    let engine = TestEngine::new().await.with_signing_token("secret");

    let wrong = engine
        .router()
        .oneshot(webhook_request(
            "/webhooks/voice-status",
            &voice_fields("CA301", "ringing", 0),
            Some("other-secret"),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

    let missing = engine
        .router()
        .oneshot(webhook_request(
            "/webhooks/voice-status",
            &voice_fields("CA301", "ringing", 0),
            None,
            None,
        ))
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

    assert_eq!(engine.inbox.count_for_call("CA301").await.unwrap(), 0);
}

#[tokio::test]
async fn test_signature_covers_payload() {
    let engine = TestEngine::new().await.with_signing_token("secret");

    let signed = voice_fields("CA302", "ringing", 0);
    let mut request = webhook_request("/webhooks/voice-status", &signed, Some("secret"), None);

    let mut tampered = signed.clone();
    tampered.insert("CallStatus".into(), "completed".into());
    *request.body_mut() = axum::body::Body::from(form_body(&tampered));

    let response = engine.router().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

// =============================================================================
// Idempotency
// =============================================================================

#[tokio::test]
async fn test_duplicate_delivery_stored_once() {
    let engine = TestEngine::new().await;
    let fields = voice_fields("CA1", "ringing", 0);

    for _ in 0..2 {
        let response = engine
            .router()
            .oneshot(webhook_request("/webhooks/voice-status", &fields, None, Some("k1")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    assert_eq!(engine.inbox.count_for_call("CA1").await.unwrap(), 1);

    engine.drain().await;
    let record = engine.store.get("CA1").await.unwrap().unwrap();
    assert_eq!(record.status, CallStatus::Ringing);
    assert_eq!(record.version, 0);
}

#[tokio::test]
async fn test_identical_payload_without_delivery_id_stored_once() {
    let engine = TestEngine::new().await;
    let fields = voice_fields("CA2", "ringing", 0);

    for _ in 0..2 {
        engine
            .router()
            .oneshot(webhook_request("/webhooks/voice-status", &fields, None, None))
            .await
            .unwrap();
    }

    assert_eq!(engine.inbox.count_for_call("CA2").await.unwrap(), 1);
}

#[tokio::test]
async fn test_replay_after_processing_is_not_reapplied() {
    let engine = TestEngine::new().await;
    let fields = voice_fields("CA3", "ringing", 0);

    engine
        .router()
        .oneshot(webhook_request("/webhooks/voice-status", &fields, None, Some("d")))
        .await
        .unwrap();
    assert_eq!(engine.drain().await, 1);

    engine
        .router()
        .oneshot(webhook_request("/webhooks/voice-status", &fields, None, Some("d")))
        .await
        .unwrap();
    assert_eq!(engine.drain().await, 0);

    let stats = engine.inbox.stats().await.unwrap();
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.pending, 0);
}

// =============================================================================
// Worker: state machine and ordering
// =============================================================================

async fn post_status(engine: &TestEngine, call_sid: &str, status: &str, secs: i64) {
    let response = engine
        .router()
        .oneshot(webhook_request(
            "/webhooks/voice-status",
            &voice_fields(call_sid, status, secs),
            None,
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_strict_regression_rejected() {
    let engine = TestEngine::new().await;

    for (secs, status) in ["queued", "ringing", "in-progress", "completed"].iter().enumerate() {
        post_status(&engine, "CA2", status, secs as i64).await;
    }
    engine.drain().await;
    assert_eq!(
        engine.store.get("CA2").await.unwrap().unwrap().status,
        CallStatus::Completed
    );

    post_status(&engine, "CA2", "ringing", 10).await;
    engine.drain().await;

    let record = engine.store.get("CA2").await.unwrap().unwrap();
    assert_eq!(record.status, CallStatus::Completed);
    assert!(record.is_final);

    let failed = engine.inbox.list_failed(10).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].event_type, "call.ringing");
    assert!(!failed[0].retryable);
    assert!(failed[0]
        .error_text
        .as_deref()
        .unwrap_or_default()
        .contains("Invalid transition"));
}

#[tokio::test]
async fn test_out_of_order_delivery_keeps_newest_state() {
    let engine = TestEngine::new().await;

    post_status(&engine, "CA10", "in-progress", 20).await;
    engine.drain().await;

    // Ringing happened earlier but arrives later
    post_status(&engine, "CA10", "ringing", 10).await;
    engine.drain().await;

    let record = engine.store.get("CA10").await.unwrap().unwrap();
    assert_eq!(record.status, CallStatus::InProgress);
    assert_eq!(record.last_event_time, t(20));

    let stats = engine.inbox.stats().await.unwrap();
    assert_eq!(stats.processed, 2);
    assert_eq!(stats.failed, 0);
}

#[tokio::test]
async fn test_batch_applies_events_of_one_call_in_order() {
    let engine = TestEngine::new().await;

    post_status(&engine, "CA11", "ringing", 0).await;
    post_status(&engine, "CA11", "in-progress", 5).await;
    post_status(&engine, "CA12", "ringing", 0).await;
    post_status(&engine, "CA11", "completed", 65).await;

    assert_eq!(engine.worker.run_once().await.unwrap(), 4);

    let first = engine.store.get("CA11").await.unwrap().unwrap();
    assert_eq!(first.status, CallStatus::Completed);
    assert_eq!(first.finalized_at, Some(t(65)));
    assert_eq!(first.answered_at, Some(t(5)));

    let second = engine.store.get("CA12").await.unwrap().unwrap();
    assert_eq!(second.status, CallStatus::Ringing);
}

#[tokio::test]
async fn test_applied_event_published() {
    let engine = TestEngine::new().await;
    let mut rx = engine.events.subscribe();

    post_status(&engine, "CA13", "ringing", 0).await;
    engine.drain().await;

    match rx.try_recv().expect("Should publish a call update") {
        CallSyncEvent::CallUpdated { record, .. } => {
            assert_eq!(record.call_sid, "CA13");
            assert_eq!(record.status, CallStatus::Ringing);
        }
        other => panic!("Unexpected event: {:?}", other),
    }
}

// =============================================================================
// Dial-action and satellites
// =============================================================================

#[tokio::test]
async fn test_dial_action_creates_child_leg() {
    let engine = TestEngine::new().await;

    post_status(&engine, "CA20", "in-progress", 0).await;

    let mut fields = voice_fields("CA20", "in-progress", 30);
    fields.insert("DialCallSid".into(), "CA20c".into());
    fields.insert("DialCallStatus".into(), "completed".into());
    fields.insert("DialCallDuration".into(), "25".into());
    engine
        .router()
        .oneshot(webhook_request("/webhooks/dial-action", &fields, None, None))
        .await
        .unwrap();

    engine.drain().await;

    let child = engine.store.get("CA20c").await.unwrap().unwrap();
    assert_eq!(child.parent_call_sid.as_deref(), Some("CA20"));
    assert_eq!(child.status, CallStatus::Completed);
    assert_eq!(child.duration_sec, 25);
    assert_eq!(child.direction, "outbound-dial");
}

#[tokio::test]
async fn test_recording_before_call_retries() {
    let engine = TestEngine::new().await;

    let mut fields = std::collections::BTreeMap::new();
    fields.insert("CallSid".to_string(), "CA30".to_string());
    fields.insert("RecordingSid".to_string(), "RE30".to_string());
    fields.insert("RecordingStatus".to_string(), "completed".to_string());
    fields.insert("RecordingUrl".to_string(), "https://media.example.com/RE30".to_string());
    fields.insert("RecordingDuration".to_string(), "61".to_string());

    engine
        .router()
        .oneshot(webhook_request("/webhooks/recording-status", &fields, None, None))
        .await
        .unwrap();
    engine.drain().await;

    let failed = engine.inbox.list_failed(10).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].retryable);
    assert_eq!(engine.inbox.stats().await.unwrap().failed_retryable, 1);

    // Call arrives; the retry picks the recording up
    post_status(&engine, "CA30", "completed", 60).await;
    engine.drain().await;

    let recordings = engine.store.recordings_for(&["CA30"]).await.unwrap();
    assert_eq!(recordings.len(), 1);
    assert_eq!(recordings[0].recording_sid, "RE30");
    assert_eq!(recordings[0].status, SatelliteStatus::Completed);
    assert_eq!(recordings[0].duration_sec, Some(61));
    assert_eq!(engine.inbox.stats().await.unwrap().failed, 0);
}
