//! Provider webhook endpoints
//!
//! Validate the signature, validate the payload shape, land it in the inbox
//! and acknowledge. Processing happens later in the inbox worker, so the
//! response never depends on downstream outcome.

use axum::{
    extract::{OriginalUri, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Form, Router,
};
use callsync_common::signature::{validate_signature, SIGNATURE_HEADER};
use serde_json::{Map, Value};
use tracing::{debug, error, warn};

use crate::error::{ApiError, ApiResult};
use crate::inbox::NewInboxEvent;
use crate::normalize::{FieldMap, ProviderPayload, WebhookKind};
use crate::AppState;

/// Provider-assigned id of one delivery attempt
pub const DELIVERY_ID_HEADER: &str = "x-provider-delivery-id";

/// Request headers kept alongside the payload for inspection
const RECORDED_HEADERS: &[&str] = &[SIGNATURE_HEADER, DELIVERY_ID_HEADER, "user-agent"];

const EMPTY_RESPONSE_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?><Response/>"#;

fn kind_from_path(name: &str) -> Option<WebhookKind> {
    match name {
        "voice-status" => Some(WebhookKind::VoiceStatus),
        "recording-status" => Some(WebhookKind::RecordingStatus),
        "transcription-status" => Some(WebhookKind::TranscriptionStatus),
        "dial-action" => Some(WebhookKind::DialAction),
        "voice-inbound" => Some(WebhookKind::VoiceInbound),
        _ => None,
    }
}

/// POST /webhooks/:kind
pub async fn receive_webhook(
    State(state): State<AppState>,
    Path(name): Path<String>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    Form(fields): Form<FieldMap>,
) -> ApiResult<Response> {
    let kind = kind_from_path(&name)
        .ok_or_else(|| ApiError::NotFound(format!("Unknown webhook: {}", name)))?;

    if let Some(token) = state.webhooks.signing_token.as_deref() {
        let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or(uri.path());
        let url = format!("{}{}", state.webhooks.public_base_url.trim_end_matches('/'), path);
        let provided = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());

        if let Err(e) = validate_signature(token, &url, &fields, provided) {
            warn!(webhook = %name, error = %e, "Rejected webhook signature");
            return Err(ApiError::Unauthorized(e.to_string()));
        }
    }

    let payload = ProviderPayload::from_form(kind, fields)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let delivery_id = headers.get(DELIVERY_ID_HEADER).and_then(|v| v.to_str().ok());
    let event = NewInboxEvent::from_payload(
        &state.webhooks.provider_name,
        kind.event_prefix(),
        &payload,
        delivery_id,
        recorded_headers(&headers),
    )
    .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let outcome = state.inbox.ingest(&event).await.map_err(|e| {
        error!(event_key = %event.event_key, error = %e, "Failed to store webhook");
        ApiError::Internal("failed to store event".into())
    })?;

    if outcome.accepted {
        state.worker_wake.notify_one();
    } else {
        debug!(event_key = %event.event_key, "Duplicate webhook delivery");
    }

    Ok(acknowledge(kind))
}

fn recorded_headers(headers: &HeaderMap) -> Value {
    let map: Map<String, Value> = RECORDED_HEADERS
        .iter()
        .filter_map(|name| {
            headers
                .get(*name)
                .and_then(|v| v.to_str().ok())
                .map(|v| (name.to_string(), Value::String(v.to_string())))
        })
        .collect();
    Value::Object(map)
}

/// Voice callbacks that drive call flow expect an (empty) instruction document
fn acknowledge(kind: WebhookKind) -> Response {
    match kind {
        WebhookKind::DialAction | WebhookKind::VoiceInbound => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/xml")],
            EMPTY_RESPONSE_XML,
        )
            .into_response(),
        _ => StatusCode::OK.into_response(),
    }
}

/// Build webhook routes
pub fn webhook_routes() -> Router<AppState> {
    Router::new().route("/webhooks/:kind", post(receive_webhook))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_webhook_paths() {
        assert_eq!(kind_from_path("voice-status"), Some(WebhookKind::VoiceStatus));
        assert_eq!(kind_from_path("dial-action"), Some(WebhookKind::DialAction));
        assert_eq!(kind_from_path("sms-status"), None);
    }

    #[test]
    fn test_recorded_headers_filters() {
        let mut headers = HeaderMap::new();
        headers.insert(DELIVERY_ID_HEADER, "d-1".parse().unwrap());
        headers.insert("cookie", "secret".parse().unwrap());

        let recorded = recorded_headers(&headers);
        assert_eq!(recorded[DELIVERY_ID_HEADER], "d-1");
        assert!(recorded.get("cookie").is_none());
    }
}
