//! Operator routes: manual ingest, inbox inspection and retry, on-demand reconciliation

use axum::{
    extract::{Path, Query, Request, State},
    http::header,
    middleware::Next,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use callsync_common::db::InboxEvent;
use callsync_common::signature::tokens_match;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::{ApiError, ApiResult};
use crate::inbox::{InboxStats, NewInboxEvent};
use crate::normalize::{ManualCallEvent, ProviderPayload};
use crate::reconcile::{ReconcileReport, Tier};
use crate::AppState;

/// Bearer-token check for `/admin` routes
pub async fn admin_auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Ok(next.run(request).await);
    };

    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);

    if !provided.is_some_and(|token| tokens_match(expected, token)) {
        warn!(path = %request.uri().path(), "Rejected admin request");
        return Err(ApiError::Unauthorized("invalid admin token".into()));
    }

    Ok(next.run(request).await)
}

#[derive(Debug, Serialize)]
pub struct ManualIngestResponse {
    pub event_key: String,
    pub accepted: bool,
}

/// POST /admin/ingest
pub async fn manual_ingest(
    State(state): State<AppState>,
    Json(event): Json<ManualCallEvent>,
) -> ApiResult<Json<ManualIngestResponse>> {
    let delivery_id = event.delivery_id.clone();
    let payload =
        ProviderPayload::from_manual(event).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let inbox_event = NewInboxEvent::from_payload(
        &state.webhooks.provider_name,
        "manual",
        &payload,
        delivery_id.as_deref(),
        Value::Object(Default::default()),
    )
    .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let outcome = state.inbox.ingest(&inbox_event).await?;
    if outcome.accepted {
        info!(event_key = %inbox_event.event_key, "Manual event ingested");
        state.worker_wake.notify_one();
    }

    Ok(Json(ManualIngestResponse {
        event_key: inbox_event.event_key,
        accepted: outcome.accepted,
    }))
}

/// GET /admin/inbox/stats
pub async fn inbox_stats(State(state): State<AppState>) -> ApiResult<Json<InboxStats>> {
    Ok(Json(state.inbox.stats().await?))
}

#[derive(Debug, Deserialize)]
pub struct FailedQuery {
    #[serde(default = "default_failed_limit")]
    pub limit: i64,
}

fn default_failed_limit() -> i64 {
    50
}

/// GET /admin/inbox/failed
pub async fn failed_events(
    State(state): State<AppState>,
    Query(query): Query<FailedQuery>,
) -> ApiResult<Json<Vec<InboxEvent>>> {
    let limit = query.limit.clamp(1, 500);
    Ok(Json(state.inbox.list_failed(limit).await?))
}

/// POST /admin/inbox/:event_key/retry
pub async fn retry_event(
    State(state): State<AppState>,
    Path(event_key): Path<String>,
) -> ApiResult<Json<Value>> {
    if !state.inbox.reset_for_retry(&event_key).await? {
        return Err(ApiError::NotFound(format!(
            "No failed inbox event with key {}",
            event_key
        )));
    }

    state.worker_wake.notify_one();
    Ok(Json(json!({ "event_key": event_key, "status": "pending" })))
}

/// POST /admin/reconcile/:tier
pub async fn run_reconcile(
    State(state): State<AppState>,
    Path(tier): Path<String>,
) -> ApiResult<Json<ReconcileReport>> {
    let tier: Tier = tier.parse().map_err(|e: crate::Error| ApiError::BadRequest(e.to_string()))?;
    let reconciler = state
        .reconciler
        .as_ref()
        .ok_or_else(|| ApiError::BadRequest("reconciliation is not configured".into()))?;

    info!(tier = %tier, "Manual reconcile run requested");
    Ok(Json(reconciler.run(tier).await?))
}

/// Build admin routes (auth layer applied by the caller)
pub fn admin_routes() -> Router<AppState> {
    Router::new()
        .route("/admin/ingest", post(manual_ingest))
        .route("/admin/inbox/stats", get(inbox_stats))
        .route("/admin/inbox/failed", get(failed_events))
        .route("/admin/inbox/:event_key/retry", post(retry_event))
        .route("/admin/reconcile/:tier", post(run_reconcile))
}
