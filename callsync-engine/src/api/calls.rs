//! Read routes for collaborators; every response carries merged entries

use axum::{
    extract::{Path, State},
    routing::{get, put},
    Json, Router,
};
use callsync_common::db::CallRecord;
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};
use crate::merge::MergedCall;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct CallListResponse {
    pub calls: Vec<MergedCall>,
    pub count: usize,
}

impl From<Vec<MergedCall>> for CallListResponse {
    fn from(calls: Vec<MergedCall>) -> Self {
        Self {
            count: calls.len(),
            calls,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LinkTimelineRequest {
    pub timeline_id: String,
}

/// GET /calls/active
pub async fn get_active_calls(State(state): State<AppState>) -> ApiResult<Json<CallListResponse>> {
    let calls = state.queries.get_active_calls().await?;
    Ok(Json(calls.into()))
}

/// GET /calls/:call_sid
pub async fn get_call(
    State(state): State<AppState>,
    Path(call_sid): Path<String>,
) -> ApiResult<Json<MergedCall>> {
    state
        .queries
        .get_call_by_sid(&call_sid)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Call not found: {}", call_sid)))
}

/// GET /timelines/:timeline_id/calls
pub async fn get_timeline_calls(
    State(state): State<AppState>,
    Path(timeline_id): Path<String>,
) -> ApiResult<Json<CallListResponse>> {
    let calls = state.queries.get_calls_by_timeline(&timeline_id).await?;
    Ok(Json(calls.into()))
}

/// PUT /calls/:call_sid/timeline
///
/// Weak link only; the timeline itself belongs to the caller.
pub async fn link_timeline(
    State(state): State<AppState>,
    Path(call_sid): Path<String>,
    Json(request): Json<LinkTimelineRequest>,
) -> ApiResult<Json<CallRecord>> {
    let timeline_id = request.timeline_id.trim();
    if timeline_id.is_empty() {
        return Err(ApiError::BadRequest("timeline_id must not be empty".into()));
    }

    state
        .store
        .link_timeline(&call_sid, timeline_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Call not found: {}", call_sid)))
}

/// Build call read routes
pub fn call_routes() -> Router<AppState> {
    Router::new()
        .route("/calls/active", get(get_active_calls))
        .route("/calls/:call_sid", get(get_call))
        .route("/calls/:call_sid/timeline", put(link_timeline))
        .route("/timelines/:timeline_id/calls", get(get_timeline_calls))
}
