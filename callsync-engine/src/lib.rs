//! callsync-engine library
//!
//! Call-event ingestion and reconciliation: webhook inbox, normalizer, state
//! machine, inbox worker, tiered reconciliation and the merged read interface.
//! Components are plain structs wired together in `main` (or in tests); there
//! is no ambient global state.

use axum::Router;
use callsync_common::events::EventBus;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::Notify;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub mod api;
pub mod config;
pub mod error;
pub mod inbox;
pub mod merge;
pub mod normalize;
pub mod notify;
pub mod provider;
pub mod read;
pub mod reconcile;
pub mod state_machine;
pub mod store;
pub mod worker;

pub use crate::error::{ApiError, ApiResult, Error, Result};

use crate::inbox::InboxStore;
use crate::read::CallQueries;
use crate::reconcile::Reconciler;
use crate::store::CallStore;

/// Webhook boundary settings
#[derive(Debug, Clone)]
pub struct WebhookSettings {
    /// Prefix of every inbox event key
    pub provider_name: String,
    /// Base URL the provider signs against
    pub public_base_url: String,
    /// `None` disables signature validation
    pub signing_token: Option<String>,
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub inbox: InboxStore,
    pub store: CallStore,
    pub queries: CallQueries,
    /// Absent when provider credentials are not configured
    pub reconciler: Option<Arc<Reconciler>>,
    /// Event bus for SSE broadcasting
    pub event_bus: EventBus,
    /// Wakes the inbox worker after an accepted ingest
    pub worker_wake: Arc<Notify>,
    pub webhooks: WebhookSettings,
    /// Bearer token for `/admin`; `None` leaves admin routes open
    pub admin_token: Option<String>,
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        db: SqlitePool,
        inbox: InboxStore,
        store: CallStore,
        event_bus: EventBus,
        worker_wake: Arc<Notify>,
        webhooks: WebhookSettings,
    ) -> Self {
        Self {
            db,
            inbox,
            queries: CallQueries::new(store.clone()),
            store,
            reconciler: None,
            event_bus,
            worker_wake,
            webhooks,
            admin_token: None,
            startup_time: Utc::now(),
        }
    }

    pub fn with_reconciler(mut self, reconciler: Arc<Reconciler>) -> Self {
        self.reconciler = Some(reconciler);
        self
    }

    pub fn with_admin_token(mut self, token: Option<String>) -> Self {
        self.admin_token = token.filter(|t| !t.is_empty());
        self
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::middleware;
    use axum::routing::get;

    let admin = api::admin_routes().layer(middleware::from_fn_with_state(
        state.clone(),
        api::admin_auth_middleware,
    ));

    Router::new()
        .merge(api::webhook_routes())
        .merge(api::call_routes())
        .merge(admin)
        .merge(api::health_routes())
        .route("/events", get(api::event_stream))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
