//! Test Helper Utilities
//!
//! Shared fixtures for callsync-engine integration tests: in-memory engine
//! wiring, a scripted provider behind the `ProviderClient` seam, and HTTP
//! request builders.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::Request;
use callsync_common::db::init_memory_database;
use callsync_common::events::EventBus;
use callsync_common::signature::{compute_signature, SIGNATURE_HEADER};
use chrono::{DateTime, Duration, DurationRound, Utc};
use serde_json::Value;
use sqlx::SqlitePool;

use callsync_engine::config::ReconcileConfig;
use callsync_engine::inbox::InboxStore;
use callsync_engine::notify::{EventBusNotifier, RealtimeNotifier};
use callsync_engine::provider::{CallPage, ProviderCall, ProviderClient, ProviderError};
use callsync_engine::reconcile::Reconciler;
use callsync_engine::state_machine::StateMachine;
use callsync_engine::store::CallStore;
use callsync_engine::worker::{InboxWorker, WorkerSettings};
use callsync_engine::{AppState, WebhookSettings};

pub const PUBLIC_BASE_URL: &str = "https://calls.example.com";
pub const PROVIDER_NAME: &str = "telephony";

/// Fixed reference instant one hour in the past, truncated to milliseconds
///
/// Events stamped relative to it stay well inside the freeze cooldown, and
/// survive the millisecond round trip through SQLite unchanged.
pub fn base_time() -> DateTime<Utc> {
    static BASE: OnceLock<DateTime<Utc>> = OnceLock::new();
    *BASE.get_or_init(|| {
        (Utc::now() - Duration::hours(1))
            .duration_trunc(Duration::milliseconds(1))
            .unwrap()
    })
}

/// `base_time() + secs`
pub fn t(secs: i64) -> DateTime<Utc> {
    base_time() + Duration::seconds(secs)
}

/// Provider timestamp string for `t(secs)`
pub fn ts(secs: i64) -> String {
    t(secs).to_rfc3339()
}

/// Engine components wired against one in-memory database
pub struct TestEngine {
    pub db: SqlitePool,
    pub events: EventBus,
    pub inbox: InboxStore,
    pub store: CallStore,
    pub worker: Arc<InboxWorker>,
    pub provider: Arc<ScriptedProvider>,
    pub reconciler: Arc<Reconciler>,
    pub signing_token: Option<String>,
    pub admin_token: Option<String>,
}

impl TestEngine {
    pub async fn new() -> Self {
        Self::with_config(ReconcileConfig::default()).await
    }

    pub async fn with_config(config: ReconcileConfig) -> Self {
        let db = init_memory_database().await.expect("Should create test database");
        let events = EventBus::new(64);
        let notifier: Arc<dyn RealtimeNotifier> = Arc::new(EventBusNotifier::new(events.clone()));

        let inbox = InboxStore::new(db.clone(), 5);
        let store = CallStore::new(db.clone(), StateMachine::new(config.freeze_cooldown()));
        let worker = Arc::new(InboxWorker::new(
            inbox.clone(),
            store.clone(),
            Arc::clone(&notifier),
            events.clone(),
            WorkerSettings::default(),
        ));

        let provider = Arc::new(ScriptedProvider::default());
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            Arc::clone(&provider) as Arc<dyn ProviderClient>,
            notifier,
            events.clone(),
            config,
        ));

        Self {
            db,
            events,
            inbox,
            store,
            worker,
            provider,
            reconciler,
            signing_token: None,
            admin_token: None,
        }
    }

    pub fn with_signing_token(mut self, token: &str) -> Self {
        self.signing_token = Some(token.to_string());
        self
    }

    pub fn with_admin_token(mut self, token: &str) -> Self {
        self.admin_token = Some(token.to_string());
        self
    }

    pub fn app_state(&self) -> AppState {
        AppState::new(
            self.db.clone(),
            self.inbox.clone(),
            self.store.clone(),
            self.events.clone(),
            self.worker.wake_handle(),
            WebhookSettings {
                provider_name: PROVIDER_NAME.to_string(),
                public_base_url: PUBLIC_BASE_URL.to_string(),
                signing_token: self.signing_token.clone(),
            },
        )
        .with_reconciler(Arc::clone(&self.reconciler))
        .with_admin_token(self.admin_token.clone())
    }

    pub fn router(&self) -> axum::Router {
        callsync_engine::build_router(self.app_state())
    }

    /// Drain the inbox until a batch processes nothing
    pub async fn drain(&self) -> usize {
        let mut total = 0;
        loop {
            let processed = self.worker.run_once().await.expect("Worker batch should run");
            if processed == 0 {
                return total;
            }
            total += processed;
        }
    }
}

/// Provider double with per-call responses and a scripted page listing
#[derive(Default)]
pub struct ScriptedProvider {
    calls: Mutex<HashMap<String, ProviderCall>>,
    failing: Mutex<HashMap<String, u16>>,
    pages: Mutex<Vec<CallPage>>,
    /// Page returned once the scripted pages run out
    repeat_page: Mutex<Option<CallPage>>,
    fetches: AtomicUsize,
    list_requests: AtomicUsize,
}

impl ScriptedProvider {
    pub fn set_call(&self, call: ProviderCall) {
        self.calls.lock().unwrap().insert(call.sid.clone(), call);
    }

    /// Make `fetch_call(sid)` fail with the given HTTP status
    pub fn fail_call(&self, sid: &str, status: u16) {
        self.failing.lock().unwrap().insert(sid.to_string(), status);
    }

    pub fn push_page(&self, page: CallPage) {
        self.pages.lock().unwrap().push(page);
    }

    pub fn repeat_page(&self, page: CallPage) {
        *self.repeat_page.lock().unwrap() = Some(page);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn list_count(&self) -> usize {
        self.list_requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderClient for ScriptedProvider {
    async fn fetch_call(&self, call_sid: &str) -> Result<ProviderCall, ProviderError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = self.failing.lock().unwrap().get(call_sid) {
            return Err(ProviderError::Api(*status, "scripted failure".into()));
        }
        self.calls
            .lock()
            .unwrap()
            .get(call_sid)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(call_sid.to_string()))
    }

    async fn list_calls(
        &self,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
        _cursor: Option<&str>,
        _limit: usize,
    ) -> Result<CallPage, ProviderError> {
        self.list_requests.fetch_add(1, Ordering::SeqCst);
        let mut pages = self.pages.lock().unwrap();
        if !pages.is_empty() {
            return Ok(pages.remove(0));
        }
        Ok(self.repeat_page.lock().unwrap().clone().unwrap_or_default())
    }
}

/// Provider call resource with the fields reconciliation reads
pub fn provider_call(sid: &str, status: &str, updated_secs: i64) -> ProviderCall {
    ProviderCall {
        sid: sid.to_string(),
        status: status.to_string(),
        direction: Some("inbound".to_string()),
        from: Some("+15550001111".to_string()),
        to: Some("+15550002222".to_string()),
        date_updated: Some(ts(updated_secs)),
        ..Default::default()
    }
}

/// Full page of `count` completed calls with sids `{prefix}{n}`
pub fn call_page(prefix: &str, count: usize, has_more: bool, cursor: Option<&str>) -> CallPage {
    CallPage {
        calls: (0..count)
            .map(|n| provider_call(&format!("{}{}", prefix, n), "completed", 0))
            .collect(),
        has_more,
        next_cursor: cursor.map(str::to_string),
    }
}

/// Voice status callback fields
pub fn voice_fields(call_sid: &str, status: &str, secs: i64) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();
    fields.insert("CallSid".to_string(), call_sid.to_string());
    fields.insert("CallStatus".to_string(), status.to_string());
    fields.insert("From".to_string(), "+15550001111".to_string());
    fields.insert("To".to_string(), "+15550002222".to_string());
    fields.insert("Direction".to_string(), "inbound".to_string());
    fields.insert("Timestamp".to_string(), ts(secs));
    fields
}

/// `application/x-www-form-urlencoded` body
pub fn form_body(fields: &BTreeMap<String, String>) -> String {
    fields
        .iter()
        .map(|(k, v)| format!("{}={}", encode(k), encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// Webhook POST, signed when `token` is given
pub fn webhook_request(
    path: &str,
    fields: &BTreeMap<String, String>,
    token: Option<&str>,
    delivery_id: Option<&str>,
) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/x-www-form-urlencoded");

    if let Some(token) = token {
        let url = format!("{}{}", PUBLIC_BASE_URL, path);
        builder = builder.header(SIGNATURE_HEADER, compute_signature(token, &url, fields));
    }
    if let Some(id) = delivery_id {
        builder = builder.header("x-provider-delivery-id", id);
    }

    builder.body(Body::from(form_body(fields))).unwrap()
}

pub fn test_request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

pub fn json_request(method: &str, uri: &str, body: &Value, bearer: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(token) = bearer {
        builder = builder.header("authorization", format!("Bearer {}", token));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

/// Read a response body as JSON
pub async fn extract_json(body: Body) -> Value {
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .expect("Should read body");
    serde_json::from_slice(&bytes).expect("Should parse JSON")
}

pub async fn extract_text(body: Body) -> String {
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .expect("Should read body");
    String::from_utf8(bytes.to_vec()).expect("Body should be UTF-8")
}
