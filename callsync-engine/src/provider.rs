//! Telephony provider REST client
//!
//! Authoritative call reads used by reconciliation. The [`ProviderClient`]
//! trait is the seam tests script against; [`HttpProviderClient`] talks to the
//! real API with basic auth, a request timeout and paced request starts.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::ProviderConfig;

const USER_AGENT: &str = concat!("callsync-engine/", env!("CARGO_PKG_VERSION"));

/// Provider client errors
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("API error {0}: {1}")]
    Api(u16, String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Call not found: {0}")]
    NotFound(String),

    #[error("Provider credentials not configured")]
    NotConfigured,
}

impl ProviderError {
    /// Transient failures worth another attempt on the next pass
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Network(_) | ProviderError::Timeout => true,
            ProviderError::Api(status, _) => *status == 429 || *status >= 500,
            ProviderError::Parse(_) | ProviderError::NotFound(_) | ProviderError::NotConfigured => {
                false
            }
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout
        } else if e.is_decode() {
            ProviderError::Parse(e.to_string())
        } else {
            ProviderError::Network(e.to_string())
        }
    }
}

/// Call resource as returned by the provider
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ProviderCall {
    pub sid: String,
    #[serde(default)]
    pub parent_call_sid: Option<String>,
    pub status: String,
    #[serde(default)]
    pub direction: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    /// Seconds; the API sends either a string or a number
    #[serde(default)]
    pub duration: Option<Value>,
    #[serde(default)]
    pub price: Option<Value>,
    #[serde(default)]
    pub price_unit: Option<String>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub answered_at: Option<String>,
    #[serde(default)]
    pub date_updated: Option<String>,
    /// Everything else the provider sends
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One page of a call listing
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CallPage {
    #[serde(default)]
    pub calls: Vec<ProviderCall>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// Read access to the provider's call records
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Fetch one call by identifier
    async fn fetch_call(&self, call_sid: &str) -> Result<ProviderCall, ProviderError>;

    /// List calls started within `[start, end)`, one page at a time
    async fn list_calls(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<CallPage, ProviderError>;
}

/// Hands out request start slots at least `spacing` apart
///
/// Reconciliation fetches run concurrently, so each caller reserves its slot
/// under the lock and sleeps outside it. Zero spacing disables pacing.
struct RequestPacer {
    next_slot: std::sync::Mutex<Instant>,
    spacing: Duration,
}

impl RequestPacer {
    fn from_config(config: &ProviderConfig) -> Self {
        Self {
            next_slot: std::sync::Mutex::new(Instant::now()),
            spacing: Duration::from_millis(config.min_request_interval_ms),
        }
    }

    async fn reserve(&self) {
        if self.spacing.is_zero() {
            return;
        }
        let slot = {
            let mut next = self
                .next_slot
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let slot = (*next).max(Instant::now());
            *next = slot + self.spacing;
            slot
        };
        let delay = slot.saturating_duration_since(Instant::now());
        if !delay.is_zero() {
            tracing::trace!(delay_ms = delay.as_millis() as u64, "Pacing provider request");
            tokio::time::sleep(delay).await;
        }
    }
}

/// HTTP implementation of [`ProviderClient`]
pub struct HttpProviderClient {
    http_client: reqwest::Client,
    pacer: RequestPacer,
    base_url: String,
    account_id: String,
    auth_token: String,
}

impl HttpProviderClient {
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let (account_id, auth_token) = match (&config.account_id, &config.auth_token) {
            (Some(id), Some(token)) if !id.is_empty() && !token.is_empty() => {
                (id.clone(), token.clone())
            }
            _ => return Err(ProviderError::NotConfigured),
        };

        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        Ok(Self {
            http_client,
            pacer: RequestPacer::from_config(config),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            account_id,
            auth_token,
        })
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
        not_found: impl FnOnce() -> ProviderError,
    ) -> Result<T, ProviderError> {
        self.pacer.reserve().await;

        tracing::debug!(url = %url, "Querying provider API");

        let response = self
            .http_client
            .get(url)
            .basic_auth(&self.account_id, Some(&self.auth_token))
            .query(query)
            .send()
            .await?;

        let status = response.status();

        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(not_found());
        }

        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api(status.as_u16(), error_text));
        }

        response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    async fn fetch_call(&self, call_sid: &str) -> Result<ProviderCall, ProviderError> {
        let url = format!("{}/calls/{}", self.base_url, call_sid);
        let sid = call_sid.to_string();
        self.get(&url, &[], move || ProviderError::NotFound(sid)).await
    }

    async fn list_calls(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<CallPage, ProviderError> {
        let url = format!("{}/calls", self.base_url);
        let mut query = vec![
            ("start", start.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ("end", end.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ("limit", limit.to_string()),
        ];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_string()));
        }

        // An empty listing is a valid answer, not a missing resource
        self.get(&url, &query, || {
            ProviderError::Api(404, "call listing endpoint not found".into())
        })
        .await
    }
}
