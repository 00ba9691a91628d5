//! callsync-engine configuration
//!
//! Loaded from the TOML config file (every field optional), then secrets are
//! overlaid from the environment. CLI arguments are applied in `main`.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

pub const ENV_PROVIDER_ACCOUNT_ID: &str = "CALLSYNC_PROVIDER_ACCOUNT_ID";
pub const ENV_PROVIDER_AUTH_TOKEN: &str = "CALLSYNC_PROVIDER_AUTH_TOKEN";
pub const ENV_ADMIN_TOKEN: &str = "CALLSYNC_ADMIN_TOKEN";

/// Service configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub provider: ProviderConfig,
    pub webhooks: WebhookConfig,
    pub worker: WorkerConfig,
    pub reconcile: ReconcileConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub port: u16,
    /// Bearer token for `/admin` routes; `None` leaves them open
    pub admin_token: Option<String>,
    /// Buffered events per realtime subscriber
    pub event_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 5800,
            admin_token: None,
            event_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Prefix of every inbox event key
    pub name: String,
    pub base_url: String,
    pub account_id: Option<String>,
    pub auth_token: Option<String>,
    pub timeout_secs: u64,
    /// Minimum spacing between outbound API requests
    pub min_request_interval_ms: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: "telephony".to_string(),
            base_url: "https://api.telephony.example.com/v1".to_string(),
            account_id: None,
            auth_token: None,
            timeout_secs: 10,
            min_request_interval_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Externally visible base URL the provider posts to; part of the signed input
    pub public_base_url: String,
    /// Signing token; falls back to the provider auth token
    pub auth_token: Option<String>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            public_base_url: "http://localhost:5800".to_string(),
            auth_token: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Calls processed in parallel; events of one call are always sequential
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    pub batch_size: i64,
    pub max_attempts: i64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval_ms: 2000,
            batch_size: 100,
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub enabled: bool,
    pub freeze_cooldown_hours: i64,
    pub hot_interval_secs: u64,
    pub warm_interval_secs: u64,
    pub cold_interval_secs: u64,
    pub hot_max_calls: i64,
    pub warm_max_calls: i64,
    pub cold_range_days: i64,
    pub cold_page_size: usize,
    /// Safety limit on calls fetched per cold run
    pub cold_max_calls: usize,
    /// Parallel provider requests per batch
    pub fetch_concurrency: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            freeze_cooldown_hours: 6,
            hot_interval_secs: 30,
            warm_interval_secs: 300,
            cold_interval_secs: 6 * 3600,
            hot_max_calls: 500,
            warm_max_calls: 500,
            cold_range_days: 30,
            cold_page_size: 50,
            cold_max_calls: 200,
            fetch_concurrency: 4,
        }
    }
}

impl ReconcileConfig {
    pub fn freeze_cooldown(&self) -> chrono::Duration {
        chrono::Duration::hours(self.freeze_cooldown_hours)
    }
}

impl Config {
    /// Load from an optional TOML file and overlay environment secrets
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config: Config = callsync_common::config::load_toml_or_default(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(value) = non_empty_env(ENV_PROVIDER_ACCOUNT_ID) {
            self.provider.account_id = Some(value);
        }
        if let Some(value) = non_empty_env(ENV_PROVIDER_AUTH_TOKEN) {
            self.provider.auth_token = Some(value);
        }
        if let Some(value) = non_empty_env(ENV_ADMIN_TOKEN) {
            self.server.admin_token = Some(value);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker.concurrency == 0 {
            return Err(Error::Config("worker.concurrency must be at least 1".into()));
        }
        if self.reconcile.fetch_concurrency == 0 {
            return Err(Error::Config("reconcile.fetch_concurrency must be at least 1".into()));
        }
        if self.reconcile.cold_page_size == 0 {
            return Err(Error::Config("reconcile.cold_page_size must be at least 1".into()));
        }
        if self.reconcile.freeze_cooldown_hours < 0 {
            return Err(Error::Config("reconcile.freeze_cooldown_hours must not be negative".into()));
        }
        if self.worker.max_attempts < 1 {
            return Err(Error::Config("worker.max_attempts must be at least 1".into()));
        }
        Ok(())
    }

    /// Token used to validate webhook signatures, if any
    pub fn signing_token(&self) -> Option<&str> {
        self.webhooks
            .auth_token
            .as_deref()
            .or(self.provider.auth_token.as_deref())
            .filter(|t| !t.is_empty())
    }

    pub fn worker_poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker.poll_interval_ms)
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}
