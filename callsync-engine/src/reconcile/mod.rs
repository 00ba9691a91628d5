//! Reconciliation service
//!
//! Webhooks get dropped, rejected or delayed. Three polling tiers pull
//! authoritative state from the provider and replay it through the same
//! ordering-guarded store path as the inbox worker, in lenient mode:
//!
//! - **hot**: active calls, refreshed by id every few seconds
//! - **warm**: recently finalized calls, re-checked once, then frozen after cooldown
//! - **cold**: paginated backfill over a date range for calls that never produced a webhook
//!
//! One call's failure never aborts a run; the next scheduled run retries.

mod cold;
mod hot;
mod warm;

use callsync_common::db::CallRecord;
use callsync_common::events::{CallSyncEvent, EventBus};
use callsync_common::time::now;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::ReconcileConfig;
use crate::error::{Error, Result};
use crate::normalize::normalize_provider_call;
use crate::notify::RealtimeNotifier;
use crate::provider::{ProviderCall, ProviderClient};
use crate::state_machine::TransitionMode;
use crate::store::{ApplyOutcome, CallStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Hot,
    Warm,
    Cold,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Hot, Tier::Warm, Tier::Cold];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Hot => "hot",
            Tier::Warm => "warm",
            Tier::Cold => "cold",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "hot" => Ok(Tier::Hot),
            "warm" => Ok(Tier::Warm),
            "cold" => Ok(Tier::Cold),
            other => Err(Error::Config(format!("Unknown reconcile tier: {}", other))),
        }
    }
}

/// Summary of one reconciliation run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    /// Calls looked at
    pub checked: usize,
    /// Calls whose stored row changed
    pub applied: usize,
    /// Calls (or pages) that errored and were skipped
    pub failed: usize,
    /// Provider list pages fetched (cold tier only)
    pub pages: usize,
    /// Records moved to `frozen` (warm tier only)
    pub frozen: usize,
}

impl ReconcileReport {
    fn record(&mut self, result: &Result<ApplyOutcome>) {
        self.checked += 1;
        match result {
            Ok(outcome) if outcome.changed() => self.applied += 1,
            Ok(_) => {}
            Err(_) => self.failed += 1,
        }
    }
}

/// Runs the reconciliation tiers against one provider
pub struct Reconciler {
    store: CallStore,
    provider: Arc<dyn ProviderClient>,
    notifier: Arc<dyn RealtimeNotifier>,
    events: EventBus,
    config: ReconcileConfig,
}

impl Reconciler {
    pub fn new(
        store: CallStore,
        provider: Arc<dyn ProviderClient>,
        notifier: Arc<dyn RealtimeNotifier>,
        events: EventBus,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            store,
            provider,
            notifier,
            events,
            config,
        }
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Run one tier once and publish its summary
    pub async fn run(&self, tier: Tier) -> Result<ReconcileReport> {
        let report = match tier {
            Tier::Hot => self.run_hot().await?,
            Tier::Warm => self.run_warm().await?,
            Tier::Cold => self.run_cold(now()).await?,
        };

        info!(
            tier = %tier,
            checked = report.checked,
            applied = report.applied,
            failed = report.failed,
            "Reconcile run complete"
        );

        self.events.emit_lossy(CallSyncEvent::ReconcileCompleted {
            event_id: Uuid::new_v4(),
            tier: tier.as_str().to_string(),
            checked: report.checked,
            applied: report.applied,
            failed: report.failed,
            timestamp: now(),
        });

        Ok(report)
    }

    /// Replay one authoritative provider read through the store
    ///
    /// A read without any provider timestamp is applied at the stored
    /// `last_event_time`, so it can never push the ordering guard forward.
    async fn apply_provider_call(
        &self,
        call: &ProviderCall,
        stored: Option<&CallRecord>,
    ) -> Result<ApplyOutcome> {
        let event = normalize_provider_call(call);
        let at = event
            .event_time
            .or_else(|| stored.map(|record| record.last_event_time))
            .ok_or_else(|| Error::Normalize(format!("provider call {} carries no timestamp", call.sid)))?;

        let outcome = self
            .store
            .apply_event(&event, TransitionMode::Lenient, at)
            .await?;

        if outcome.changed() {
            self.notifier.publish_call_update(outcome.record());
        }
        Ok(outcome)
    }

    fn interval(&self, tier: Tier) -> Duration {
        let secs = match tier {
            Tier::Hot => self.config.hot_interval_secs,
            Tier::Warm => self.config.warm_interval_secs,
            Tier::Cold => self.config.cold_interval_secs,
        };
        Duration::from_secs(secs.max(1))
    }
}

/// Spawn one periodic loop per tier; each stops when `shutdown` flips to true
pub fn spawn_tiers(reconciler: Arc<Reconciler>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
    Tier::ALL
        .into_iter()
        .map(|tier| {
            let reconciler = Arc::clone(&reconciler);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { run_tier_loop(reconciler, tier, shutdown).await })
        })
        .collect()
}

async fn run_tier_loop(reconciler: Arc<Reconciler>, tier: Tier, mut shutdown: watch::Receiver<bool>) {
    let period = reconciler.interval(tier);
    info!(tier = %tier, period_secs = period.as_secs(), "Reconcile tier scheduled");

    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = reconciler.run(tier).await {
                    error!(tier = %tier, error = %e, "Reconcile run failed");
                }
            }
            _ = shutdown.changed() => {}
        }

        if *shutdown.borrow() {
            info!(tier = %tier, "Reconcile tier stopping");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_parse() {
        assert_eq!("HOT".parse::<Tier>().unwrap(), Tier::Hot);
        assert_eq!("cold".parse::<Tier>().unwrap(), Tier::Cold);
        assert!("lukewarm".parse::<Tier>().is_err());
    }

    #[test]
    fn test_report_counts() {
        let mut report = ReconcileReport::default();
        report.record(&Err(Error::CallNotFound("CA1".into())));
        assert_eq!(report.checked, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.applied, 0);
    }
}
