//! Warm tier: one confirming re-check per finalized call, then the freeze sweep

use callsync_common::time::now;
use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use super::{ReconcileReport, Reconciler};
use crate::error::Result;
use crate::store::ApplyOutcome;

impl Reconciler {
    pub async fn run_warm(&self) -> Result<ReconcileReport> {
        let candidates = self
            .store
            .list_warm_candidates(self.config.warm_max_calls)
            .await?;
        debug!(count = candidates.len(), "Warm reconcile candidates");

        let results: Vec<Result<ApplyOutcome>> = stream::iter(candidates)
            .map(|record| async move {
                let call = match self.provider.fetch_call(&record.call_sid).await {
                    Ok(call) => call,
                    Err(e) => {
                        warn!(call_sid = %record.call_sid, error = %e, "Warm re-check failed for call");
                        return Err(e.into());
                    }
                };

                let outcome = self.apply_provider_call(&call, Some(&record)).await?;
                if !call.status.eq_ignore_ascii_case(outcome.record().status.as_str()) {
                    // Final states are absorbing, so drift is reported, not applied
                    warn!(
                        call_sid = %record.call_sid,
                        stored = %outcome.record().status,
                        provider = %call.status,
                        "Provider disagrees with final call status"
                    );
                }

                self.store.mark_verified(&record.call_sid).await?;
                Ok(outcome)
            })
            .buffer_unordered(self.config.fetch_concurrency.max(1))
            .collect()
            .await;

        let mut report = ReconcileReport::default();
        for result in &results {
            report.record(result);
        }

        let frozen = self.store.freeze_expired(now()).await?;
        for record in &frozen {
            self.notifier.publish_call_update(record);
        }
        report.frozen = frozen.len();

        Ok(report)
    }
}
