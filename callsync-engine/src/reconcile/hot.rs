//! Hot tier: refresh every active, non-final call by id

use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use super::{ReconcileReport, Reconciler};
use crate::error::Result;

impl Reconciler {
    pub async fn run_hot(&self) -> Result<ReconcileReport> {
        let candidates = self
            .store
            .list_hot_candidates(self.config.hot_max_calls)
            .await?;
        debug!(count = candidates.len(), "Hot reconcile candidates");

        let results: Vec<_> = stream::iter(candidates)
            .map(|record| async move {
                let result = match self.provider.fetch_call(&record.call_sid).await {
                    Ok(call) => self.apply_provider_call(&call, Some(&record)).await,
                    Err(e) => Err(e.into()),
                };
                if let Err(e) = &result {
                    warn!(call_sid = %record.call_sid, error = %e, "Hot reconcile failed for call");
                }
                result
            })
            .buffer_unordered(self.config.fetch_concurrency.max(1))
            .collect()
            .await;

        let mut report = ReconcileReport::default();
        for result in &results {
            report.record(result);
        }
        Ok(report)
    }
}
