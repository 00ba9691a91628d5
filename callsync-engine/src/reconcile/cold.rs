//! Cold tier: paginated backfill over a bounded date range
//!
//! Stops on a short page, on `has_more == false`, on a missing cursor, or when
//! the per-run call budget is spent, whichever comes first.

use callsync_common::SyncState;
use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use super::{ReconcileReport, Reconciler};
use crate::error::Result;
use crate::provider::ProviderCall;
use crate::store::ApplyOutcome;

impl Reconciler {
    /// Maximum pages a single cold run may request
    pub fn cold_max_pages(&self) -> usize {
        let page_size = self.config.cold_page_size.max(1);
        self.config.cold_max_calls.div_ceil(page_size)
    }

    pub async fn run_cold(&self, end: DateTime<Utc>) -> Result<ReconcileReport> {
        let start = end - Duration::days(self.config.cold_range_days);
        let page_size = self.config.cold_page_size.max(1);
        let max_pages = self.cold_max_pages();

        let mut report = ReconcileReport::default();
        let mut cursor: Option<String> = None;
        let mut budget = self.config.cold_max_calls;

        while report.pages < max_pages && budget > 0 {
            let page = match self
                .provider
                .list_calls(start, end, cursor.as_deref(), page_size)
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    warn!(page = report.pages + 1, error = %e, "Cold reconcile page fetch failed");
                    report.failed += 1;
                    break;
                }
            };
            report.pages += 1;

            let received = page.calls.len();
            let calls: Vec<ProviderCall> = page.calls.into_iter().take(budget).collect();
            budget -= calls.len();
            debug!(page = report.pages, calls = received, "Cold reconcile page");

            let results: Vec<Option<Result<ApplyOutcome>>> = stream::iter(calls)
                .map(|call| async move {
                    let result = self.backfill(&call).await;
                    if let Some(Err(e)) = &result {
                        warn!(call_sid = %call.sid, error = %e, "Cold reconcile failed for call");
                    }
                    result
                })
                .buffer_unordered(self.config.fetch_concurrency.max(1))
                .collect()
                .await;

            for result in results {
                match result {
                    Some(result) => report.record(&result),
                    None => report.checked += 1,
                }
            }

            if received < page_size || !page.has_more {
                break;
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        if report.pages >= max_pages {
            info!(pages = report.pages, "Cold reconcile reached page safety limit");
        }

        Ok(report)
    }

    /// Apply one listed call; frozen records are left alone
    async fn backfill(&self, call: &ProviderCall) -> Option<Result<ApplyOutcome>> {
        match self.store.get(&call.sid).await {
            Ok(Some(existing)) if existing.sync_state == SyncState::Frozen => None,
            Ok(existing) => Some(self.apply_provider_call(call, existing.as_ref()).await),
            Err(e) => Some(Err(e)),
        }
    }
}
