//! Read interface for collaborators
//!
//! Every query returns merged entries, never raw legs. Related legs outside
//! the primary selection are pulled in so pairs merge consistently no matter
//! which leg matched.

use callsync_common::db::CallRecord;

use crate::error::Result;
use crate::merge::{attach_satellites, merge_calls, MergedCall};
use crate::store::CallStore;

#[derive(Clone)]
pub struct CallQueries {
    store: CallStore,
}

impl CallQueries {
    pub fn new(store: CallStore) -> Self {
        Self { store }
    }

    pub async fn get_calls_by_timeline(&self, timeline_id: &str) -> Result<Vec<MergedCall>> {
        let primary = self.store.list_by_timeline(timeline_id).await?;
        self.assemble(primary).await
    }

    /// Entries with at least one live leg
    pub async fn get_active_calls(&self) -> Result<Vec<MergedCall>> {
        let primary = self.store.list_active().await?;
        let merged = self.assemble(primary).await?;
        Ok(merged
            .into_iter()
            .filter(|entry| !entry.record.is_final)
            .collect())
    }

    /// Resolve a leg to its entry; a suppressed parent resolves to its child
    pub async fn get_call_by_sid(&self, call_sid: &str) -> Result<Option<MergedCall>> {
        let Some(record) = self.store.get(call_sid).await? else {
            return Ok(None);
        };

        let merged = self.assemble(vec![record]).await?;
        Ok(merged.into_iter().find(|entry| {
            entry.record.call_sid == call_sid
                || entry.merged_parent_sid.as_deref() == Some(call_sid)
        }))
    }

    async fn assemble(&self, primary: Vec<CallRecord>) -> Result<Vec<MergedCall>> {
        if primary.is_empty() {
            return Ok(Vec::new());
        }

        let related = self.store.list_related(&primary).await?;
        let mut records = primary;
        records.extend(related);

        let mut merged = merge_calls(records);

        let sids: Vec<&str> = merged.iter().flat_map(|entry| entry.leg_sids()).collect();
        let recordings = self.store.recordings_for(&sids).await?;
        let transcripts = self.store.transcripts_for(&sids).await?;

        attach_satellites(&mut merged, recordings, transcripts);
        Ok(merged)
    }
}
