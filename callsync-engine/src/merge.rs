//! Parent-child merge engine
//!
//! The provider models some conversations as two legs: an outer PSTN/SIP leg
//! and an inner client leg dialed from it. Read paths collapse each such pair
//! into one entry. The child row survives; the parent is suppressed.

use callsync_common::db::{CallRecord, Recording, Transcript};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

/// User-facing call entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedCall {
    #[serde(flatten)]
    pub record: CallRecord,
    pub total_duration: i64,
    pub talk_time: i64,
    pub wait_time: i64,
    /// Parent leg folded into this entry, if any
    pub merged_parent_sid: Option<String>,
    pub recordings: Vec<Recording>,
    pub transcripts: Vec<Transcript>,
}

impl MergedCall {
    fn standalone(record: CallRecord) -> Self {
        let duration = record.duration_sec.max(0);
        Self {
            record,
            total_duration: duration,
            talk_time: duration,
            wait_time: 0,
            merged_parent_sid: None,
            recordings: Vec::new(),
            transcripts: Vec::new(),
        }
    }

    /// Legs whose satellites belong to this entry
    pub fn leg_sids(&self) -> Vec<&str> {
        std::iter::once(self.record.call_sid.as_str())
            .chain(self.merged_parent_sid.as_deref())
            .collect()
    }
}

/// Client or SIP routing address rather than a dialable phone number
///
/// Prefix match only; unvalidated against sampled production traffic.
pub fn is_internal_address(value: &str) -> bool {
    let value = value.trim().to_ascii_lowercase();
    value.starts_with("client:") || value.starts_with("sip:")
}

fn has_internal_endpoint(record: &CallRecord) -> bool {
    [&record.from_number, &record.to_number]
        .into_iter()
        .flatten()
        .any(|v| is_internal_address(v))
}

fn has_phone_endpoint(record: &CallRecord) -> bool {
    [&record.from_number, &record.to_number]
        .into_iter()
        .flatten()
        .any(|v| !v.trim().is_empty() && !is_internal_address(v))
}

/// Pick the endpoints shown for a merged pair
fn choose_endpoints(parent: &CallRecord, child: &CallRecord) -> (Option<String>, Option<String>) {
    let parents = (parent.from_number.clone(), parent.to_number.clone());
    let childs = (child.from_number.clone(), child.to_number.clone());

    let child_internal = has_internal_endpoint(child);
    let parent_internal = has_internal_endpoint(parent);

    if child_internal && !parent_internal && has_phone_endpoint(parent) {
        return parents;
    }
    if parent_internal && !child_internal {
        return childs;
    }
    if parent.direction.starts_with("inbound") {
        parents
    } else {
        childs
    }
}

fn merge_pair(parent: &CallRecord, child: CallRecord) -> MergedCall {
    let (from_number, to_number) = choose_endpoints(parent, &child);

    let talk_time = child.duration_sec.max(0);
    let total_duration = parent.duration_sec.max(talk_time);

    let mut record = child;
    record.from_number = from_number;
    record.to_number = to_number;
    record.direction = parent.direction.clone();
    if record.timeline_id.is_none() {
        record.timeline_id = parent.timeline_id.clone();
    }
    if let Some(parent_start) = parent.started_at {
        if record.started_at.map_or(true, |s| parent_start < s) {
            record.started_at = Some(parent_start);
        }
    }
    // The conversation is live while either leg is
    if record.is_final && !parent.is_final {
        record.status = parent.status;
        record.is_final = false;
        record.finalized_at = None;
        record.sync_state = parent.sync_state;
        record.ended_at = parent.ended_at;
    }

    MergedCall {
        record,
        total_duration,
        talk_time,
        wait_time: total_duration - talk_time,
        merged_parent_sid: Some(parent.call_sid.clone()),
        recordings: Vec::new(),
        transcripts: Vec::new(),
    }
}

/// Collapse parent/child legs; output keeps input order of surviving rows
pub fn merge_calls(records: Vec<CallRecord>) -> Vec<MergedCall> {
    let by_sid: HashMap<String, CallRecord> = records
        .iter()
        .map(|r| (r.call_sid.clone(), r.clone()))
        .collect();

    let merged_parents: HashSet<String> = records
        .iter()
        .filter_map(|r| r.parent_call_sid.clone())
        .filter(|parent| by_sid.contains_key(parent))
        .collect();

    records
        .into_iter()
        .filter(|r| !merged_parents.contains(&r.call_sid))
        .map(|record| {
            let parent = record
                .parent_call_sid
                .as_deref()
                .and_then(|sid| by_sid.get(sid));
            match parent {
                Some(parent) => merge_pair(parent, record),
                None => MergedCall::standalone(record),
            }
        })
        .collect()
}

/// Attach satellites to the entry owning their leg
pub fn attach_satellites(
    calls: &mut [MergedCall],
    recordings: Vec<Recording>,
    transcripts: Vec<Transcript>,
) {
    let mut owner: HashMap<String, usize> = HashMap::new();
    for (idx, call) in calls.iter().enumerate() {
        for sid in call.leg_sids() {
            owner.insert(sid.to_string(), idx);
        }
    }

    for recording in recordings {
        if let Some(&idx) = owner.get(&recording.call_sid) {
            calls[idx].recordings.push(recording);
        }
    }
    for transcript in transcripts {
        if let Some(&idx) = owner.get(&transcript.call_sid) {
            calls[idx].transcripts.push(transcript);
        }
    }
}
