//! Canonical call store
//!
//! Every write path (inbox worker, reconciliation tiers) funnels through
//! [`CallStore::apply_event`]. The ordering guard and the optimistic version
//! check are part of the UPDATE itself, so concurrent writers for one call
//! cannot lose updates or regress a newer state.

use callsync_common::db::{CallRecord, Recording, Transcript};
use callsync_common::time::{now, parse_provider_timestamp, to_millis};
use callsync_common::{CallStatus, SatelliteStatus, SyncState};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::normalize::{CallEvent, CallEventKind, EXTERNAL_DIRECTION};
use crate::state_machine::{CallState, StateMachine, TransitionMode};

/// Optimistic write attempts before giving up with a conflict
const MAX_WRITE_ATTEMPTS: usize = 3;

/// What happened to a call record when an event was applied
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Created(CallRecord),
    Updated(CallRecord),
    /// Event carried nothing new
    Unchanged(CallRecord),
    /// Rejected by the ordering guard: a newer event was already applied
    Stale(CallRecord),
    /// Invalid transition dropped in lenient mode
    Ignored(CallRecord),
}

impl ApplyOutcome {
    pub fn record(&self) -> &CallRecord {
        match self {
            ApplyOutcome::Created(r)
            | ApplyOutcome::Updated(r)
            | ApplyOutcome::Unchanged(r)
            | ApplyOutcome::Stale(r)
            | ApplyOutcome::Ignored(r) => r,
        }
    }

    pub fn into_record(self) -> CallRecord {
        match self {
            ApplyOutcome::Created(r)
            | ApplyOutcome::Updated(r)
            | ApplyOutcome::Unchanged(r)
            | ApplyOutcome::Stale(r)
            | ApplyOutcome::Ignored(r) => r,
        }
    }

    /// True when the stored row was written
    pub fn changed(&self) -> bool {
        matches!(self, ApplyOutcome::Created(_) | ApplyOutcome::Updated(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            ApplyOutcome::Created(_) => "created",
            ApplyOutcome::Updated(_) => "updated",
            ApplyOutcome::Unchanged(_) => "unchanged",
            ApplyOutcome::Stale(_) => "stale",
            ApplyOutcome::Ignored(_) => "ignored",
        }
    }
}

/// Mutable columns of a call row
#[derive(Debug, Clone, PartialEq)]
struct CallFields {
    parent_call_sid: Option<String>,
    status: CallStatus,
    is_final: bool,
    finalized_at: Option<DateTime<Utc>>,
    sync_state: SyncState,
    direction: String,
    from_number: Option<String>,
    to_number: Option<String>,
    duration_sec: i64,
    answered_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    price: Option<f64>,
    price_unit: Option<String>,
    last_event_time: DateTime<Utc>,
}

impl CallFields {
    fn from_record(record: &CallRecord) -> Self {
        Self {
            parent_call_sid: record.parent_call_sid.clone(),
            status: record.status,
            is_final: record.is_final,
            finalized_at: record.finalized_at,
            sync_state: record.sync_state,
            direction: record.direction.clone(),
            from_number: record.from_number.clone(),
            to_number: record.to_number.clone(),
            duration_sec: record.duration_sec,
            answered_at: record.answered_at,
            started_at: record.started_at,
            ended_at: record.ended_at,
            price: record.price,
            price_unit: record.price_unit.clone(),
            last_event_time: record.last_event_time,
        }
    }

    fn initial(event: &CallEvent, state: CallState, at: DateTime<Utc>) -> Self {
        let mut fields = Self {
            parent_call_sid: None,
            status: state.status,
            is_final: state.is_final,
            finalized_at: state.finalized_at,
            sync_state: state.sync_state,
            direction: EXTERNAL_DIRECTION.to_string(),
            from_number: None,
            to_number: None,
            duration_sec: 0,
            answered_at: None,
            started_at: None,
            ended_at: None,
            price: None,
            price_unit: None,
            last_event_time: at,
        };
        fields.merge(event, state, at);
        if fields.started_at.is_none() {
            fields.started_at = Some(at);
        }
        fields
    }

    /// Fold event attributes and the computed state into the row
    fn merge(&mut self, event: &CallEvent, state: CallState, at: DateTime<Utc>) {
        self.status = state.status;
        self.is_final = state.is_final;
        self.finalized_at = state.finalized_at;
        self.sync_state = state.sync_state;

        if event.parent_call_sid.is_some() {
            self.parent_call_sid = event.parent_call_sid.clone();
        }
        if event.direction != EXTERNAL_DIRECTION || self.direction.is_empty() {
            self.direction = event.direction.clone();
        }
        if event.from_number.is_some() {
            self.from_number = event.from_number.clone();
        }
        if event.to_number.is_some() {
            self.to_number = event.to_number.clone();
        }
        if event.duration > 0 {
            self.duration_sec = event.duration;
        }
        if let Some(price) = event.price() {
            self.price = Some(price);
        }
        if let Some(unit) = event.metadata_str("price_unit") {
            self.price_unit = Some(unit.to_string());
        }

        let reported = |key: &str| event.metadata_str(key).and_then(parse_provider_timestamp);
        if let Some(started) = reported("start_time") {
            self.started_at = Some(started);
        }
        if let Some(answered) = reported("answered_at") {
            self.answered_at = Some(answered);
        } else if self.answered_at.is_none() && state.status == CallStatus::InProgress {
            self.answered_at = Some(at);
        }
        if let Some(ended) = reported("end_time") {
            self.ended_at = Some(ended);
        } else if self.ended_at.is_none() && state.is_final {
            self.ended_at = Some(at);
        }

        if at > self.last_event_time {
            self.last_event_time = at;
        }
    }

    fn state(&self) -> CallState {
        CallState {
            status: self.status,
            is_final: self.is_final,
            finalized_at: self.finalized_at,
            sync_state: self.sync_state,
        }
    }
}

fn millis(ts: Option<DateTime<Utc>>) -> Option<i64> {
    ts.map(to_millis)
}

/// Call, recording and transcript persistence
#[derive(Clone)]
pub struct CallStore {
    pool: SqlitePool,
    state_machine: StateMachine,
}

impl CallStore {
    pub fn new(pool: SqlitePool, state_machine: StateMachine) -> Self {
        Self {
            pool,
            state_machine,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn state_machine(&self) -> &StateMachine {
        &self.state_machine
    }

    pub async fn get(&self, call_sid: &str) -> Result<Option<CallRecord>> {
        let record = sqlx::query_as::<_, CallRecord>("SELECT * FROM call_records WHERE call_sid = ?")
            .bind(call_sid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    /// Apply a call-status event under the ordering guard
    ///
    /// `at` is the event time used by the guard. Webhook callers substitute
    /// the receive time when the provider sent none; poll callers never pass a
    /// time later than the provider reported. Strict mode surfaces invalid
    /// transitions as errors.
    pub async fn apply_event(
        &self,
        event: &CallEvent,
        mode: TransitionMode,
        at: DateTime<Utc>,
    ) -> Result<ApplyOutcome> {
        let status = event.call_status()?;

        for _ in 0..MAX_WRITE_ATTEMPTS {
            let current = match self.get(&event.call_sid).await? {
                Some(current) => current,
                None => {
                    let state = self.state_machine.initial_state(status, at, now());
                    let fields = CallFields::initial(event, state, at);
                    if let Some(created) = self.insert(&event.call_sid, &fields).await? {
                        debug!(call_sid = %event.call_sid, status = %status, "Call record created");
                        return Ok(ApplyOutcome::Created(created));
                    }
                    // Lost the insert race; apply on top of the winner
                    continue;
                }
            };

            if at < current.last_event_time {
                debug!(
                    call_sid = %current.call_sid,
                    status = %status,
                    "Event older than stored state, skipping"
                );
                return Ok(ApplyOutcome::Stale(current));
            }

            let before = CallFields::from_record(&current);
            let state = self
                .state_machine
                .apply_transition(&before.state(), status, mode, at, now())?;

            if state.status != status {
                return Ok(ApplyOutcome::Ignored(current));
            }

            let mut after = before.clone();
            after.merge(event, state, at);
            if after == before {
                return Ok(ApplyOutcome::Unchanged(current));
            }

            if let Some(updated) = self.update(&current, &after, at).await? {
                if updated.status != current.status {
                    debug!(
                        call_sid = %updated.call_sid,
                        from = %current.status,
                        to = %updated.status,
                        "Call status advanced"
                    );
                }
                return Ok(ApplyOutcome::Updated(updated));
            }
            // Row moved underneath us: re-read and let the guard decide again
        }

        Err(Error::WriteConflict(event.call_sid.clone()))
    }

    async fn insert(&self, call_sid: &str, fields: &CallFields) -> Result<Option<CallRecord>> {
        let now_ms = to_millis(now());
        let record = sqlx::query_as::<_, CallRecord>(
            r#"
            INSERT INTO call_records (
                call_sid, parent_call_sid, status, is_final, finalized_at_ms, sync_state,
                direction, from_number, to_number, duration_sec, answered_at_ms, started_at_ms,
                ended_at_ms, price, price_unit, last_event_ms, version, created_at_ms, updated_at_ms
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
            ON CONFLICT(call_sid) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(call_sid)
        .bind(&fields.parent_call_sid)
        .bind(fields.status.as_str())
        .bind(fields.is_final as i64)
        .bind(millis(fields.finalized_at))
        .bind(fields.sync_state.as_str())
        .bind(&fields.direction)
        .bind(&fields.from_number)
        .bind(&fields.to_number)
        .bind(fields.duration_sec)
        .bind(millis(fields.answered_at))
        .bind(millis(fields.started_at))
        .bind(millis(fields.ended_at))
        .bind(fields.price)
        .bind(&fields.price_unit)
        .bind(to_millis(fields.last_event_time))
        .bind(now_ms)
        .bind(now_ms)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Conditional update: same version, and nothing newer applied meanwhile
    async fn update(
        &self,
        current: &CallRecord,
        fields: &CallFields,
        at: DateTime<Utc>,
    ) -> Result<Option<CallRecord>> {
        let record = sqlx::query_as::<_, CallRecord>(
            r#"
            UPDATE call_records SET
                parent_call_sid = ?, status = ?, is_final = ?, finalized_at_ms = ?, sync_state = ?,
                direction = ?, from_number = ?, to_number = ?, duration_sec = ?,
                answered_at_ms = ?, started_at_ms = ?, ended_at_ms = ?, price = ?, price_unit = ?,
                last_event_ms = ?, version = version + 1, updated_at_ms = ?
            WHERE call_sid = ? AND version = ? AND last_event_ms <= ?
            RETURNING *
            "#,
        )
        .bind(&fields.parent_call_sid)
        .bind(fields.status.as_str())
        .bind(fields.is_final as i64)
        .bind(millis(fields.finalized_at))
        .bind(fields.sync_state.as_str())
        .bind(&fields.direction)
        .bind(&fields.from_number)
        .bind(&fields.to_number)
        .bind(fields.duration_sec)
        .bind(millis(fields.answered_at))
        .bind(millis(fields.started_at))
        .bind(millis(fields.ended_at))
        .bind(fields.price)
        .bind(&fields.price_unit)
        .bind(to_millis(fields.last_event_time))
        .bind(to_millis(now()))
        .bind(&current.call_sid)
        .bind(current.version)
        .bind(to_millis(at))
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Upsert a recording or transcript from a satellite event
    ///
    /// A terminal satellite status is never replaced. The owning call must
    /// already exist; it is returned on success.
    pub async fn apply_satellite(&self, event: &CallEvent) -> Result<CallRecord> {
        let Some(call) = self.get(&event.call_sid).await? else {
            return Err(Error::CallNotFound(event.call_sid.clone()));
        };

        let status: SatelliteStatus = event
            .event_status
            .parse()
            .map_err(|e: callsync_common::Error| Error::Normalize(e.to_string()))?;
        let now_ms = to_millis(now());

        match event.kind {
            CallEventKind::Recording => {
                let recording_sid = event
                    .metadata_str("recording_sid")
                    .ok_or_else(|| Error::Normalize("recording event without RecordingSid".into()))?;
                let duration = event
                    .metadata_str("recording_duration")
                    .and_then(|d| d.parse::<i64>().ok());

                sqlx::query(
                    r#"
                    INSERT INTO recordings
                        (recording_sid, call_sid, status, url, duration_sec, created_at_ms, updated_at_ms)
                    VALUES (?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT(recording_sid) DO UPDATE SET
                        status = CASE WHEN recordings.status IN ('completed', 'failed', 'absent')
                                      THEN recordings.status ELSE excluded.status END,
                        url = COALESCE(excluded.url, recordings.url),
                        duration_sec = COALESCE(excluded.duration_sec, recordings.duration_sec),
                        updated_at_ms = excluded.updated_at_ms
                    "#,
                )
                .bind(recording_sid)
                .bind(&event.call_sid)
                .bind(status.as_str())
                .bind(event.metadata_str("recording_url"))
                .bind(duration)
                .bind(now_ms)
                .bind(now_ms)
                .execute(&self.pool)
                .await?;

                debug!(call_sid = %event.call_sid, recording_sid = %recording_sid, status = %status.as_str(), "Recording stored");
            }
            CallEventKind::Transcription => {
                let transcription_sid = event.metadata_str("transcription_sid").ok_or_else(|| {
                    Error::Normalize("transcription event without TranscriptionSid".into())
                })?;

                sqlx::query(
                    r#"
                    INSERT INTO transcripts
                        (transcription_sid, call_sid, recording_sid, status, text, url, created_at_ms, updated_at_ms)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT(transcription_sid) DO UPDATE SET
                        status = CASE WHEN transcripts.status IN ('completed', 'failed', 'absent')
                                      THEN transcripts.status ELSE excluded.status END,
                        recording_sid = COALESCE(excluded.recording_sid, transcripts.recording_sid),
                        text = COALESCE(excluded.text, transcripts.text),
                        url = COALESCE(excluded.url, transcripts.url),
                        updated_at_ms = excluded.updated_at_ms
                    "#,
                )
                .bind(transcription_sid)
                .bind(&event.call_sid)
                .bind(event.metadata_str("recording_sid"))
                .bind(status.as_str())
                .bind(event.metadata_str("transcription_text"))
                .bind(event.metadata_str("transcription_url"))
                .bind(now_ms)
                .bind(now_ms)
                .execute(&self.pool)
                .await?;

                debug!(call_sid = %event.call_sid, transcription_sid = %transcription_sid, status = %status.as_str(), "Transcript stored");
            }
            CallEventKind::CallStatus | CallEventKind::Informational => {
                return Err(Error::Internal(format!(
                    "{:?} event routed to satellite store",
                    event.kind
                )));
            }
        }

        Ok(call)
    }

    /// Active, non-final calls, least recently touched first
    pub async fn list_hot_candidates(&self, limit: i64) -> Result<Vec<CallRecord>> {
        let records = sqlx::query_as::<_, CallRecord>(
            r#"
            SELECT * FROM call_records
            WHERE is_final = 0 AND sync_state = 'active'
            ORDER BY last_event_ms ASC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    /// Final calls still inside the cooldown that were never re-checked
    pub async fn list_warm_candidates(&self, limit: i64) -> Result<Vec<CallRecord>> {
        let records = sqlx::query_as::<_, CallRecord>(
            r#"
            SELECT * FROM call_records
            WHERE is_final = 1 AND sync_state = 'active' AND verified_at_ms IS NULL
            ORDER BY finalized_at_ms ASC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    pub async fn mark_verified(&self, call_sid: &str) -> Result<()> {
        sqlx::query("UPDATE call_records SET verified_at_ms = ? WHERE call_sid = ?")
            .bind(to_millis(now()))
            .bind(call_sid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Freeze every final record whose cooldown has strictly elapsed
    pub async fn freeze_expired(&self, now: DateTime<Utc>) -> Result<Vec<CallRecord>> {
        let cutoff = now - self.state_machine.cooldown();
        let frozen = sqlx::query_as::<_, CallRecord>(
            r#"
            UPDATE call_records
            SET sync_state = 'frozen', version = version + 1, updated_at_ms = ?
            WHERE is_final = 1 AND sync_state = 'active' AND finalized_at_ms < ?
            RETURNING *
            "#,
        )
        .bind(to_millis(now))
        .bind(to_millis(cutoff))
        .fetch_all(&self.pool)
        .await?;

        if !frozen.is_empty() {
            info!(count = frozen.len(), "Froze finalized calls past cooldown");
        }
        Ok(frozen)
    }

    /// Attach a call to a timeline owned by a collaborator
    pub async fn link_timeline(&self, call_sid: &str, timeline_id: &str) -> Result<Option<CallRecord>> {
        let record = sqlx::query_as::<_, CallRecord>(
            r#"
            UPDATE call_records
            SET timeline_id = ?, version = version + 1, updated_at_ms = ?
            WHERE call_sid = ?
            RETURNING *
            "#,
        )
        .bind(timeline_id)
        .bind(to_millis(now()))
        .bind(call_sid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn list_by_timeline(&self, timeline_id: &str) -> Result<Vec<CallRecord>> {
        let records = sqlx::query_as::<_, CallRecord>(
            "SELECT * FROM call_records WHERE timeline_id = ? ORDER BY started_at_ms DESC, id DESC",
        )
        .bind(timeline_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    pub async fn list_active(&self) -> Result<Vec<CallRecord>> {
        let records = sqlx::query_as::<_, CallRecord>(
            "SELECT * FROM call_records WHERE is_final = 0 ORDER BY started_at_ms DESC, id DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    /// Parents and children of the given legs that are not in the set already
    pub async fn list_related(&self, records: &[CallRecord]) -> Result<Vec<CallRecord>> {
        let sids: Vec<&str> = records.iter().map(|r| r.call_sid.as_str()).collect();
        let parents: Vec<&str> = records
            .iter()
            .filter_map(|r| r.parent_call_sid.as_deref())
            .collect();

        let related = sqlx::query_as::<_, CallRecord>(
            r#"
            SELECT * FROM call_records
            WHERE call_sid NOT IN (SELECT value FROM json_each(?1))
              AND (parent_call_sid IN (SELECT value FROM json_each(?1))
                   OR call_sid IN (SELECT value FROM json_each(?2)))
            "#,
        )
        .bind(serde_json::to_string(&sids)?)
        .bind(serde_json::to_string(&parents)?)
        .fetch_all(&self.pool)
        .await?;
        Ok(related)
    }

    pub async fn recordings_for(&self, call_sids: &[&str]) -> Result<Vec<Recording>> {
        let recordings = sqlx::query_as::<_, Recording>(
            r#"
            SELECT * FROM recordings
            WHERE call_sid IN (SELECT value FROM json_each(?))
            ORDER BY created_at_ms ASC, id ASC
            "#,
        )
        .bind(serde_json::to_string(call_sids)?)
        .fetch_all(&self.pool)
        .await?;
        Ok(recordings)
    }

    pub async fn transcripts_for(&self, call_sids: &[&str]) -> Result<Vec<Transcript>> {
        let transcripts = sqlx::query_as::<_, Transcript>(
            r#"
            SELECT * FROM transcripts
            WHERE call_sid IN (SELECT value FROM json_each(?))
            ORDER BY created_at_ms ASC, id ASC
            "#,
        )
        .bind(serde_json::to_string(call_sids)?)
        .fetch_all(&self.pool)
        .await?;
        Ok(transcripts)
    }
}
