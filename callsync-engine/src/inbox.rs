//! Webhook inbox
//!
//! Durable, idempotent landing zone for provider callbacks. The unique
//! `event_key` makes a second delivery of the same callback a silent no-op.
//! The table doubles as the retry ledger for the inbox worker.

use callsync_common::db::InboxEvent;
use callsync_common::signature::payload_digest;
use callsync_common::time::{from_millis, now, to_millis};
use callsync_common::InboxStatus;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::error::Result;
use crate::normalize::{normalize, CallEventKind, ProviderPayload};

/// Row to insert into the inbox
#[derive(Debug, Clone, PartialEq)]
pub struct NewInboxEvent {
    pub event_key: String,
    pub source: String,
    pub event_type: String,
    pub call_sid: Option<String>,
    pub payload: Value,
    pub headers: Value,
}

impl NewInboxEvent {
    /// Build the inbox row for a validated payload
    ///
    /// `prefix` names the callback family (`call`, `dial-action`, `manual`, ...).
    /// Without a provider delivery id the key falls back to a digest of the
    /// payload, so byte-identical replays collapse onto one row.
    pub fn from_payload(
        provider: &str,
        prefix: &str,
        payload: &ProviderPayload,
        delivery_id: Option<&str>,
        headers: Value,
    ) -> Result<Self> {
        let event = normalize(payload)?;

        let status = if event.event_status.is_empty() {
            "unknown"
        } else {
            event.event_status.as_str()
        };
        let event_type = format!("{}.{}", prefix, status);

        let entity_id = match event.kind {
            CallEventKind::Recording => event.metadata_str("recording_sid"),
            CallEventKind::Transcription => event.metadata_str("transcription_sid"),
            _ => None,
        }
        .unwrap_or(event.call_sid.as_str())
        .to_string();

        let delivery_id = match delivery_id.map(str::trim).filter(|d| !d.is_empty()) {
            Some(id) => id.to_string(),
            None => digest(payload),
        };

        Ok(Self {
            event_key: event_key(provider, &event_type, &entity_id, &delivery_id),
            source: payload.source().as_str().to_string(),
            event_type,
            call_sid: Some(event.call_sid),
            payload: payload.to_json(),
            headers,
        })
    }
}

/// `{provider}:{event_type}:{entity_id}:{delivery_id}`
pub fn event_key(provider: &str, event_type: &str, entity_id: &str, delivery_id: &str) -> String {
    format!("{}:{}:{}:{}", provider, event_type, entity_id, delivery_id)
}

fn digest(payload: &ProviderPayload) -> String {
    match payload {
        ProviderPayload::Voice(fields)
        | ProviderPayload::DialAction(fields)
        | ProviderPayload::Recording(fields)
        | ProviderPayload::Transcription(fields) => payload_digest(fields),
        // The serialized event already carries its optional delivery id
        ProviderPayload::Manual(_) => {
            let flattened = [("manual".to_string(), payload.to_json().to_string())]
                .into_iter()
                .collect();
            payload_digest(&flattened)
        }
    }
}

/// Result of [`InboxStore::ingest`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IngestOutcome {
    /// False when the event key was already present
    pub accepted: bool,
}

/// Inbox counters for operators
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InboxStats {
    pub pending: i64,
    pub processed: i64,
    pub failed: i64,
    /// Failed rows the worker will pick up again on its own
    pub failed_retryable: i64,
    pub oldest_pending_at: Option<DateTime<Utc>>,
}

/// Inbox persistence
#[derive(Clone)]
pub struct InboxStore {
    pool: SqlitePool,
    max_attempts: i64,
}

impl InboxStore {
    pub fn new(pool: SqlitePool, max_attempts: i64) -> Self {
        Self { pool, max_attempts }
    }

    pub fn max_attempts(&self) -> i64 {
        self.max_attempts
    }

    /// Conditionally insert an event; duplicates are absorbed, never errors
    pub async fn ingest(&self, event: &NewInboxEvent) -> Result<IngestOutcome> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO inbox_events
                (event_key, source, event_type, call_sid, payload, headers, status, received_at_ms)
            VALUES (?, ?, ?, ?, ?, ?, 'pending', ?)
            "#,
        )
        .bind(&event.event_key)
        .bind(&event.source)
        .bind(&event.event_type)
        .bind(&event.call_sid)
        .bind(event.payload.to_string())
        .bind(event.headers.to_string())
        .bind(to_millis(now()))
        .execute(&self.pool)
        .await?;

        let accepted = result.rows_affected() > 0;
        if accepted {
            debug!(event_key = %event.event_key, "Inbox event stored");
        } else {
            debug!(event_key = %event.event_key, "Duplicate inbox event ignored");
        }

        Ok(IngestOutcome { accepted })
    }

    /// Rows the worker should process next, oldest first
    ///
    /// Pending rows plus retryable failures that still have attempts left.
    pub async fn next_batch(&self, limit: i64) -> Result<Vec<InboxEvent>> {
        let events = sqlx::query_as::<_, InboxEvent>(
            r#"
            SELECT * FROM inbox_events
            WHERE status = 'pending'
               OR (status = 'failed' AND retryable = 1 AND attempts < ?)
            ORDER BY received_at_ms ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(self.max_attempts)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }

    pub async fn get(&self, event_key: &str) -> Result<Option<InboxEvent>> {
        let event = sqlx::query_as::<_, InboxEvent>("SELECT * FROM inbox_events WHERE event_key = ?")
            .bind(event_key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(event)
    }

    pub async fn mark_processed(&self, id: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE inbox_events
            SET status = 'processed', error_text = NULL, processed_at_ms = ?
            WHERE id = ?
            "#,
        )
        .bind(to_millis(now()))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a processing failure; the row stays in the ledger for retry
    pub async fn mark_failed(&self, id: i64, error_text: &str, retryable: bool) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE inbox_events
            SET status = 'failed', attempts = attempts + 1, error_text = ?, retryable = ?,
                processed_at_ms = ?
            WHERE id = ?
            "#,
        )
        .bind(error_text)
        .bind(retryable as i64)
        .bind(to_millis(now()))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Put a failed row back in the queue with a fresh attempt budget
    ///
    /// Returns false when no failed row has that key.
    pub async fn reset_for_retry(&self, event_key: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE inbox_events
            SET status = 'pending', attempts = 0, retryable = 1, processed_at_ms = NULL
            WHERE event_key = ? AND status = 'failed'
            "#,
        )
        .bind(event_key)
        .execute(&self.pool)
        .await?;

        let reset = result.rows_affected() > 0;
        if reset {
            info!(event_key = %event_key, "Inbox event reset for retry");
        }
        Ok(reset)
    }

    pub async fn list_failed(&self, limit: i64) -> Result<Vec<InboxEvent>> {
        let events = sqlx::query_as::<_, InboxEvent>(
            r#"
            SELECT * FROM inbox_events
            WHERE status = 'failed'
            ORDER BY received_at_ms DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    pub async fn count_for_call(&self, call_sid: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM inbox_events WHERE call_sid = ?")
            .bind(call_sid)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn stats(&self) -> Result<InboxStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM inbox_events GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = InboxStats::default();
        for (status, count) in rows {
            match status.parse::<InboxStatus>() {
                Ok(InboxStatus::Pending) => stats.pending = count,
                Ok(InboxStatus::Processed) => stats.processed = count,
                Ok(InboxStatus::Failed) => stats.failed = count,
                Err(_) => {}
            }
        }

        stats.failed_retryable = sqlx::query_scalar(
            "SELECT COUNT(*) FROM inbox_events WHERE status = 'failed' AND retryable = 1 AND attempts < ?",
        )
        .bind(self.max_attempts)
        .fetch_one(&self.pool)
        .await?;

        let oldest: Option<i64> =
            sqlx::query_scalar("SELECT MIN(received_at_ms) FROM inbox_events WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await?;
        stats.oldest_pending_at = oldest.map(from_millis);

        Ok(stats)
    }
}
