//! Database models
//!
//! Row types decode themselves from SQLite rows. Timestamps are stored as unix
//! milliseconds and surfaced as `DateTime<Utc>`; enum columns are stored as
//! their lower-case text form.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};
use std::str::FromStr;

use crate::time::from_millis;
use crate::types::{CallStatus, InboxStatus, SatelliteStatus, SyncState};

/// One received or synthesized provider callback
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxEvent {
    pub id: i64,
    pub event_key: String,
    /// Raw source label; classified by the worker
    pub source: String,
    pub event_type: String,
    pub call_sid: Option<String>,
    pub payload: serde_json::Value,
    pub headers: serde_json::Value,
    pub status: InboxStatus,
    pub attempts: i64,
    pub retryable: bool,
    pub error_text: Option<String>,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Canonical call leg
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: i64,
    pub call_sid: String,
    pub parent_call_sid: Option<String>,
    pub status: CallStatus,
    pub is_final: bool,
    pub finalized_at: Option<DateTime<Utc>>,
    pub sync_state: SyncState,
    pub direction: String,
    pub from_number: Option<String>,
    pub to_number: Option<String>,
    pub duration_sec: i64,
    pub answered_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub price: Option<f64>,
    pub price_unit: Option<String>,
    pub last_event_time: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
    pub timeline_id: Option<String>,
    /// Optimistic concurrency counter, bumped on every write
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    pub id: i64,
    pub recording_sid: String,
    pub call_sid: String,
    pub status: SatelliteStatus,
    pub url: Option<String>,
    pub duration_sec: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub id: i64,
    pub transcription_sid: String,
    pub call_sid: String,
    pub recording_sid: Option<String>,
    pub status: SatelliteStatus,
    pub text: Option<String>,
    pub url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn decode_error(column: &str, source: impl std::error::Error + Send + Sync + 'static) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(source),
    }
}

fn parse_text<T>(row: &SqliteRow, column: &str) -> Result<T, sqlx::Error>
where
    T: FromStr<Err = crate::Error>,
{
    let raw: String = row.try_get(column)?;
    raw.parse::<T>().map_err(|e| decode_error(column, e))
}

fn timestamp(row: &SqliteRow, column: &str) -> Result<DateTime<Utc>, sqlx::Error> {
    let millis: i64 = row.try_get(column)?;
    Ok(from_millis(millis))
}

fn optional_timestamp(row: &SqliteRow, column: &str) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
    let millis: Option<i64> = row.try_get(column)?;
    Ok(millis.map(from_millis))
}

fn json_text(row: &SqliteRow, column: &str) -> Result<serde_json::Value, sqlx::Error> {
    let raw: String = row.try_get(column)?;
    serde_json::from_str(&raw).map_err(|e| decode_error(column, e))
}

impl<'r> FromRow<'r, SqliteRow> for InboxEvent {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            event_key: row.try_get("event_key")?,
            source: row.try_get("source")?,
            event_type: row.try_get("event_type")?,
            call_sid: row.try_get("call_sid")?,
            payload: json_text(row, "payload")?,
            headers: json_text(row, "headers")?,
            status: parse_text(row, "status")?,
            attempts: row.try_get("attempts")?,
            retryable: row.try_get::<i64, _>("retryable")? != 0,
            error_text: row.try_get("error_text")?,
            received_at: timestamp(row, "received_at_ms")?,
            processed_at: optional_timestamp(row, "processed_at_ms")?,
        })
    }
}

impl<'r> FromRow<'r, SqliteRow> for CallRecord {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            call_sid: row.try_get("call_sid")?,
            parent_call_sid: row.try_get("parent_call_sid")?,
            status: parse_text(row, "status")?,
            is_final: row.try_get::<i64, _>("is_final")? != 0,
            finalized_at: optional_timestamp(row, "finalized_at_ms")?,
            sync_state: parse_text(row, "sync_state")?,
            direction: row.try_get("direction")?,
            from_number: row.try_get("from_number")?,
            to_number: row.try_get("to_number")?,
            duration_sec: row.try_get("duration_sec")?,
            answered_at: optional_timestamp(row, "answered_at_ms")?,
            started_at: optional_timestamp(row, "started_at_ms")?,
            ended_at: optional_timestamp(row, "ended_at_ms")?,
            price: row.try_get("price")?,
            price_unit: row.try_get("price_unit")?,
            last_event_time: timestamp(row, "last_event_ms")?,
            verified_at: optional_timestamp(row, "verified_at_ms")?,
            timeline_id: row.try_get("timeline_id")?,
            version: row.try_get("version")?,
            created_at: timestamp(row, "created_at_ms")?,
            updated_at: timestamp(row, "updated_at_ms")?,
        })
    }
}

impl<'r> FromRow<'r, SqliteRow> for Recording {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            recording_sid: row.try_get("recording_sid")?,
            call_sid: row.try_get("call_sid")?,
            status: parse_text(row, "status")?,
            url: row.try_get("url")?,
            duration_sec: row.try_get("duration_sec")?,
            created_at: timestamp(row, "created_at_ms")?,
            updated_at: timestamp(row, "updated_at_ms")?,
        })
    }
}

impl<'r> FromRow<'r, SqliteRow> for Transcript {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            transcription_sid: row.try_get("transcription_sid")?,
            call_sid: row.try_get("call_sid")?,
            recording_sid: row.try_get("recording_sid")?,
            status: parse_text(row, "status")?,
            text: row.try_get("text")?,
            url: row.try_get("url")?,
            created_at: timestamp(row, "created_at_ms")?,
            updated_at: timestamp(row, "updated_at_ms")?,
        })
    }
}
