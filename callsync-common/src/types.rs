//! Call lifecycle types shared by the inbox, the state machine and the read paths
//!
//! All enums are stored as lower-case TEXT in SQLite. Parsing from the wire is
//! case-insensitive; canonical storage is always the lower-case form.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Telephony call status
///
/// Active states progress `queued → initiated → ringing → in-progress`;
/// every other state is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallStatus {
    Queued,
    Initiated,
    Ringing,
    InProgress,
    Completed,
    Busy,
    NoAnswer,
    Failed,
    Canceled,
}

impl CallStatus {
    pub const ALL: [CallStatus; 9] = [
        CallStatus::Queued,
        CallStatus::Initiated,
        CallStatus::Ringing,
        CallStatus::InProgress,
        CallStatus::Completed,
        CallStatus::Busy,
        CallStatus::NoAnswer,
        CallStatus::Failed,
        CallStatus::Canceled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Queued => "queued",
            CallStatus::Initiated => "initiated",
            CallStatus::Ringing => "ringing",
            CallStatus::InProgress => "in-progress",
            CallStatus::Completed => "completed",
            CallStatus::Busy => "busy",
            CallStatus::NoAnswer => "no-answer",
            CallStatus::Failed => "failed",
            CallStatus::Canceled => "canceled",
        }
    }

    /// True for terminal statuses
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            CallStatus::Completed
                | CallStatus::Busy
                | CallStatus::NoAnswer
                | CallStatus::Failed
                | CallStatus::Canceled
        )
    }

    /// Position in the canonical progression; all final states share the last rank
    pub fn rank(&self) -> u8 {
        match self {
            CallStatus::Queued => 0,
            CallStatus::Initiated => 1,
            CallStatus::Ringing => 2,
            CallStatus::InProgress => 3,
            _ => 4,
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        CallStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == lowered)
            .ok_or_else(|| Error::InvalidInput(format!("Unknown call status: {}", s)))
    }
}

/// Whether reconciliation still polls a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Active,
    Frozen,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Active => "active",
            SyncState::Frozen => "frozen",
        }
    }
}

impl FromStr for SyncState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(SyncState::Active),
            "frozen" => Ok(SyncState::Frozen),
            _ => Err(Error::InvalidInput(format!("Unknown sync state: {}", s))),
        }
    }
}

/// Origin of an inbox event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventSource {
    Voice,
    Recording,
    Transcription,
    ManualIngest,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Voice => "voice",
            EventSource::Recording => "recording",
            EventSource::Transcription => "transcription",
            EventSource::ManualIngest => "manual-ingest",
        }
    }
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventSource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "voice" => Ok(EventSource::Voice),
            "recording" => Ok(EventSource::Recording),
            "transcription" => Ok(EventSource::Transcription),
            "manual-ingest" => Ok(EventSource::ManualIngest),
            _ => Err(Error::InvalidInput(format!("Unknown event source: {}", s))),
        }
    }
}

/// Processing state of an inbox row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InboxStatus {
    Pending,
    Processed,
    Failed,
}

impl InboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InboxStatus::Pending => "pending",
            InboxStatus::Processed => "processed",
            InboxStatus::Failed => "failed",
        }
    }
}

impl FromStr for InboxStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(InboxStatus::Pending),
            "processed" => Ok(InboxStatus::Processed),
            "failed" => Ok(InboxStatus::Failed),
            _ => Err(Error::InvalidInput(format!("Unknown inbox status: {}", s))),
        }
    }
}

/// Lifecycle of a recording or transcript attached to a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SatelliteStatus {
    InProgress,
    Completed,
    Failed,
    Absent,
}

impl SatelliteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SatelliteStatus::InProgress => "in-progress",
            SatelliteStatus::Completed => "completed",
            SatelliteStatus::Failed => "failed",
            SatelliteStatus::Absent => "absent",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SatelliteStatus::InProgress)
    }
}

impl FromStr for SatelliteStatus {
    type Err = Error;

    /// Provider progress values (`processing`, `queued`) collapse into `in-progress`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "completed" => Ok(SatelliteStatus::Completed),
            "failed" => Ok(SatelliteStatus::Failed),
            "absent" => Ok(SatelliteStatus::Absent),
            "in-progress" | "processing" | "queued" | "" => Ok(SatelliteStatus::InProgress),
            other => Err(Error::InvalidInput(format!("Unknown satellite status: {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_status_parse_is_case_insensitive() {
        assert_eq!("RINGING".parse::<CallStatus>().unwrap(), CallStatus::Ringing);
        assert_eq!("In-Progress".parse::<CallStatus>().unwrap(), CallStatus::InProgress);
        assert_eq!(" no-answer ".parse::<CallStatus>().unwrap(), CallStatus::NoAnswer);
        assert!("answered".parse::<CallStatus>().is_err());
    }

    #[test]
    fn test_final_set() {
        let finals: Vec<_> = CallStatus::ALL.iter().filter(|s| s.is_final()).collect();
        assert_eq!(finals.len(), 5);
        assert!(!CallStatus::InProgress.is_final());
        assert!(CallStatus::Canceled.is_final());
    }

    #[test]
    fn test_status_serializes_lower_case() {
        let json = serde_json::to_string(&CallStatus::InProgress).unwrap();
        assert_eq!(json, "\"in-progress\"");
    }

    #[test]
    fn test_event_source_round_trip() {
        for source in [
            EventSource::Voice,
            EventSource::Recording,
            EventSource::Transcription,
            EventSource::ManualIngest,
        ] {
            assert_eq!(source.as_str().parse::<EventSource>().unwrap(), source);
        }
        assert!("sms".parse::<EventSource>().is_err());
    }

    #[test]
    fn test_satellite_terminal() {
        assert!(SatelliteStatus::Absent.is_terminal());
        assert!(!SatelliteStatus::InProgress.is_terminal());
        assert_eq!("Completed".parse::<SatelliteStatus>().unwrap(), SatelliteStatus::Completed);
    }
}
