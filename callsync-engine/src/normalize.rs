//! Event normalizer
//!
//! Maps provider payload shapes onto one canonical [`CallEvent`]. Everything
//! here is pure: no I/O, no clock reads, deterministic for a given input.
//!
//! Payloads are validated once at the boundary ([`ProviderPayload::from_form`],
//! [`ProviderPayload::from_inbox`]) into a variant per source; normalization
//! itself never fails on missing optional fields.

use callsync_common::time::parse_provider_timestamp;
use callsync_common::{CallStatus, EventSource};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::provider::ProviderCall;

/// Flat provider form fields
pub type FieldMap = BTreeMap<String, String>;

/// Direction used when the provider does not say
pub const EXTERNAL_DIRECTION: &str = "external";

/// Where a canonical event came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventOrigin {
    Inbox(EventSource),
    /// Authoritative read from the provider REST API
    Poll,
}

/// What part of the call model an event touches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallEventKind {
    CallStatus,
    Recording,
    Transcription,
    /// Carries no state for the core (e.g. a dial action that created no leg)
    Informational,
}

/// Webhook endpoint a callback arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookKind {
    VoiceStatus,
    RecordingStatus,
    TranscriptionStatus,
    DialAction,
    VoiceInbound,
}

impl WebhookKind {
    pub fn source(&self) -> EventSource {
        match self {
            WebhookKind::VoiceStatus | WebhookKind::DialAction | WebhookKind::VoiceInbound => {
                EventSource::Voice
            }
            WebhookKind::RecordingStatus => EventSource::Recording,
            WebhookKind::TranscriptionStatus => EventSource::Transcription,
        }
    }

    /// Prefix of the inbox `event_type`
    pub fn event_prefix(&self) -> &'static str {
        match self {
            WebhookKind::VoiceStatus => "call",
            WebhookKind::RecordingStatus => "recording",
            WebhookKind::TranscriptionStatus => "transcription",
            WebhookKind::DialAction => "dial-action",
            WebhookKind::VoiceInbound => "voice-inbound",
        }
    }

    fn from_event_type(source: EventSource, event_type: &str) -> Option<WebhookKind> {
        let prefix = event_type.split('.').next().unwrap_or_default();
        match (source, prefix) {
            (EventSource::Voice, "call") => Some(WebhookKind::VoiceStatus),
            (EventSource::Voice, "dial-action") => Some(WebhookKind::DialAction),
            (EventSource::Voice, "voice-inbound") => Some(WebhookKind::VoiceInbound),
            (EventSource::Recording, _) => Some(WebhookKind::RecordingStatus),
            (EventSource::Transcription, _) => Some(WebhookKind::TranscriptionStatus),
            _ => None,
        }
    }
}

/// Operator-submitted call event in canonical field names
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManualCallEvent {
    pub call_sid: String,
    pub status: String,
    #[serde(default)]
    pub parent_call_sid: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub direction: Option<String>,
    #[serde(default)]
    pub duration: Option<i64>,
    #[serde(default)]
    pub event_time: Option<DateTime<Utc>>,
    /// Distinguishes deliberate re-submissions of the same event
    #[serde(default)]
    pub delivery_id: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Boundary-validated provider payload, one variant per source shape
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderPayload {
    Voice(FieldMap),
    DialAction(FieldMap),
    Recording(FieldMap),
    Transcription(FieldMap),
    Manual(ManualCallEvent),
}

/// Canonical event produced by the normalizer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEvent {
    pub origin: EventOrigin,
    pub kind: CallEventKind,
    pub call_sid: String,
    /// Lower-case provider status of whatever `kind` describes
    pub event_status: String,
    pub from_number: Option<String>,
    pub to_number: Option<String>,
    pub direction: String,
    pub duration: i64,
    pub parent_call_sid: Option<String>,
    pub event_time: Option<DateTime<Utc>>,
    /// Provider extras not modelled by the core
    pub metadata: Map<String, Value>,
}

impl CallEvent {
    /// Parse `event_status` as a call status
    pub fn call_status(&self) -> Result<CallStatus> {
        self.event_status
            .parse::<CallStatus>()
            .map_err(|e| Error::Normalize(e.to_string()))
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn price(&self) -> Option<f64> {
        self.metadata.get("price").and_then(value_as_f64)
    }
}

/// Provider field names mapped to canonical metadata keys
const EXTRA_FIELDS: &[(&str, &str)] = &[
    ("AnsweredBy", "answered_by"),
    ("QueueTime", "queue_time"),
    ("Price", "price"),
    ("PriceUnit", "price_unit"),
    ("SequenceNumber", "sequence_number"),
    ("CallbackSource", "callback_source"),
    ("RecordingSid", "recording_sid"),
    ("RecordingUrl", "recording_url"),
    ("RecordingStatus", "recording_status"),
    ("RecordingDuration", "recording_duration"),
    ("TranscriptionSid", "transcription_sid"),
    ("TranscriptionStatus", "transcription_status"),
    ("TranscriptionText", "transcription_text"),
    ("TranscriptionUrl", "transcription_url"),
];

/// Fields consumed into canonical columns
const CORE_FIELDS: &[&str] = &[
    "CallSid",
    "ParentCallSid",
    "CallStatus",
    "From",
    "To",
    "Direction",
    "CallDuration",
    "Duration",
    "Timestamp",
    "DialCallSid",
    "DialCallStatus",
    "DialCallDuration",
];

impl ProviderPayload {
    /// Validate a form-encoded webhook body
    ///
    /// The only hard requirement is the identifier the event key is built from.
    pub fn from_form(kind: WebhookKind, fields: FieldMap) -> Result<Self> {
        let required = match kind {
            WebhookKind::RecordingStatus => "RecordingSid",
            WebhookKind::TranscriptionStatus => "TranscriptionSid",
            _ => "CallSid",
        };
        if field(&fields, required).is_none() {
            return Err(Error::Normalize(format!("missing required field {}", required)));
        }
        if field(&fields, "CallSid").is_none() {
            return Err(Error::Normalize("missing required field CallSid".into()));
        }

        Ok(match kind {
            WebhookKind::VoiceStatus | WebhookKind::VoiceInbound => ProviderPayload::Voice(fields),
            WebhookKind::DialAction => ProviderPayload::DialAction(fields),
            WebhookKind::RecordingStatus => ProviderPayload::Recording(fields),
            WebhookKind::TranscriptionStatus => ProviderPayload::Transcription(fields),
        })
    }

    /// Validate a manual-ingest submission
    pub fn from_manual(event: ManualCallEvent) -> Result<Self> {
        if event.call_sid.trim().is_empty() {
            return Err(Error::Normalize("missing required field call_sid".into()));
        }
        if event.status.trim().is_empty() {
            return Err(Error::Normalize("missing required field status".into()));
        }
        Ok(ProviderPayload::Manual(event))
    }

    /// Rebuild the typed payload from a stored inbox row
    pub fn from_inbox(source: EventSource, event_type: &str, payload: &Value) -> Result<Self> {
        if source == EventSource::ManualIngest {
            let event: ManualCallEvent = serde_json::from_value(payload.clone())
                .map_err(|e| Error::Normalize(format!("invalid manual event: {}", e)))?;
            return Self::from_manual(event);
        }

        let kind = WebhookKind::from_event_type(source, event_type).ok_or_else(|| {
            Error::Normalize(format!("unrecognized event type {} for {}", event_type, source))
        })?;

        let object = payload
            .as_object()
            .ok_or_else(|| Error::Normalize("payload is not an object".into()))?;
        let fields: FieldMap = object
            .iter()
            .map(|(k, v)| {
                let text = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), text)
            })
            .collect();

        Self::from_form(kind, fields)
    }

    pub fn source(&self) -> EventSource {
        match self {
            ProviderPayload::Voice(_) | ProviderPayload::DialAction(_) => EventSource::Voice,
            ProviderPayload::Recording(_) => EventSource::Recording,
            ProviderPayload::Transcription(_) => EventSource::Transcription,
            ProviderPayload::Manual(_) => EventSource::ManualIngest,
        }
    }

    /// Payload as stored in the inbox `payload` column
    pub fn to_json(&self) -> Value {
        match self {
            ProviderPayload::Voice(fields)
            | ProviderPayload::DialAction(fields)
            | ProviderPayload::Recording(fields)
            | ProviderPayload::Transcription(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect(),
            ),
            ProviderPayload::Manual(event) => {
                serde_json::to_value(event).unwrap_or(Value::Null)
            }
        }
    }
}

/// Normalize a validated payload into a canonical event
pub fn normalize(payload: &ProviderPayload) -> Result<CallEvent> {
    match payload {
        ProviderPayload::Voice(fields) => Ok(normalize_voice(fields)),
        ProviderPayload::DialAction(fields) => Ok(normalize_dial_action(fields)),
        ProviderPayload::Recording(fields) => Ok(normalize_satellite(
            fields,
            CallEventKind::Recording,
            "RecordingStatus",
        )),
        ProviderPayload::Transcription(fields) => Ok(normalize_satellite(
            fields,
            CallEventKind::Transcription,
            "TranscriptionStatus",
        )),
        ProviderPayload::Manual(event) => Ok(normalize_manual(event)),
    }
}

fn normalize_voice(fields: &FieldMap) -> CallEvent {
    CallEvent {
        origin: EventOrigin::Inbox(EventSource::Voice),
        kind: CallEventKind::CallStatus,
        call_sid: field(fields, "CallSid").unwrap_or_default().to_string(),
        event_status: lower(field(fields, "CallStatus")),
        from_number: owned(field(fields, "From")),
        to_number: owned(field(fields, "To")),
        direction: direction(field(fields, "Direction")),
        duration: parse_duration(field(fields, "CallDuration").or(field(fields, "Duration"))),
        parent_call_sid: owned(field(fields, "ParentCallSid")),
        event_time: field(fields, "Timestamp").and_then(parse_provider_timestamp),
        metadata: extras(fields),
    }
}

/// Dial action callbacks describe the dialed child leg of `CallSid`
fn normalize_dial_action(fields: &FieldMap) -> CallEvent {
    let parent = field(fields, "CallSid").unwrap_or_default().to_string();
    let mut metadata = extras(fields);
    metadata.insert("callback_source".into(), Value::String("dial-action".into()));

    match field(fields, "DialCallSid") {
        Some(child) => CallEvent {
            origin: EventOrigin::Inbox(EventSource::Voice),
            kind: CallEventKind::CallStatus,
            call_sid: child.to_string(),
            event_status: lower(field(fields, "DialCallStatus")),
            from_number: owned(field(fields, "From")),
            to_number: owned(field(fields, "To")),
            direction: "outbound-dial".to_string(),
            duration: parse_duration(field(fields, "DialCallDuration")),
            parent_call_sid: Some(parent),
            event_time: field(fields, "Timestamp").and_then(parse_provider_timestamp),
            metadata,
        },
        None => CallEvent {
            origin: EventOrigin::Inbox(EventSource::Voice),
            kind: CallEventKind::Informational,
            call_sid: parent,
            event_status: lower(field(fields, "DialCallStatus")),
            from_number: owned(field(fields, "From")),
            to_number: owned(field(fields, "To")),
            direction: direction(field(fields, "Direction")),
            duration: 0,
            parent_call_sid: None,
            event_time: field(fields, "Timestamp").and_then(parse_provider_timestamp),
            metadata,
        },
    }
}

fn normalize_satellite(fields: &FieldMap, kind: CallEventKind, status_field: &str) -> CallEvent {
    let source = match kind {
        CallEventKind::Transcription => EventSource::Transcription,
        _ => EventSource::Recording,
    };

    CallEvent {
        origin: EventOrigin::Inbox(source),
        kind,
        call_sid: field(fields, "CallSid").unwrap_or_default().to_string(),
        event_status: lower(field(fields, status_field)),
        from_number: owned(field(fields, "From")),
        to_number: owned(field(fields, "To")),
        direction: direction(field(fields, "Direction")),
        duration: parse_duration(field(fields, "CallDuration")),
        parent_call_sid: owned(field(fields, "ParentCallSid")),
        event_time: field(fields, "Timestamp").and_then(parse_provider_timestamp),
        metadata: extras(fields),
    }
}

fn normalize_manual(event: &ManualCallEvent) -> CallEvent {
    CallEvent {
        origin: EventOrigin::Inbox(EventSource::ManualIngest),
        kind: CallEventKind::CallStatus,
        call_sid: event.call_sid.trim().to_string(),
        event_status: lower(Some(event.status.as_str())),
        from_number: owned(event.from.as_deref()),
        to_number: owned(event.to.as_deref()),
        direction: direction(event.direction.as_deref()),
        duration: event.duration.unwrap_or(0).max(0),
        parent_call_sid: owned(event.parent_call_sid.as_deref()),
        event_time: event.event_time,
        metadata: event.metadata.clone(),
    }
}

/// Normalize a call resource read from the provider REST API
pub fn normalize_provider_call(call: &ProviderCall) -> CallEvent {
    let mut metadata = call.extra.clone();
    if let Some(price) = &call.price {
        metadata.insert("price".into(), price.clone());
    }
    if let Some(unit) = &call.price_unit {
        metadata.insert("price_unit".into(), Value::String(unit.clone()));
    }
    for (key, value) in [
        ("start_time", &call.start_time),
        ("end_time", &call.end_time),
        ("answered_at", &call.answered_at),
    ] {
        if let Some(value) = value {
            metadata.insert(key.into(), Value::String(value.clone()));
        }
    }

    CallEvent {
        origin: EventOrigin::Poll,
        kind: CallEventKind::CallStatus,
        call_sid: call.sid.clone(),
        event_status: lower(Some(call.status.as_str())),
        from_number: owned(call.from.as_deref()),
        to_number: owned(call.to.as_deref()),
        direction: direction(call.direction.as_deref()),
        duration: call.duration.as_ref().and_then(value_as_i64).unwrap_or(0).max(0),
        parent_call_sid: owned(call.parent_call_sid.as_deref()),
        event_time: [&call.date_updated, &call.end_time, &call.start_time]
            .into_iter()
            .flatten()
            .find_map(|raw| parse_provider_timestamp(raw)),
        metadata,
    }
}

fn field<'a>(fields: &'a FieldMap, name: &str) -> Option<&'a str> {
    fields
        .get(name)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}

fn owned(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn lower(value: Option<&str>) -> String {
    value.unwrap_or_default().trim().to_ascii_lowercase()
}

fn direction(value: Option<&str>) -> String {
    owned(value)
        .map(|d| d.to_ascii_lowercase())
        .unwrap_or_else(|| EXTERNAL_DIRECTION.to_string())
}

fn parse_duration(value: Option<&str>) -> i64 {
    value
        .and_then(|v| v.trim().parse::<f64>().ok())
        .map(|secs| secs.max(0.0).round() as i64)
        .unwrap_or(0)
}

/// Keep every non-core field; known extras get canonical snake_case keys
fn extras(fields: &FieldMap) -> Map<String, Value> {
    let mut metadata = Map::new();
    for (name, value) in fields {
        if CORE_FIELDS.contains(&name.as_str()) {
            continue;
        }
        let key = EXTRA_FIELDS
            .iter()
            .find(|(provider, _)| provider == name)
            .map(|(_, canonical)| canonical.to_string())
            .unwrap_or_else(|| name.clone());
        metadata.insert(key, Value::String(value.clone()));
    }
    metadata
}

pub(crate) fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Value::String(s) => s.trim().parse::<f64>().ok().map(|f| f.round() as i64),
        _ => None,
    }
}

pub(crate) fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}
