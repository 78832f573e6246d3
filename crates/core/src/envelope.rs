//! Canonical event envelope
//!
//! Validates and normalizes incoming event documents. Two modes: strict
//! requires the full producer envelope, lenient accepts the legacy SDK
//! aliases (`event_type`/`timestamp`) and fills the gaps.

use crate::error::EnvelopeError;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value, json};
use uuid::Uuid;

/// Envelope validation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    /// Full envelope required; UUID fields validated, nothing generated.
    Strict,
    /// Legacy aliases accepted; missing identifiers generated.
    Lenient,
}

/// Fields every document must carry once aliases are resolved.
const REQUIRED_FIELDS: [&str; 10] = [
    "app_uuid",
    "event_type",
    "timestamp",
    "anon_user_id",
    "device_id_hash",
    "session_id",
    "sdk_version",
    "event_version",
    "payload",
    "context",
];

/// Envelope fields that must be present and non-empty in strict mode.
const STRICT_ENVELOPE_FIELDS: [&str; 6] = [
    "event_name",
    "occurred_at",
    "event_id",
    "trace_id",
    "producer",
    "actor",
];

const DEFAULT_PRODUCER: &str = "smartbuket-sdk";
const DEFAULT_ACTOR: &str = "anonymous";

/// A validated, normalized event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalEvent {
    pub event_id: Uuid,
    pub trace_id: Uuid,
    pub producer: String,
    pub actor: String,
    pub app_uuid: Uuid,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub anon_user_id: String,
    pub device_id_hash: String,
    pub session_id: String,
    pub sdk_version: String,
    pub event_version: String,
    pub payload: Map<String, Value>,
    pub context: Map<String, Value>,
}

/// The geo sample read from `context.geo`, when present and numeric.
#[derive(Debug, Clone, PartialEq)]
pub struct GeoSample {
    pub lat: f64,
    pub lon: f64,
    pub accuracy_m: Option<f64>,
    pub source: Option<String>,
}

impl CanonicalEvent {
    /// Event timestamp as RFC3339 with a trailing `Z`.
    pub fn occurred_at_rfc3339(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true)
    }

    /// The envelope as staged in the outbox and published on the wire: the
    /// original document with the normalized envelope keys guaranteed to
    /// exist. Unknown keys pass through verbatim.
    pub fn wire_payload(&self, original: &Value) -> Value {
        let mut doc = original.as_object().cloned().unwrap_or_default();
        doc.insert("event_id".to_string(), json!(self.event_id));
        doc.insert("trace_id".to_string(), json!(self.trace_id));
        doc.insert("producer".to_string(), json!(self.producer));
        doc.insert("actor".to_string(), json!(self.actor));
        doc.insert("occurred_at".to_string(), json!(self.occurred_at_rfc3339()));
        doc.insert("event_name".to_string(), json!(self.event_type));
        Value::Object(doc)
    }

    /// Reads `context.geo.{lat,lon,accuracy_m,source}`. Returns `None`
    /// unless both coordinates are numeric.
    pub fn geo(&self) -> Option<GeoSample> {
        let geo = self.context.get("geo")?.as_object()?;
        let lat = geo.get("lat")?.as_f64()?;
        let lon = geo.get("lon")?.as_f64()?;

        Some(GeoSample {
            lat,
            lon,
            accuracy_m: geo.get("accuracy_m").and_then(Value::as_f64),
            source: geo
                .get("source")
                .and_then(Value::as_str)
                .map(str::to_owned),
        })
    }
}

/// Parse and normalize an incoming document into a [`CanonicalEvent`].
pub fn parse_event(doc: &Value, mode: ParseMode) -> Result<CanonicalEvent, EnvelopeError> {
    let obj = doc.as_object().ok_or(EnvelopeError::NotAnObject)?;

    if mode == ParseMode::Strict {
        let missing: Vec<&'static str> = STRICT_ENVELOPE_FIELDS
            .into_iter()
            .filter(|key| is_absent(obj.get(*key)))
            .collect();
        if !missing.is_empty() {
            return Err(EnvelopeError::MissingEnvelopeFields(missing));
        }
    }

    // Alias resolution: event_type <-> event_name, timestamp <-> occurred_at.
    // Strict mode always takes the envelope names.
    let event_type_value = match mode {
        ParseMode::Strict => obj.get("event_name"),
        ParseMode::Lenient => obj.get("event_type").or_else(|| obj.get("event_name")),
    };
    let timestamp_value = match mode {
        ParseMode::Strict => obj.get("occurred_at"),
        ParseMode::Lenient => obj.get("timestamp").or_else(|| obj.get("occurred_at")),
    };

    let missing: Vec<&'static str> = REQUIRED_FIELDS
        .into_iter()
        .filter(|key| match *key {
            "event_type" => event_type_value.is_none(),
            "timestamp" => timestamp_value.is_none(),
            other => !obj.contains_key(other),
        })
        .collect();
    if !missing.is_empty() {
        return Err(EnvelopeError::MissingFields(missing));
    }

    let timestamp = parse_timestamp(
        timestamp_value.ok_or(EnvelopeError::MissingValue("timestamp"))?,
        "timestamp",
    )?;

    let payload = obj
        .get("payload")
        .and_then(Value::as_object)
        .ok_or(EnvelopeError::FieldNotObject("payload"))?
        .clone();
    let context = obj
        .get("context")
        .and_then(Value::as_object)
        .ok_or(EnvelopeError::FieldNotObject("context"))?
        .clone();

    let (event_id, trace_id) = match mode {
        ParseMode::Strict => (
            required_uuid(obj.get("event_id"), "event_id")?,
            required_uuid(obj.get("trace_id"), "trace_id")?,
        ),
        ParseMode::Lenient => (
            uuid_or_generated(obj.get("event_id"), "event_id")?,
            uuid_or_generated(obj.get("trace_id"), "trace_id")?,
        ),
    };

    let producer = envelope_actor(obj.get("producer"), "producer", DEFAULT_PRODUCER, mode)?;
    let actor = envelope_actor(obj.get("actor"), "actor", DEFAULT_ACTOR, mode)?;

    Ok(CanonicalEvent {
        event_id,
        trace_id,
        producer,
        actor,
        app_uuid: required_uuid(obj.get("app_uuid"), "app_uuid")?,
        event_type: required_string(event_type_value, "event_type")?,
        timestamp,
        anon_user_id: required_string(obj.get("anon_user_id"), "anon_user_id")?,
        device_id_hash: required_string(obj.get("device_id_hash"), "device_id_hash")?,
        session_id: required_string(obj.get("session_id"), "session_id")?,
        sdk_version: required_string(obj.get("sdk_version"), "sdk_version")?,
        event_version: required_string(obj.get("event_version"), "event_version")?,
        payload,
        context,
    })
}

fn is_absent(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(_) => false,
    }
}

fn parse_timestamp(value: &Value, field: &'static str) -> Result<DateTime<Utc>, EnvelopeError> {
    let raw = value
        .as_str()
        .ok_or(EnvelopeError::TimestampNotString(field))?;

    // RFC3339 covers offsets and the trailing Z; naive timestamps are
    // reinterpreted as UTC.
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    raw.parse::<NaiveDateTime>()
        .map(|naive| naive.and_utc())
        .map_err(|_| EnvelopeError::InvalidTimestamp(field))
}

fn required_uuid(value: Option<&Value>, field: &'static str) -> Result<Uuid, EnvelopeError> {
    let raw = value
        .and_then(Value::as_str)
        .ok_or(EnvelopeError::InvalidUuid(field))?;
    Uuid::parse_str(raw).map_err(|_| EnvelopeError::InvalidUuid(field))
}

fn uuid_or_generated(value: Option<&Value>, field: &'static str) -> Result<Uuid, EnvelopeError> {
    match value {
        Some(Value::String(s)) if !s.is_empty() => {
            Uuid::parse_str(s).map_err(|_| EnvelopeError::InvalidUuid(field))
        }
        None | Some(Value::Null) | Some(Value::String(_)) => Ok(Uuid::new_v4()),
        Some(_) => Err(EnvelopeError::InvalidUuid(field)),
    }
}

// String-typed envelope fields coerce rather than reject: a numeric
// sdk_version or boolean event_version is stringified and admitted.
fn required_string(value: Option<&Value>, field: &'static str) -> Result<String, EnvelopeError> {
    match value {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Ok(other.to_string()),
        None => Err(EnvelopeError::MissingValue(field)),
    }
}

fn envelope_actor(
    value: Option<&Value>,
    field: &'static str,
    default: &str,
    mode: ParseMode,
) -> Result<String, EnvelopeError> {
    match mode {
        ParseMode::Strict => {
            let raw = required_string(value, field)?;
            if raw.trim().is_empty() {
                return Err(EnvelopeError::MissingValue(field));
            }
            Ok(raw)
        }
        ParseMode::Lenient => match value {
            None | Some(Value::Null) => Ok(default.to_string()),
            Some(v) => required_string(Some(v), field),
        },
    }
}
