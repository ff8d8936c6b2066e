//! Asynchronous events emitted by an automation target.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde_json::{Map, Number, Value};

/// Kind recorded for uncaught exceptions.
pub const EXCEPTION_KIND: &str = "exception";

/// Payload of a target event as it was observed.
///
/// Richer than JSON: it may carry raw bytes, non-finite floats or values
/// the target could only describe textually.
#[derive(Debug, Clone, PartialEq)]
pub enum EventValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<EventValue>),
    /// Ordered key/value pairs.
    Map(Vec<(String, EventValue)>),
    /// A value with no JSON form, kept as its description.
    Opaque(String),
}

impl EventValue {
    /// Convert into a JSON-safe value.
    ///
    /// Never fails: anything JSON cannot carry falls back to text.
    #[must_use]
    pub fn to_json_safe(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::Number((*i).into()),
            Self::Float(f) => Number::from_f64(*f).map_or_else(|| Value::String(f.to_string()), Value::Number),
            Self::Text(s) | Self::Opaque(s) => Value::String(s.clone()),
            Self::Bytes(bytes) => Value::String(BASE64.encode(bytes)),
            Self::List(items) => Value::Array(items.iter().map(Self::to_json_safe).collect()),
            Self::Map(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json_safe()))
                    .collect::<Map<String, Value>>(),
            ),
        }
    }

    /// Human-readable rendering: text verbatim, everything else as compact JSON.
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::Text(s) | Self::Opaque(s) => s.clone(),
            other => other.to_json_safe().to_string(),
        }
    }

    /// Look up a key in a map value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Self> {
        match self {
            Self::Map(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<Value> for EventValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .or_else(|| n.as_f64().map(Self::Float))
                .unwrap_or_else(|| Self::Opaque(n.to_string())),
            Value::String(s) => Self::Text(s),
            Value::Array(items) => Self::List(items.into_iter().map(Self::from).collect()),
            Value::Object(map) => Self::Map(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect()),
        }
    }
}

impl From<&str> for EventValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

/// Event forwarded from an active connection into the log buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum TargetEvent {
    /// Console output; `kind` is the console method (`log`, `warn`, ...).
    Console { kind: String, payload: EventValue },
    /// Uncaught exception inside the target.
    Exception { payload: EventValue },
}

impl TargetEvent {
    /// Log kind: the console method, or [`EXCEPTION_KIND`].
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::Console { kind, .. } => kind,
            Self::Exception { .. } => EXCEPTION_KIND,
        }
    }

    #[must_use]
    pub const fn payload(&self) -> &EventValue {
        match self {
            Self::Console { payload, .. } | Self::Exception { payload } => payload,
        }
    }

    /// One-line message for the log entry.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::Console { payload, .. } => match payload.get("args") {
                Some(EventValue::List(args)) => args.iter().map(EventValue::render).collect::<Vec<_>>().join(" "),
                _ => payload.render(),
            },
            Self::Exception { payload } => payload
                .get("message")
                .and_then(EventValue::as_str)
                .map_or_else(|| payload.render(), str::to_owned),
        }
    }
}
