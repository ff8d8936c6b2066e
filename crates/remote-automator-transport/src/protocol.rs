//! Wire protocol for the automation target.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request method names.
pub mod methods {
    pub const GET_CURRENT_PAGE: &str = "App.getCurrentPage";
    pub const ENABLE_LOG: &str = "App.enableLog";
    pub const EXIT: &str = "App.exit";
}

/// Event method names.
pub mod events {
    pub const LOG_ADDED: &str = "App.logAdded";
    pub const EXCEPTION_THROWN: &str = "App.exceptionThrown";
}

/// Message from client to target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Request {
    #[must_use]
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            id,
            method: method.into(),
            params,
        }
    }
}

/// Error object reported by the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
}

/// Reply to a [`Request`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
}

/// Unsolicited notification from the target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// A frame received from the target.
#[derive(Debug, Clone)]
pub enum Incoming {
    Response(Response),
    Event(Event),
}

impl Incoming {
    /// Classify a text frame: frames with an `id` are responses, frames
    /// with only a `method` are events.
    ///
    /// # Errors
    /// Returns error if the frame is not JSON or matches neither shape.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(text)?;
        if value.get("id").is_some() {
            serde_json::from_value(value).map(Self::Response)
        } else {
            serde_json::from_value(value).map(Self::Event)
        }
    }
}
