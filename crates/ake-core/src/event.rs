//! Worker-completion event payloads.
//!
//! Two shapes are accepted on stdin:
//!
//! - the native descriptor `{"eventId", "agent", "reportText", "timestamp"?}`
//!   (snake_case keys also accepted);
//! - a host hook payload with `session_id`, `tool_use_id`,
//!   `tool_input.subagent_type` and `tool_response.content[].text`.
//!
//! Host worker type names are mapped to agent ids through the configured
//! aliases.

use ake_common::{AgentId, EventId};
use ake_config::Config;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Keys tried, in order, when a host response carries no content blocks.
const RESPONSE_FALLBACK_KEYS: [&str; 5] = ["output", "result", "message", "text", "response"];

#[derive(Debug, Error)]
pub enum EventError {
    #[error("event payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("event payload is missing {0}")]
    Missing(&'static str),

    #[error("event payload field {field} is invalid: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("event payload is neither a worker event nor a host hook payload")]
    UnknownShape,
}

impl From<EventError> for ake_common::Error {
    fn from(err: EventError) -> Self {
        ake_common::Error::MalformedInput(err.to_string())
    }
}

/// One worker-completion event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventDescriptor {
    pub event_id: EventId,
    pub agent: AgentId,
    pub report_text: String,
    /// Event time, when the trigger supplies one.
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NativeEvent {
    #[serde(alias = "event_id")]
    event_id: String,
    agent: String,
    #[serde(alias = "report_text")]
    report_text: String,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

impl EventDescriptor {
    /// Parse a payload read from stdin or an event file.
    pub fn parse(input: &str, config: &Config) -> Result<Self, EventError> {
        let value: Value = serde_json::from_str(input)?;
        let Some(object) = value.as_object() else {
            return Err(EventError::UnknownShape);
        };

        let is_native = ["eventId", "event_id", "reportText", "report_text"]
            .iter()
            .any(|k| object.contains_key(*k));
        if is_native {
            let native: NativeEvent = serde_json::from_value(value)?;
            return Self::from_native(native, config);
        }
        if object.contains_key("tool_response") || object.contains_key("tool_input") {
            return Self::from_host(&value, config);
        }
        Err(EventError::UnknownShape)
    }

    fn from_native(native: NativeEvent, config: &Config) -> Result<Self, EventError> {
        let event_id = EventId::parse(&native.event_id).ok_or(EventError::Invalid {
            field: "eventId",
            reason: "must not be empty".to_string(),
        })?;
        let agent = AgentId::parse(config.alias_for(native.agent.trim())).ok_or(
            EventError::Invalid {
                field: "agent",
                reason: "must not be empty".to_string(),
            },
        )?;
        Ok(Self {
            event_id,
            agent,
            report_text: native.report_text,
            timestamp: native.timestamp,
        })
    }

    fn from_host(value: &Value, config: &Config) -> Result<Self, EventError> {
        let tool_input = embedded_object(value.get("tool_input"));
        let tool_response = embedded_object(value.get("tool_response"));

        let subagent = tool_input
            .as_ref()
            .and_then(|v| v.get("subagent_type"))
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let agent = AgentId::parse(config.alias_for(subagent.trim())).ok_or(EventError::Invalid {
            field: "tool_input.subagent_type",
            reason: "must not be empty".to_string(),
        })?;

        let report_text = tool_response
            .as_ref()
            .map(response_text)
            .or_else(|| value.get("tool_response").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_default();

        let event_id = match value.get("tool_use_id").and_then(Value::as_str) {
            Some(id) if !id.trim().is_empty() => EventId::parse(id),
            _ => {
                let session = value
                    .get("session_id")
                    .and_then(Value::as_str)
                    .filter(|s| !s.trim().is_empty())
                    .ok_or(EventError::Missing("tool_use_id or session_id"))?;
                let digest = hex::encode(Sha256::digest(report_text.as_bytes()));
                EventId::parse(&format!("{}-{}", session.trim(), &digest[..16]))
            }
        }
        .ok_or(EventError::Missing("tool_use_id or session_id"))?;

        Ok(Self {
            event_id,
            agent,
            report_text,
            timestamp: None,
        })
    }
}

/// Hook payloads sometimes carry nested objects as JSON strings.
fn embedded_object(value: Option<&Value>) -> Option<Value> {
    match value? {
        Value::Object(_) => value.cloned(),
        Value::String(s) => serde_json::from_str::<Value>(s)
            .ok()
            .filter(Value::is_object),
        _ => None,
    }
}

fn response_text(response: &Value) -> String {
    let blocks: Vec<&str> = response
        .get("content")
        .and_then(Value::as_array)
        .map(|content| {
            content
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();
    if !blocks.is_empty() {
        return blocks.join("\n");
    }
    RESPONSE_FALLBACK_KEYS
        .iter()
        .filter_map(|k| response.get(*k).and_then(Value::as_str))
        .find(|s| !s.is_empty())
        .unwrap_or_default()
        .to_string()
}
