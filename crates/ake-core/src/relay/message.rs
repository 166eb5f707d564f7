//! Addressed messages between workers.

use ake_common::{AgentId, EventId, MessageId};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::LazyLock;

/// `@target: body`, one message per line.
static MESSAGE_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*@([A-Za-z0-9][A-Za-z0-9_.-]*)\s*:\s*(\S.*?)\s*$").expect("regex")
});

/// A message addressed from one worker to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub from: AgentId,
    pub to: AgentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    pub body: String,
    #[serde(default)]
    pub delivered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    /// Set when the recipient acknowledges the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn new(
        from: AgentId,
        to: AgentId,
        event_id: &EventId,
        timestamp: Option<DateTime<Utc>>,
        body: &str,
    ) -> Self {
        let body = body.trim().to_string();
        Self {
            id: MessageId::derive(&from, &to, timestamp.as_ref(), event_id, &body),
            from,
            to,
            timestamp,
            body,
            delivered: false,
            delivered_at: None,
            read_at: None,
        }
    }

    pub fn is_read(&self) -> bool {
        self.read_at.is_some()
    }
}

/// Parse a single line as a message, if it is one.
pub fn parse_message_line(line: &str) -> Option<(AgentId, String)> {
    let caps = MESSAGE_LINE_RE.captures(line)?;
    let to = AgentId::parse(caps.get(1)?.as_str())?;
    Some((to, caps.get(2)?.as_str().to_string()))
}

/// Extract all messages from `report_text`, in text order.
///
/// Repeated identical lines yield one message, since they share an id.
pub fn extract_messages(
    report_text: &str,
    from: &AgentId,
    event_id: &EventId,
    timestamp: Option<DateTime<Utc>>,
) -> Vec<Message> {
    let mut seen = HashSet::new();
    report_text
        .lines()
        .filter_map(parse_message_line)
        .map(|(to, body)| Message::new(from.clone(), to, event_id, timestamp, &body))
        .filter(|m| seen.insert(m.id.clone()))
        .collect()
}
