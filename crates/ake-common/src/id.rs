//! Pattern, event, agent, and message identity types.
//!
//! Every identifier here ends up as a path component in the on-disk store,
//! so each type also knows how to render itself safely for that purpose.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Longest fingerprint kept verbatim; longer names get a digest suffix.
const MAX_FINGERPRINT_LEN: usize = 96;

/// Longest raw identifier used verbatim as a storage path component.
const MAX_COMPONENT_LEN: usize = 128;

/// Hex prefix of a sha256 digest.
fn digest_prefix(input: &[u8], chars: usize) -> String {
    let digest = hex::encode(Sha256::digest(input));
    digest[..chars.min(digest.len())].to_string()
}

/// Render an arbitrary identifier as a single, traversal-free path component.
///
/// Identifiers made only of `[A-Za-z0-9._-]` (and not `.`/`..`) pass through
/// unchanged; anything else is replaced by a digest so distinct inputs stay
/// distinct.
pub fn safe_component(raw: &str) -> String {
    let is_plain = !raw.is_empty()
        && raw.len() <= MAX_COMPONENT_LEN
        && raw != "."
        && raw != ".."
        && !raw.starts_with('.')
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if is_plain {
        raw.to_string()
    } else {
        format!("h-{}", digest_prefix(raw.as_bytes(), 32))
    }
}

/// Stable pattern key derived from a normalized name.
///
/// Normalization lowercases, collapses runs of whitespace and hyphens into
/// one `-`: `"Debug  Memory Leak"` becomes `debug-memory-leak`. Any other
/// character is significant. Names that contain one get a readable ASCII
/// slug plus a digest of the normalized name, so `"C++ tuning"` and
/// `"C tuning"` stay distinct patterns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Derive the fingerprint for a pattern name.
    ///
    /// Returns `None` when the name contains no alphanumeric character at all.
    pub fn from_name(name: &str) -> Option<Self> {
        if !name.chars().any(char::is_alphanumeric) {
            return None;
        }
        let lowered = name.to_lowercase();
        let normalized = lowered
            .split(|c: char| c.is_whitespace() || c == '-')
            .filter(|w| !w.is_empty())
            .collect::<Vec<_>>()
            .join("-");

        let plain = normalized
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-');
        if plain && normalized.len() <= MAX_FINGERPRINT_LEN {
            return Some(Fingerprint(normalized));
        }

        let slug: String = normalized
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        let slug = collapse_hyphens(&slug);

        // Names written in non-ASCII scripts keep a stable, unique key.
        let letters = normalized.chars().filter(|c| *c != '-').count();
        let ascii = slug.chars().filter(|c| *c != '-').count();
        if ascii == 0 || ascii * 2 < letters {
            return Some(Fingerprint(format!(
                "p-{}",
                digest_prefix(normalized.as_bytes(), 16)
            )));
        }

        let head = slug[..slug.len().min(MAX_FINGERPRINT_LEN)].trim_end_matches('-');
        Some(Fingerprint(format!(
            "{}-{}",
            head,
            digest_prefix(normalized.as_bytes(), 8)
        )))
    }

    /// Accept an already-normalized fingerprint (e.g. from the CLI).
    pub fn parse(s: &str) -> Option<Self> {
        let valid = !s.is_empty()
            && !s.starts_with('-')
            && !s.ends_with('-')
            && s.chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
        valid.then(|| Fingerprint(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn collapse_hyphens(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c == '-' && (out.is_empty() || out.ends_with('-')) {
            continue;
        }
        out.push(c);
    }
    out.trim_end_matches('-').to_string()
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one worker-completion event, supplied by the trigger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    pub fn parse(s: &str) -> Option<Self> {
        let trimmed = s.trim();
        (!trimmed.is_empty()).then(|| EventId(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path component used for markers and error logs.
    pub fn storage_component(&self) -> String {
        safe_component(&self.0)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque worker identifier, case-folded so `@Kai` and `kai` share an inbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn parse(s: &str) -> Option<Self> {
        let normalized = s.trim().trim_start_matches('@').trim().to_lowercase();
        (!normalized.is_empty()).then_some(AgentId(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path component used for the agent's inbox record.
    pub fn storage_component(&self) -> String {
        safe_component(&self.0)
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content-derived message identifier.
///
/// Format: `msg-<16 hex>` over `(from, to, timestamp, sha256(body))`, so
/// re-parsing the same report always yields the same id. Without a timestamp
/// the carrying event id stands in for it: a retry of one event reproduces
/// the id, while the same line sent in a later event is a new message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn derive(
        from: &AgentId,
        to: &AgentId,
        timestamp: Option<&DateTime<Utc>>,
        event_id: &EventId,
        body: &str,
    ) -> Self {
        let body_hash = hex::encode(Sha256::digest(body.as_bytes()));
        let ts = match timestamp {
            Some(t) => t.to_rfc3339_opts(SecondsFormat::Millis, true),
            None => format!("event:{event_id}"),
        };
        let mut hasher = Sha256::new();
        for part in [from.as_str(), to.as_str(), ts.as_str(), body_hash.as_str()] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        let digest = hex::encode(hasher.finalize());
        MessageId(format!("msg-{}", &digest[..16]))
    }

    pub fn parse(s: &str) -> Option<Self> {
        (s.starts_with("msg-") && s.len() > 4).then(|| MessageId(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
