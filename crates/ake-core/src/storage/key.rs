//! Store keys and the on-disk layout they map to.
//!
//! ```text
//! <root>/
//! ├── patterns/<fingerprint>.record
//! ├── inboxes/<agent>.record
//! ├── shared-knowledge.record
//! ├── capabilities/<slug>/artifact
//! ├── processed-events/<eventId>.marker
//! └── logs/errors/<eventId>.json
//! ```

use ake_common::{AgentId, EventId, Fingerprint};
use std::fmt;
use std::path::PathBuf;

pub const PATTERNS_DIR: &str = "patterns";
pub const INBOXES_DIR: &str = "inboxes";
pub const CAPABILITIES_DIR: &str = "capabilities";
pub const PROCESSED_DIR: &str = "processed-events";
pub const ERROR_LOG_DIR: &str = "logs/errors";
pub const SHARED_KNOWLEDGE_FILE: &str = "shared-knowledge.record";
pub const RECORD_EXT: &str = "record";
pub const MARKER_EXT: &str = "marker";
pub const ARTIFACT_FILE: &str = "artifact";

/// Relative location of one record inside the store.
///
/// Keys are only built from validated identifiers, so they never contain
/// `..` or absolute components.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreKey(String);

impl StoreKey {
    pub fn pattern(fingerprint: &Fingerprint) -> Self {
        StoreKey(format!("{PATTERNS_DIR}/{fingerprint}.{RECORD_EXT}"))
    }

    pub fn inbox(agent: &AgentId) -> Self {
        StoreKey(format!(
            "{INBOXES_DIR}/{}.{RECORD_EXT}",
            agent.storage_component()
        ))
    }

    pub fn shared_knowledge() -> Self {
        StoreKey(SHARED_KNOWLEDGE_FILE.to_string())
    }

    /// Capability artifacts are keyed by the slug of the pattern name, which
    /// is the pattern fingerprint.
    pub fn capability(slug: &Fingerprint) -> Self {
        StoreKey(format!("{CAPABILITIES_DIR}/{slug}/{ARTIFACT_FILE}"))
    }

    pub fn processed_event(event_id: &EventId) -> Self {
        StoreKey(format!(
            "{PROCESSED_DIR}/{}.{MARKER_EXT}",
            event_id.storage_component()
        ))
    }

    /// Error log for an invocation; `component` must already be path-safe.
    pub fn error_log(component: &str) -> Self {
        StoreKey(format!(
            "{ERROR_LOG_DIR}/{}.json",
            ake_common::safe_component(component)
        ))
    }

    pub(crate) fn from_relative(relative: String) -> Self {
        StoreKey(relative)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn relative_path(&self) -> PathBuf {
        self.0.split('/').collect()
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
