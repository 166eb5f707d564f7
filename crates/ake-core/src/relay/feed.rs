//! Bounded shared-knowledge feed.
//!
//! A FIFO ring buffer of short snippets (messages and learnings) visible to
//! every agent. When full, the oldest entry is evicted. An entry whose
//! `source_id` is already in the buffer is not appended again, so
//! re-processing a report leaves the feed unchanged.

use super::learning::LearningCategory;
use crate::storage::{StorageError, Store, StoreKey};
use ake_common::schema::default_schema_version;
use ake_common::AgentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::debug;

/// Entries shown per category in an injected context block.
pub const INJECT_PER_CATEGORY: usize = 3;

/// One feed entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedEntry {
    pub date: DateTime<Utc>,
    pub agent: AgentId,
    pub learning_snippet: String,
    /// Message id or learning digest; the dedup key.
    pub source_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<LearningCategory>,
}

/// Result of pushing one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedPush {
    Duplicate,
    Appended { evicted: usize },
}

/// The on-disk feed record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedKnowledgeFeed {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    #[serde(default)]
    entries: VecDeque<FeedEntry>,
}

impl Default for SharedKnowledgeFeed {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            entries: VecDeque::new(),
        }
    }
}

impl SharedKnowledgeFeed {
    /// Entries, oldest first.
    pub fn entries(&self) -> impl Iterator<Item = &FeedEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, source_id: &str) -> bool {
        self.entries.iter().any(|e| e.source_id == source_id)
    }

    /// Append `entry`, evicting from the front until `capacity` holds.
    pub fn push(&mut self, entry: FeedEntry, capacity: usize) -> FeedPush {
        if self.contains(&entry.source_id) {
            return FeedPush::Duplicate;
        }
        self.entries.push_back(entry);
        let mut evicted = 0;
        while self.entries.len() > capacity.max(1) {
            self.entries.pop_front();
            evicted += 1;
        }
        FeedPush::Appended { evicted }
    }

    /// Render as a `<shared-agent-context>` block for prompt injection.
    ///
    /// Entries are grouped by category (uncategorized entries last) and only
    /// the newest [`INJECT_PER_CATEGORY`] of each group are shown. An empty
    /// feed renders as an empty string.
    pub fn render_injection(&self) -> String {
        if self.entries.is_empty() {
            return String::new();
        }
        let groups = LearningCategory::ALL
            .into_iter()
            .map(Some)
            .chain(std::iter::once(None));

        let mut lines = vec![
            "<shared-agent-context>".to_string(),
            "The following context was shared by other agents:".to_string(),
            String::new(),
        ];
        for group in groups {
            let items: Vec<&FeedEntry> = self
                .entries
                .iter()
                .filter(|e| e.category == group)
                .collect();
            if items.is_empty() {
                continue;
            }
            let label = group.map(|c| c.as_str()).unwrap_or("note");
            lines.push(format!("{}:", label.to_uppercase()));
            let skip = items.len().saturating_sub(INJECT_PER_CATEGORY);
            for item in &items[skip..] {
                lines.push(format!("  - [{}]: {}", item.agent, item.learning_snippet));
            }
            lines.push(String::new());
        }
        lines.push("</shared-agent-context>".to_string());
        lines.join("\n")
    }
}

/// Counts from one batch append.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FeedAppendReport {
    pub appended: usize,
    pub duplicates: usize,
    pub evicted: usize,
}

/// Feed access over the store.
#[derive(Debug, Clone)]
pub struct FeedStore {
    store: Store,
    capacity: usize,
}

impl FeedStore {
    pub fn new(store: Store, capacity: usize) -> Self {
        Self { store, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn load(&self) -> Result<SharedKnowledgeFeed, StorageError> {
        Ok(self
            .store
            .load(&StoreKey::shared_knowledge())?
            .unwrap_or_default())
    }

    /// Append a batch in one commit, preserving batch order.
    pub fn append(&self, entries: Vec<FeedEntry>) -> Result<FeedAppendReport, StorageError> {
        if entries.is_empty() {
            return Ok(FeedAppendReport::default());
        }
        let capacity = self.capacity;
        let report = self.store.commit_atomic(
            &StoreKey::shared_knowledge(),
            |slot: &mut Option<SharedKnowledgeFeed>| {
                let feed = slot.get_or_insert_with(SharedKnowledgeFeed::default);
                let mut report = FeedAppendReport::default();
                for entry in entries {
                    match feed.push(entry, capacity) {
                        FeedPush::Duplicate => report.duplicates += 1,
                        FeedPush::Appended { evicted } => {
                            report.appended += 1;
                            report.evicted += evicted;
                        }
                    }
                }
                Ok::<_, StorageError>(report)
            },
        )?;
        debug!(appended = report.appended, evicted = report.evicted, "feed updated");
        Ok(report)
    }
}
