//! Cross-agent message relay and shared-knowledge feed.
//!
//! Delivery is idempotent by message id: the recipient inbox is checked and
//! appended under that inbox's lock, so re-delivering a report's messages
//! is a no-op. Feed entries are keyed by message id or learning digest and
//! are deduplicated the same way.

pub mod feed;
pub mod inbox;
pub mod learning;
pub mod message;

pub use feed::{FeedAppendReport, FeedEntry, FeedStore, SharedKnowledgeFeed};
pub use inbox::{InboxError, InboxRecord, InboxResponse, InboxStore};
pub use learning::{detect_category, extract_learnings, truncate_snippet, Learning, LearningCategory};
pub use message::{extract_messages, Message};

use crate::storage::{StorageError, Store};
use ake_common::{AgentId, MessageId};
use ake_config::RelaySettings;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Inbox(#[from] InboxError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<RelayError> for ake_common::Error {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::Inbox(e) => e.into(),
            RelayError::Storage(e) => e.into(),
        }
    }
}

/// What one `deliver` call did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeliveryReport {
    /// Newly appended to an inbox by this call.
    pub delivered: Vec<MessageId>,
    /// Already present in the recipient inbox.
    pub skipped: Vec<MessageId>,
    pub feed: FeedAppendReport,
}

/// Delivers messages and learnings.
#[derive(Debug, Clone)]
pub struct MessageRelay {
    inboxes: InboxStore,
    feed: FeedStore,
    snippet_max_chars: usize,
}

impl MessageRelay {
    pub fn new(store: Store, settings: &RelaySettings) -> Self {
        Self {
            inboxes: InboxStore::new(store.clone()),
            feed: FeedStore::new(store, settings.feed_capacity),
            snippet_max_chars: settings.snippet_max_chars,
        }
    }

    pub fn inboxes(&self) -> &InboxStore {
        &self.inboxes
    }

    pub fn feed(&self) -> &FeedStore {
        &self.feed
    }

    /// Deliver `messages` in order, marking each one delivered.
    ///
    /// Every message also yields a feed entry; entries already in the feed
    /// are skipped there, so a retried run that delivered some messages
    /// before failing still completes the feed.
    pub fn deliver(&self, messages: &mut [Message]) -> Result<DeliveryReport, RelayError> {
        let mut report = DeliveryReport::default();
        let now = Utc::now();
        let mut entries = Vec::with_capacity(messages.len());

        for message in messages.iter_mut() {
            let (stored, appended) = self.inboxes.append_if_absent(message, now)?;
            message.delivered = true;
            message.delivered_at = stored.delivered_at;
            if appended {
                debug!(id = %message.id, to = %message.to, "message delivered");
                report.delivered.push(message.id.clone());
            } else {
                debug!(id = %message.id, to = %message.to, "message already delivered");
                report.skipped.push(message.id.clone());
            }

            entries.push(FeedEntry {
                date: message.timestamp.unwrap_or(now),
                agent: message.from.clone(),
                learning_snippet: truncate_snippet(
                    &format!("@{}: {}", message.to, message.body),
                    self.snippet_max_chars,
                ),
                source_id: message.id.to_string(),
                category: detect_category(&message.body),
            });
        }

        report.feed = self.feed.append(entries)?;
        if !report.delivered.is_empty() {
            info!(
                delivered = report.delivered.len(),
                skipped = report.skipped.len(),
                "messages relayed"
            );
        }
        Ok(report)
    }

    /// Append learnings reported by `agent` to the shared feed.
    pub fn share_learnings(
        &self,
        agent: &AgentId,
        learnings: &[Learning],
        at: DateTime<Utc>,
    ) -> Result<FeedAppendReport, RelayError> {
        let entries = learnings
            .iter()
            .map(|learning| FeedEntry {
                date: at,
                agent: agent.clone(),
                learning_snippet: truncate_snippet(&learning.text, self.snippet_max_chars),
                source_id: learning.source_id(),
                category: learning.category,
            })
            .collect();
        Ok(self.feed.append(entries)?)
    }
}
