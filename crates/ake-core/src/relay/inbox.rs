//! Per-agent inboxes.
//!
//! Each agent has one inbox record holding every message ever delivered to
//! it, in delivery order. Messages are never removed; acknowledging one only
//! sets its `read_at`.

use super::message::Message;
use crate::storage::key::{INBOXES_DIR, RECORD_EXT};
use crate::storage::{StorageError, Store, StoreKey};
use ake_common::schema::{default_schema_version, SCHEMA_VERSION};
use ake_common::{AgentId, MessageId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from inbox operations.
#[derive(Debug, Error)]
pub enum InboxError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("message {message} not found in inbox of {agent}")]
    MessageNotFound { agent: AgentId, message: String },
}

impl From<InboxError> for ake_common::Error {
    fn from(err: InboxError) -> Self {
        match err {
            InboxError::Storage(e) => e.into(),
            InboxError::MessageNotFound { agent, message } => {
                ake_common::Error::NotFound(format!("message {message} in inbox of {agent}"))
            }
        }
    }
}

/// On-disk inbox of one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboxRecord {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    pub agent: AgentId,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl InboxRecord {
    pub fn new(agent: AgentId) -> Self {
        Self {
            schema_version: default_schema_version(),
            agent,
            messages: Vec::new(),
        }
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.messages.iter().any(|m| &m.id == id)
    }
}

/// Response for inbox listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxResponse {
    pub schema_version: String,
    pub generated_at: String,
    pub agent: AgentId,
    pub messages: Vec<Message>,
    /// Count of messages without `read_at`.
    pub unread_count: u32,
}

impl InboxResponse {
    pub fn new(agent: AgentId, messages: Vec<Message>) -> Self {
        let unread_count = messages.iter().filter(|m| !m.is_read()).count() as u32;
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            generated_at: Utc::now().to_rfc3339(),
            agent,
            messages,
            unread_count,
        }
    }
}

/// Inbox access over the store.
#[derive(Debug, Clone)]
pub struct InboxStore {
    store: Store,
}

impl InboxStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// All messages for `agent`, in delivery order.
    pub fn list(&self, agent: &AgentId) -> Result<Vec<Message>, InboxError> {
        Ok(self
            .store
            .load::<InboxRecord>(&StoreKey::inbox(agent))?
            .map(|r| r.messages)
            .unwrap_or_default())
    }

    /// Messages not yet acknowledged.
    pub fn list_unread(&self, agent: &AgentId) -> Result<Vec<Message>, InboxError> {
        let messages = self.list(agent)?;
        Ok(messages.into_iter().filter(|m| !m.is_read()).collect())
    }

    /// Agents that have an inbox.
    pub fn agents(&self) -> Result<Vec<AgentId>, InboxError> {
        let mut agents = Vec::new();
        for key in self.store.list(INBOXES_DIR, RECORD_EXT)? {
            if let Some(record) = self.store.load::<InboxRecord>(&key)? {
                agents.push(record.agent);
            }
        }
        Ok(agents)
    }

    /// Append `message` unless a message with the same id is present.
    ///
    /// Returns the stored message and whether it was appended by this call.
    pub fn append_if_absent(
        &self,
        message: &Message,
        at: DateTime<Utc>,
    ) -> Result<(Message, bool), InboxError> {
        let key = StoreKey::inbox(&message.to);
        self.store.commit_atomic(&key, |slot: &mut Option<InboxRecord>| {
            let record = slot.get_or_insert_with(|| InboxRecord::new(message.to.clone()));
            if let Some(existing) = record.messages.iter().find(|m| m.id == message.id) {
                return Ok((existing.clone(), false));
            }
            let mut delivered = message.clone();
            delivered.delivered = true;
            delivered.delivered_at = Some(at);
            record.messages.push(delivered.clone());
            Ok::<_, InboxError>((delivered, true))
        })
    }

    /// Mark a message as read. Acknowledging twice keeps the first `read_at`.
    pub fn acknowledge(&self, agent: &AgentId, id: &MessageId) -> Result<Message, InboxError> {
        let not_found = || InboxError::MessageNotFound {
            agent: agent.clone(),
            message: id.to_string(),
        };
        self.store
            .commit_atomic(&StoreKey::inbox(agent), |slot: &mut Option<InboxRecord>| {
                let record = slot.as_mut().ok_or_else(not_found)?;
                let message = record
                    .messages
                    .iter_mut()
                    .find(|m| &m.id == id)
                    .ok_or_else(not_found)?;
                if message.read_at.is_none() {
                    message.read_at = Some(Utc::now());
                }
                Ok(message.clone())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ake_common::EventId;
    use ake_config::LockSettings;
    use tempfile::TempDir;

    fn test_store() -> (InboxStore, TempDir) {
        let tmp = TempDir::new().unwrap();
        let store = InboxStore::new(Store::new(tmp.path(), LockSettings::default()));
        (store, tmp)
    }

    fn msg(to: &str, body: &str) -> Message {
        Message::new(
            AgentId::parse("scout").unwrap(),
            AgentId::parse(to).unwrap(),
            &EventId::parse("evt-1").unwrap(),
            None,
            body,
        )
    }

    #[test]
    fn test_empty_inbox() {
        let (store, _tmp) = test_store();
        let kai = AgentId::parse("kai").unwrap();
        assert!(store.list(&kai).unwrap().is_empty());
        assert!(store.agents().unwrap().is_empty());
    }

    #[test]
    fn test_append_and_list() {
        let (store, _tmp) = test_store();
        let m = msg("kai", "check the new endpoint");
        let (stored, appended) = store.append_if_absent(&m, Utc::now()).unwrap();
        assert!(appended);
        assert!(stored.delivered);
        assert!(stored.delivered_at.is_some());

        let kai = AgentId::parse("kai").unwrap();
        let items = store.list(&kai).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, m.id);
        assert_eq!(store.agents().unwrap(), vec![kai]);
    }

    #[test]
    fn test_append_is_idempotent_by_id() {
        let (store, _tmp) = test_store();
        let m = msg("kai", "check the new endpoint");
        let (first, _) = store.append_if_absent(&m, Utc::now()).unwrap();
        let (second, appended) = store.append_if_absent(&m, Utc::now()).unwrap();
        assert!(!appended);
        assert_eq!(first.delivered_at, second.delivered_at);
        assert_eq!(store.list(&m.to).unwrap().len(), 1);
    }

    #[test]
    fn test_acknowledge() {
        let (store, _tmp) = test_store();
        let m1 = msg("vera", "first");
        let m2 = msg("vera", "second");
        store.append_if_absent(&m1, Utc::now()).unwrap();
        store.append_if_absent(&m2, Utc::now()).unwrap();

        let acked = store.acknowledge(&m1.to, &m1.id).unwrap();
        assert!(acked.read_at.is_some());

        let unread = store.list_unread(&m1.to).unwrap();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].id, m2.id);
        // Nothing is removed.
        assert_eq!(store.list(&m1.to).unwrap().len(), 2);
    }

    #[test]
    fn test_acknowledge_unknown_message() {
        let (store, _tmp) = test_store();
        let m = msg("kai", "hello there");
        let err = store.acknowledge(&m.to, &m.id).unwrap_err();
        assert!(matches!(err, InboxError::MessageNotFound { .. }));
    }

    #[test]
    fn test_inbox_response() {
        let mut m1 = msg("kai", "one");
        m1.read_at = Some(Utc::now());
        let m2 = msg("kai", "two");
        let response = InboxResponse::new(AgentId::parse("kai").unwrap(), vec![m1, m2]);
        assert_eq!(response.messages.len(), 2);
        assert_eq!(response.unread_count, 1);
    }
}
