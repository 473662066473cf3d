//! In-memory store of conversation summaries.
//!
//! Iteration order is most-recently-updated first: any conversation that
//! receives a message or an update moves to the front. The server's order
//! is taken as-is on a full replace.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use parley_shared::models::{Conversation, Message};
use parley_shared::types::{ConversationId, UserId};

use crate::error::Result;
use crate::normalize;

/// Outcome of patching a conversation's last message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    /// The conversation was known and updated.
    Updated,
    /// The conversation has never been seen; the caller should refetch the
    /// full list rather than drop the event.
    Unknown,
}

#[derive(Debug, Clone, Default)]
pub struct ConversationStore {
    entries: Vec<Conversation>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole list from a raw fetch payload.
    ///
    /// Fails closed: if no array can be extracted the store is left
    /// unchanged and the error surfaced. Duplicate ids keep the first
    /// occurrence.
    pub fn replace_all(&mut self, payload: &Value) -> Result<usize> {
        let list = normalize::extract_conversations(payload)?;
        let mut entries: Vec<Conversation> = Vec::with_capacity(list.len());
        for convo in list {
            if entries.iter().any(|c| c.id == convo.id) {
                debug!(conversation = %convo.id, "dropping duplicate id in fetched list");
                continue;
            }
            entries.push(convo);
        }
        self.entries = entries;
        Ok(self.entries.len())
    }

    /// Insert or replace a conversation and move it to the front.
    pub fn upsert(&mut self, conversation: Conversation) {
        self.entries.retain(|c| c.id != conversation.id);
        self.entries.insert(0, conversation);
    }

    /// Merge `message` into the conversation's `last_message` and move the
    /// conversation to the front.
    pub fn patch_last_message(
        &mut self,
        conversation_id: &ConversationId,
        message: Message,
    ) -> PatchOutcome {
        let Some(index) = self.entries.iter().position(|c| &c.id == conversation_id) else {
            return PatchOutcome::Unknown;
        };
        let mut convo = self.entries.remove(index);
        convo.updated_at = Some(message.timestamp);
        convo.last_message = Some(message);
        self.entries.insert(0, convo);
        PatchOutcome::Updated
    }

    /// Update `user`'s read marker on a conversation. Returns `false` if
    /// the conversation or participant is unknown.
    pub fn mark_read(
        &mut self,
        conversation_id: &ConversationId,
        user: &UserId,
        timestamp: DateTime<Utc>,
    ) -> bool {
        let Some(convo) = self.entries.iter_mut().find(|c| &c.id == conversation_id) else {
            return false;
        };
        match convo.participants.iter_mut().find(|p| &p.user_id == user) {
            Some(p) => {
                p.last_read_timestamp = timestamp;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &ConversationId) -> Option<&Conversation> {
        self.entries.iter().find(|c| &c.id == id)
    }

    pub fn contains(&self, id: &ConversationId) -> bool {
        self.get(id).is_some()
    }

    /// Conversations in most-recently-updated-first order.
    pub fn iter(&self) -> impl Iterator<Item = &Conversation> {
        self.entries.iter()
    }

    pub fn to_vec(&self) -> Vec<Conversation> {
        self.entries.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// JSON snapshot of the list, for the durable cached-snapshot key.
    pub fn snapshot_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.entries)?)
    }

    /// Restore a previously snapshotted list. Best-effort UX only; the
    /// next authoritative fetch replaces it wholesale.
    pub fn restore(&mut self, entries: Vec<Conversation>) {
        self.entries = entries;
    }
}
