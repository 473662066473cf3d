//! In-memory store of the active conversation's messages.
//!
//! Exactly one conversation is active at a time. Switching conversations
//! clears the store before the new history is fetched, so stale messages
//! are never shown against the new id. Messages are kept in ascending
//! timestamp order with unique ids.

use serde_json::Value;
use tracing::debug;

use parley_shared::models::Message;
use parley_shared::types::{ConversationId, DeliveryState, MessageId};

use crate::error::Result;
use crate::normalize;

#[derive(Debug, Clone, Default)]
pub struct MessageStore {
    active: Option<ConversationId>,
    messages: Vec<Message>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> Option<&ConversationId> {
        self.active.as_ref()
    }

    /// Switch the active conversation, clearing all held messages first.
    pub fn activate(&mut self, conversation: Option<ConversationId>) {
        self.active = conversation;
        self.messages.clear();
    }

    /// Clear all messages without changing the active conversation.
    pub fn reset(&mut self) {
        self.messages.clear();
    }

    /// Replace the history from a raw fetch payload for the active
    /// conversation. Fails closed; entries for other conversations and
    /// duplicate ids are dropped.
    pub fn replace_all(&mut self, payload: &Value) -> Result<usize> {
        let list = normalize::extract_messages(payload)?;
        let mut messages: Vec<Message> = Vec::with_capacity(list.len());
        for msg in list {
            if Some(&msg.conversation_id) != self.active.as_ref() {
                debug!(message = %msg.id, "dropping fetched message for inactive conversation");
                continue;
            }
            if messages.iter().any(|m| m.id == msg.id) {
                continue;
            }
            messages.push(msg);
        }
        messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        self.messages = messages;
        Ok(self.messages.len())
    }

    /// Append a confirmed message if it belongs to the active conversation;
    /// otherwise a silent no-op. Duplicate ids are dropped.
    pub fn append(&mut self, message: Message) -> bool {
        if Some(&message.conversation_id) != self.active.as_ref() {
            return false;
        }
        if self.messages.iter().any(|m| m.id == message.id) {
            return false;
        }
        self.insert_sorted(message);
        true
    }

    /// Insert an optimistic pending message (local echo at send time).
    /// Gated on the active conversation like [`append`](Self::append).
    pub fn insert_pending(&mut self, message: Message) -> bool {
        if Some(&message.conversation_id) != self.active.as_ref() {
            return false;
        }
        self.insert_sorted(message);
        true
    }

    /// Replace the pending entry carrying `client_tag` with the server's
    /// authoritative message. Returns `false` when no such entry exists
    /// (e.g. the user already switched away).
    pub fn confirm_pending(&mut self, client_tag: &str, authoritative: Message) -> bool {
        let Some(index) = self.messages.iter().position(|m| {
            m.delivery == DeliveryState::Pending && m.client_tag.as_deref() == Some(client_tag)
        }) else {
            return false;
        };
        self.messages.remove(index);
        self.insert_sorted(authoritative);
        true
    }

    /// Mark a message as failed. The entry is kept so the UI can offer
    /// retry.
    pub fn mark_failed(&mut self, id: &MessageId) -> bool {
        match self.messages.iter_mut().find(|m| &m.id == id) {
            Some(m) => {
                m.delivery = DeliveryState::Failed;
                true
            }
            None => false,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn to_vec(&self) -> Vec<Message> {
        self.messages.clone()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn insert_sorted(&mut self, message: Message) {
        let index = self
            .messages
            .iter()
            .rposition(|m| m.timestamp <= message.timestamp)
            .map(|i| i + 1)
            .unwrap_or(0);
        self.messages.insert(index, message);
    }
}
