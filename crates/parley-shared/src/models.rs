//! Domain model structs mirrored from the server.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to a UI layer; field names follow the server's camelCase wire
//! shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    ContentKind, ConversationId, ConversationKind, DeliveryState, MessageId, UserId,
};

// ---------------------------------------------------------------------------
// Participant
// ---------------------------------------------------------------------------

/// A user's membership in a conversation, including their read marker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Timestamp of the newest message this participant has read.
    pub last_read_timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Message content
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageContent {
    #[serde(rename = "type")]
    pub kind: ContentKind,
    pub text: String,
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: ContentKind::Text,
            text: text.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A single chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub sender_name: String,
    pub content: MessageContent,
    pub timestamp: DateTime<Utc>,
    /// Correlation tag generated by the sending client and echoed back by
    /// the server; used to confirm optimistic sends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_tag: Option<String>,
    /// Client-local delivery state; not part of the wire shape.
    #[serde(skip)]
    pub delivery: DeliveryState,
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// A conversation summary as held in the conversation store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    #[serde(rename = "type")]
    pub kind: ConversationKind,
    #[serde(default)]
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub last_message: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Conversation {
    /// Find the participant entry for `user`.
    pub fn participant(&self, user: &UserId) -> Option<&Participant> {
        self.participants.iter().find(|p| &p.user_id == user)
    }

    /// A conversation is unread for `user` when its last message is newer
    /// than that user's read marker.
    pub fn unread_for(&self, user: &UserId) -> bool {
        let Some(last) = &self.last_message else {
            return false;
        };
        match self.participant(user) {
            Some(p) => last.timestamp > p.last_read_timestamp,
            None => false,
        }
    }
}
