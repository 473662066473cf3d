use serde::{Deserialize, Serialize};

use crate::models::{Conversation, Message, MessageContent};
use crate::types::{ConversationId, PresenceStatus, UserId};

/// Events pushed by the server over the socket.
///
/// The set is closed: frames with an unknown `type` tag fail to decode and
/// are dropped at the link, so handlers for these variants are total.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "SERVER:NEW_MESSAGE", rename_all = "camelCase")]
    NewMessage {
        conversation_id: ConversationId,
        message: Message,
    },

    #[serde(rename = "SERVER:CONVERSATION_UPDATED", rename_all = "camelCase")]
    ConversationUpdated { conversation: Conversation },

    #[serde(rename = "SERVER:USER_STATUS", rename_all = "camelCase")]
    UserStatus {
        user_id: UserId,
        status: PresenceStatus,
    },
}

/// Subscription key for a [`ServerEvent`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerEventKind {
    NewMessage,
    ConversationUpdated,
    UserStatus,
}

impl ServerEventKind {
    pub const ALL: [ServerEventKind; 3] = [
        ServerEventKind::NewMessage,
        ServerEventKind::ConversationUpdated,
        ServerEventKind::UserStatus,
    ];
}

impl ServerEvent {
    pub fn kind(&self) -> ServerEventKind {
        match self {
            ServerEvent::NewMessage { .. } => ServerEventKind::NewMessage,
            ServerEvent::ConversationUpdated { .. } => ServerEventKind::ConversationUpdated,
            ServerEvent::UserStatus { .. } => ServerEventKind::UserStatus,
        }
    }

    /// Decode a text frame into a server event.
    pub fn from_frame(frame: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(frame)
    }

    /// Encode as a text frame.
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Events the client sends to the server over the socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "CLIENT:SEND_MESSAGE", rename_all = "camelCase")]
    SendMessage {
        conversation_id: ConversationId,
        content: MessageContent,
        /// Echoed back by the server on the resulting message so the
        /// sender can confirm its optimistic copy.
        client_tag: String,
    },

    #[serde(rename = "CLIENT:TYPING_START", rename_all = "camelCase")]
    TypingStart {
        conversation_id: ConversationId,
        user: UserId,
    },

    #[serde(rename = "CLIENT:TYPING_STOP", rename_all = "camelCase")]
    TypingStop {
        conversation_id: ConversationId,
        user: UserId,
    },
}

impl ClientEvent {
    pub fn from_frame(frame: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(frame)
    }

    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
