use serde::{Deserialize, Serialize};

// Server-assigned identifiers are opaque strings; the client never assumes
// a particular format.

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kind of conversation, mirroring the server's enum.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ConversationKind {
    #[serde(rename = "DIRECT")]
    Direct,
    #[serde(rename = "COMMUNITY")]
    Community,
    #[serde(rename = "SESSION")]
    Session,
}

impl ConversationKind {
    /// Wire name, as used in query parameters.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationKind::Direct => "DIRECT",
            ConversationKind::Community => "COMMUNITY",
            ConversationKind::Session => "SESSION",
        }
    }
}

/// The kind of message content.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ContentKind {
    #[serde(rename = "TEXT")]
    Text,
    #[serde(rename = "SYSTEM_NOTIFICATION")]
    SystemNotification,
}

/// Client-local delivery state of a message. Never serialized to the wire;
/// everything that arrives from the server is authoritative and therefore
/// `Confirmed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryState {
    #[default]
    Confirmed,
    Pending,
    Failed,
}

/// Presence of a user as pushed by the server.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PresenceStatus {
    #[serde(rename = "ONLINE")]
    Online,
    #[serde(rename = "OFFLINE")]
    Offline,
}
