use thiserror::Error;

use crate::types::{ConversationId, MessageId};

/// User-facing fault state surfaced through the engine snapshot.
///
/// Faults are advisory: each one is cleared by the next successful
/// operation of the same kind, and a fault never blocks further actions.
/// Canceled or superseded fetches are not faults and never appear here.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncFault {
    /// A fetch succeeded at the transport level but its payload shape
    /// could not be normalized.
    #[error("server response could not be interpreted: {0}")]
    MalformedResponse(String),

    /// An action requiring a live session or socket was invoked without
    /// one; no network call was attempted.
    #[error("action requires a logged-in identity and a connected socket")]
    AuthOrConnectivity,

    /// A referenced conversation no longer resolves on the server.
    #[error("conversation {0} no longer exists")]
    NotFound(ConversationId),

    /// An outbound message could not be delivered; the message entry is
    /// kept in the store as failed so the UI can offer retry.
    #[error("message {0} could not be delivered")]
    SendFailed(MessageId),

    /// A fetch failed after local retries were exhausted.
    #[error("request failed: {0}")]
    FetchFailed(String),

    /// The transport exhausted its reconnection attempts.
    #[error("connection lost and retry attempts exhausted")]
    ConnectionFailed,
}
