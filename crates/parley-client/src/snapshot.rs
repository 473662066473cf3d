//! Read-only view of the engine state, handed to the UI layer.

use std::collections::HashMap;

use parley_shared::identity::AuthIdentity;
use parley_shared::models::{Conversation, Message};
use parley_shared::types::{ConversationId, PresenceStatus, UserId};
use parley_shared::SyncFault;

/// Which asynchronous operations are currently in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadingFlags {
    pub conversations: bool,
    pub messages: bool,
    pub creating_dm: bool,
}

/// A point-in-time copy of the engine state. Cheap to take and always
/// readable without blocking on network work.
#[derive(Debug, Clone)]
pub struct EngineSnapshot {
    pub identity: Option<AuthIdentity>,
    /// Conversations in most-recently-updated-first order.
    pub conversations: Vec<Conversation>,
    pub active_conversation: Option<ConversationId>,
    /// Messages of the active conversation, ascending by timestamp.
    pub messages: Vec<Message>,
    pub socket_connected: bool,
    pub presence: HashMap<UserId, PresenceStatus>,
    pub loading: LoadingFlags,
    pub fault: Option<SyncFault>,
}
