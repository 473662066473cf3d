//! # parley-shared
//!
//! Types shared by every Parley crate: domain models, the socket wire
//! protocol, the engine fault taxonomy, the authenticated-identity record,
//! and tunable constants.

pub mod constants;
pub mod error;
pub mod identity;
pub mod models;
pub mod protocol;
pub mod types;

pub use error::SyncFault;
pub use identity::AuthIdentity;
pub use models::{Conversation, Message, MessageContent, Participant};
pub use protocol::{ClientEvent, ServerEvent, ServerEventKind};
pub use types::{
    ContentKind, ConversationId, ConversationKind, DeliveryState, MessageId, PresenceStatus,
    UserId,
};
