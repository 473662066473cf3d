//! # parley-store
//!
//! Client-side state for the synchronization engine: the in-memory
//! conversation and message stores, the durable selection state, and the
//! narrow key-value port used for everything that must survive a reload.
//!
//! The stores are plain synchronous types; the engine crate owns all
//! mutation and wraps them in its own lock.

pub mod conversations;
pub mod messages;
pub mod normalize;
pub mod selection;
pub mod sqlite;
pub mod storage;

mod error;

pub use conversations::{ConversationStore, PatchOutcome};
pub use error::{Result, StoreError};
pub use messages::MessageStore;
pub use selection::SelectionState;
pub use sqlite::SqliteStorage;
pub use storage::{
    clear_messaging_keys, MemoryStorage, StoragePort, KEY_ACTIVE_CONVERSATION,
    KEY_CACHED_CONVERSATIONS, KEY_RETRY_ATTEMPTS,
};
