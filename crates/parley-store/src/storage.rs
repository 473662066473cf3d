//! Durable key-value port.
//!
//! Everything the engine persists across reloads goes through this narrow
//! interface: the active conversation id, the cached conversation-list
//! snapshot, and the not-found retry counter. All three are cleared
//! together by the storage-clear action.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::Result;

/// Durable key for the active conversation id.
pub const KEY_ACTIVE_CONVERSATION: &str = "active-conversation";

/// Durable key for the cached conversation-list snapshot (best-effort UX,
/// never authoritative).
pub const KEY_CACHED_CONVERSATIONS: &str = "cached-conversations";

/// Durable key for the consecutive not-found strike counter.
pub const KEY_RETRY_ATTEMPTS: &str = "retry-attempts";

const MESSAGING_KEYS: [&str; 3] = [
    KEY_ACTIVE_CONVERSATION,
    KEY_CACHED_CONVERSATIONS,
    KEY_RETRY_ATTEMPTS,
];

/// Narrow durable storage interface. Implementations must be cheap enough
/// to call synchronously alongside the in-memory update they mirror.
pub trait StoragePort: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// Remove every messaging-related durable key.
pub fn clear_messaging_keys(storage: &dyn StoragePort) -> Result<()> {
    for key in MESSAGING_KEYS {
        storage.remove(key)?;
    }
    Ok(())
}

/// In-memory implementation, for tests and ephemeral embedders.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StoragePort for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
        Ok(())
    }
}
