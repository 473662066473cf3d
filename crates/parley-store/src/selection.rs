//! The durable selection: which conversation is active.
//!
//! The in-memory value and the durable `active-conversation` key are
//! updated together, synchronously, so the two can never diverge. A
//! selection that stops resolving against the conversation store is
//! cleared from both.

use tracing::{debug, warn};

use parley_shared::types::ConversationId;

use crate::conversations::ConversationStore;
use crate::storage::{StoragePort, KEY_ACTIVE_CONVERSATION, KEY_RETRY_ATTEMPTS};

#[derive(Debug, Clone, Default)]
pub struct SelectionState {
    active: Option<ConversationId>,
}

impl SelectionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore the selection from durable storage. Storage errors degrade
    /// to an empty selection.
    pub fn load(storage: &dyn StoragePort) -> Self {
        let active = match storage.get(KEY_ACTIVE_CONVERSATION) {
            Ok(value) => value.map(ConversationId::new),
            Err(e) => {
                warn!(error = %e, "could not read stored selection");
                None
            }
        };
        Self { active }
    }

    pub fn active(&self) -> Option<&ConversationId> {
        self.active.as_ref()
    }

    /// Set the in-memory selection without touching durable storage. Used
    /// when the id does not (yet) resolve and must not be persisted.
    pub fn set(&mut self, conversation: Option<ConversationId>) {
        self.active = conversation;
    }

    /// Set the selection and mirror it durably. Clearing the selection
    /// also clears the retry counter so a later attempt starts fresh.
    pub fn set_persistent(
        &mut self,
        conversation: Option<ConversationId>,
        storage: &dyn StoragePort,
    ) {
        self.active = conversation;
        let result = match &self.active {
            Some(id) => storage.set(KEY_ACTIVE_CONVERSATION, id.as_str()),
            None => storage
                .remove(KEY_ACTIVE_CONVERSATION)
                .and_then(|_| storage.remove(KEY_RETRY_ATTEMPTS)),
        };
        if let Err(e) = result {
            warn!(error = %e, "could not persist selection");
        }
    }

    /// Clear the selection if it no longer resolves in `conversations`.
    /// Returns `true` when something was cleared.
    pub fn reconcile(
        &mut self,
        conversations: &ConversationStore,
        storage: &dyn StoragePort,
    ) -> bool {
        let Some(active) = &self.active else {
            return false;
        };
        if conversations.contains(active) {
            return false;
        }
        debug!(conversation = %active, "stored selection absent from fetched list; clearing");
        self.set_persistent(None, storage);
        true
    }
}
