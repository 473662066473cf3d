//! Push-event translation and periodic reconciliation.
//!
//! Transport handlers installed here forward typed server events into
//! store mutations; the transport itself never touches store state. The
//! reconciliation tick syncs the believed connection flag against the
//! transport, manages subscriptions, expires send acks, and surfaces the
//! terminal connection-failed condition.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use parley_net::EventHandler;
use parley_shared::models::Message;
use parley_shared::protocol::{ServerEvent, ServerEventKind};
use parley_shared::types::ConversationId;
use parley_shared::SyncFault;
use parley_store::PatchOutcome;

use crate::engine::{EngineInner, SyncEngine};

/// One reconciliation pass. Runs every tick and after connect attempts.
pub(crate) fn reconcile_tick(inner: &Arc<EngineInner>) {
    let actual = inner.transport.is_connected();
    let failed = inner.transport.is_connection_failed();

    let desired_subscriptions = {
        let mut st = inner.state();
        if st.socket_connected != actual {
            info!(connected = actual, "reconciling socket state");
            st.socket_connected = actual;
        }

        if failed && st.identity.is_some() && !st.connection_failure_seen {
            st.connection_failure_seen = true;
            st.fault = Some(SyncFault::ConnectionFailed);
        } else if !failed {
            st.connection_failure_seen = false;
        }

        // Expire optimistic sends whose echo never arrived.
        let now = Instant::now();
        let mut expired = Vec::new();
        st.pending_sends.retain(|p| {
            if p.deadline <= now {
                expired.push(p.message_id.clone());
                false
            } else {
                true
            }
        });
        for message_id in expired {
            warn!(message = %message_id, "send ack deadline passed; marking failed");
            st.messages.mark_failed(&message_id);
            st.fault = Some(SyncFault::SendFailed(message_id));
        }

        st.identity.is_some() && actual
    };

    sync_subscriptions(inner, desired_subscriptions);
}

/// Install or tear down the transport subscriptions, exactly once per
/// (identity ∧ connected) session. The `subscriptions_active` flag guards
/// against double-subscribe and double-unsubscribe.
pub(crate) fn sync_subscriptions(inner: &Arc<EngineInner>, desired: bool) {
    let active = inner.state().subscriptions_active;
    if desired == active {
        return;
    }

    if desired {
        let weak = Arc::downgrade(inner);
        let handler: EventHandler = Arc::new(move |event| {
            if let Some(inner) = weak.upgrade() {
                handle_server_event(&inner, event);
            }
        });
        let mut installed = inner.installed.lock().unwrap_or_else(|e| e.into_inner());
        for kind in ServerEventKind::ALL {
            inner.transport.subscribe(kind, Arc::clone(&handler));
            installed.push((kind, Arc::clone(&handler)));
        }
        inner.state().subscriptions_active = true;
        debug!("subscriptions installed");
    } else {
        let mut installed = inner.installed.lock().unwrap_or_else(|e| e.into_inner());
        for (kind, handler) in installed.drain(..) {
            inner.transport.unsubscribe(kind, &handler);
        }
        inner.state().subscriptions_active = false;
        debug!("subscriptions torn down");
    }
}

/// Translate one pushed server event into store mutations.
pub(crate) fn handle_server_event(inner: &Arc<EngineInner>, event: ServerEvent) {
    match event {
        ServerEvent::NewMessage {
            conversation_id,
            message,
        } => on_new_message(inner, conversation_id, message),

        ServerEvent::ConversationUpdated { conversation } => {
            debug!(conversation = %conversation.id, "conversation updated");
            inner.state().conversations.upsert(conversation);
        }

        ServerEvent::UserStatus { user_id, status } => {
            debug!(user = %user_id, status = ?status, "presence update");
            inner.state().presence.insert(user_id, status);
        }
    }
}

fn on_new_message(inner: &Arc<EngineInner>, conversation_id: ConversationId, message: Message) {
    let unknown_conversation = {
        let mut st = inner.state();

        // An echo of our own optimistic send confirms the pending entry.
        let pending_pos = message.client_tag.as_deref().and_then(|tag| {
            st.pending_sends
                .iter()
                .position(|p| p.client_tag == tag)
        });
        match pending_pos {
            Some(pos) => {
                let pending = st.pending_sends.remove(pos);
                let tag = pending.client_tag;
                if st.messages.confirm_pending(&tag, message.clone()) {
                    debug!(message = %message.id, "optimistic send confirmed");
                } else {
                    // Switched away before the echo arrived; the summary
                    // below still updates.
                    debug!(message = %message.id, "echo for an inactive conversation");
                }
                if matches!(st.fault, Some(SyncFault::SendFailed(_))) {
                    st.fault = None;
                }
            }
            None => {
                // Pushes for the active conversation append; others only
                // update the conversation summary.
                st.messages.append(message.clone());
            }
        }

        st.conversations
            .patch_last_message(&conversation_id, message)
            == PatchOutcome::Unknown
    };

    if unknown_conversation {
        // A conversation the client has never seen must not be silently
        // dropped: refresh the full list.
        info!(conversation = %conversation_id, "message for unknown conversation; refetching list");
        let engine = SyncEngine::from_inner(Arc::clone(inner));
        tokio::spawn(async move {
            engine.fetch_user_conversations().await;
        });
    }
}
