//! The synchronization engine.
//!
//! [`SyncEngine`] wires the conversation, message, and selection stores to
//! the socket transport and the REST collaborator. It owns every store
//! mutation: the transport only reports events, and the engine translates
//! them. Durable writes are performed synchronously with the in-memory
//! update they mirror, so the two can never diverge.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use parley_net::{EventHandler, SocketTransport};
use parley_shared::constants::{
    CREATE_DM_TIMEOUT_MS, DEFAULT_MESSAGE_PAGE, FETCH_RETRY_BASE_DELAY_MS, FETCH_RETRY_LIMIT,
    FETCH_TIMEOUT_MS, NOT_FOUND_STRIKE_LIMIT, RECONCILE_INTERVAL_MS, SEND_ACK_TIMEOUT_MS,
};
use parley_shared::identity::AuthIdentity;
use parley_shared::models::{Conversation, Message, MessageContent};
use parley_shared::protocol::{ClientEvent, ServerEventKind};
use parley_shared::types::{ConversationId, DeliveryState, MessageId, PresenceStatus, UserId};
use parley_shared::SyncFault;
use parley_store::normalize;
use parley_store::{
    clear_messaging_keys, ConversationStore, MessageStore, SelectionState, StoragePort,
    KEY_CACHED_CONVERSATIONS, KEY_RETRY_ATTEMPTS,
};

use crate::api::{ApiError, ConversationApi, ConversationQuery, MessagePage};
use crate::events;
use crate::snapshot::{EngineSnapshot, LoadingFlags};

/// Engine tunables. The defaults mirror the constants in `parley-shared`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub fetch_timeout: Duration,
    pub create_dm_timeout: Duration,
    pub send_ack_timeout: Duration,
    pub reconcile_interval: Duration,
    pub fetch_retry_limit: u32,
    pub fetch_retry_base_delay: Duration,
    pub not_found_strike_limit: u32,
    pub message_page_limit: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_millis(FETCH_TIMEOUT_MS),
            create_dm_timeout: Duration::from_millis(CREATE_DM_TIMEOUT_MS),
            send_ack_timeout: Duration::from_millis(SEND_ACK_TIMEOUT_MS),
            reconcile_interval: Duration::from_millis(RECONCILE_INTERVAL_MS),
            fetch_retry_limit: FETCH_RETRY_LIMIT,
            fetch_retry_base_delay: Duration::from_millis(FETCH_RETRY_BASE_DELAY_MS),
            not_found_strike_limit: NOT_FOUND_STRIKE_LIMIT,
            message_page_limit: DEFAULT_MESSAGE_PAGE,
        }
    }
}

/// An optimistic send awaiting its server echo.
pub(crate) struct PendingSend {
    pub client_tag: String,
    pub message_id: MessageId,
    pub deadline: Instant,
}

pub(crate) struct EngineState {
    pub identity: Option<AuthIdentity>,
    pub conversations: ConversationStore,
    pub messages: MessageStore,
    pub selection: SelectionState,
    pub presence: HashMap<UserId, PresenceStatus>,
    pub loading: LoadingFlags,
    pub fault: Option<SyncFault>,
    pub socket_connected: bool,
    pub subscriptions_active: bool,
    /// Terminal transport failure already surfaced once.
    pub connection_failure_seen: bool,
    /// Bumped per message fetch; a completion whose epoch is stale belongs
    /// to a superseded fetch and must not touch anything.
    pub fetch_epoch: u64,
    pub pending_sends: Vec<PendingSend>,
}

pub(crate) struct EngineInner {
    pub config: EngineConfig,
    pub transport: SocketTransport,
    pub api: Arc<dyn ConversationApi>,
    pub storage: Arc<dyn StoragePort>,
    pub state: StdMutex<EngineState>,
    /// Cancellation token of the in-flight message fetch, if any.
    pub fetch_token: StdMutex<Option<CancellationToken>>,
    /// Handlers currently registered on the transport.
    pub installed: StdMutex<Vec<(ServerEventKind, EventHandler)>>,
    pub shutdown: CancellationToken,
}

impl EngineInner {
    pub(crate) fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Handle to the synchronization engine. Clones share the same state.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    /// Build the engine and start its reconciliation task.
    pub fn new(
        transport: SocketTransport,
        api: Arc<dyn ConversationApi>,
        storage: Arc<dyn StoragePort>,
        config: EngineConfig,
    ) -> Self {
        let reconcile_interval = config.reconcile_interval;
        let inner = Arc::new(EngineInner {
            config,
            transport,
            api,
            storage,
            state: StdMutex::new(EngineState {
                identity: None,
                conversations: ConversationStore::new(),
                messages: MessageStore::new(),
                selection: SelectionState::new(),
                presence: HashMap::new(),
                loading: LoadingFlags::default(),
                fault: None,
                socket_connected: false,
                subscriptions_active: false,
                connection_failure_seen: false,
                fetch_epoch: 0,
                pending_sends: Vec::new(),
            }),
            fetch_token: StdMutex::new(None),
            installed: StdMutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        });

        // Periodic reconciliation: the believed connection flag is synced
        // against the transport's actual flag rather than trusting only
        // discrete events. The task holds a weak reference so a dropped
        // engine is not kept alive by its own timer.
        let weak = Arc::downgrade(&inner);
        let shutdown = inner.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(reconcile_interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        events::reconcile_tick(&inner);
                    }
                }
            }
        });

        Self { inner }
    }

    pub(crate) fn from_inner(inner: Arc<EngineInner>) -> Self {
        Self { inner }
    }

    /// Stop the reconciliation task, tear down subscriptions, and close
    /// the socket. The stores keep their contents.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        events::sync_subscriptions(&self.inner, false);
        self.inner.transport.disconnect().await;
    }

    /// Point-in-time copy of the engine state. Never blocks on network
    /// work.
    pub fn snapshot(&self) -> EngineSnapshot {
        let st = self.inner.state();
        EngineSnapshot {
            identity: st.identity.clone(),
            conversations: st.conversations.to_vec(),
            active_conversation: st.selection.active().cloned(),
            messages: st.messages.to_vec(),
            socket_connected: st.socket_connected,
            presence: st.presence.clone(),
            loading: st.loading,
            fault: st.fault.clone(),
        }
    }

    /// Supply, replace, or clear the authenticated identity.
    ///
    /// A change of user or token tears the previous session down in a
    /// fixed order (socket, selection, stores, durable storage) before
    /// any of the new identity's data is loaded.
    pub async fn set_identity(&self, identity: Option<AuthIdentity>) {
        let (had_previous, unchanged) = {
            let st = self.inner.state();
            let unchanged = match (&st.identity, &identity) {
                (Some(a), Some(b)) => a.same_session(b),
                (None, None) => true,
                _ => false,
            };
            (st.identity.is_some(), unchanged)
        };
        if unchanged {
            return;
        }

        if had_previous {
            info!("identity changed; tearing down previous session");
            if let Some(token) = self
                .inner
                .fetch_token
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take()
            {
                token.cancel();
            }
            events::sync_subscriptions(&self.inner, false);
            self.inner.transport.set_credential(None).await;
            self.inner.transport.disconnect().await;
            {
                let mut st = self.inner.state();
                st.selection.set(None);
                st.conversations.clear();
                st.messages.activate(None);
                st.presence.clear();
                st.pending_sends.clear();
                st.fault = None;
                st.socket_connected = false;
                st.connection_failure_seen = false;
                st.identity = None;
                if let Err(e) = clear_messaging_keys(self.inner.storage.as_ref()) {
                    warn!(error = %e, "could not clear messaging storage");
                }
            }
            self.inner.api.set_credential(None);
        }

        let Some(identity) = identity else {
            return;
        };

        info!(user = %identity.user_id, "identity set");
        {
            let mut st = self.inner.state();
            st.identity = Some(identity.clone());

            // Best-effort: show the cached list until the authoritative
            // fetch replaces it.
            match self.inner.storage.get(KEY_CACHED_CONVERSATIONS) {
                Ok(Some(json)) => match serde_json::from_str::<Vec<Conversation>>(&json) {
                    Ok(entries) => st.conversations.restore(entries),
                    Err(e) => debug!(error = %e, "ignoring unreadable cached snapshot"),
                },
                Ok(None) => {}
                Err(e) => warn!(error = %e, "could not read cached snapshot"),
            }

            st.selection = SelectionState::load(self.inner.storage.as_ref());
            let active = st.selection.active().cloned();
            st.messages.activate(active);
        }

        self.inner.api.set_credential(Some(identity.token.clone()));
        self.inner
            .transport
            .set_credential(Some(identity.token.clone()))
            .await;
        if let Err(e) = self.inner.transport.connect().await {
            warn!(error = %e, "initial socket connect failed");
        }
        // Sync the connected flag now instead of waiting a full tick.
        events::reconcile_tick(&self.inner);

        self.fetch_user_conversations().await;

        let active = self.inner.state().selection.active().cloned();
        if let Some(active) = active {
            self.spawn_message_fetch(active);
        }
    }

    /// Change the active conversation. A no-op when already selected. The
    /// id is persisted only if it currently resolves in the conversation
    /// store; the message store is cleared before the new fetch starts.
    pub async fn select_conversation(&self, conversation: Option<ConversationId>) {
        let selected = {
            let mut st = self.inner.state();
            if st.identity.is_none() {
                debug!("select_conversation without identity");
                return;
            }
            if st.selection.active() == conversation.as_ref() {
                return;
            }
            match &conversation {
                Some(id) if st.conversations.contains(id) => {
                    st.selection
                        .set_persistent(conversation.clone(), self.inner.storage.as_ref());
                }
                Some(id) => {
                    // Never persist a dangling reference.
                    debug!(conversation = %id, "selected id does not resolve yet; not persisting");
                    st.selection.set(conversation.clone());
                }
                None => {
                    st.selection
                        .set_persistent(None, self.inner.storage.as_ref());
                }
            }
            st.messages.activate(conversation.clone());
            conversation
        };

        match selected {
            Some(id) => self.spawn_message_fetch(id),
            None => {
                if let Some(token) = self
                    .inner
                    .fetch_token
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .take()
                {
                    token.cancel();
                }
            }
        }
    }

    /// Send a message over the socket, optimistically inserting a pending
    /// local copy. Fails fast, without any transport call, when there is
    /// no identity or the socket is down.
    pub async fn send_message(
        &self,
        conversation: ConversationId,
        content: MessageContent,
    ) -> Result<MessageId, SyncFault> {
        let identity = {
            let mut st = self.inner.state();
            match (&st.identity, st.socket_connected) {
                (Some(identity), true) => identity.clone(),
                _ => {
                    warn!("send_message without identity or connection");
                    st.fault = Some(SyncFault::AuthOrConnectivity);
                    return Err(SyncFault::AuthOrConnectivity);
                }
            }
        };

        let client_tag = Uuid::new_v4().to_string();
        let message_id = MessageId::new(client_tag.clone());
        let message = Message {
            id: message_id.clone(),
            conversation_id: conversation.clone(),
            sender_id: identity.user_id.clone(),
            sender_name: identity.display_name.clone(),
            content: content.clone(),
            timestamp: Utc::now(),
            client_tag: Some(client_tag.clone()),
            delivery: DeliveryState::Pending,
        };
        {
            let mut st = self.inner.state();
            st.messages.insert_pending(message);
            st.pending_sends.push(PendingSend {
                client_tag: client_tag.clone(),
                message_id: message_id.clone(),
                deadline: Instant::now() + self.inner.config.send_ack_timeout,
            });
        }

        let event = ClientEvent::SendMessage {
            conversation_id: conversation,
            content,
            client_tag: client_tag.clone(),
        };
        match self.inner.transport.send(event).await {
            Ok(()) => Ok(message_id),
            Err(e) => {
                warn!(error = %e, message = %message_id, "send failed");
                let mut st = self.inner.state();
                st.pending_sends.retain(|p| p.client_tag != client_tag);
                st.messages.mark_failed(&message_id);
                st.fault = Some(SyncFault::SendFailed(message_id.clone()));
                Err(SyncFault::SendFailed(message_id))
            }
        }
    }

    /// Mark a conversation read: the local marker moves immediately and
    /// the server call runs in the background. A server failure never
    /// rolls the local marker back.
    pub fn mark_conversation_as_read(&self, conversation: ConversationId) {
        let user = {
            let mut st = self.inner.state();
            let Some(identity) = &st.identity else {
                return;
            };
            let user = identity.user_id.clone();
            st.conversations.mark_read(&conversation, &user, Utc::now());
            user
        };
        debug!(conversation = %conversation, user = %user, "marked read locally");

        let api = Arc::clone(&self.inner.api);
        tokio::spawn(async move {
            if let Err(e) = api.mark_read(&conversation).await {
                warn!(conversation = %conversation, error = %e,
                    "mark-read call failed; keeping local marker");
            }
        });
    }

    /// Refetch the full conversation list and reconcile the durable
    /// selection against it.
    pub async fn fetch_user_conversations(&self) {
        {
            let mut st = self.inner.state();
            if st.identity.is_none() {
                debug!("no identity; skipping conversations fetch");
                return;
            }
            st.loading.conversations = true;
        }

        let query = ConversationQuery::default();
        let result = fetch_with_retries(
            &self.inner.config,
            None,
            self.inner.config.fetch_timeout,
            || self.inner.api.fetch_conversations(&query),
        )
        .await;

        let mut st = self.inner.state();
        st.loading.conversations = false;
        if st.identity.is_none() {
            // Logged out while the fetch was in flight.
            return;
        }
        match result {
            Ok(payload) => match st.conversations.replace_all(&payload) {
                Ok(count) => {
                    info!(count, "conversations loaded");
                    match st.conversations.snapshot_json() {
                        Ok(json) => {
                            if let Err(e) =
                                self.inner.storage.set(KEY_CACHED_CONVERSATIONS, &json)
                            {
                                warn!(error = %e, "could not cache conversation snapshot");
                            }
                        }
                        Err(e) => warn!(error = %e, "could not snapshot conversations"),
                    }
                    let EngineState {
                        selection,
                        conversations,
                        messages,
                        ..
                    } = &mut *st;
                    if selection.reconcile(conversations, self.inner.storage.as_ref()) {
                        messages.activate(None);
                    }
                    if matches!(
                        st.fault,
                        Some(SyncFault::MalformedResponse(_) | SyncFault::FetchFailed(_))
                    ) {
                        st.fault = None;
                    }
                }
                Err(e) => {
                    error!(error = %e, "conversations payload rejected");
                    st.fault = Some(SyncFault::MalformedResponse(e.to_string()));
                }
            },
            Err(e) if e.is_canceled() => {}
            Err(e) => {
                warn!(error = %e, "conversations fetch failed");
                st.fault = Some(SyncFault::FetchFailed(e.to_string()));
            }
        }
    }

    /// Get-or-create a direct conversation with `user`, select it, and
    /// fetch its history.
    pub async fn create_dm_conversation(
        &self,
        user: UserId,
    ) -> Result<Conversation, SyncFault> {
        {
            let mut st = self.inner.state();
            if st.identity.is_none() {
                st.fault = Some(SyncFault::AuthOrConnectivity);
                return Err(SyncFault::AuthOrConnectivity);
            }
            st.loading.creating_dm = true;
        }

        // Creating a DM supersedes any in-flight message fetch, like any
        // other selection change.
        let token = CancellationToken::new();
        if let Some(prev) = self
            .inner
            .fetch_token
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(token.clone())
        {
            prev.cancel();
        }

        let result = fetch_with_retries(
            &self.inner.config,
            Some(&token),
            self.inner.config.create_dm_timeout,
            || self.inner.api.get_or_create_dm(&user),
        )
        .await;

        self.inner.state().loading.creating_dm = false;

        match result {
            Ok(payload) => match normalize::extract_conversation(&payload) {
                Ok(conversation) => {
                    let id = conversation.id.clone();
                    {
                        let mut st = self.inner.state();
                        st.conversations.upsert(conversation.clone());
                        st.selection
                            .set_persistent(Some(id.clone()), self.inner.storage.as_ref());
                        st.messages.activate(Some(id.clone()));
                    }
                    info!(conversation = %id, user = %user, "direct conversation ready");
                    self.spawn_message_fetch(id);
                    Ok(conversation)
                }
                Err(e) => {
                    error!(error = %e, "DM payload rejected");
                    let fault = SyncFault::MalformedResponse(e.to_string());
                    self.inner.state().fault = Some(fault.clone());
                    Err(fault)
                }
            },
            Err(e) if e.is_canceled() => {
                debug!("DM creation canceled");
                Err(SyncFault::FetchFailed("request canceled".into()))
            }
            Err(e) => {
                warn!(error = %e, "DM creation failed");
                let fault = SyncFault::FetchFailed(e.to_string());
                self.inner.state().fault = Some(fault.clone());
                Err(fault)
            }
        }
    }

    /// Emit a typing indicator. Best-effort; dropped silently while
    /// disconnected.
    pub async fn send_typing(&self, conversation: ConversationId, started: bool) {
        let user = {
            let st = self.inner.state();
            if !st.socket_connected {
                return;
            }
            match &st.identity {
                Some(identity) => identity.user_id.clone(),
                None => return,
            }
        };
        let event = if started {
            ClientEvent::TypingStart {
                conversation_id: conversation,
                user,
            }
        } else {
            ClientEvent::TypingStop {
                conversation_id: conversation,
                user,
            }
        };
        if let Err(e) = self.inner.transport.send(event).await {
            debug!(error = %e, "typing event dropped");
        }
    }

    /// Wipe every messaging-related durable key and the in-memory
    /// selection, so a stale reference cannot resurrect on the next
    /// reload.
    pub fn clear_messaging_storage(&self) {
        let mut st = self.inner.state();
        if let Err(e) = clear_messaging_keys(self.inner.storage.as_ref()) {
            warn!(error = %e, "could not clear messaging storage");
        }
        st.selection.set(None);
        st.messages.activate(None);
    }

    // -- internals ----------------------------------------------------------

    /// Start a message fetch for `conversation`, superseding any fetch
    /// already in flight.
    fn spawn_message_fetch(&self, conversation: ConversationId) {
        let token = CancellationToken::new();
        if let Some(prev) = self
            .inner
            .fetch_token
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(token.clone())
        {
            prev.cancel();
        }
        let epoch = {
            let mut st = self.inner.state();
            st.fetch_epoch += 1;
            st.loading.messages = true;
            st.fetch_epoch
        };

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            run_message_fetch(inner, conversation, epoch, token).await;
        });
    }
}

async fn run_message_fetch(
    inner: Arc<EngineInner>,
    conversation: ConversationId,
    epoch: u64,
    token: CancellationToken,
) {
    let page = MessagePage {
        limit: Some(inner.config.message_page_limit),
        before: None,
        after: None,
    };
    let result = fetch_with_retries(
        &inner.config,
        Some(&token),
        inner.config.fetch_timeout,
        || inner.api.fetch_messages(&conversation, &page),
    )
    .await;

    let mut st = inner.state();
    if st.fetch_epoch != epoch {
        // Superseded: a newer fetch owns the loading flag and the store.
        return;
    }
    st.loading.messages = false;
    if token.is_cancelled() {
        return;
    }

    match result {
        Ok(payload) => {
            if st.selection.active() != Some(&conversation) {
                return;
            }
            match st.messages.replace_all(&payload) {
                Ok(count) => {
                    debug!(conversation = %conversation, count, "message history loaded");
                    if let Err(e) = inner.storage.remove(KEY_RETRY_ATTEMPTS) {
                        warn!(error = %e, "could not reset retry counter");
                    }
                    if matches!(
                        st.fault,
                        Some(
                            SyncFault::MalformedResponse(_)
                                | SyncFault::FetchFailed(_)
                                | SyncFault::NotFound(_)
                        )
                    ) {
                        st.fault = None;
                    }
                }
                Err(e) => {
                    error!(conversation = %conversation, error = %e, "message payload rejected");
                    st.fault = Some(SyncFault::MalformedResponse(e.to_string()));
                }
            }
        }
        Err(e) if e.is_canceled() => {
            debug!(conversation = %conversation, "message fetch canceled");
        }
        Err(ApiError::Status(404)) => {
            let strikes = retry_strikes(inner.storage.as_ref()) + 1;
            warn!(conversation = %conversation, strikes, "selected conversation not found");
            if strikes >= inner.config.not_found_strike_limit {
                // Enough: wipe the stale reference everywhere instead of
                // striking again on the next reload.
                if let Err(e) = clear_messaging_keys(inner.storage.as_ref()) {
                    warn!(error = %e, "could not clear messaging storage");
                }
                st.selection.set(None);
                st.messages.activate(None);
            } else if let Err(e) = inner
                .storage
                .set(KEY_RETRY_ATTEMPTS, &strikes.to_string())
            {
                warn!(error = %e, "could not record retry strike");
            }
            st.fault = Some(SyncFault::NotFound(conversation));
        }
        Err(e) => {
            warn!(conversation = %conversation, error = %e, "message fetch failed");
            st.fault = Some(SyncFault::FetchFailed(e.to_string()));
        }
    }
}

fn retry_strikes(storage: &dyn StoragePort) -> u32 {
    storage
        .get(KEY_RETRY_ATTEMPTS)
        .ok()
        .flatten()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// Run `call` with a per-attempt timeout, an optional cancellation token,
/// and bounded exponential backoff for transient failures. Cancellation
/// and timeouts come back as canceled-class errors, never retried.
async fn fetch_with_retries<F, Fut>(
    config: &EngineConfig,
    token: Option<&CancellationToken>,
    timeout: Duration,
    mut call: F,
) -> Result<Value, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Value, ApiError>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let attempt_future = async {
            match tokio::time::timeout(timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(ApiError::Timeout),
            }
        };
        let result = match token {
            Some(token) => tokio::select! {
                _ = token.cancelled() => Err(ApiError::Canceled),
                result = attempt_future => result,
            },
            None => attempt_future.await,
        };

        match result {
            Err(e) if e.is_transient() && attempt < config.fetch_retry_limit => {
                let delay = config.fetch_retry_base_delay * 2u32.pow(attempt - 1);
                debug!(attempt, error = %e, "transient fetch failure; retrying");
                tokio::time::sleep(delay).await;
                if token.is_some_and(|t| t.is_cancelled()) {
                    return Err(ApiError::Canceled);
                }
            }
            other => return other,
        }
    }
}
