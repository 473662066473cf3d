//! End-to-end engine tests over in-process fakes: a scripted REST API, an
//! in-memory storage port, and a channel-pair socket link.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};

use parley_client::api::{ApiError, ConversationApi, ConversationQuery, MessagePage};
use parley_client::{EngineConfig, SyncEngine};
use parley_net::{channel_link, ChannelPeer, SocketTransport, TransportConfig};
use parley_shared::models::{Message, MessageContent};
use parley_shared::protocol::{ClientEvent, ServerEvent};
use parley_shared::types::{
    ConversationId, DeliveryState, MessageId, PresenceStatus, UserId,
};
use parley_shared::{AuthIdentity, SyncFault};
use parley_store::{MemoryStorage, StoragePort, KEY_ACTIVE_CONVERSATION};

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeApi {
    conversations: Mutex<Value>,
    messages: Mutex<HashMap<String, Value>>,
    delays: Mutex<HashMap<String, Duration>>,
    dm_response: Mutex<Option<Value>>,
    read_calls: Mutex<Vec<String>>,
}

impl FakeApi {
    fn new() -> Arc<Self> {
        let api = Self::default();
        *api.conversations.lock().unwrap() = json!([]);
        Arc::new(api)
    }

    fn set_conversations(&self, payload: Value) {
        *self.conversations.lock().unwrap() = payload;
    }

    fn set_messages(&self, conversation: &str, payload: Value) {
        self.messages
            .lock()
            .unwrap()
            .insert(conversation.to_string(), payload);
    }

    fn set_delay(&self, conversation: &str, delay: Duration) {
        self.delays
            .lock()
            .unwrap()
            .insert(conversation.to_string(), delay);
    }

    fn set_dm_response(&self, payload: Value) {
        *self.dm_response.lock().unwrap() = Some(payload);
    }

    fn read_calls(&self) -> Vec<String> {
        self.read_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConversationApi for FakeApi {
    async fn fetch_conversations(&self, _query: &ConversationQuery) -> Result<Value, ApiError> {
        Ok(self.conversations.lock().unwrap().clone())
    }

    async fn fetch_messages(
        &self,
        conversation: &ConversationId,
        _page: &MessagePage,
    ) -> Result<Value, ApiError> {
        let delay = self
            .delays
            .lock()
            .unwrap()
            .get(conversation.as_str())
            .copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let payload = self
            .messages
            .lock()
            .unwrap()
            .get(conversation.as_str())
            .cloned();
        payload.ok_or(ApiError::Status(404))
    }

    async fn post_message(
        &self,
        _conversation: &ConversationId,
        _content: &MessageContent,
    ) -> Result<Value, ApiError> {
        Ok(json!({}))
    }

    async fn get_or_create_dm(&self, _user: &UserId) -> Result<Value, ApiError> {
        self.dm_response
            .lock()
            .unwrap()
            .clone()
            .ok_or(ApiError::Status(500))
    }

    async fn mark_read(&self, conversation: &ConversationId) -> Result<(), ApiError> {
        self.read_calls
            .lock()
            .unwrap()
            .push(conversation.as_str().to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn identity() -> AuthIdentity {
    AuthIdentity {
        user_id: UserId::new("u1"),
        display_name: "Uli".into(),
        token: "token-u1".into(),
    }
}

fn convo_json(id: &str) -> Value {
    json!({
        "id": id,
        "type": "DIRECT",
        "participants": [
            {"userId": "u1", "lastReadTimestamp": "2024-01-01T00:00:00Z"},
            {"userId": "u2", "lastReadTimestamp": "2024-01-01T00:00:00Z"}
        ]
    })
}

fn message_json(id: &str, conversation: &str, secs: i64) -> Value {
    json!({
        "id": id,
        "conversationId": conversation,
        "senderId": "u2",
        "senderName": "Sam",
        "content": {"type": "TEXT", "text": format!("text of {id}")},
        "timestamp": ts(secs).to_rfc3339(),
    })
}

fn push_message(id: &str, conversation: &str, secs: i64) -> Message {
    Message {
        id: MessageId::new(id),
        conversation_id: ConversationId::new(conversation),
        sender_id: UserId::new("u2"),
        sender_name: "Sam".into(),
        content: MessageContent::text(format!("text of {id}")),
        timestamp: ts(secs),
        client_tag: None,
        delivery: DeliveryState::Confirmed,
    }
}

fn build_engine(api: Arc<FakeApi>, storage: Arc<MemoryStorage>) -> (SyncEngine, ChannelPeer) {
    let (link, peer) = channel_link();
    let transport = SocketTransport::new(
        Arc::new(link),
        TransportConfig {
            url: "ws://test".into(),
            max_reconnect_attempts: 3,
            reconnect_base_delay: Duration::from_millis(10),
        },
    );
    let config = EngineConfig {
        fetch_timeout: Duration::from_millis(2_000),
        create_dm_timeout: Duration::from_millis(2_000),
        send_ack_timeout: Duration::from_millis(300),
        reconcile_interval: Duration::from_millis(50),
        fetch_retry_base_delay: Duration::from_millis(10),
        ..EngineConfig::default()
    };
    (SyncEngine::new(transport, api, storage, config), peer)
}

/// Let spawned work and reconciliation ticks run (virtual time).
async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_initial_load_and_selection_persists_across_reload() {
    let api = FakeApi::new();
    let storage = Arc::new(MemoryStorage::new());
    api.set_conversations(json!({"conversations": [convo_json("c1")]}));
    api.set_messages("c1", json!([message_json("m1", "c1", 10)]));

    let (engine, _peer) = build_engine(Arc::clone(&api), Arc::clone(&storage));
    engine.set_identity(Some(identity())).await;
    settle().await;

    // Full fetch populated the store with exactly one entry, ordered first.
    let snap = engine.snapshot();
    assert_eq!(snap.conversations.len(), 1);
    assert_eq!(snap.conversations[0].id.as_str(), "c1");
    assert!(snap.socket_connected);

    engine
        .select_conversation(Some(ConversationId::new("c1")))
        .await;
    settle().await;

    let snap = engine.snapshot();
    assert_eq!(snap.active_conversation.as_ref().unwrap().as_str(), "c1");
    assert_eq!(snap.messages.len(), 1);
    assert_eq!(
        storage.get(KEY_ACTIVE_CONVERSATION).unwrap().as_deref(),
        Some("c1")
    );

    engine.shutdown().await;

    // Simulated reload: a fresh engine over the same durable storage.
    let (engine2, _peer2) = build_engine(api, storage);
    engine2.set_identity(Some(identity())).await;
    settle().await;

    let snap = engine2.snapshot();
    assert_eq!(snap.active_conversation.as_ref().unwrap().as_str(), "c1");
    assert_eq!(snap.messages.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_dangling_stored_selection_is_cleared() {
    let api = FakeApi::new();
    let storage = Arc::new(MemoryStorage::new());
    storage.set(KEY_ACTIVE_CONVERSATION, "ghost").unwrap();
    api.set_conversations(json!([convo_json("c1")]));

    let (engine, _peer) = build_engine(api, Arc::clone(&storage));
    engine.set_identity(Some(identity())).await;
    settle().await;

    let snap = engine.snapshot();
    assert_eq!(snap.active_conversation, None);
    assert_eq!(storage.get(KEY_ACTIVE_CONVERSATION).unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn test_slow_stale_fetch_never_writes() {
    let api = FakeApi::new();
    let storage = Arc::new(MemoryStorage::new());
    api.set_conversations(json!([convo_json("c1"), convo_json("c2")]));
    api.set_messages("c1", json!([message_json("mA", "c1", 10)]));
    api.set_messages("c2", json!([message_json("mB", "c2", 20)]));
    api.set_delay("c1", Duration::from_millis(400));

    let (engine, _peer) = build_engine(api, storage);
    engine.set_identity(Some(identity())).await;
    settle().await;

    // Start a slow fetch for c1, then switch to c2 while it is in flight.
    engine
        .select_conversation(Some(ConversationId::new("c1")))
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    engine
        .select_conversation(Some(ConversationId::new("c2")))
        .await;

    // Let c1's delayed response arrive well after the switch.
    tokio::time::sleep(Duration::from_millis(600)).await;

    let snap = engine.snapshot();
    assert_eq!(snap.active_conversation.as_ref().unwrap().as_str(), "c2");
    assert_eq!(snap.messages.len(), 1);
    assert_eq!(snap.messages[0].id.as_str(), "mB");
    assert!(snap
        .messages
        .iter()
        .all(|m| m.conversation_id.as_str() == "c2"));
}

#[tokio::test(start_paused = true)]
async fn test_push_updates_message_store_and_summary_order() {
    let api = FakeApi::new();
    let storage = Arc::new(MemoryStorage::new());
    api.set_conversations(json!([convo_json("c2"), convo_json("c1")]));
    api.set_messages("c1", json!([message_json("m1", "c1", 10)]));

    let (engine, peer) = build_engine(api, storage);
    engine.set_identity(Some(identity())).await;
    settle().await;
    engine
        .select_conversation(Some(ConversationId::new("c1")))
        .await;
    settle().await;

    assert!(peer
        .push(ServerEvent::NewMessage {
            conversation_id: ConversationId::new("c1"),
            message: push_message("m9", "c1", 99),
        })
        .await);
    settle().await;

    let snap = engine.snapshot();
    assert_eq!(snap.messages.last().unwrap().id.as_str(), "m9");
    // The conversation that received the message is now first, and its
    // summary carries the new last message.
    assert_eq!(snap.conversations[0].id.as_str(), "c1");
    assert_eq!(
        snap.conversations[0].last_message.as_ref().unwrap().id.as_str(),
        "m9"
    );
}

#[tokio::test(start_paused = true)]
async fn test_push_for_inactive_conversation_updates_summary_only() {
    let api = FakeApi::new();
    let storage = Arc::new(MemoryStorage::new());
    api.set_conversations(json!([convo_json("c1"), convo_json("c2")]));
    api.set_messages("c1", json!([]));

    let (engine, peer) = build_engine(api, storage);
    engine.set_identity(Some(identity())).await;
    settle().await;
    engine
        .select_conversation(Some(ConversationId::new("c1")))
        .await;
    settle().await;

    assert!(peer
        .push(ServerEvent::NewMessage {
            conversation_id: ConversationId::new("c2"),
            message: push_message("m5", "c2", 50),
        })
        .await);
    settle().await;

    let snap = engine.snapshot();
    // The message store stays bound to c1; only c2's summary moved.
    assert!(snap.messages.is_empty());
    assert_eq!(snap.conversations[0].id.as_str(), "c2");
    assert_eq!(
        snap.conversations[0].last_message.as_ref().unwrap().id.as_str(),
        "m5"
    );
}

#[tokio::test(start_paused = true)]
async fn test_send_fails_fast_without_connection() {
    let api = FakeApi::new();
    let storage = Arc::new(MemoryStorage::new());
    api.set_conversations(json!([convo_json("c1")]));
    api.set_messages("c1", json!([]));

    let (engine, mut peer) = build_engine(api, storage);
    peer.set_refuse_opens(true);
    engine.set_identity(Some(identity())).await;
    settle().await;
    engine
        .select_conversation(Some(ConversationId::new("c1")))
        .await;
    settle().await;

    let err = engine
        .send_message(ConversationId::new("c1"), MessageContent::text("hi"))
        .await
        .unwrap_err();
    assert_eq!(err, SyncFault::AuthOrConnectivity);

    let snap = engine.snapshot();
    assert_eq!(snap.fault, Some(SyncFault::AuthOrConnectivity));
    // No optimistic entry and no transport call were made.
    assert!(snap.messages.is_empty());
    assert!(peer.sent_rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_send_confirms_on_server_echo() {
    let api = FakeApi::new();
    let storage = Arc::new(MemoryStorage::new());
    api.set_conversations(json!([convo_json("c1")]));
    api.set_messages("c1", json!([]));

    let (engine, mut peer) = build_engine(api, storage);
    engine.set_identity(Some(identity())).await;
    settle().await;
    engine
        .select_conversation(Some(ConversationId::new("c1")))
        .await;
    settle().await;

    let local_id = engine
        .send_message(ConversationId::new("c1"), MessageContent::text("hi"))
        .await
        .unwrap();

    let snap = engine.snapshot();
    assert_eq!(snap.messages.len(), 1);
    assert_eq!(snap.messages[0].delivery, DeliveryState::Pending);
    assert_eq!(snap.messages[0].id, local_id);

    // The wire carried our correlation tag; echo it back as the server
    // would, with the authoritative id.
    let Some(ClientEvent::SendMessage { client_tag, .. }) = peer.next_sent().await else {
        panic!("expected a SendMessage frame");
    };
    let mut echo = push_message("m-server", "c1", 42);
    echo.sender_id = UserId::new("u1");
    echo.client_tag = Some(client_tag);
    assert!(peer
        .push(ServerEvent::NewMessage {
            conversation_id: ConversationId::new("c1"),
            message: echo,
        })
        .await);
    settle().await;

    let snap = engine.snapshot();
    assert_eq!(snap.messages.len(), 1);
    assert_eq!(snap.messages[0].id.as_str(), "m-server");
    assert_eq!(snap.messages[0].delivery, DeliveryState::Confirmed);
    assert_eq!(
        snap.conversations[0].last_message.as_ref().unwrap().id.as_str(),
        "m-server"
    );
}

#[tokio::test(start_paused = true)]
async fn test_unacked_send_is_marked_failed() {
    let api = FakeApi::new();
    let storage = Arc::new(MemoryStorage::new());
    api.set_conversations(json!([convo_json("c1")]));
    api.set_messages("c1", json!([]));

    let (engine, _peer) = build_engine(api, storage);
    engine.set_identity(Some(identity())).await;
    settle().await;
    engine
        .select_conversation(Some(ConversationId::new("c1")))
        .await;
    settle().await;

    let local_id = engine
        .send_message(ConversationId::new("c1"), MessageContent::text("hi"))
        .await
        .unwrap();

    // No echo arrives; the ack deadline (300 ms) passes.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let snap = engine.snapshot();
    assert_eq!(snap.messages.len(), 1);
    assert_eq!(snap.messages[0].delivery, DeliveryState::Failed);
    assert_eq!(snap.fault, Some(SyncFault::SendFailed(local_id)));
}

#[tokio::test(start_paused = true)]
async fn test_push_for_unknown_conversation_triggers_refetch() {
    let api = FakeApi::new();
    let storage = Arc::new(MemoryStorage::new());
    api.set_conversations(json!([convo_json("c1")]));

    let (engine, peer) = build_engine(Arc::clone(&api), storage);
    engine.set_identity(Some(identity())).await;
    settle().await;
    assert_eq!(engine.snapshot().conversations.len(), 1);

    // The server now knows a conversation we have never seen; its push
    // must trigger a full refetch rather than being dropped.
    api.set_conversations(json!([convo_json("c9"), convo_json("c1")]));
    assert!(peer
        .push(ServerEvent::NewMessage {
            conversation_id: ConversationId::new("c9"),
            message: push_message("m1", "c9", 10),
        })
        .await);
    settle().await;

    let snap = engine.snapshot();
    assert!(snap
        .conversations
        .iter()
        .any(|c| c.id.as_str() == "c9"));
}

#[tokio::test(start_paused = true)]
async fn test_identity_switch_tears_down_everything() {
    let api = FakeApi::new();
    let storage = Arc::new(MemoryStorage::new());
    api.set_conversations(json!([convo_json("c1")]));
    api.set_messages("c1", json!([message_json("m1", "c1", 10)]));

    let (engine, _peer) = build_engine(Arc::clone(&api), Arc::clone(&storage));
    engine.set_identity(Some(identity())).await;
    settle().await;
    engine
        .select_conversation(Some(ConversationId::new("c1")))
        .await;
    settle().await;
    assert!(!engine.snapshot().messages.is_empty());

    // Another user logs in: nothing of u1's session may leak through.
    api.set_conversations(json!([]));
    engine
        .set_identity(Some(AuthIdentity {
            user_id: UserId::new("u2"),
            display_name: "Vic".into(),
            token: "token-u2".into(),
        }))
        .await;
    settle().await;

    let snap = engine.snapshot();
    assert_eq!(snap.identity.as_ref().unwrap().user_id.as_str(), "u2");
    assert!(snap.conversations.is_empty());
    assert!(snap.messages.is_empty());
    assert_eq!(snap.active_conversation, None);
    assert_eq!(storage.get(KEY_ACTIVE_CONVERSATION).unwrap(), None);

    // Logout clears the rest.
    engine.set_identity(None).await;
    let snap = engine.snapshot();
    assert!(snap.identity.is_none());
    assert!(snap.conversations.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_mark_read_is_optimistic_with_background_call() {
    let api = FakeApi::new();
    let storage = Arc::new(MemoryStorage::new());
    // Newer than the participant's 2024 read marker, older than the real
    // clock `mark_conversation_as_read` stamps with.
    let mut convo = convo_json("c1");
    convo["lastMessage"] = message_json("m1", "c1", 1_750_000_000);
    api.set_conversations(json!([convo]));

    let (engine, _peer) = build_engine(Arc::clone(&api), storage);
    engine.set_identity(Some(identity())).await;
    settle().await;

    let user = UserId::new("u1");
    assert!(engine.snapshot().conversations[0].unread_for(&user));

    engine.mark_conversation_as_read(ConversationId::new("c1"));
    // Local state flips immediately, before the server call completes.
    assert!(!engine.snapshot().conversations[0].unread_for(&user));

    settle().await;
    assert_eq!(api.read_calls(), vec!["c1".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_payload_faults_and_self_clears() {
    let api = FakeApi::new();
    let storage = Arc::new(MemoryStorage::new());
    api.set_conversations(json!({"unexpected": "shape"}));

    let (engine, _peer) = build_engine(Arc::clone(&api), storage);
    engine.set_identity(Some(identity())).await;
    settle().await;

    let snap = engine.snapshot();
    assert!(matches!(snap.fault, Some(SyncFault::MalformedResponse(_))));
    assert!(snap.conversations.is_empty());

    // The next successful fetch of the same kind clears the fault.
    api.set_conversations(json!([convo_json("c1")]));
    engine.fetch_user_conversations().await;

    let snap = engine.snapshot();
    assert_eq!(snap.fault, None);
    assert_eq!(snap.conversations.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_not_found_strikes_clear_storage_across_reloads() {
    let api = FakeApi::new();
    let storage = Arc::new(MemoryStorage::new());
    // The stored selection resolves in the list, but its history fetch
    // keeps answering 404.
    storage.set(KEY_ACTIVE_CONVERSATION, "c1").unwrap();
    api.set_conversations(json!([convo_json("c1")]));

    for reload in 1..=3u32 {
        let (engine, _peer) = build_engine(Arc::clone(&api), Arc::clone(&storage));
        engine.set_identity(Some(identity())).await;
        settle().await;

        let snap = engine.snapshot();
        assert!(matches!(snap.fault, Some(SyncFault::NotFound(_))));
        if reload < 3 {
            assert_eq!(
                storage.get(KEY_ACTIVE_CONVERSATION).unwrap().as_deref(),
                Some("c1")
            );
        }
        engine.shutdown().await;
    }

    // Third strike: every messaging key is gone and the selection with it.
    assert_eq!(storage.get(KEY_ACTIVE_CONVERSATION).unwrap(), None);
    assert_eq!(
        storage.get(parley_store::KEY_RETRY_ATTEMPTS).unwrap(),
        None
    );
}

#[tokio::test(start_paused = true)]
async fn test_presence_updates_reach_snapshot() {
    let api = FakeApi::new();
    let storage = Arc::new(MemoryStorage::new());

    let (engine, peer) = build_engine(api, storage);
    engine.set_identity(Some(identity())).await;
    settle().await;

    assert!(peer
        .push(ServerEvent::UserStatus {
            user_id: UserId::new("u7"),
            status: PresenceStatus::Online,
        })
        .await);
    settle().await;

    let snap = engine.snapshot();
    assert_eq!(
        snap.presence.get(&UserId::new("u7")),
        Some(&PresenceStatus::Online)
    );
}

#[tokio::test(start_paused = true)]
async fn test_create_dm_selects_new_conversation() {
    let api = FakeApi::new();
    let storage = Arc::new(MemoryStorage::new());
    api.set_conversations(json!([]));
    api.set_dm_response(json!({"data": convo_json("dm-1")}));
    api.set_messages("dm-1", json!([]));

    let (engine, _peer) = build_engine(api, Arc::clone(&storage));
    engine.set_identity(Some(identity())).await;
    settle().await;

    let conversation = engine
        .create_dm_conversation(UserId::new("u2"))
        .await
        .unwrap();
    settle().await;

    assert_eq!(conversation.id.as_str(), "dm-1");
    let snap = engine.snapshot();
    assert_eq!(snap.active_conversation.as_ref().unwrap().as_str(), "dm-1");
    assert_eq!(snap.conversations[0].id.as_str(), "dm-1");
    assert_eq!(
        storage.get(KEY_ACTIVE_CONVERSATION).unwrap().as_deref(),
        Some("dm-1")
    );
}

#[tokio::test(start_paused = true)]
async fn test_select_same_conversation_is_noop() {
    let api = FakeApi::new();
    let storage = Arc::new(MemoryStorage::new());
    api.set_conversations(json!([convo_json("c1")]));
    api.set_messages("c1", json!([message_json("m1", "c1", 10)]));

    let (engine, peer) = build_engine(api, storage);
    engine.set_identity(Some(identity())).await;
    settle().await;
    engine
        .select_conversation(Some(ConversationId::new("c1")))
        .await;
    settle().await;

    // Re-selecting must not reset the store (messages stay put).
    let before = engine.snapshot().messages.len();
    engine
        .select_conversation(Some(ConversationId::new("c1")))
        .await;
    let after = engine.snapshot().messages.len();
    assert_eq!(before, after);
    assert_eq!(before, 1);
    drop(peer);
}
