//! Socket links: the raw bidirectional connection underneath the transport.
//!
//! A [`SocketLink`] opens one connection and hands back channel ends for
//! outbound and inbound frames. [`WsLink`] is the production websocket
//! implementation; [`channel_link`] builds an in-process pair for tests and
//! for embedding the engine against a local event source.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use parley_shared::constants::CHANNEL_CAPACITY;
use parley_shared::protocol::{ClientEvent, ServerEvent};

use crate::error::NetError;

/// One outbound frame plus the ack that resolves once the frame has
/// actually been written to the wire.
pub struct OutboundFrame {
    pub event: ClientEvent,
    pub ack: oneshot::Sender<Result<(), NetError>>,
}

/// Channel ends of an open connection.
///
/// `inbound` closes when the underlying connection drops; dropping
/// `outbound` closes the write side.
pub struct LinkHandle {
    pub outbound: mpsc::Sender<OutboundFrame>,
    pub inbound: mpsc::Receiver<ServerEvent>,
}

/// Something that can open a bidirectional event connection.
#[async_trait]
pub trait SocketLink: Send + Sync {
    /// Open a connection authenticated with `token`.
    async fn open(&self, token: &str) -> Result<LinkHandle, NetError>;
}

// ---------------------------------------------------------------------------
// Websocket link
// ---------------------------------------------------------------------------

/// Production link over a websocket carrying JSON text frames.
pub struct WsLink {
    url: String,
}

impl WsLink {
    /// `url` is the socket endpoint without credentials, e.g.
    /// `ws://localhost:5001`; the token is appended as a query parameter.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl SocketLink for WsLink {
    async fn open(&self, token: &str) -> Result<LinkHandle, NetError> {
        let url = format!("{}?token={}", self.url, token);
        let (ws, _) = connect_async(&url)
            .await
            .map_err(|e| NetError::Handshake(e.to_string()))?;
        let (mut write, mut read) = ws.split();

        let (out_tx, mut out_rx) = mpsc::channel::<OutboundFrame>(CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<ServerEvent>(CHANNEL_CAPACITY);
        let (pong_tx, mut pong_rx) = mpsc::channel::<Vec<u8>>(8);

        // Writer pump: drains outbound frames and pong replies. Each frame
        // is acked only after the sink accepted it.
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = out_rx.recv() => {
                        let Some(OutboundFrame { event, ack }) = frame else { break };
                        let result = match event.to_frame() {
                            Ok(text) => write
                                .send(Message::Text(text.into()))
                                .await
                                .map_err(|e| NetError::Send(e.to_string())),
                            Err(e) => Err(NetError::Encode(e)),
                        };
                        let _ = ack.send(result);
                    }
                    pong = pong_rx.recv() => {
                        let Some(data) = pong else { break };
                        if write.send(Message::Pong(data.into())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        // Reader pump: decodes text frames into server events. Unknown
        // frames are logged and dropped so downstream handlers stay total.
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => match ServerEvent::from_frame(&text) {
                        Ok(event) => {
                            if in_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "dropping undecodable frame");
                        }
                    },
                    Ok(Message::Ping(data)) => {
                        let _ = pong_tx.send(data.into()).await;
                    }
                    Ok(Message::Close(_)) => {
                        debug!("server closed the socket");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "socket read error");
                        break;
                    }
                }
            }
            // Dropping `in_tx` here signals the transport that the
            // connection is gone.
        });

        Ok(LinkHandle {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

// ---------------------------------------------------------------------------
// In-process channel link
// ---------------------------------------------------------------------------

struct PeerSession {
    push_tx: mpsc::Sender<ServerEvent>,
    close_tx: Option<oneshot::Sender<()>>,
}

struct PeerShared {
    session: Mutex<Option<PeerSession>>,
    sent: mpsc::UnboundedSender<ClientEvent>,
    /// When set, emissions whose encoded frame contains this substring are
    /// acked with an error instead of being delivered.
    fail_matching: StdMutex<Option<String>>,
    refuse_opens: AtomicBool,
    opens: AtomicU32,
}

/// Link half of an in-process connection pair.
pub struct ChannelLink {
    shared: Arc<PeerShared>,
}

/// "Server" half of an in-process connection pair: observes what the
/// client emitted, pushes server events, and can sever the connection.
pub struct ChannelPeer {
    shared: Arc<PeerShared>,
    pub sent_rx: mpsc::UnboundedReceiver<ClientEvent>,
}

/// Build a connected [`ChannelLink`] / [`ChannelPeer`] pair.
pub fn channel_link() -> (ChannelLink, ChannelPeer) {
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(PeerShared {
        session: Mutex::new(None),
        sent: sent_tx,
        fail_matching: StdMutex::new(None),
        refuse_opens: AtomicBool::new(false),
        opens: AtomicU32::new(0),
    });
    (
        ChannelLink {
            shared: Arc::clone(&shared),
        },
        ChannelPeer { shared, sent_rx },
    )
}

#[async_trait]
impl SocketLink for ChannelLink {
    async fn open(&self, _token: &str) -> Result<LinkHandle, NetError> {
        self.shared.opens.fetch_add(1, Ordering::SeqCst);
        if self.shared.refuse_opens.load(Ordering::SeqCst) {
            return Err(NetError::Handshake("connection refused".into()));
        }

        let (out_tx, mut out_rx) = mpsc::channel::<OutboundFrame>(CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<ServerEvent>(CHANNEL_CAPACITY);
        let (close_tx, mut close_rx) = oneshot::channel::<()>();

        // Replacing the previous session drops its push sender, which ends
        // the transport's old inbound stream, like a real disconnect.
        *self.shared.session.lock().await = Some(PeerSession {
            push_tx: in_tx,
            close_tx: Some(close_tx),
        });

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut close_rx => break,
                    frame = out_rx.recv() => {
                        let Some(OutboundFrame { event, ack }) = frame else { break };
                        let should_fail = {
                            let rule = shared.fail_matching.lock().unwrap_or_else(|e| e.into_inner());
                            match (&*rule, event.to_frame()) {
                                (Some(needle), Ok(text)) => text.contains(needle.as_str()),
                                _ => false,
                            }
                        };
                        if should_fail {
                            let _ = ack.send(Err(NetError::Send("simulated write failure".into())));
                        } else {
                            let _ = shared.sent.send(event);
                            let _ = ack.send(Ok(()));
                        }
                    }
                }
            }
        });

        Ok(LinkHandle {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

impl ChannelPeer {
    /// Deliver a server event on the current connection. Returns `false`
    /// when no connection is open.
    pub async fn push(&self, event: ServerEvent) -> bool {
        let session = self.shared.session.lock().await;
        match session.as_ref() {
            Some(s) => s.push_tx.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Sever the current connection, as a transport-level drop would.
    pub async fn drop_connection(&self) {
        if let Some(mut session) = self.shared.session.lock().await.take() {
            if let Some(close) = session.close_tx.take() {
                let _ = close.send(());
            }
        }
    }

    /// Refuse (or accept again) subsequent `open` calls.
    pub fn set_refuse_opens(&self, refuse: bool) {
        self.shared.refuse_opens.store(refuse, Ordering::SeqCst);
    }

    /// Fail emissions whose encoded frame contains `needle`.
    pub fn set_fail_matching(&self, needle: Option<&str>) {
        *self
            .shared
            .fail_matching
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = needle.map(str::to_owned);
    }

    /// How many times `open` has been called.
    pub fn opens(&self) -> u32 {
        self.shared.opens.load(Ordering::SeqCst)
    }

    /// Receive the next event the client emitted.
    pub async fn next_sent(&mut self) -> Option<ClientEvent> {
        self.sent_rx.recv().await
    }
}
