//! Connection lifecycle, outbound queueing, and subscription fan-out.
//!
//! The transport owns exactly one connection at a time. External code talks
//! to it through [`SocketTransport`], a cheaply cloneable handle; inbound
//! events are fanned out to registered handlers, and outbound sends made
//! while disconnected are queued and flushed in order on reconnect.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use parley_shared::constants::{MAX_RECONNECT_ATTEMPTS, RECONNECT_BASE_DELAY_MS};
use parley_shared::protocol::{ClientEvent, ServerEvent, ServerEventKind};

use crate::error::NetError;
use crate::link::{LinkHandle, OutboundFrame, SocketLink};

/// Handler invoked for every inbound event of a subscribed kind.
///
/// Handlers are compared by `Arc` identity: registering the same `Arc`
/// twice is a no-op, and unsubscribing requires the same `Arc`.
pub type EventHandler = Arc<dyn Fn(ServerEvent) + Send + Sync>;

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Socket endpoint, e.g. `ws://localhost:5001`.
    pub url: String,
    /// Reconnection attempts before the terminal connection-failed state.
    pub max_reconnect_attempts: u32,
    /// Base reconnect delay; the effective delay grows linearly with the
    /// attempt number.
    pub reconnect_base_delay: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:5001".to_string(),
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            reconnect_base_delay: Duration::from_millis(RECONNECT_BASE_DELAY_MS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Disconnected,
    Connecting,
    Connected,
}

struct QueuedSend {
    event: ClientEvent,
    /// Resolves when the event is actually emitted. `None` for entries
    /// whose original caller has already been answered (failed emissions
    /// are re-queued without their ack).
    ack: Option<oneshot::Sender<Result<(), NetError>>>,
}

struct TransportState {
    phase: Phase,
    credential: Option<String>,
    outbound: Option<mpsc::Sender<OutboundFrame>>,
    queue: VecDeque<QueuedSend>,
    reconnect_attempts: u32,
}

struct TransportInner {
    link: Arc<dyn SocketLink>,
    config: TransportConfig,
    state: Mutex<TransportState>,
    handlers: StdMutex<HashMap<ServerEventKind, Vec<EventHandler>>>,
    connected: AtomicBool,
    connection_failed: AtomicBool,
    /// Bumped whenever a session is installed or torn down, so a stale
    /// session task can never clobber newer state.
    epoch: AtomicU64,
}

/// Handle to the socket transport. Clones share the same connection.
#[derive(Clone)]
pub struct SocketTransport {
    inner: Arc<TransportInner>,
}

impl SocketTransport {
    pub fn new(link: Arc<dyn SocketLink>, config: TransportConfig) -> Self {
        Self {
            inner: Arc::new(TransportInner {
                link,
                config,
                state: Mutex::new(TransportState {
                    phase: Phase::Disconnected,
                    credential: None,
                    outbound: None,
                    queue: VecDeque::new(),
                    reconnect_attempts: 0,
                }),
                handlers: StdMutex::new(HashMap::new()),
                connected: AtomicBool::new(false),
                connection_failed: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    /// Store (or clear) the credential presented on connect. Clearing it
    /// also stops any pending reconnection.
    pub async fn set_credential(&self, token: Option<String>) {
        let mut st = self.inner.state.lock().await;
        st.credential = token;
        st.reconnect_attempts = 0;
        self.inner.connection_failed.store(false, Ordering::SeqCst);
    }

    /// Whether the connection is currently up. Lock-free, safe to poll.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Whether reconnection attempts have been exhausted.
    pub fn is_connection_failed(&self) -> bool {
        self.inner.connection_failed.load(Ordering::SeqCst)
    }

    /// Open the connection. Idempotent: a no-op while already connected or
    /// while another connect is in flight.
    pub async fn connect(&self) -> Result<(), NetError> {
        let token = {
            let mut st = self.inner.state.lock().await;
            if st.phase != Phase::Disconnected {
                return Ok(());
            }
            let Some(token) = st.credential.clone() else {
                return Err(NetError::MissingCredential);
            };
            st.phase = Phase::Connecting;
            token
        };

        match self.inner.link.open(&token).await {
            Ok(handle) => {
                self.install_session(handle).await;
                self.flush_queue().await;
                Ok(())
            }
            Err(e) => {
                {
                    let mut st = self.inner.state.lock().await;
                    st.phase = Phase::Disconnected;
                }
                debug!(error = %e, "socket open failed");
                self.schedule_reconnect();
                Err(e)
            }
        }
    }

    /// Close the connection. Idempotent. Queued sends and registered
    /// handlers are retained.
    pub async fn disconnect(&self) {
        let mut st = self.inner.state.lock().await;
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        st.phase = Phase::Disconnected;
        st.outbound = None;
        self.inner.connected.store(false, Ordering::SeqCst);
        debug!("socket disconnected");
    }

    /// Register `handler` for events of `kind`. Set semantics: the same
    /// `Arc` registered twice stays registered once.
    pub fn subscribe(&self, kind: ServerEventKind, handler: EventHandler) {
        let mut map = self
            .inner
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let list = map.entry(kind).or_default();
        if list.iter().any(|h| Arc::ptr_eq(h, &handler)) {
            return;
        }
        list.push(handler);
    }

    /// Remove a previously registered handler.
    pub fn unsubscribe(&self, kind: ServerEventKind, handler: &EventHandler) {
        let mut map = self
            .inner
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(list) = map.get_mut(&kind) {
            list.retain(|h| !Arc::ptr_eq(h, handler));
        }
    }

    /// Emit `event`, or queue it if disconnected (kicking off a connect
    /// attempt). Resolves only once the event was actually emitted; on an
    /// emission failure the event is re-queued and the error returned.
    pub async fn send(&self, event: ClientEvent) -> Result<(), NetError> {
        if self.is_connected() {
            return match self.emit(event.clone()).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    let mut st = self.inner.state.lock().await;
                    st.queue.push_front(QueuedSend { event, ack: None });
                    Err(e)
                }
            };
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        {
            let mut st = self.inner.state.lock().await;
            st.queue.push_back(QueuedSend {
                event,
                ack: Some(ack_tx),
            });
            debug!(queued = st.queue.len(), "send queued while disconnected");
        }

        let this = self.clone();
        tokio::spawn(async move {
            // A reconnect may have finished between the connected check and
            // the queue push; flush directly in that case.
            if this.is_connected() {
                this.flush_queue().await;
            } else if let Err(e) = this.connect().await {
                debug!(error = %e, "connect attempt after queued send failed");
            }
        });

        ack_rx.await.map_err(|_| NetError::Closed)?
    }

    /// Number of sends waiting for a connection.
    pub async fn queued_len(&self) -> usize {
        self.inner.state.lock().await.queue.len()
    }

    // -- internals ----------------------------------------------------------

    async fn install_session(&self, handle: LinkHandle) {
        let epoch = {
            let mut st = self.inner.state.lock().await;
            if st.phase != Phase::Connecting {
                // A disconnect raced the open; drop the fresh connection.
                return;
            }
            st.phase = Phase::Connected;
            st.outbound = Some(handle.outbound);
            st.reconnect_attempts = 0;
            self.inner.connected.store(true, Ordering::SeqCst);
            self.inner.connection_failed.store(false, Ordering::SeqCst);
            self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1
        };
        info!("socket connected");

        let this = self.clone();
        let mut inbound = handle.inbound;
        tokio::spawn(async move {
            while let Some(event) = inbound.recv().await {
                if this.inner.epoch.load(Ordering::SeqCst) != epoch {
                    return;
                }
                this.dispatch(event);
            }
            this.on_session_closed(epoch).await;
        });
    }

    fn dispatch(&self, event: ServerEvent) {
        let handlers: Vec<EventHandler> = {
            let map = self
                .inner
                .handlers
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            map.get(&event.kind()).cloned().unwrap_or_default()
        };
        for handler in handlers {
            handler(event.clone());
        }
    }

    async fn on_session_closed(&self, epoch: u64) {
        {
            let mut st = self.inner.state.lock().await;
            if self.inner.epoch.load(Ordering::SeqCst) != epoch {
                // Superseded by a newer session or an explicit disconnect.
                return;
            }
            st.phase = Phase::Disconnected;
            st.outbound = None;
            self.inner.connected.store(false, Ordering::SeqCst);
            if st.credential.is_none() {
                return;
            }
        }
        info!("connection lost");
        self.schedule_reconnect();
    }

    /// Emit one event on the live connection and wait for the write ack.
    async fn emit(&self, event: ClientEvent) -> Result<(), NetError> {
        let outbound = {
            let st = self.inner.state.lock().await;
            st.outbound.clone().ok_or(NetError::NotConnected)?
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        outbound
            .send(OutboundFrame {
                event,
                ack: ack_tx,
            })
            .await
            .map_err(|_| NetError::Closed)?;
        ack_rx.await.map_err(|_| NetError::Closed)?
    }

    /// Drain the outbound queue FIFO. Halts on the first failed emission:
    /// the failed event goes back to the front and the remainder stays
    /// queued in order.
    async fn flush_queue(&self) {
        loop {
            let item = {
                let mut st = self.inner.state.lock().await;
                if st.phase != Phase::Connected {
                    return;
                }
                st.queue.pop_front()
            };
            let Some(item) = item else { return };

            match self.emit(item.event.clone()).await {
                Ok(()) => {
                    if let Some(ack) = item.ack {
                        let _ = ack.send(Ok(()));
                    }
                }
                Err(e) => {
                    warn!(error = %e, "flush halted; re-queueing failed send");
                    if let Some(ack) = item.ack {
                        let _ = ack.send(Err(e));
                    }
                    let mut st = self.inner.state.lock().await;
                    st.queue.push_front(QueuedSend {
                        event: item.event,
                        ack: None,
                    });
                    return;
                }
            }
        }
    }

    fn schedule_reconnect(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            let (attempt, delay) = {
                let mut st = this.inner.state.lock().await;
                if st.phase != Phase::Disconnected
                    || st.credential.is_none()
                    || this.inner.connection_failed.load(Ordering::SeqCst)
                {
                    return;
                }
                st.reconnect_attempts += 1;
                if st.reconnect_attempts > this.inner.config.max_reconnect_attempts {
                    this.inner.connection_failed.store(true, Ordering::SeqCst);
                    let attempts = st.reconnect_attempts - 1;
                    // Pending callers are answered with the terminal error;
                    // their payloads stay queued for a future manual connect.
                    for item in st.queue.iter_mut() {
                        if let Some(ack) = item.ack.take() {
                            let _ = ack.send(Err(NetError::ConnectionFailed { attempts }));
                        }
                    }
                    warn!(attempts, "reconnection attempts exhausted");
                    return;
                }
                (
                    st.reconnect_attempts,
                    this.inner.config.reconnect_base_delay * st.reconnect_attempts,
                )
            };

            info!(attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
            tokio::time::sleep(delay).await;
            if let Err(e) = this.connect().await {
                debug!(error = %e, "reconnect attempt failed");
            }
        });
    }
}
