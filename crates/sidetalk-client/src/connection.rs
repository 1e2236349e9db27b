//! WebSocket connection ownership
//!
//! The `ConnectionManager` exclusively owns the socket: it dials,
//! authenticates, pumps inbound frames into the router, and schedules
//! exponential-backoff reconnects when the transport drops. No other
//! component ever touches the raw socket; they send through a
//! [`FrameSender`] handle instead.

use crate::config::ClientConfig;
use crate::directory::PublicKeyDirectory;
use crate::error::{ClientError, Result};
use crate::router::MessageRouter;
use crate::session::SessionKeys;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use sidetalk_crypto::KeyStore;
use sidetalk_types::ClientFrame;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticated,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Authenticated => write!(f, "authenticated"),
        }
    }
}

/// Cloneable handle for transmitting frames over whatever socket is
/// currently live
///
/// Holds no socket itself; the `ConnectionManager` installs and clears the
/// underlying channel as connections come and go.
#[derive(Clone)]
pub(crate) struct FrameSender {
    slot: Arc<Mutex<Option<mpsc::UnboundedSender<Message>>>>,
}

impl FrameSender {
    pub(crate) fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) fn install(&self, tx: mpsc::UnboundedSender<Message>) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
    }

    /// Drop the current channel; the writer task then closes the socket
    pub(crate) fn clear(&self) {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub(crate) fn send_frame(&self, frame: &ClientFrame) -> Result<()> {
        let json = serde_json::to_string(frame)?;
        self.send_raw(Message::Text(json))
    }

    pub(crate) fn send_raw(&self, msg: Message) -> Result<()> {
        let guard = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(tx) => tx.send(msg).map_err(|_| ClientError::NotConnected),
            None => Err(ClientError::NotConnected),
        }
    }
}

struct ReconnectState {
    attempt: u32,
    timer: Option<JoinHandle<()>>,
}

pub(crate) struct ConnInner {
    config: ClientConfig,
    sender: FrameSender,
    router: Arc<MessageRouter>,
    keystore: Arc<KeyStore>,
    keys: Arc<SessionKeys>,
    directory: Arc<PublicKeyDirectory>,
    state_tx: watch::Sender<ConnectionState>,
    token: Mutex<Option<String>>,
    shutdown: AtomicBool,
    // Connection generation counters so each socket's close event is
    // processed exactly once
    epoch: AtomicU64,
    closed_epoch: AtomicU64,
    reconnect: Mutex<ReconnectState>,
}

pub struct ConnectionManager {
    inner: Arc<ConnInner>,
}

impl ConnectionManager {
    pub(crate) fn new(
        config: ClientConfig,
        sender: FrameSender,
        router: Arc<MessageRouter>,
        keystore: Arc<KeyStore>,
        keys: Arc<SessionKeys>,
        directory: Arc<PublicKeyDirectory>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(ConnInner {
                config,
                sender,
                router,
                keystore,
                keys,
                directory,
                state_tx,
                token: Mutex::new(None),
                shutdown: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                closed_epoch: AtomicU64::new(0),
                reconnect: Mutex::new(ReconnectState {
                    attempt: 0,
                    timer: None,
                }),
            }),
        }
    }

    /// Open the transport and complete the authentication handshake
    ///
    /// Resolves only once the server confirms authentication; dialing and
    /// the handshake are each bounded by `config.connect_timeout`, so this
    /// never hangs.
    pub async fn connect(&self, token: &str) -> Result<()> {
        if self.state() != ConnectionState::Disconnected {
            debug!(state = %self.state(), "connect called while already active");
            return Ok(());
        }
        self.inner.shutdown.store(false, Ordering::SeqCst);
        *self
            .inner
            .token
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(token.to_string());
        self.inner.establish(false).await
    }

    /// Tear down the connection and cancel any scheduled reconnect
    ///
    /// Idempotent: safe to call when already disconnected.
    pub fn disconnect(&self) {
        let inner = &self.inner;
        inner.shutdown.store(true, Ordering::SeqCst);

        let timer = {
            let mut rec = inner
                .reconnect
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            rec.timer.take()
        };
        if let Some(timer) = timer {
            timer.abort();
            debug!("cancelled pending reconnect");
        }

        // Mark the current socket's close as handled before we trigger it
        inner
            .closed_epoch
            .fetch_max(inner.epoch.load(Ordering::SeqCst), Ordering::SeqCst);
        inner.sender.clear();
        inner.router.drop_auth_waiter();
        inner.directory.fail_pending();
        inner.set_state(ConnectionState::Disconnected);
        info!("disconnected");
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Watch channel for state transitions (boolean-connected listeners
    /// subscribe here)
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Reconnect attempts since the last successful authentication
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner
            .reconnect
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .attempt
    }
}

impl ConnInner {
    fn set_state(&self, next: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                debug!(from = %current, to = %next, "connection state change");
                *current = next;
                true
            }
        });
    }

    fn token(&self) -> Option<String> {
        self.token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// One full connect attempt: dial, handshake, spawn the pumps
    ///
    /// `from_reconnect` controls who schedules the next attempt when
    /// dialing itself fails (a socket that opened and then died is instead
    /// handled by the read loop's close path).
    async fn establish(self: &Arc<Self>, from_reconnect: bool) -> Result<()> {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_state(ConnectionState::Connecting);
        debug!(url = %self.config.server_url, "dialing");

        let dial = connect_async(&self.config.server_url);
        let ws: WsStream = match tokio::time::timeout(self.config.connect_timeout, dial).await {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(e)) => {
                self.set_state(ConnectionState::Disconnected);
                if from_reconnect && !self.shutdown.load(Ordering::SeqCst) {
                    self.schedule_reconnect();
                }
                return Err(e.into());
            }
            Err(_) => {
                self.set_state(ConnectionState::Disconnected);
                if from_reconnect && !self.shutdown.load(Ordering::SeqCst) {
                    self.schedule_reconnect();
                }
                return Err(ClientError::Transport(format!(
                    "connect to {} timed out",
                    self.config.server_url
                )));
            }
        };

        let (mut sink, stream) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });
        self.sender.install(tx);
        self.set_state(ConnectionState::Connected);

        // Waiter goes in before the authenticate frame goes out, so the
        // response cannot win the race
        let (auth_tx, auth_rx) = oneshot::channel();
        self.router.set_auth_waiter(auth_tx);

        let token = self.token().ok_or(ClientError::NotConnected)?;
        self.sender
            .send_frame(&ClientFrame::Authenticate { token })?;
        debug!("sent authentication");

        let reader = Arc::clone(self);
        tokio::spawn(async move { reader.read_loop(stream, epoch).await });

        match tokio::time::timeout(self.config.connect_timeout, auth_rx).await {
            Ok(Ok(outcome)) if outcome.success => {
                let Some(user_id) = outcome.user_id else {
                    self.shutdown.store(true, Ordering::SeqCst);
                    self.on_transport_closed(epoch);
                    return Err(ClientError::AuthenticationFailed(
                        "server did not provide a user id".to_string(),
                    ));
                };

                let pair = self.keystore.ensure_key_pair(&user_id)?;
                self.keys.set_identity(&user_id, pair.clone());
                self.sender.send_frame(&ClientFrame::SharePublicKey {
                    public_key: BASE64.encode(pair.public_key),
                })?;

                self.set_state(ConnectionState::Authenticated);
                self.reconnect
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .attempt = 0;
                info!(user_id = %user_id, "authenticated");
                Ok(())
            }
            Ok(Ok(_)) => {
                // Explicit rejection: retrying the same token is pointless,
                // so the reconnect loop stops here
                self.shutdown.store(true, Ordering::SeqCst);
                self.on_transport_closed(epoch);
                Err(ClientError::AuthenticationFailed(
                    "server rejected token".to_string(),
                ))
            }
            Ok(Err(_)) => {
                // Waiter dropped: the socket died mid-handshake and the
                // read loop already ran the close path
                Err(ClientError::Transport(
                    "connection closed during authentication".to_string(),
                ))
            }
            Err(_) => {
                self.on_transport_closed(epoch);
                Err(ClientError::ConnectTimeout)
            }
        }
    }

    async fn read_loop(self: Arc<Self>, mut stream: SplitStream<WsStream>, epoch: u64) {
        while let Some(item) = stream.next().await {
            match item {
                Ok(Message::Text(text)) => match serde_json::from_str(&text) {
                    Ok(frame) => self.router.route(frame),
                    Err(e) => debug!(error = %e, "ignoring unrecognized frame"),
                },
                Ok(Message::Ping(payload)) => {
                    let _ = self.sender.send_raw(Message::Pong(payload));
                }
                Ok(Message::Close(_)) => {
                    debug!("server closed the connection");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "transport error");
                    break;
                }
            }
        }
        self.on_transport_closed(epoch);
    }

    /// Close handling for one connection generation; runs at most once per
    /// epoch no matter how many paths observe the failure
    fn on_transport_closed(self: &Arc<Self>, epoch: u64) {
        if self.closed_epoch.fetch_max(epoch, Ordering::SeqCst) >= epoch {
            return;
        }

        self.sender.clear();
        self.router.drop_auth_waiter();
        // Dangling key requests would otherwise wait out their full timeout
        self.directory.fail_pending();
        self.set_state(ConnectionState::Disconnected);

        if self.shutdown.load(Ordering::SeqCst) {
            debug!("transport closed during shutdown");
            return;
        }
        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if self.token().is_none() {
            debug!("no auth token known; not reconnecting");
            return;
        }

        let mut rec = self
            .reconnect
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(max) = self.config.reconnect.max_attempts {
            if rec.attempt >= max {
                warn!(attempts = rec.attempt, "reconnect attempts exhausted");
                return;
            }
        }

        let delay = self.config.reconnect.delay_for(rec.attempt);
        rec.attempt += 1;
        let attempt = rec.attempt;
        info!(attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");

        let inner = Arc::clone(self);
        rec.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if inner.shutdown.load(Ordering::SeqCst) {
                return;
            }
            match inner.establish(true).await {
                Ok(()) => info!("reconnected"),
                Err(e) => warn!(error = %e, "reconnect attempt failed"),
            }
        }));
    }
}
