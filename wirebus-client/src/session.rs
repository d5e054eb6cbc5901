//! Client session state machine.
//!
//! A session owns one outbound connection to a server and walks
//! `Disconnected → Connecting → Connected → Authenticated`. A background
//! loop, woken once per interval, is the only place reconnection is
//! attempted; everything else just raises the reconnect flag. Deliveries
//! made while not authenticated go to a bounded replay cache that is
//! flushed right after authentication succeeds.

use crate::error::ClientError;
use crate::replay::ReplayCache;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;
use wirebus_core::{
    ChannelTransport, Connection, PoolConfig, ProcessorPool, ProcessorRegistry, Transport,
};
use wirebus_protocol::{
    ByteFramer, CodecConfig, Packet, PacketCodec, Payload, AUTH_IDENTIFIER, KEY_AUTH_IDENTIFIER,
    KEY_RESULT, KEY_TOKEN,
};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address.
    pub addr: SocketAddr,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// How long to wait for the auth echo.
    pub auth_timeout: Duration,
    /// Background loop wake interval (keepalive and reconnect pacing).
    pub ping_interval: Duration,
    /// Maximum entries in the replay cache.
    pub replay_limit: usize,
    /// Packet codec options.
    pub codec: CodecConfig,
    /// Options for the client-side dispatch pool.
    pub pool: PoolConfig,
}

impl ClientConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: Duration::from_secs(10),
            auth_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            replay_limit: 1000,
            codec: CodecConfig::default(),
            pool: PoolConfig::default().with_workers(2),
        }
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_replay_limit(mut self, limit: usize) -> Self {
        self.replay_limit = limit;
        self
    }

    pub fn with_codec(mut self, codec: CodecConfig) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }
}

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No transport.
    Disconnected,
    /// Transport being established.
    Connecting,
    /// Transport up, not yet authenticated.
    Connected,
    /// Handshake accepted; deliveries flow.
    Authenticated,
}

/// A client session: one outbound connection plus its lifecycle machinery.
pub struct ClientSession {
    config: ClientConfig,
    codec: Arc<PacketCodec>,
    connection: Arc<Connection>,
    state: Mutex<SessionState>,
    reconnect_requested: AtomicBool,
    replay: ReplayCache,
    pool: Arc<ProcessorPool>,
    credentials: Mutex<Option<(String, String)>>,
    auth_waiter: Mutex<Option<oneshot::Sender<bool>>>,
    read_task: Mutex<Option<JoinHandle<()>>>,
    loop_task: Mutex<Option<JoinHandle<()>>>,
    loop_running: AtomicBool,
    authenticated_hook: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
}

impl ClientSession {
    /// Creates a session. Inbound packets dispatch through `processors`;
    /// call [`ClientSession::start`] to run the keepalive/reconnect loop.
    pub fn new(config: ClientConfig, processors: Arc<ProcessorRegistry>) -> Arc<Self> {
        let codec = Arc::new(PacketCodec::new(config.codec.clone()));

        // Placeholder transport until the first connect.
        let (transport, _rx) = ChannelTransport::new();
        transport.close();
        let connection = Connection::new(
            format!("client-{}", Uuid::new_v4()),
            transport,
            codec.clone(),
        );

        // Client pools have no connection registry: handler results are
        // dropped rather than answered.
        let pool = ProcessorPool::new(config.pool.clone(), processors, None);

        Arc::new(Self {
            replay: ReplayCache::new(config.replay_limit),
            config,
            codec,
            connection,
            state: Mutex::new(SessionState::Disconnected),
            reconnect_requested: AtomicBool::new(false),
            pool,
            credentials: Mutex::new(None),
            auth_waiter: Mutex::new(None),
            read_task: Mutex::new(None),
            loop_task: Mutex::new(None),
            loop_running: AtomicBool::new(false),
            authenticated_hook: Mutex::new(None),
        })
    }

    /// Registers a hook fired after each successful authentication.
    pub fn on_authenticated(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.authenticated_hook.lock() = Some(Arc::new(hook));
    }

    /// Connects and authenticates. A no-op when already authenticated on a
    /// live transport, or while another connect is in flight.
    pub async fn connect(self: &Arc<Self>, identifier: &str, token: &str) -> Result<(), ClientError> {
        {
            let mut state = self.state.lock();
            match *state {
                SessionState::Authenticated if !self.connection.is_closed() => return Ok(()),
                SessionState::Connecting => return Ok(()),
                _ => *state = SessionState::Connecting,
            }
        }
        *self.credentials.lock() = Some((identifier.to_string(), token.to_string()));

        match self.establish(identifier, token).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let mut state = self.state.lock();
                if *state == SessionState::Connecting {
                    *state = SessionState::Disconnected;
                }
                Err(e)
            }
        }
    }

    async fn establish(self: &Arc<Self>, identifier: &str, token: &str) -> Result<(), ClientError> {
        // Tear down any previous read task before rebinding.
        if let Some(task) = self.read_task.lock().take() {
            task.abort();
        }

        tracing::debug!("connecting to {}", self.config.addr);
        let stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(self.config.addr),
        )
        .await
        .map_err(|_| ClientError::Timeout)??;
        stream.set_nodelay(true).ok();
        let (read_half, mut write_half) = stream.into_split();

        let (transport, mut writer_rx) = ChannelTransport::new();
        tokio::spawn(async move {
            while let Some(bytes) = writer_rx.recv().await {
                if write_half.write_all(&bytes).await.is_err() {
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        self.connection.rebind(transport);
        *self.state.lock() = SessionState::Connected;

        let weak = Arc::downgrade(self);
        *self.read_task.lock() = Some(tokio::spawn(Self::read_loop(weak, read_half)));

        // Authenticate: send the handshake packet and wait for its echo.
        let (tx, rx) = oneshot::channel();
        *self.auth_waiter.lock() = Some(tx);
        let packet = Packet::new(
            Uuid::new_v4().to_string(),
            AUTH_IDENTIFIER,
            json!({ KEY_AUTH_IDENTIFIER: identifier, KEY_TOKEN: token }),
        );
        self.connection.send(&packet).map_err(ClientError::Core)?;

        let accepted = tokio::time::timeout(self.config.auth_timeout, rx)
            .await
            .map_err(|_| ClientError::Timeout)?
            .map_err(|_| ClientError::ConnectionClosed)?;

        if !accepted {
            tracing::warn!("server rejected credentials for '{}'", identifier);
            return Err(ClientError::AuthRejected);
        }

        *self.state.lock() = SessionState::Authenticated;
        tracing::info!("authenticated as '{}'", identifier);

        let hook = self.authenticated_hook.lock().clone();
        if let Some(hook) = hook {
            hook();
        }
        self.process_cached_data();
        Ok(())
    }

    async fn read_loop(session: Weak<ClientSession>, mut read_half: OwnedReadHalf) {
        let mut framer = ByteFramer::new();
        let mut buf = [0u8; 8192];

        loop {
            let n = match read_half.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            let Some(session) = session.upgrade() else { return };

            if framer.feed(&buf[..n]).is_err() {
                tracing::warn!("framing error from server, dropping link");
                session.connection.close();
                session.reconnect_requested.store(true, Ordering::Release);
                return;
            }

            while let Some(payload) = framer.next() {
                match session.codec.decode(&payload) {
                    Ok(packet) if packet.is_auth() => {
                        let accepted = packet
                            .payload
                            .as_value()
                            .and_then(|v| v.get(KEY_RESULT))
                            .and_then(Value::as_bool)
                            .unwrap_or(false);
                        if let Some(tx) = session.auth_waiter.lock().take() {
                            let _ = tx.send(accepted);
                        }
                    }
                    Ok(mut packet) => {
                        packet.connection_id = session.connection.id();
                        if session.pool.push(packet).await.is_err() {
                            tracing::warn!("client dispatch queue closed, dropping packet");
                        }
                    }
                    Err(e) => tracing::warn!("dropping undecodable packet: {}", e),
                }
            }
        }

        if let Some(session) = session.upgrade() {
            tracing::debug!("server link lost");
            session.connection.close();
        }
    }

    /// Hands a payload to the server, or caches it for replay.
    ///
    /// When authenticated on a live transport the packet is sent
    /// immediately; a send failure raises the reconnect flag and caches
    /// the delivery. While not authenticated no send is attempted.
    pub fn deliver(&self, identifier: &str, payload: Payload) {
        let authenticated = *self.state.lock() == SessionState::Authenticated;
        if authenticated && !self.connection.is_closed() {
            let packet = Packet::new(Uuid::new_v4().to_string(), identifier, payload.clone());
            match self.connection.send(&packet) {
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!("deliver to '{}' failed, caching for replay: {}", identifier, e);
                    self.reconnect_requested.store(true, Ordering::Release);
                }
            }
        }
        self.replay.push(identifier, payload);
    }

    /// Drains the replay cache, re-delivering each entry in FIFO order.
    pub fn process_cached_data(&self) {
        let cached = self.replay.drain();
        if cached.is_empty() {
            return;
        }
        tracing::info!("replaying {} cached deliveries", cached.len());
        for (identifier, payload) in cached {
            self.deliver(&identifier, payload);
        }
    }

    /// Starts the background keepalive/reconnect loop.
    pub fn start(self: &Arc<Self>) {
        if self.loop_task.lock().is_some() {
            return;
        }
        self.loop_running.store(true, Ordering::Release);
        let weak = Arc::downgrade(self);
        let interval = self.config.ping_interval;
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(session) = weak.upgrade() else { break };
                if !session.loop_running.load(Ordering::Acquire) {
                    break;
                }
                session.tick().await;
            }
        });
        *self.loop_task.lock() = Some(task);
    }

    /// One background-loop iteration: reconnect if requested, otherwise
    /// keepalive a healthy session or flag an unhealthy one.
    async fn tick(self: &Arc<Self>) {
        if self.reconnect_requested.swap(false, Ordering::AcqRel) {
            let credentials = self.credentials.lock().clone();
            if let Some((identifier, token)) = credentials {
                if let Err(e) = self.connect(&identifier, &token).await {
                    tracing::debug!("reconnect attempt failed: {}", e);
                }
            }
            return;
        }

        let authenticated = *self.state.lock() == SessionState::Authenticated;
        if authenticated {
            if self.connection.is_closed() {
                *self.state.lock() = SessionState::Disconnected;
                self.reconnect_requested.store(true, Ordering::Release);
            } else if self.connection.send_keepalive().is_err() {
                self.reconnect_requested.store(true, Ordering::Release);
            }
        } else {
            self.reconnect_requested.store(true, Ordering::Release);
        }
    }

    /// Stops the background loop, closes the transport and releases the
    /// session's I/O resources. Terminal: not re-entrant with an in-flight
    /// connect.
    pub fn disconnect(&self) {
        self.loop_running.store(false, Ordering::Release);
        if let Some(task) = self.loop_task.lock().take() {
            task.abort();
        }
        if let Some(task) = self.read_task.lock().take() {
            task.abort();
        }
        self.auth_waiter.lock().take();
        self.reconnect_requested.store(false, Ordering::Release);
        self.connection.close();
        self.pool.shutdown();
        *self.state.lock() = SessionState::Disconnected;
        tracing::info!("session disconnected");
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == SessionState::Authenticated
    }

    /// Whether a reconnect is pending for the next loop wake-up.
    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_requested.load(Ordering::Acquire)
    }

    /// Number of deliveries waiting for replay.
    pub fn cached_deliveries(&self) -> usize {
        self.replay.len()
    }

    /// The session's connection.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }
}
