//! TCP server implementation.

use crate::auth::{AuthGate, AuthOutcome};
use crate::config::Config;
use crate::error::ServerError;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use uuid::Uuid;
use wirebus_core::{
    AssuredProcessorPool, ChannelTransport, Connection, ConnectionRegistry, CoreError, PoolConfig,
    ProcessorPool, ProcessorRegistry,
};
use wirebus_protocol::{ByteFramer, CodecConfig, PacketCodec, ProtocolError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Dispatch pool options.
    pub pool: PoolConfig,
    /// Use the assured pool (every request gets a response).
    pub assured: bool,
    /// Packet codec options.
    pub codec: CodecConfig,
    /// Consecutive auth failures tolerated before the connection is cut.
    pub auth_max_failures: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], wirebus_protocol::DEFAULT_PORT)),
            pool: PoolConfig::default(),
            assured: false,
            codec: CodecConfig::default(),
            auth_max_failures: crate::auth::DEFAULT_MAX_FAILURES,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Builds a runtime configuration from loaded settings.
    pub fn from_settings(config: &Config) -> Self {
        let mut codec = CodecConfig::default().with_min_compress_len(config.codec.min_compress_len);
        if config.codec.compression {
            codec = codec.with_compression();
        }
        let mut pool = PoolConfig::default()
            .with_workers(config.pool.workers)
            .with_shard_capacity(config.pool.shard_capacity)
            .with_poll_timeout(config.pool.poll_timeout());
        if !config.pool.queueing {
            pool = pool.without_queueing();
        }
        Self {
            bind_addr: config.network.bind_addr,
            pool,
            assured: config.pool.assured,
            codec,
            auth_max_failures: config.auth.max_failures,
        }
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub auth_failures_total: AtomicU64,
    pub errors_total: AtomicU64,
}

/// Either dispatch pool variant.
enum Dispatcher {
    Plain(Arc<ProcessorPool>),
    Assured(Arc<AssuredProcessorPool>),
}

impl Dispatcher {
    async fn push(&self, packet: wirebus_protocol::Packet) -> Result<(), CoreError> {
        match self {
            Dispatcher::Plain(pool) => pool.push(packet).await,
            Dispatcher::Assured(pool) => pool.push(packet).await,
        }
    }

    fn shutdown(&self) {
        match self {
            Dispatcher::Plain(pool) => pool.shutdown(),
            Dispatcher::Assured(pool) => pool.shutdown(),
        }
    }
}

/// TCP server for the wirebus protocol.
pub struct Server {
    config: ServerConfig,
    codec: Arc<PacketCodec>,
    registry: Arc<ConnectionRegistry>,
    dispatcher: Dispatcher,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server {
    /// Creates a new server over the given processor registry.
    pub fn new(config: ServerConfig, processors: Arc<ProcessorRegistry>) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        let registry = ConnectionRegistry::new();
        let dispatcher = if config.assured {
            Dispatcher::Assured(AssuredProcessorPool::new(
                config.pool.clone(),
                processors,
                registry.clone(),
            ))
        } else {
            Dispatcher::Plain(ProcessorPool::new(
                config.pool.clone(),
                processors,
                Some(registry.clone()),
            ))
        };
        Arc::new(Self {
            codec: Arc::new(PacketCodec::new(config.codec.clone())),
            config,
            registry,
            dispatcher,
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        })
    }

    /// Binds the configured address and runs the accept loop.
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!("server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Runs the accept loop over an already-bound listener.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> Result<(), ServerError> {
        self.running.store(true, Ordering::SeqCst);
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                            self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

                            let server = Arc::clone(self);
                            let mut conn_shutdown = self.shutdown.subscribe();
                            tokio::spawn(async move {
                                let result = server
                                    .handle_connection(stream, addr, &mut conn_shutdown)
                                    .await;
                                if let Err(e) = result {
                                    tracing::debug!("connection {} error: {}", addr, e);
                                    server.stats.errors_total.fetch_add(1, Ordering::Relaxed);
                                }
                                server.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                                tracing::info!("client disconnected: {}", addr);
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("server shutting down");
                    break;
                }
            }
        }

        self.dispatcher.shutdown();
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Handles one accepted connection until EOF, error or shutdown.
    async fn handle_connection(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        tracing::info!("client connected: {}", addr);
        stream.set_nodelay(true).ok();
        let (mut read_half, mut write_half) = stream.into_split();

        let (transport, mut writer_rx) = ChannelTransport::new();
        let writer = tokio::spawn(async move {
            while let Some(bytes) = writer_rx.recv().await {
                if write_half.write_all(&bytes).await.is_err() {
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        let conn = Connection::new(
            Uuid::new_v4().to_string(),
            transport,
            self.codec.clone(),
        );
        self.registry.add(conn.clone());

        let result = self.read_loop(&mut read_half, &conn, shutdown).await;

        self.registry.remove(&conn.id());
        conn.close();
        // close() dropped the writer channel; give the task a moment to
        // flush, then cut it loose.
        let _ = tokio::time::timeout(Duration::from_secs(1), writer).await;

        result
    }

    async fn read_loop(
        &self,
        read_half: &mut OwnedReadHalf,
        conn: &Arc<Connection>,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        let mut framer = ByteFramer::new();
        let mut gate = AuthGate::new(self.config.auth_max_failures);
        let mut buf = [0u8; 8192];

        loop {
            tokio::select! {
                result = read_half.read(&mut buf) => {
                    match result {
                        Ok(0) => {
                            tracing::debug!("[{}] connection closed by peer", conn.id());
                            return Ok(());
                        }
                        Ok(n) => {
                            // Framing errors are fatal for the connection.
                            framer.feed(&buf[..n])?;
                            while let Some(payload) = framer.next() {
                                if !self.process_payload(&payload, conn, &mut gate).await? {
                                    return Ok(());
                                }
                            }
                        }
                        Err(e) => return Err(ServerError::Io(e)),
                    }
                }
                _ = shutdown.recv() => {
                    tracing::debug!("[{}] shutdown signal received", conn.id());
                    return Err(ServerError::ShuttingDown);
                }
            }
        }
    }

    /// Decodes and routes one framed payload. Returns false when the
    /// connection should be dropped.
    async fn process_payload(
        &self,
        payload: &[u8],
        conn: &Arc<Connection>,
        gate: &mut AuthGate,
    ) -> Result<bool, ServerError> {
        let mut packet = match self.codec.decode(payload) {
            Ok(packet) => packet,
            Err(e @ ProtocolError::EmptyHead) => return Err(e.into()),
            Err(e) => {
                // Malformed packets are dropped; the connection survives.
                tracing::warn!("[{}] dropping undecodable packet: {}", conn.id(), e);
                return Ok(true);
            }
        };
        packet.connection_id = conn.id();

        if !gate.is_authenticated() {
            match gate.evaluate(&packet) {
                AuthOutcome::Accepted { identity, response } => {
                    let transport_id = conn.id();
                    self.registry.replace(&transport_id, &identity);
                    tracing::info!("[{}] authenticated as '{}'", transport_id, identity);
                    if let Err(e) = conn.send(&response) {
                        tracing::warn!("[{}] auth echo failed: {}", conn.id(), e);
                    }
                }
                AuthOutcome::Rejected { response } => {
                    self.stats.auth_failures_total.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("[{}] authentication failed", conn.id());
                    let _ = conn.send(&response);
                }
                AuthOutcome::LockedOut => {
                    self.stats.auth_failures_total.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("[{}] closing after repeated auth failures", conn.id());
                    return Ok(false);
                }
            }
            return Ok(true);
        }

        self.dispatcher.push(packet).await?;
        Ok(true)
    }

    /// Initiates server shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns whether the accept loop is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    /// Returns the connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wirebus_core::{CoreError, DispatchContext, Processor};
    use wirebus_protocol::{encode_frame, Packet, Payload, AUTH_IDENTIFIER};

    struct Echo;

    impl Processor for Echo {
        fn identifier(&self) -> &str {
            "echo"
        }

        fn handle(
            &self,
            _ctx: &DispatchContext,
            _request_id: &str,
            _method: &str,
            payload: &Payload,
        ) -> Result<Option<Payload>, CoreError> {
            Ok(Some(payload.clone()))
        }
    }

    struct TestClient {
        stream: TcpStream,
        framer: ByteFramer,
        codec: PacketCodec,
    }

    impl TestClient {
        async fn connect(addr: SocketAddr) -> Self {
            Self {
                stream: TcpStream::connect(addr).await.unwrap(),
                framer: ByteFramer::new(),
                codec: PacketCodec::default(),
            }
        }

        async fn send(&mut self, packet: &Packet) {
            let payload = self.codec.encode(packet).unwrap();
            self.stream.write_all(&encode_frame(&payload)).await.unwrap();
        }

        /// Reads until one packet is decoded, or returns None on EOF.
        async fn recv(&mut self) -> Option<Packet> {
            let mut buf = [0u8; 4096];
            loop {
                if let Some(payload) = self.framer.next() {
                    return Some(self.codec.decode(&payload).unwrap());
                }
                let n = self.stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    return None;
                }
                self.framer.feed(&buf[..n]).unwrap();
            }
        }
    }

    fn auth_packet(request_id: &str, identity: &str, token: &str) -> Packet {
        Packet::new(
            request_id,
            AUTH_IDENTIFIER,
            json!({ "authIdentifier": identity, "token": token }),
        )
    }

    async fn start_server(assured: bool) -> (SocketAddr, Arc<Server>) {
        let mut processors = ProcessorRegistry::new();
        processors.register(Arc::new(Echo));

        let mut config = ServerConfig::new("127.0.0.1:0".parse().unwrap());
        config.assured = assured;
        config.pool = PoolConfig::default()
            .with_workers(2)
            .with_poll_timeout(Duration::from_millis(20));

        let server = Server::new(config, Arc::new(processors));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server_ref = server.clone();
        tokio::spawn(async move {
            let _ = server_ref.serve(listener).await;
        });
        (addr, server)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_auth_then_request_response() {
        let (addr, server) = start_server(false).await;
        let mut client = TestClient::connect(addr).await;

        client.send(&auth_packet("a1", "user-7", "secret")).await;
        let echo = client.recv().await.unwrap();
        assert_eq!(echo.request_id, "a1");
        assert_eq!(echo.payload.as_value().unwrap()["result"], json!(true));

        client
            .send(&Packet::new("r1", "echo.ping", json!("hi")))
            .await;
        let response = client.recv().await.unwrap();
        assert_eq!(response.request_id, "r1");
        assert_eq!(response.payload, Payload::Value(json!("hi")));

        server.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_auth_lockout_after_three_failures() {
        let (addr, server) = start_server(false).await;
        let mut client = TestClient::connect(addr).await;

        // Two rejections, each echoed with result=false.
        for i in 0..2 {
            client.send(&auth_packet(&format!("a{}", i), "", "")).await;
            let echo = client.recv().await.unwrap();
            assert_eq!(echo.payload.as_value().unwrap()["result"], json!(false));
        }

        // Third failure closes the connection without an echo.
        client.send(&auth_packet("a2", "", "")).await;
        assert!(client.recv().await.is_none());

        server.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_non_auth_packet_before_auth_is_rejected() {
        let (addr, server) = start_server(false).await;
        let mut client = TestClient::connect(addr).await;

        client
            .send(&Packet::new("r1", "echo.ping", json!("sneaky")))
            .await;
        let echo = client.recv().await.unwrap();
        // Counted as an auth failure and answered with result=false; the
        // echo processor never ran.
        assert_eq!(echo.request_id, "r1");
        assert_eq!(echo.payload.as_value().unwrap()["result"], json!(false));

        server.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_assured_pool_answers_unknown_processor() {
        let (addr, server) = start_server(true).await;
        let mut client = TestClient::connect(addr).await;

        client.send(&auth_packet("a1", "user-1", "t")).await;
        client.recv().await.unwrap();

        client.send(&Packet::new("r1", "ghost.run", json!({}))).await;
        let response = client.recv().await.unwrap();
        assert_eq!(response.request_id, "r1");
        assert!(response.payload.as_value().unwrap()["error"]
            .as_str()
            .unwrap()
            .contains("ghost"));

        server.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_connection_registered_under_identity_after_auth() {
        let (addr, server) = start_server(false).await;
        let mut client = TestClient::connect(addr).await;

        client.send(&auth_packet("a1", "user-9", "secret")).await;
        client.recv().await.unwrap();

        assert!(server.registry().get("user-9").is_some());
        server.shutdown();
    }
}
