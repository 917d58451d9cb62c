//! Connection management.
//!
//! A [`Connection`] owns one socket. It frames the inbound byte stream and
//! reports everything that happens to it as [`ConnectionEvent`]s delivered to
//! the observers registered on that connection. It never looks inside a
//! message beyond its length prefix.

use crate::error::ClientError;
use crate::registry::{ConnectionInfo, ConnectionRegistry};
use crate::stream::ClientStream;
use crate::tls::create_tls_connector;
use bytes::{Bytes, BytesMut};
use docwire_protocol::{
    DecodeOptions, FrameEvent, FrameParser, ParseState, ProtocolError, DEFAULT_MAX_MESSAGE_SIZE,
    DEFAULT_PORT,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(0);

/// TLS configuration for client connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsClientConfig {
    /// Enable TLS for the connection.
    pub enabled: bool,
    /// Path to PEM-encoded CA certificate(s) for server verification.
    /// If None, the bundled web roots are used.
    pub ca_cert_path: Option<PathBuf>,
    /// Path to PEM-encoded certificate revocation list(s).
    pub crl_path: Option<PathBuf>,
    /// Path to PEM-encoded client certificate (for mTLS).
    pub client_cert_path: Option<PathBuf>,
    /// Path to PEM-encoded client private key (for mTLS).
    pub client_key_path: Option<PathBuf>,
    /// Passphrase for an encrypted private key. Encrypted keys are rejected.
    pub passphrase: Option<String>,
    /// Fail the handshake when the server certificate does not verify.
    pub reject_unauthorized: bool,
    /// Verify that the certificate matches the server name.
    pub check_server_identity: bool,
    /// Server name for SNI (defaults to the connection host).
    pub server_name: Option<String>,
    /// ALPN protocols offered during the handshake.
    pub alpn_protocols: Vec<String>,
}

impl Default for TlsClientConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ca_cert_path: None,
            crl_path: None,
            client_cert_path: None,
            client_key_path: None,
            passphrase: None,
            reject_unauthorized: true,
            check_server_identity: true,
            server_name: None,
            alpn_protocols: Vec::new(),
        }
    }
}

impl TlsClientConfig {
    pub fn new() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    pub fn with_ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    pub fn with_crl(mut self, path: impl Into<PathBuf>) -> Self {
        self.crl_path = Some(path.into());
        self
    }

    pub fn with_client_cert(
        mut self,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        self.client_cert_path = Some(cert_path.into());
        self.client_key_path = Some(key_path.into());
        self
    }

    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    /// Skip server certificate verification (INSECURE - development only).
    pub fn with_insecure(mut self) -> Self {
        self.reject_unauthorized = false;
        self
    }

    pub fn without_server_identity_check(mut self) -> Self {
        self.check_server_identity = false;
        self
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    pub fn with_alpn_protocols(mut self, protocols: Vec<String>) -> Self {
        self.alpn_protocols = protocols;
        self
    }
}

/// Address family used when resolving the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    #[default]
    V4,
    V6,
    Any,
}

impl AddressFamily {
    fn accepts(&self, addr: &SocketAddr) -> bool {
        match self {
            AddressFamily::V4 => addr.is_ipv4(),
            AddressFamily::V6 => addr.is_ipv6(),
            AddressFamily::Any => true,
        }
    }
}

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server host name, address, or Unix domain socket path.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Address family for name resolution.
    pub family: AddressFamily,
    /// Enable TCP keepalive.
    pub keep_alive: bool,
    /// Idle time before the first keepalive probe.
    pub keep_alive_initial_delay: Duration,
    /// Disable Nagle's algorithm.
    pub no_delay: bool,
    /// Time allowed for dial and TLS handshake.
    pub connect_timeout: Duration,
    /// Inactivity window once connected. Zero disables it.
    pub socket_timeout: Duration,
    /// Largest framed message accepted from the server.
    pub max_message_size: usize,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
    /// Value promotion applied when decoding replies.
    pub promote: DecodeOptions,
    /// TLS configuration (optional).
    pub tls: Option<TlsClientConfig>,
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            family: AddressFamily::V4,
            keep_alive: true,
            keep_alive_initial_delay: Duration::from_secs(300),
            no_delay: true,
            connect_timeout: Duration::from_secs(30),
            socket_timeout: Duration::from_secs(360),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            promote: DecodeOptions::default(),
            tls: None,
        }
    }

    pub fn with_family(mut self, family: AddressFamily) -> Self {
        self.family = family;
        self
    }

    pub fn with_keep_alive(mut self, enabled: bool, initial_delay: Duration) -> Self {
        self.keep_alive = enabled;
        self.keep_alive_initial_delay = initial_delay;
        self
    }

    pub fn with_no_delay(mut self, no_delay: bool) -> Self {
        self.no_delay = no_delay;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = timeout;
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }

    pub fn with_promote(mut self, promote: DecodeOptions) -> Self {
        self.promote = promote;
        self
    }

    pub fn with_tls(mut self, tls_config: TlsClientConfig) -> Self {
        self.tls = Some(tls_config);
        self
    }

    /// Keepalive delay, capped at half the socket timeout.
    pub fn effective_keep_alive_delay(&self) -> Duration {
        if !self.socket_timeout.is_zero() && self.keep_alive_initial_delay > self.socket_timeout {
            self.socket_timeout / 2
        } else {
            self.keep_alive_initial_delay
        }
    }

    /// Returns whether the host names a Unix domain socket.
    pub fn is_unix_socket(&self) -> bool {
        self.host.contains('/')
    }

    fn tls_enabled(&self) -> bool {
        self.tls.as_ref().is_some_and(|t| t.enabled)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new("localhost", DEFAULT_PORT)
    }
}

/// Per-connect overrides. Only these TLS options may be passed through.
#[derive(Debug, Clone, Default)]
pub struct ConnectOverrides {
    pub server_name: Option<String>,
    pub alpn_protocols: Option<Vec<String>>,
    pub ca_cert_path: Option<PathBuf>,
    pub client_cert_path: Option<PathBuf>,
    pub client_key_path: Option<PathBuf>,
    pub promote: Option<DecodeOptions>,
}

impl ConnectOverrides {
    fn apply(&self, tls: &mut TlsClientConfig) {
        if let Some(ref name) = self.server_name {
            tls.server_name = Some(name.clone());
        }
        if let Some(ref protocols) = self.alpn_protocols {
            tls.alpn_protocols = protocols.clone();
        }
        if let Some(ref path) = self.ca_cert_path {
            tls.ca_cert_path = Some(path.clone());
        }
        if let Some(ref path) = self.client_cert_path {
            tls.client_cert_path = Some(path.clone());
        }
        if let Some(ref path) = self.client_key_path {
            tls.client_key_path = Some(path.clone());
        }
    }
}

/// Something that happened on a connection.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// The socket is connected (and the TLS handshake finished).
    Connect,
    /// A complete framed message.
    Message(Bytes),
    /// A bad length prefix. The connection stays open.
    ParseError {
        error: ProtocolError,
        state: ParseState,
    },
    /// A socket or handshake error.
    Error { message: String, tls: bool },
    /// The connect or idle window elapsed.
    Timeout(String),
    /// The peer closed the socket.
    Close(String),
}

/// Receives events from a connection.
pub trait ConnectionObserver: Send + Sync {
    fn on_event(&self, connection_id: u64, event: &ConnectionEvent);
}

impl<F> ConnectionObserver for F
where
    F: Fn(u64, &ConnectionEvent) + Send + Sync,
{
    fn on_event(&self, connection_id: u64, event: &ConnectionEvent) {
        self(connection_id, event)
    }
}

enum ReadOutcome {
    Data(usize),
    Eof,
    TimedOut,
    Failed(std::io::Error),
}

/// A connection to a database server.
pub struct Connection {
    id: u64,
    config: ConnectionConfig,
    registry: Option<Arc<ConnectionRegistry>>,
    /// Write half of the stream (for sending requests).
    writer: Mutex<Option<WriteHalf<ClientStream>>>,
    /// Read half of the stream, taken by the read loop.
    reader: Mutex<Option<ReadHalf<ClientStream>>>,
    observers: RwLock<Vec<Arc<dyn ConnectionObserver>>>,
    connected: AtomicBool,
    destroyed: AtomicBool,
    tls: AtomicBool,
    socket_timeout_ms: AtomicU64,
    promote: RwLock<DecodeOptions>,
    shutdown: Notify,
}

impl Connection {
    /// Creates a new connection (not yet connected).
    pub fn new(config: ConnectionConfig, registry: Option<Arc<ConnectionRegistry>>) -> Self {
        let promote = config.promote;
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::SeqCst),
            config,
            registry,
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            observers: RwLock::new(Vec::new()),
            connected: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            tls: AtomicBool::new(false),
            socket_timeout_ms: AtomicU64::new(0),
            promote: RwLock::new(promote),
            shutdown: Notify::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            host: self.config.host.clone(),
            port: self.config.port,
        }
    }

    /// Decode options for replies on this connection.
    pub fn promote_options(&self) -> DecodeOptions {
        *self.promote.read()
    }

    /// Registers an observer for this connection's events.
    pub fn add_observer(&self, observer: Arc<dyn ConnectionObserver>) {
        self.observers.write().push(observer);
    }

    fn emit(&self, event: ConnectionEvent) {
        let observers = self.observers.read().clone();
        for observer in observers {
            observer.on_event(self.id, &event);
        }
    }

    fn label(&self) -> String {
        format!("connection {} to {}:{}", self.id, self.config.host, self.config.port)
    }

    /// Connects to the server.
    pub async fn connect(&self, overrides: &ConnectOverrides) -> Result<(), ClientError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(self.destroyed_error());
        }

        if let Some(promote) = overrides.promote {
            *self.promote.write() = promote;
        }

        let tls_config = if self.config.tls_enabled() {
            self.config.tls.clone().map(|mut tls| {
                overrides.apply(&mut tls);
                tls
            })
        } else {
            None
        };

        tracing::debug!("Connecting to {}:{}...", self.config.host, self.config.port);

        let stream = match tokio::time::timeout(
            self.config.connect_timeout,
            self.open_stream(tls_config.as_ref()),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::debug!("Connection failed: {}", e);
                self.emit(ConnectionEvent::Error {
                    message: format!("{} failed: {}", self.label(), e),
                    tls: tls_config.is_some(),
                });
                return Err(e);
            }
            Err(_) => {
                let message = format!("{} timed out", self.label());
                tracing::debug!("{}", message);
                self.emit(ConnectionEvent::Timeout(message.clone()));
                return Err(ClientError::Timeout(message));
            }
        };

        self.tls.store(stream.is_tls(), Ordering::SeqCst);

        // Split into read/write halves for concurrent access
        let (read_half, write_half) = tokio::io::split(stream);
        *self.writer.lock().await = Some(write_half);
        *self.reader.lock().await = Some(read_half);

        // Leave the connect window for the idle window
        self.reset_socket_timeout();
        self.connected.store(true, Ordering::SeqCst);

        if let Some(ref registry) = self.registry {
            registry.add(self.info());
        }

        tracing::debug!("{} established", self.label());
        self.emit(ConnectionEvent::Connect);
        Ok(())
    }

    async fn open_stream(
        &self,
        tls_config: Option<&TlsClientConfig>,
    ) -> Result<ClientStream, ClientError> {
        #[cfg(unix)]
        if self.config.is_unix_socket() {
            let stream = tokio::net::UnixStream::connect(&self.config.host).await?;
            return Ok(ClientStream::Unix(stream));
        }

        let addr = self.resolve().await?;
        let tcp_stream = TcpStream::connect(addr).await?;

        tracing::debug!("TCP connected, configuring socket");
        tcp_stream.set_nodelay(self.config.no_delay)?;
        if self.config.keep_alive {
            // TCP_KEEPIDLE has one-second granularity and rejects zero
            let delay = self
                .config
                .effective_keep_alive_delay()
                .max(Duration::from_secs(1));
            let keepalive = socket2::TcpKeepalive::new().with_time(delay);
            socket2::SockRef::from(&tcp_stream).set_tcp_keepalive(&keepalive)?;
        }

        // Upgrade to TLS if configured
        let Some(tls_config) = tls_config else {
            return Ok(ClientStream::Plain(tcp_stream));
        };

        if !tls_config.reject_unauthorized {
            tracing::warn!("Using insecure TLS (certificate verification disabled)");
        }
        let (connector, server_name) = create_tls_connector(tls_config, &self.config.host)?;

        tracing::debug!("Performing TLS handshake...");
        let tls_stream = connector
            .connect(server_name, tcp_stream)
            .await
            .map_err(|e| ClientError::TlsHandshake(e.to_string()))?;

        tracing::debug!("TLS handshake complete");
        Ok(ClientStream::Tls(Box::new(tls_stream)))
    }

    async fn resolve(&self) -> Result<SocketAddr, ClientError> {
        let family = self.config.family;
        tokio::net::lookup_host((self.config.host.as_str(), self.config.port))
            .await?
            .find(|addr| family.accepts(addr))
            .ok_or_else(|| {
                ClientError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!(
                        "no {:?} address found for {}",
                        family, self.config.host
                    ),
                ))
            })
    }

    /// Writes buffers to the socket in order.
    ///
    /// Returns `false` when the connection is not usable or the write failed.
    /// Write failures are also reported as an `Error` event.
    pub async fn write(&self, buffers: &[Bytes]) -> bool {
        if self.destroyed.load(Ordering::SeqCst) || !self.connected.load(Ordering::SeqCst) {
            tracing::debug!("write() on unusable {}", self.label());
            return false;
        }

        let result = {
            let mut writer_guard = self.writer.lock().await;
            let Some(writer) = writer_guard.as_mut() else {
                return false;
            };
            let mut result = Ok(());
            for buffer in buffers {
                result = writer.write_all(buffer).await;
                if result.is_err() {
                    break;
                }
            }
            match result {
                Ok(()) => writer.flush().await,
                err => err,
            }
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("write failed on {}: {}", self.label(), e);
                self.emit(ConnectionEvent::Error {
                    message: format!("{} write failed: {}", self.label(), e),
                    tls: self.is_tls(),
                });
                false
            }
        }
    }

    /// Shuts the connection down. Safe to call more than once.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("Destroying {}", self.label());
        self.connected.store(false, Ordering::SeqCst);

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        let _ = self.reader.lock().await.take();

        // Stops the read loop, now or when it next polls
        self.shutdown.notify_one();

        if let Some(ref registry) = self.registry {
            registry.remove(self.id);
        }
    }

    fn destroyed_error(&self) -> ClientError {
        ClientError::ConnectionDestroyed {
            host: self.config.host.clone(),
            port: self.config.port,
        }
    }

    /// Sets the inactivity window. Zero disables it.
    pub fn set_socket_timeout(&self, timeout: Duration) {
        self.socket_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::SeqCst);
    }

    /// Restores the configured inactivity window.
    pub fn reset_socket_timeout(&self) {
        self.set_socket_timeout(self.config.socket_timeout);
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms.load(Ordering::SeqCst))
    }

    /// Returns whether the connection is established.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn is_tls(&self) -> bool {
        self.tls.load(Ordering::SeqCst)
    }

    /// Reads and frames messages until the socket ends (call this in a background task).
    pub async fn read_loop(&self) {
        let Some(mut reader) = self.reader.lock().await.take() else {
            tracing::debug!("read_loop: no reader for {}", self.label());
            return;
        };
        tracing::debug!("read_loop started for {}", self.label());

        let mut parser = FrameParser::new(self.config.max_message_size);
        let mut buf = BytesMut::with_capacity(self.config.read_buffer_size);

        loop {
            buf.reserve(self.config.read_buffer_size);
            let timeout = self.socket_timeout();

            let outcome = tokio::select! {
                _ = self.shutdown.notified() => {
                    tracing::debug!("read_loop: shutdown requested");
                    return;
                }
                outcome = read_chunk(&mut reader, &mut buf, timeout) => outcome,
            };

            match outcome {
                ReadOutcome::Data(n) => {
                    tracing::trace!("read_loop: received {} bytes", n);
                    for event in parser.push(buf.split().freeze()) {
                        match event {
                            FrameEvent::Message(message) => {
                                self.emit(ConnectionEvent::Message(message))
                            }
                            FrameEvent::ParseError { error, state } => {
                                tracing::warn!("{}: parse error: {}", self.label(), error);
                                self.emit(ConnectionEvent::ParseError { error, state });
                            }
                        }
                    }
                }
                ReadOutcome::Eof => {
                    self.terminate(ConnectionEvent::Close(format!("{} closed", self.label())));
                    return;
                }
                ReadOutcome::TimedOut => {
                    self.terminate(ConnectionEvent::Timeout(format!(
                        "{} timed out",
                        self.label()
                    )));
                    return;
                }
                ReadOutcome::Failed(e) => {
                    if self.is_destroyed() {
                        return;
                    }
                    self.terminate(ConnectionEvent::Error {
                        message: format!("{} failed: {}", self.label(), e),
                        tls: self.is_tls(),
                    });
                    return;
                }
            }
        }
    }

    fn terminate(&self, event: ConnectionEvent) {
        tracing::debug!("read_loop: {:?}", event);
        self.connected.store(false, Ordering::SeqCst);
        if let Some(ref registry) = self.registry {
            registry.remove(self.id);
        }
        self.emit(event);
    }
}

async fn read_chunk(
    reader: &mut ReadHalf<ClientStream>,
    buf: &mut BytesMut,
    timeout: Duration,
) -> ReadOutcome {
    let result = if timeout.is_zero() {
        reader.read_buf(buf).await
    } else {
        match tokio::time::timeout(timeout, reader.read_buf(buf)).await {
            Ok(result) => result,
            Err(_) => return ReadOutcome::TimedOut,
        }
    };

    match result {
        Ok(0) => ReadOutcome::Eof,
        Ok(n) => ReadOutcome::Data(n),
        Err(e) => ReadOutcome::Failed(e),
    }
}
