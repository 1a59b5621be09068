//! # Transport Session
//!
//! Owns the single TCP connection to the instrument and moves raw RTU frames across
//! it. A request is written, then bytes are accumulated until the reply frame is
//! complete or the line stays quiet for the inter-byte timeout.
//!
//! Connection-level failures (reset, broken pipe, EOF before any reply byte, connect
//! failure) close the socket, wait the [`RetryPolicy`] backoff, reconnect and repeat the
//! exchange. Everything else is handed back to the caller unchanged.
//!
//! ```rust,no_run
//! use xeus_modbus::transport::{ModbusTransport, TcpRtuTransport, TransportConfig};
//! use xeus_modbus::protocol::{build_read_frame, ModbusFunction};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut transport = TcpRtuTransport::connect("192.168.0.10", 503, TransportConfig::default()).await?;
//! let frame = build_read_frame(ModbusFunction::ReadInputRegisters, 400, 15, 1)?;
//! let reply = transport.exchange(&frame).await?;
//! println!("{} bytes, {} reconnects", reply.len(), transport.get_stats().reconnects);
//! # Ok(())
//! # }
//! ```
//!
//! The device tends to ignore the first request after a (re)connect. The session does
//! not mask this; see `InstrumentClient::read_registers_primed`.

use std::fmt;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::info;

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::expected_frame_len;
use crate::utils::format::bytes_to_hex;

/// Largest single read from the socket
const MAX_RTU_FRAME_SIZE: usize = 256;

/// Accumulation stops here even without a recognizable frame
const RECEIVE_BUFFER_LIMIT: usize = 512;

fn log_packet(direction: &str, data: &[u8], unit_id: u8) {
    info!("[MODBUS-RTU/TCP] {} unit:{} {}", direction, unit_id, bytes_to_hex(data));
}

/// Byte-level exchange with the instrument
///
/// Implementations send one request frame and return the raw reply bytes, which may be
/// empty when the device stayed silent. Frame interpretation is left to the caller.
#[async_trait]
pub trait ModbusTransport: Send {
    /// Send `frame` and collect the reply
    async fn exchange(&mut self, frame: &[u8]) -> ModbusResult<Vec<u8>>;

    /// Check if the transport currently holds an open connection
    fn is_connected(&self) -> bool;

    /// Close the connection; a later exchange reconnects
    async fn close(&mut self) -> ModbusResult<()>;

    /// Get communication statistics
    fn get_stats(&self) -> TransportStats;
}

/// Transport layer statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransportStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub reconnects: u64,
}

/// Bounded reconnect-and-retry behavior for connection-level failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per exchange, the first one included
    pub max_attempts: u32,
    /// Pause before reconnecting, in milliseconds
    pub backoff_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff_ms: backoff.as_millis() as u64,
        }
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 300,
        }
    }
}

/// Session timing and diagnostics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub connect_timeout_ms: u64,
    /// Quiet period that ends reply accumulation
    pub inter_byte_timeout_ms: u64,
    pub retry: RetryPolicy,
    /// Hex dump every frame through `tracing`
    pub packet_logging: bool,
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn inter_byte_timeout(&self) -> Duration {
        Duration::from_millis(self.inter_byte_timeout_ms)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 2000,
            inter_byte_timeout_ms: 1000,
            retry: RetryPolicy::default(),
            packet_logging: false,
        }
    }
}

/// Establishes the byte stream a session runs on
#[async_trait]
pub trait Connector: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send;

    async fn connect(&self) -> io::Result<Self::Stream>;

    /// Peer description for log and error messages
    fn describe(&self) -> String;
}

/// Plain TCP connector with a connect timeout
#[derive(Debug, Clone)]
pub struct TcpConnector {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16, connect_timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self) -> io::Result<TcpStream> {
        let stream = timeout(
            self.connect_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn describe(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Connection lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// RTU framing over a raw TCP stream
pub struct TcpRtuTransport<C: Connector = TcpConnector> {
    connector: C,
    stream: Option<C::Stream>,
    state: SessionState,
    config: TransportConfig,
    stats: TransportStats,
    buffer: BytesMut,
}

impl TcpRtuTransport<TcpConnector> {
    /// Open a session to `host:port`
    pub async fn connect(host: &str, port: u16, config: TransportConfig) -> ModbusResult<Self> {
        let connector = TcpConnector::new(host, port, config.connect_timeout());
        Self::with_connector(connector, config).await
    }
}

impl<C: Connector> TcpRtuTransport<C> {
    /// Open a session over streams produced by `connector`
    pub async fn with_connector(connector: C, config: TransportConfig) -> ModbusResult<Self> {
        let mut transport = Self {
            connector,
            stream: None,
            state: SessionState::Disconnected,
            config,
            stats: TransportStats::default(),
            buffer: BytesMut::with_capacity(RECEIVE_BUFFER_LIMIT),
        };
        transport.ensure_connected().await?;
        Ok(transport)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Enable or disable packet logging
    pub fn set_packet_logging(&mut self, enabled: bool) {
        self.config.packet_logging = enabled;
    }

    async fn ensure_connected(&mut self) -> ModbusResult<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let reconnecting = self.state == SessionState::Reconnecting;
        if !reconnecting {
            self.state = SessionState::Connecting;
        }

        match self.connector.connect().await {
            Ok(stream) => {
                self.stream = Some(stream);
                self.state = SessionState::Connected;
                if reconnecting {
                    self.stats.reconnects += 1;
                    info!("Reconnected to {}", self.connector.describe());
                } else {
                    debug!("Connected to {}", self.connector.describe());
                }
                Ok(())
            }
            Err(e) => {
                if !reconnecting {
                    self.state = SessionState::Disconnected;
                }
                Err(ModbusError::connection(format!(
                    "Failed to connect to {}: {}",
                    self.connector.describe(),
                    e
                )))
            }
        }
    }

    async fn drop_stream(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }

    /// One write/collect cycle on the current stream
    async fn exchange_once(&mut self, frame: &[u8]) -> ModbusResult<Vec<u8>> {
        let unit_id = frame[0];
        let function = frame[1];
        let quiet = self.config.inter_byte_timeout();
        let quiet_ms = self.config.inter_byte_timeout_ms;

        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ModbusError::connection("Not connected"))?;

        timeout(quiet, stream.write_all(frame))
            .await
            .map_err(|_| ModbusError::timeout("write", quiet_ms))??;
        stream.flush().await?;
        self.stats.requests_sent += 1;
        self.stats.bytes_sent += frame.len() as u64;

        if self.config.packet_logging {
            log_packet("send", frame, unit_id);
        }

        self.buffer.clear();
        let mut chunk = [0u8; MAX_RTU_FRAME_SIZE];
        loop {
            match timeout(quiet, stream.read(&mut chunk)).await {
                Err(_) => {
                    if self.buffer.is_empty() {
                        self.stats.timeouts += 1;
                        debug!("No reply within {:?}", quiet);
                    } else {
                        debug!("Line quiet after {} bytes", self.buffer.len());
                    }
                    break;
                }
                Ok(Ok(0)) => {
                    if self.buffer.is_empty() {
                        return Err(ModbusError::connection("Connection closed by peer"));
                    }
                    break;
                }
                Ok(Ok(n)) => {
                    self.buffer.extend_from_slice(&chunk[..n]);
                    if let Some(needed) = expected_frame_len(&self.buffer, unit_id, function) {
                        if self.buffer.len() >= needed {
                            break;
                        }
                    }
                    if self.buffer.len() >= RECEIVE_BUFFER_LIMIT {
                        warn!("Receive buffer full without a complete frame");
                        break;
                    }
                }
                Ok(Err(e)) => return Err(e.into()),
            }
        }

        let reply = self.buffer.split().to_vec();
        if !reply.is_empty() {
            self.stats.responses_received += 1;
            self.stats.bytes_received += reply.len() as u64;
            if self.config.packet_logging {
                log_packet("receive", &reply, unit_id);
            }
        }
        Ok(reply)
    }
}

#[async_trait]
impl<C: Connector> ModbusTransport for TcpRtuTransport<C> {
    async fn exchange(&mut self, frame: &[u8]) -> ModbusResult<Vec<u8>> {
        if frame.len() < 2 {
            return Err(ModbusError::invalid_data("Request frame too short"));
        }

        let max_attempts = self.config.retry.max_attempts.max(1);
        let backoff = self.config.retry.backoff();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = match self.ensure_connected().await {
                Ok(()) => self.exchange_once(frame).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_connection_level() => {
                    self.stats.errors += 1;
                    self.drop_stream().await;
                    if attempt >= max_attempts {
                        self.state = SessionState::Disconnected;
                        warn!("Giving up on {} after {} attempts: {}", self.connector.describe(), attempt, e);
                        return Err(ModbusError::retries_exhausted(attempt, &e));
                    }
                    warn!(
                        "Attempt {}/{} failed: {}; reconnecting in {:?}",
                        attempt, max_attempts, e, backoff
                    );
                    self.state = SessionState::Reconnecting;
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    self.stats.errors += 1;
                    return Err(e);
                }
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn close(&mut self) -> ModbusResult<()> {
        self.drop_stream().await;
        self.state = SessionState::Disconnected;
        Ok(())
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{build_exception_response, build_read_frame, build_read_response, ModbusFunction};
    use std::collections::VecDeque;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;
    use tokio_test::io::{Builder, Mock};

    /// Hands out scripted streams in order, then refuses
    struct MockConnector {
        streams: Mutex<VecDeque<Mock>>,
    }

    impl MockConnector {
        fn new(streams: Vec<Mock>) -> Self {
            Self {
                streams: Mutex::new(streams.into()),
            }
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        type Stream = Mock;

        async fn connect(&self) -> io::Result<Mock> {
            self.streams
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "no more streams"))
        }

        fn describe(&self) -> String {
            "mock".to_string()
        }
    }

    fn fast_config() -> TransportConfig {
        TransportConfig {
            connect_timeout_ms: 100,
            inter_byte_timeout_ms: 50,
            retry: RetryPolicy::new(3, Duration::from_millis(1)),
            packet_logging: true,
        }
    }

    fn request() -> Vec<u8> {
        build_read_frame(ModbusFunction::ReadInputRegisters, 400, 2, 1).unwrap()
    }

    #[tokio::test]
    async fn test_exchange_complete_frame() {
        let reply = build_read_response(1, ModbusFunction::ReadInputRegisters, &[0x4446, 0x0000]);
        let mock = Builder::new().write(&request()).read(&reply).build();

        let mut transport = TcpRtuTransport::with_connector(MockConnector::new(vec![mock]), fast_config())
            .await
            .unwrap();
        assert_eq!(transport.state(), SessionState::Connected);

        let received = transport.exchange(&request()).await.unwrap();
        assert_eq!(received, reply);

        let stats = transport.get_stats();
        assert_eq!(stats.requests_sent, 1);
        assert_eq!(stats.responses_received, 1);
        assert_eq!(stats.bytes_received, reply.len() as u64);
    }

    #[tokio::test]
    async fn test_exchange_reassembles_split_reply() {
        let reply = build_read_response(1, ModbusFunction::ReadInputRegisters, &[1, 2]);
        let mock = Builder::new()
            .write(&request())
            .read(&reply[..2])
            .read(&reply[2..4])
            .read(&reply[4..])
            .build();

        let mut transport = TcpRtuTransport::with_connector(MockConnector::new(vec![mock]), fast_config())
            .await
            .unwrap();
        assert_eq!(transport.exchange(&request()).await.unwrap(), reply);
    }

    #[tokio::test]
    async fn test_exchange_keeps_garbage_prefix() {
        let mut reply = vec![0x00, 0xFF];
        reply.extend(build_exception_response(1, ModbusFunction::ReadInputRegisters, 2));
        let mock = Builder::new().write(&request()).read(&reply).build();

        let mut transport = TcpRtuTransport::with_connector(MockConnector::new(vec![mock]), fast_config())
            .await
            .unwrap();
        assert_eq!(transport.exchange(&request()).await.unwrap(), reply);
    }

    #[tokio::test]
    async fn test_silent_device_returns_empty() {
        let mock = Builder::new()
            .write(&request())
            .wait(Duration::from_millis(500))
            .build();

        let mut transport = TcpRtuTransport::with_connector(MockConnector::new(vec![mock]), fast_config())
            .await
            .unwrap();
        let received = transport.exchange(&request()).await.unwrap();
        assert!(received.is_empty());
        assert_eq!(transport.get_stats().timeouts, 1);
        assert_eq!(transport.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_reset_triggers_reconnect() {
        let reply = build_read_response(1, ModbusFunction::ReadInputRegisters, &[7, 8]);
        let first = Builder::new()
            .write(&request())
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let second = Builder::new().write(&request()).read(&reply).build();

        let mut transport =
            TcpRtuTransport::with_connector(MockConnector::new(vec![first, second]), fast_config())
                .await
                .unwrap();

        let received = transport.exchange(&request()).await.unwrap();
        assert_eq!(received, reply);
        assert_eq!(transport.state(), SessionState::Connected);

        let stats = transport.get_stats();
        assert_eq!(stats.reconnects, 1);
        assert_eq!(stats.errors, 1);
    }

    #[tokio::test]
    async fn test_eof_before_reply_is_connection_failure() {
        let reply = build_read_response(1, ModbusFunction::ReadInputRegisters, &[3, 4]);
        let first = Builder::new().write(&request()).build();
        let second = Builder::new().write(&request()).read(&reply).build();

        let mut transport =
            TcpRtuTransport::with_connector(MockConnector::new(vec![first, second]), fast_config())
                .await
                .unwrap();

        assert_eq!(transport.exchange(&request()).await.unwrap(), reply);
        assert_eq!(transport.get_stats().reconnects, 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted_leaves_disconnected() {
        let first = Builder::new()
            .write(&request())
            .read_error(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"))
            .build();

        let mut transport = TcpRtuTransport::with_connector(MockConnector::new(vec![first]), fast_config())
            .await
            .unwrap();

        let err = transport.exchange(&request()).await.unwrap_err();
        assert!(matches!(err, ModbusError::RetriesExhausted { attempts: 3, .. }));
        assert!(err.is_transport_error());
        assert_eq!(transport.state(), SessionState::Disconnected);
        assert!(!transport.is_connected());
    }

    /// Peer that accepts connections but never drains its socket
    struct StalledPeer;

    struct StalledStream;

    impl AsyncRead for StalledStream {
        fn poll_read(self: Pin<&mut Self>, _: &mut Context<'_>, _: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            Poll::Pending
        }
    }

    impl AsyncWrite for StalledStream {
        fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<io::Result<usize>> {
            Poll::Pending
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[async_trait]
    impl Connector for StalledPeer {
        type Stream = StalledStream;

        async fn connect(&self) -> io::Result<StalledStream> {
            Ok(StalledStream)
        }

        fn describe(&self) -> String {
            "stalled".to_string()
        }
    }

    #[tokio::test]
    async fn test_write_timeout_reports_configured_limit() {
        let mut config = fast_config();
        config.retry = RetryPolicy::new(2, Duration::from_millis(1));
        let mut transport = TcpRtuTransport::with_connector(StalledPeer, config).await.unwrap();

        match transport.exchange(&request()).await {
            Err(ModbusError::RetriesExhausted { attempts, last_error }) => {
                assert_eq!(attempts, 2);
                assert_eq!(last_error, ModbusError::timeout("write", 50).to_string());
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(transport.get_stats().requests_sent, 0);
        assert_eq!(transport.get_stats().reconnects, 1);
        assert_eq!(transport.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_initial_connect_failure() {
        let result = TcpRtuTransport::with_connector(MockConnector::new(vec![]), fast_config()).await;
        assert!(matches!(result, Err(ModbusError::Connection { .. })));
    }

    #[tokio::test]
    async fn test_close_then_exchange_reconnects() {
        let reply = build_read_response(1, ModbusFunction::ReadInputRegisters, &[9, 9]);
        let first = Builder::new().build();
        let second = Builder::new().write(&request()).read(&reply).build();

        let mut transport =
            TcpRtuTransport::with_connector(MockConnector::new(vec![first, second]), fast_config())
                .await
                .unwrap();
        transport.close().await.unwrap();
        assert_eq!(transport.state(), SessionState::Disconnected);

        assert_eq!(transport.exchange(&request()).await.unwrap(), reply);
        assert_eq!(transport.state(), SessionState::Connected);
    }

    #[test]
    fn test_default_policy() {
        let config = TransportConfig::default();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.backoff(), Duration::from_millis(300));
        assert_eq!(config.connect_timeout(), Duration::from_secs(2));
        assert_eq!(config.inter_byte_timeout(), Duration::from_secs(1));
    }
}
