//! Transport layer abstraction
//!
//! A uniform `Connection` / `Stream` / `Listener` contract over the two
//! multiplexed transports, KCP and QUIC. This module is the only place a
//! concrete transport type is visible; everything above programs against the
//! trait objects and the [`DatagramSocket`](crate::fabric::DatagramSocket)
//! seam below carries the datagrams — whether that is the pcap fabric or an
//! in-memory loopback.
//!
//! Every network operation is bounded: dial 30 s, stream open 30 s, blocking
//! ping 10 s, accept polled at 5 s with an explicit cancellation check so an
//! idle listener never busy-polls and never outlives shutdown.
//!
//! ```text
//! dial()/listen()
//!       |
//!       v
//!  Box<dyn Connection> -- open_stream()/accept_stream() --> Box<dyn Stream>
//!       |                                                        |
//!   KCP session + mux  or  quinn connection                 AsyncRead+AsyncWrite
//!       |
//!       v
//!  Arc<dyn DatagramSocket>  (pcap fabric or memory loopback)
//! ```

pub mod kcp;
pub mod mux;
pub mod quic;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::fabric::{DatagramSocket, EndpointStats, ShadowTable};

/// Dial deadline
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(30);
/// Stream-open deadline
pub const STREAM_OPEN_TIMEOUT: Duration = Duration::from_secs(30);
/// Blocking-ping deadline
pub const BLOCKING_PING_TIMEOUT: Duration = Duration::from_secs(10);
/// Accept poll interval; each expiry re-checks the shutdown signal
pub const ACCEPT_POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// One multiplexed bidirectional byte stream
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {
    /// Stream id within its connection
    fn sid(&self) -> u64;
}

impl std::fmt::Debug for dyn Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn Stream").field("sid", &self.sid()).finish()
    }
}

/// Boxed stream handed across the adapter boundary
pub type BoxStream = Box<dyn Stream>;

/// One transport connection multiplexing many streams
#[async_trait]
pub trait Connection: Send + Sync {
    /// Open a new stream. Times out after [`STREAM_OPEN_TIMEOUT`].
    async fn open_stream(&self) -> Result<BoxStream, TransportError>;

    /// Accept the next peer-initiated stream.
    async fn accept_stream(&self) -> Result<BoxStream, TransportError>;

    /// Probe liveness. `wait = false` is a cheap local check; `wait = true`
    /// exchanges PING/PONG on a throwaway stream within
    /// [`BLOCKING_PING_TIMEOUT`].
    async fn ping(&self, wait: bool) -> Result<(), TransportError>;

    /// Close the connection, the streams on it, and (for dialed
    /// connections) the datagram endpoint it owns. Idempotent; cancels
    /// in-flight operations.
    fn close(&self);

    /// Whether the connection is closed or lost
    fn is_closed(&self) -> bool;

    /// Local tuple
    fn local_addr(&self) -> SocketAddr;

    /// Remote tuple
    fn remote_addr(&self) -> SocketAddr;

    /// Drop/queue counters from the underlying endpoint
    fn packet_stats(&self) -> EndpointStats;

    /// Shadow table of the underlying endpoint, for TCPF handling
    fn shadow(&self) -> Option<Arc<ShadowTable>>;
}

impl std::fmt::Debug for dyn Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn Connection")
            .field("local_addr", &self.local_addr())
            .field("remote_addr", &self.remote_addr())
            .field("is_closed", &self.is_closed())
            .finish()
    }
}

/// Accepts transport connections on one endpoint
#[async_trait]
pub trait Listener: Send + Sync {
    /// Accept the next connection. Honors the listener's shutdown signal;
    /// returns [`TransportError::Cancelled`] once it fires.
    async fn accept(&self) -> Result<Box<dyn Connection>, TransportError>;

    /// Stop accepting and close every accepted connection's parent scope.
    /// Idempotent.
    fn close(&self);

    /// Local tuple
    fn local_addr(&self) -> SocketAddr;
}

/// Dial `addr` over the configured protocol.
///
/// The connection takes ownership of `endpoint`: closing the connection
/// closes the endpoint.
///
/// # Errors
///
/// `ConnectFailed` / `Timeout` on dial problems, `Config` when the
/// transport section is unusable.
pub async fn dial(
    cfg: &TransportConfig,
    addr: SocketAddr,
    endpoint: Arc<dyn DatagramSocket>,
    cancel: &CancellationToken,
) -> Result<Box<dyn Connection>, TransportError> {
    match cfg.protocol {
        crate::config::TransportProtocol::Kcp => {
            let kcp_cfg = cfg
                .kcp
                .clone()
                .ok_or_else(|| TransportError::Config("transport.kcp missing".into()))?;
            kcp::dial(&kcp_cfg, addr, endpoint, cancel).await
        }
        crate::config::TransportProtocol::Quic => {
            let quic_cfg = cfg
                .quic
                .clone()
                .ok_or_else(|| TransportError::Config("transport.quic missing".into()))?;
            quic::dial(&quic_cfg, addr, endpoint, cancel).await
        }
    }
}

/// Listen on `endpoint` with the configured protocol.
///
/// # Errors
///
/// `Config` when the transport section is unusable or TLS setup fails.
pub async fn listen(
    cfg: &TransportConfig,
    endpoint: Arc<dyn DatagramSocket>,
    cancel: &CancellationToken,
) -> Result<Box<dyn Listener>, TransportError> {
    match cfg.protocol {
        crate::config::TransportProtocol::Kcp => {
            let kcp_cfg = cfg
                .kcp
                .clone()
                .ok_or_else(|| TransportError::Config("transport.kcp missing".into()))?;
            kcp::listen(&kcp_cfg, endpoint, cancel)
        }
        crate::config::TransportProtocol::Quic => {
            let quic_cfg = cfg
                .quic
                .clone()
                .ok_or_else(|| TransportError::Config("transport.quic missing".into()))?;
            quic::listen(&quic_cfg, endpoint, cancel)
        }
    }
}

/// PING/PONG over a fresh stream; the shared blocking-ping implementation.
pub(crate) async fn ping_over_stream(conn: &dyn Connection) -> Result<(), TransportError> {
    let fut = async {
        let mut stream = conn.open_stream().await?;
        crate::protocol::Frame::Ping.write_to(&mut stream).await?;
        match crate::protocol::Frame::read_from(&mut stream).await? {
            crate::protocol::Frame::Pong => Ok(()),
            other => Err(TransportError::protocol(format!(
                "expected PONG, got type 0x{:02x}",
                other.type_byte()
            ))),
        }
    };
    tokio::time::timeout(BLOCKING_PING_TIMEOUT, fut)
        .await
        .map_err(|_| TransportError::timeout("blocking ping", BLOCKING_PING_TIMEOUT.as_secs()))?
}
