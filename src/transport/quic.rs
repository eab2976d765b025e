//! QUIC transport adapter using quinn
//!
//! quinn never touches a kernel socket here: the endpoint is constructed
//! over an abstract UDP socket backed by our [`DatagramSocket`] seam, so
//! QUIC datagrams ride the pcap fabric (or the in-memory loopback in tests)
//! exactly like KCP segments do.
//!
//! TLS is self-signed and unverified by design: the tunnel's threat model
//! treats QUIC's crypto as transport framing, not authentication, and both
//! ends are provisioned together. The certificate is generated fresh per
//! listener start.

use std::io::{self, IoSliceMut};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use quinn::udp::{RecvMeta, Transmit};
use quinn::{Endpoint, EndpointConfig, IdleTimeout, RecvStream, SendStream, TokioRuntime, VarInt};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, Error as RustlsError, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::QuicConfig;
use crate::error::TransportError;
use crate::fabric::{DatagramSocket, EndpointStats, ShadowTable};
use crate::transport::{
    ping_over_stream, BoxStream, Connection, Listener, Stream, ACCEPT_POLL_TIMEOUT, DIAL_TIMEOUT,
    STREAM_OPEN_TIMEOUT,
};

/// SNI/certificate name both ends agree on
const SERVER_NAME: &str = "ghostwire";

/// ALPN protocol id
const ALPN: &[u8] = b"gw/1";

/// QUIC's floor; our fabric payload budget is comfortably above it
const QUIC_MTU: u16 = 1200;

static INIT_CRYPTO: Once = Once::new();

fn init_crypto_provider() {
    INIT_CRYPTO.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Adapter presenting a [`DatagramSocket`] to quinn as a UDP socket
#[derive(Debug)]
struct AbstractSocket {
    inner: Arc<dyn DatagramSocket>,
}

impl quinn::AsyncUdpSocket for AbstractSocket {
    fn create_io_poller(self: Arc<Self>) -> Pin<Box<dyn quinn::UdpPoller>> {
        // Sends never block: the pipeline drops on saturation like a full
        // UDP socket buffer would, and quinn's loss recovery handles it.
        Box::pin(AlwaysWritable)
    }

    fn try_send(&self, transmit: &Transmit) -> io::Result<()> {
        self.inner.try_send_to(transmit.contents, transmit.destination)
    }

    fn poll_recv(
        &self,
        cx: &mut Context,
        bufs: &mut [IoSliceMut<'_>],
        meta: &mut [RecvMeta],
    ) -> Poll<io::Result<usize>> {
        let Some(buf) = bufs.first_mut() else {
            return Poll::Ready(Ok(0));
        };
        match self.inner.poll_recv_from(cx, buf) {
            Poll::Ready(Ok((len, addr))) => {
                meta[0] = RecvMeta {
                    addr,
                    len,
                    stride: len,
                    ecn: None,
                    dst_ip: None,
                };
                Poll::Ready(Ok(1))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.inner.local_addr())
    }

    fn may_fragment(&self) -> bool {
        false
    }
}

#[derive(Debug)]
struct AlwaysWritable;

impl quinn::UdpPoller for AlwaysWritable {
    fn poll_writable(self: Pin<&mut Self>, _cx: &mut Context) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// quinn transport parameters from the config knobs
fn build_transport(cfg: &QuicConfig) -> Result<quinn::TransportConfig, TransportError> {
    let mut transport = quinn::TransportConfig::default();

    let idle = IdleTimeout::try_from(Duration::from_millis(cfg.max_idle_timeout_ms))
        .map_err(|_| TransportError::Config("max_idle_timeout_ms out of range".into()))?;
    transport.max_idle_timeout(Some(idle));

    transport.max_concurrent_bidi_streams(VarInt::from_u32(cfg.max_incoming_streams));
    transport.max_concurrent_uni_streams(VarInt::from_u32(cfg.max_incoming_uni_streams));

    let stream_window = VarInt::try_from(cfg.max_stream_receive_window)
        .map_err(|_| TransportError::Config("max_stream_receive_window out of range".into()))?;
    transport.stream_receive_window(stream_window);

    let conn_window = VarInt::try_from(cfg.max_connection_receive_window)
        .map_err(|_| TransportError::Config("max_connection_receive_window out of range".into()))?;
    transport.receive_window(conn_window);
    transport.send_window(cfg.max_connection_receive_window);

    if cfg.keep_alive_period_ms > 0 {
        transport.keep_alive_interval(Some(Duration::from_millis(cfg.keep_alive_period_ms)));
    }

    // The fabric already bounds datagrams under the link MTU; probing past
    // it would only manufacture loss.
    transport.initial_mtu(QUIC_MTU);
    transport.min_mtu(QUIC_MTU);
    transport.mtu_discovery_config(None);

    Ok(transport)
}

fn build_client_config(cfg: &QuicConfig) -> Result<quinn::ClientConfig, TransportError> {
    let mut tls = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(TunnelCertVerifier))
        .with_no_client_auth();
    tls.alpn_protocols = vec![ALPN.to_vec()];
    if cfg.enable_0rtt {
        tls.enable_early_data = true;
    }

    let crypto = quinn::crypto::rustls::QuicClientConfig::try_from(tls)
        .map_err(|e| TransportError::Config(format!("QUIC client crypto: {e}")))?;
    let mut client = quinn::ClientConfig::new(Arc::new(crypto));
    client.transport_config(Arc::new(build_transport(cfg)?));
    Ok(client)
}

fn build_server_config(cfg: &QuicConfig) -> Result<quinn::ServerConfig, TransportError> {
    let certified = rcgen::generate_simple_self_signed(vec![SERVER_NAME.to_string()])
        .map_err(|e| TransportError::Config(format!("certificate generation: {e}")))?;
    let cert: CertificateDer<'static> = certified.cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        certified.key_pair.serialize_der(),
    ));

    let mut tls = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .map_err(|e| TransportError::Config(format!("TLS server config: {e}")))?;
    tls.alpn_protocols = vec![ALPN.to_vec()];
    if cfg.enable_0rtt {
        tls.max_early_data_size = u32::MAX;
    }

    let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(tls)
        .map_err(|e| TransportError::Config(format!("QUIC server crypto: {e}")))?;
    let mut server = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    server.transport_config(Arc::new(build_transport(cfg)?));
    Ok(server)
}

fn build_endpoint(
    server_config: Option<quinn::ServerConfig>,
    socket: Arc<dyn DatagramSocket>,
) -> Result<Endpoint, TransportError> {
    let abstract_socket: Arc<dyn quinn::AsyncUdpSocket> =
        Arc::new(AbstractSocket { inner: socket });
    Endpoint::new_with_abstract_socket(
        EndpointConfig::default(),
        server_config,
        abstract_socket,
        Arc::new(TokioRuntime),
    )
    .map_err(|e| TransportError::Config(format!("endpoint setup: {e}")))
}

/// A QUIC bidirectional stream
pub struct QuicStream {
    send: SendStream,
    recv: RecvStream,
    sid: u64,
}

impl Stream for QuicStream {
    fn sid(&self) -> u64 {
        self.sid
    }
}

impl AsyncRead for QuicStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        use std::future::Future;

        let max_len = buf.remaining();
        if max_len == 0 {
            return Poll::Ready(Ok(()));
        }

        let recv = &mut self.recv;
        let read_fut = recv.read_chunk(max_len, true);
        let mut pinned = std::pin::pin!(read_fut);

        match pinned.as_mut().poll(cx) {
            Poll::Ready(Ok(Some(chunk))) => {
                buf.put_slice(&chunk.bytes);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Ok(None)) => Poll::Ready(Ok(())),
            Poll::Ready(Err(e)) => {
                Poll::Ready(Err(io::Error::other(format!("QUIC read error: {e}"))))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for QuicStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.send)
            .poll_write(cx, buf)
            .map_err(|e| io::Error::other(format!("QUIC write error: {e}")))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.send)
            .poll_flush(cx)
            .map_err(|e| io::Error::other(format!("QUIC flush error: {e}")))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.send)
            .poll_shutdown(cx)
            .map_err(|e| io::Error::other(format!("QUIC shutdown error: {e}")))
    }
}

impl std::fmt::Debug for QuicStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuicStream").field("sid", &self.sid).finish()
    }
}

/// A QUIC connection over the datagram seam
pub struct QuicConnection {
    conn: quinn::Connection,
    quinn_endpoint: Endpoint,
    socket: Arc<dyn DatagramSocket>,
    cancel: CancellationToken,
    owns_endpoint: bool,
    closed: AtomicBool,
}

#[async_trait]
impl Connection for QuicConnection {
    async fn open_stream(&self) -> Result<BoxStream, TransportError> {
        let (send, recv) = tokio::time::timeout(STREAM_OPEN_TIMEOUT, self.conn.open_bi())
            .await
            .map_err(|_| TransportError::timeout("stream open", STREAM_OPEN_TIMEOUT.as_secs()))?
            .map_err(|e| TransportError::StreamOpen(e.to_string()))?;
        let sid = send.id().index();
        Ok(Box::new(QuicStream { send, recv, sid }))
    }

    async fn accept_stream(&self) -> Result<BoxStream, TransportError> {
        let accepted = tokio::select! {
            () = self.cancel.cancelled() => return Err(TransportError::Cancelled),
            accepted = self.conn.accept_bi() => accepted,
        };
        let (send, recv) = accepted.map_err(|e| TransportError::Accept(e.to_string()))?;
        let sid = send.id().index();
        Ok(Box::new(QuicStream { send, recv, sid }))
    }

    async fn ping(&self, wait: bool) -> Result<(), TransportError> {
        if wait {
            return ping_over_stream(self).await;
        }
        match self.conn.close_reason() {
            None => Ok(()),
            Some(reason) => Err(TransportError::lost(reason.to_string())),
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(remote = %self.conn.remote_address(), "closing QUIC connection");
            self.cancel.cancel();
            self.conn.close(VarInt::from_u32(0), b"closed");
            if self.owns_endpoint {
                self.quinn_endpoint.close(VarInt::from_u32(0), b"closed");
                self.socket.close();
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.conn.close_reason().is_some()
    }

    fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    fn remote_addr(&self) -> SocketAddr {
        self.conn.remote_address()
    }

    fn packet_stats(&self) -> EndpointStats {
        self.socket.stats()
    }

    fn shadow(&self) -> Option<Arc<ShadowTable>> {
        self.socket.shadow()
    }
}

impl Drop for QuicConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Dial `addr` over QUIC. The connection owns the endpoint.
///
/// # Errors
///
/// `Config` on TLS/transport setup problems, `ConnectFailed`/`Timeout` on
/// handshake problems.
pub async fn dial(
    cfg: &QuicConfig,
    addr: SocketAddr,
    endpoint: Arc<dyn DatagramSocket>,
    cancel: &CancellationToken,
) -> Result<Box<dyn Connection>, TransportError> {
    init_crypto_provider();

    let quinn_endpoint = build_endpoint(None, Arc::clone(&endpoint))?;
    let client_config = build_client_config(cfg)?;

    debug!(remote = %addr, "QUIC dialing");
    let connecting = quinn_endpoint
        .connect_with(client_config, addr, SERVER_NAME)
        .map_err(|e| TransportError::connect_failed(addr, e.to_string()))?;

    let conn = if cfg.enable_0rtt {
        match connecting.into_0rtt() {
            Ok((conn, _accepted)) => conn,
            Err(connecting) => await_handshake(connecting, addr, cancel).await?,
        }
    } else {
        await_handshake(connecting, addr, cancel).await?
    };

    info!(remote = %addr, "QUIC connection established");
    Ok(Box::new(QuicConnection {
        conn,
        quinn_endpoint,
        socket: endpoint,
        cancel: cancel.child_token(),
        owns_endpoint: true,
        closed: AtomicBool::new(false),
    }))
}

async fn await_handshake(
    connecting: quinn::Connecting,
    addr: SocketAddr,
    cancel: &CancellationToken,
) -> Result<quinn::Connection, TransportError> {
    tokio::select! {
        () = cancel.cancelled() => Err(TransportError::Cancelled),
        result = tokio::time::timeout(DIAL_TIMEOUT, connecting) => result
            .map_err(|_| TransportError::timeout("dial", DIAL_TIMEOUT.as_secs()))?
            .map_err(|e| TransportError::connect_failed(addr, e.to_string())),
    }
}

/// The QUIC listener
pub struct QuicListener {
    quinn_endpoint: Endpoint,
    socket: Arc<dyn DatagramSocket>,
    local: SocketAddr,
    cancel: CancellationToken,
}

/// Listen for QUIC connections on `endpoint`.
///
/// # Errors
///
/// `Config` when certificate generation or TLS setup fails.
pub fn listen(
    cfg: &QuicConfig,
    endpoint: Arc<dyn DatagramSocket>,
    cancel: &CancellationToken,
) -> Result<Box<dyn Listener>, TransportError> {
    init_crypto_provider();

    let server_config = build_server_config(cfg)?;
    let quinn_endpoint = build_endpoint(Some(server_config), Arc::clone(&endpoint))?;

    info!(local = %endpoint.local_addr(), "QUIC listener ready");
    Ok(Box::new(QuicListener {
        quinn_endpoint,
        local: endpoint.local_addr(),
        socket: endpoint,
        cancel: cancel.child_token(),
    }))
}

#[async_trait]
impl Listener for QuicListener {
    async fn accept(&self) -> Result<Box<dyn Connection>, TransportError> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            let incoming = tokio::select! {
                () = self.cancel.cancelled() => return Err(TransportError::Cancelled),
                incoming = tokio::time::timeout(ACCEPT_POLL_TIMEOUT, self.quinn_endpoint.accept()) => incoming,
            };
            match incoming {
                Ok(Some(incoming)) => {
                    let conn = incoming
                        .await
                        .map_err(|e| TransportError::Accept(e.to_string()))?;
                    debug!(remote = %conn.remote_address(), "QUIC connection accepted");
                    return Ok(Box::new(QuicConnection {
                        conn,
                        quinn_endpoint: self.quinn_endpoint.clone(),
                        socket: Arc::clone(&self.socket),
                        cancel: self.cancel.child_token(),
                        owns_endpoint: false,
                        closed: AtomicBool::new(false),
                    }));
                }
                Ok(None) => return Err(TransportError::Accept("endpoint closed".into())),
                Err(_) => {
                    // Poll expiry; loop to re-check cancellation.
                }
            }
        }
    }

    fn close(&self) {
        self.cancel.cancel();
        self.quinn_endpoint.close(VarInt::from_u32(0), b"shutdown");
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

/// Accepts any certificate: the tunnel authenticates nothing at the TLS
/// layer, both ends being provisioned by the same operator.
#[derive(Debug)]
struct TunnelCertVerifier;

impl ServerCertVerifier for TunnelCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, RustlsError> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
