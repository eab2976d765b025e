//! KCP transport adapter
//!
//! The `kcp` crate supplies the ARQ; this module supplies everything around
//! it: an output sink that feeds the datagram endpoint, a driver task that
//! clocks `update()` and pumps inbound datagrams through `input()`, an
//! `AsyncRead`/`AsyncWrite` byte stream over the session, and the
//! [`Mux`](super::mux::Mux) on top for stream multiplexing.
//!
//! Dialing is connectionless, as KCP is: the session exists as soon as the
//! conversation id is chosen, and the first retransmitted segment finds the
//! server whenever it is reachable. The listener creates a session the first
//! time it sees an unknown (source address, conversation id) pair and hands
//! it to `accept()`; the flow table that routes established pairs is
//! TTL-swept so dead peers age out.

use std::io::{self, Write};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::KcpConfig;
use crate::error::TransportError;
use crate::fabric::{recv_from, Datagram, DatagramSocket, EndpointStats, FlowTable, ShadowTable};
use crate::transport::mux::Mux;
use crate::transport::{
    ping_over_stream, BoxStream, Connection, Listener, ACCEPT_POLL_TIMEOUT, STREAM_OPEN_TIMEOUT,
};

/// Capacity of a session's inbound datagram queue
const SESSION_QUEUE_CAPACITY: usize = 1024;

/// Capacity of the decoded-bytes channel toward the session reader
const SESSION_READ_BUFFER: usize = 256;

/// Pending accepted connections before the listener sheds new sessions
const ACCEPT_BACKLOG: usize = 64;

/// KCP segment header size; anything shorter cannot carry a conversation id
const KCP_HEADER_LEN: usize = 24;

/// `Write` sink KCP flushes serialized segments into
struct KcpOutput {
    endpoint: Arc<dyn DatagramSocket>,
    peer: SocketAddr,
}

impl Write for KcpOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // Saturation drops are counted by the endpoint; KCP retransmits.
        self.endpoint.try_send_to(buf, self.peer)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct SessionInner {
    kcp: kcp::Kcp<KcpOutput>,
    write_wakers: Vec<Waker>,
}

/// The reliable ordered byte stream one KCP conversation provides
pub struct KcpSessionStream {
    inner: Arc<Mutex<SessionInner>>,
    data_rx: mpsc::Receiver<Bytes>,
    pending: Bytes,
    snd_wnd: u16,
    closed: Arc<AtomicBool>,
}

impl KcpSessionStream {
    /// Assemble a session: configure the ARQ, spawn the driver, return the
    /// byte stream. `input_rx` must be fed with this conversation's
    /// datagrams.
    fn spawn(
        cfg: &KcpConfig,
        conv: u32,
        endpoint: &Arc<dyn DatagramSocket>,
        peer: SocketAddr,
        mut input_rx: mpsc::Receiver<Datagram>,
        cancel: CancellationToken,
    ) -> Self {
        let output = KcpOutput {
            endpoint: Arc::clone(endpoint),
            peer,
        };
        let mut ikcp = kcp::Kcp::new_stream(conv, output);
        let mtu = cfg.mtu.min(endpoint.max_payload());
        if let Err(e) = ikcp.set_mtu(mtu) {
            warn!(mtu, error = %e, "could not apply KCP MTU, keeping default");
        }
        ikcp.set_wndsize(cfg.snd_wnd, cfg.rcv_wnd);
        ikcp.set_nodelay(
            cfg.nodelay.unwrap_or(true),
            cfg.interval_ms as i32,
            cfg.resend as i32,
            true,
        );

        let inner = Arc::new(Mutex::new(SessionInner {
            kcp: ikcp,
            write_wakers: Vec::new(),
        }));
        let (data_tx, data_rx) = mpsc::channel(SESSION_READ_BUFFER);
        let closed = Arc::new(AtomicBool::new(false));

        let driver_inner = Arc::clone(&inner);
        let driver_closed = Arc::clone(&closed);
        let interval = std::time::Duration::from_millis(u64::from(cfg.interval_ms));
        tokio::spawn(async move {
            let start = Instant::now();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let mut inner = driver_inner.lock();
                        let now = (start.elapsed().as_millis() & 0xffff_ffff) as u32;
                        if let Err(e) = inner.kcp.update(now) {
                            trace!(error = %e, "kcp update failed");
                        }
                        drain_and_wake(&mut inner, &data_tx);
                    }
                    datagram = input_rx.recv() => {
                        let Some((bytes, _src)) = datagram else { break };
                        let mut inner = driver_inner.lock();
                        if let Err(e) = inner.kcp.input(&bytes) {
                            trace!(error = %e, "kcp rejected datagram");
                        }
                        drain_and_wake(&mut inner, &data_tx);
                    }
                }
            }
            driver_closed.store(true, Ordering::Release);
            // data_tx drops here, surfacing EOF to the reader.
        });

        Self {
            inner,
            data_rx,
            pending: Bytes::new(),
            snd_wnd: cfg.snd_wnd,
            closed,
        }
    }
}

/// Move decoded bytes out of KCP while the reader has room, then wake
/// writers the freed send window may unblock. Leaving data inside KCP when
/// the channel is full closes the receive window, which is the
/// backpressure.
fn drain_and_wake(inner: &mut SessionInner, data_tx: &mpsc::Sender<Bytes>) {
    loop {
        let size = match inner.kcp.peeksize() {
            Ok(size) if size > 0 => size,
            _ => break,
        };
        if data_tx.capacity() == 0 {
            break;
        }
        let mut buf = vec![0u8; size];
        match inner.kcp.recv(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                if data_tx.try_send(Bytes::from(buf)).is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    for waker in inner.write_wakers.drain(..) {
        waker.wake();
    }
}

impl AsyncRead for KcpSessionStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.pending.is_empty() {
                let n = self.pending.len().min(buf.remaining());
                let chunk = self.pending.split_to(n);
                buf.put_slice(&chunk);
                return Poll::Ready(Ok(()));
            }
            match self.data_rx.poll_recv(cx) {
                Poll::Ready(Some(bytes)) => self.pending = bytes,
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for KcpSessionStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.closed.load(Ordering::Acquire) {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "kcp session closed",
            )));
        }
        let mut inner = self.inner.lock();
        // Bound the unacked backlog at twice the send window; past that the
        // driver wakes us as acks arrive.
        if inner.kcp.wait_snd() >= usize::from(self.snd_wnd) * 2 {
            inner.write_wakers.push(cx.waker().clone());
            return Poll::Pending;
        }
        match inner.kcp.send(buf) {
            Ok(n) => Poll::Ready(Ok(n)),
            Err(e) => Poll::Ready(Err(io::Error::other(e.to_string()))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut inner = self.inner.lock();
        let _ = inner.kcp.flush();
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_flush(cx)
    }
}

impl std::fmt::Debug for KcpSessionStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KcpSessionStream")
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

/// A KCP connection: one conversation, multiplexed
pub struct KcpConnection {
    mux: Arc<Mux>,
    endpoint: Arc<dyn DatagramSocket>,
    local: SocketAddr,
    remote: SocketAddr,
    conv: u32,
    cancel: CancellationToken,
    owns_endpoint: bool,
    closed: AtomicBool,
}

#[async_trait]
impl Connection for KcpConnection {
    async fn open_stream(&self) -> Result<BoxStream, TransportError> {
        let stream = tokio::time::timeout(STREAM_OPEN_TIMEOUT, self.mux.open_stream())
            .await
            .map_err(|_| {
                TransportError::timeout("stream open", STREAM_OPEN_TIMEOUT.as_secs())
            })??;
        Ok(Box::new(stream))
    }

    async fn accept_stream(&self) -> Result<BoxStream, TransportError> {
        let stream = self.mux.accept_stream().await?;
        Ok(Box::new(stream))
    }

    async fn ping(&self, wait: bool) -> Result<(), TransportError> {
        if wait {
            return ping_over_stream(self).await;
        }
        if self.is_closed() {
            return Err(TransportError::lost("kcp session closed"));
        }
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(conv = self.conv, remote = %self.remote, "closing KCP connection");
            self.cancel.cancel();
            self.mux.close();
            if self.owns_endpoint {
                self.endpoint.close();
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.mux.is_closed()
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    fn packet_stats(&self) -> EndpointStats {
        self.endpoint.stats()
    }

    fn shadow(&self) -> Option<Arc<ShadowTable>> {
        self.endpoint.shadow()
    }
}

impl Drop for KcpConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Dial `addr` over KCP.
///
/// The connection takes ownership of the endpoint. The conversation id is a
/// random non-zero value; the listener keys sessions by (source address,
/// conv), so parallel connections from one tuple coexist.
///
/// # Errors
///
/// Currently only fails on endpoint misuse; KCP itself has no handshake to
/// fail. Reachability shows up on the first ping or stream.
pub async fn dial(
    cfg: &KcpConfig,
    addr: SocketAddr,
    endpoint: Arc<dyn DatagramSocket>,
    cancel: &CancellationToken,
) -> Result<Box<dyn Connection>, TransportError> {
    let conv: u32 = rand::thread_rng().gen_range(1..u32::MAX);
    let child = cancel.child_token();

    let (input_tx, input_rx) = mpsc::channel(SESSION_QUEUE_CAPACITY);
    spawn_dial_feeder(Arc::clone(&endpoint), addr, conv, input_tx, child.clone());

    let session = KcpSessionStream::spawn(cfg, conv, &endpoint, addr, input_rx, child.clone());
    let mux = Mux::new(session, true, &child);

    info!(remote = %addr, conv, "KCP connection established");
    Ok(Box::new(KcpConnection {
        mux,
        local: endpoint.local_addr(),
        endpoint,
        remote: addr,
        conv,
        cancel: child,
        owns_endpoint: true,
        closed: AtomicBool::new(false),
    }))
}

/// Feed the dialer's session with datagrams from its peer and conversation.
fn spawn_dial_feeder(
    endpoint: Arc<dyn DatagramSocket>,
    peer: SocketAddr,
    conv: u32,
    input_tx: mpsc::Sender<Datagram>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; endpoint.max_payload()];
        loop {
            let received = tokio::select! {
                () = cancel.cancelled() => return,
                r = recv_from(endpoint.as_ref(), &mut buf) => r,
            };
            let Ok((n, src)) = received else { return };
            if src != peer || n < KCP_HEADER_LEN || kcp::get_conv(&buf[..n]) != conv {
                trace!(%src, "discarding datagram for foreign conversation");
                continue;
            }
            if input_tx.send((buf[..n].to_vec(), src)).await.is_err() {
                return;
            }
        }
    });
}

/// The KCP listener: demultiplexes conversations over one endpoint
pub struct KcpListener {
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Box<dyn Connection>>>,
    local: SocketAddr,
    cancel: CancellationToken,
}

/// Listen for KCP conversations on `endpoint`.
///
/// # Errors
///
/// Infallible today; the signature matches the QUIC side, which can fail
/// on TLS setup.
pub fn listen(
    cfg: &KcpConfig,
    endpoint: Arc<dyn DatagramSocket>,
    cancel: &CancellationToken,
) -> Result<Box<dyn Listener>, TransportError> {
    let child = cancel.child_token();
    let flows: Arc<FlowTable<(SocketAddr, u32)>> = FlowTable::new();
    flows.spawn_sweeper(child.clone());

    let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);
    spawn_listen_loop(
        cfg.clone(),
        Arc::clone(&endpoint),
        Arc::clone(&flows),
        accept_tx,
        child.clone(),
    );

    info!(local = %endpoint.local_addr(), "KCP listener ready");
    Ok(Box::new(KcpListener {
        accept_rx: tokio::sync::Mutex::new(accept_rx),
        local: endpoint.local_addr(),
        cancel: child,
    }))
}

fn spawn_listen_loop(
    cfg: KcpConfig,
    endpoint: Arc<dyn DatagramSocket>,
    flows: Arc<FlowTable<(SocketAddr, u32)>>,
    accept_tx: mpsc::Sender<Box<dyn Connection>>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; endpoint.max_payload()];
        loop {
            let received = tokio::select! {
                () = cancel.cancelled() => return,
                r = recv_from(endpoint.as_ref(), &mut buf) => r,
            };
            let Ok((n, src)) = received else { return };
            if n < KCP_HEADER_LEN {
                continue;
            }
            let conv = kcp::get_conv(&buf[..n]);
            let key = (src, conv);

            if flows.contains(key) {
                if !flows.route(key, (buf[..n].to_vec(), src)) {
                    trace!(%src, conv, "session queue full, dropping datagram");
                }
                continue;
            }

            // First datagram of an unknown conversation: set up the session
            // and hand the connection to accept().
            let input_rx = flows.register(key, SESSION_QUEUE_CAPACITY);
            flows.route(key, (buf[..n].to_vec(), src));

            let conn_cancel = cancel.child_token();
            let session = KcpSessionStream::spawn(
                &cfg,
                conv,
                &endpoint,
                src,
                input_rx,
                conn_cancel.clone(),
            );
            let mux = Mux::new(session, false, &conn_cancel);
            let conn = Box::new(KcpConnection {
                mux,
                local: endpoint.local_addr(),
                endpoint: Arc::clone(&endpoint),
                remote: src,
                conv,
                cancel: conn_cancel,
                owns_endpoint: false,
                closed: AtomicBool::new(false),
            });

            debug!(remote = %src, conv, "new KCP conversation");
            if accept_tx.try_send(conn).is_err() {
                warn!(remote = %src, conv, "accept backlog full, shedding conversation");
                flows.deregister(key);
            }
        }
    });
}

#[async_trait]
impl Listener for KcpListener {
    async fn accept(&self) -> Result<Box<dyn Connection>, TransportError> {
        let mut rx = self.accept_rx.lock().await;
        loop {
            if self.cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            match tokio::time::timeout(ACCEPT_POLL_TIMEOUT, rx.recv()).await {
                Ok(Some(conn)) => return Ok(conn),
                Ok(None) => return Err(TransportError::Accept("listener closed".into())),
                Err(_) => {
                    // Poll expiry; loop to re-check cancellation.
                }
            }
        }
    }

    fn close(&self) {
        self.cancel.cancel();
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }
}
