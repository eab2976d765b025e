//! The datagram endpoint the transports program against
//!
//! KCP and QUIC both want a UDP-socket-shaped thing: write a datagram to an
//! address, read a datagram with its source address, know the local address,
//! close. [`DatagramSocket`] is exactly that surface and nothing more. Two
//! implementations exist: [`PacketEndpoint`], backed by the pcap fabric, and
//! [`MemoryEndpoint`], an in-process loopback used by tests and by anything
//! that wants the transports without the raw wire.
//!
//! The real endpoint runs a dispatcher task that consumes captured segments,
//! applies a deliberately lax plausibility check (RST and SYN segments are
//! discarded; KCP/QUIC validate everything else themselves), folds the TCP
//! fields into the shadow table, and queues the payload for `read_from`.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::NetworkConfig;
use crate::error::FabricError;
use crate::fabric::capture::{CapturedSegment, PacketFabric};
use crate::fabric::craft::FrameComposer;
use crate::fabric::sender::SendPipeline;
use crate::fabric::shadow::ShadowTable;

/// Capacity of the default inbound queue
const INBOUND_QUEUE_CAPACITY: usize = 4096;

/// Flow-table sweep cadence
const FLOW_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// Flows idle longer than this are evicted
const FLOW_MAX_IDLE: Duration = Duration::from_secs(600);

/// One inbound datagram: payload plus source address
pub type Datagram = (Vec<u8>, SocketAddr);

/// Counters a datagram endpoint exposes for observability
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointStats {
    /// Outbound datagrams dropped by the send pipeline
    pub send_dropped: u64,
    /// Outbound datagrams currently queued
    pub send_queue_depth: usize,
    /// Inbound datagrams dropped because a queue was full or implausible
    pub recv_dropped: u64,
}

/// The datagram surface the transport adapters see.
///
/// Sends are non-blocking: a saturated path drops the datagram (and counts
/// it) exactly like a congested UDP socket would, leaving retransmission to
/// the transport above.
pub trait DatagramSocket: Send + Sync + std::fmt::Debug + 'static {
    /// Queue a datagram toward `addr`. Never blocks.
    ///
    /// # Errors
    ///
    /// Only fails when the endpoint is closed; saturation is not an error.
    fn try_send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<()>;

    /// Poll for the next inbound datagram, copying up to `buf.len()` bytes.
    /// A datagram larger than `buf` has its remainder kept for the next
    /// read.
    fn poll_recv_from(
        &self,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<(usize, SocketAddr)>>;

    /// The configured local address
    fn local_addr(&self) -> SocketAddr;

    /// Close the endpoint and everything under it. Idempotent.
    fn close(&self);

    /// Whether the endpoint has been closed
    fn is_closed(&self) -> bool;

    /// Largest datagram this endpoint can carry
    fn max_payload(&self) -> usize;

    /// Drop/queue counters
    fn stats(&self) -> EndpointStats {
        EndpointStats::default()
    }

    /// The shadow table backing this endpoint, when it has one
    fn shadow(&self) -> Option<Arc<ShadowTable>> {
        None
    }
}

/// Await the next datagram from a trait object
pub async fn recv_from(
    socket: &dyn DatagramSocket,
    buf: &mut [u8],
) -> io::Result<(usize, SocketAddr)> {
    std::future::poll_fn(|cx| socket.poll_recv_from(cx, buf)).await
}

/// Routes inbound datagrams to per-remote queues.
///
/// Keyed by source address by default; transports that multiplex several
/// conversations per remote (the KCP listener, which keys by source address
/// plus conversation id) pick a wider key. Entries are touched on every
/// routed datagram and evicted after ten idle minutes by
/// [`spawn_sweeper`](Self::spawn_sweeper).
#[derive(Debug)]
pub struct FlowTable<K = SocketAddr>
where
    K: Eq + std::hash::Hash + Copy + Send + Sync + std::fmt::Debug + 'static,
{
    flows: RwLock<HashMap<K, FlowEntry>>,
}

#[derive(Debug)]
struct FlowEntry {
    tx: mpsc::Sender<Datagram>,
    last_seen: Instant,
}

impl<K> Default for FlowTable<K>
where
    K: Eq + std::hash::Hash + Copy + Send + Sync + std::fmt::Debug + 'static,
{
    fn default() -> Self {
        Self {
            flows: RwLock::new(HashMap::new()),
        }
    }
}

impl<K> FlowTable<K>
where
    K: Eq + std::hash::Hash + Copy + Send + Sync + std::fmt::Debug + 'static,
{
    /// Create an empty table
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a flow for `remote`, returning its datagram receiver.
    /// Re-registering replaces the previous queue.
    pub fn register(&self, remote: K, capacity: usize) -> mpsc::Receiver<Datagram> {
        let (tx, rx) = mpsc::channel(capacity);
        self.flows.write().insert(
            remote,
            FlowEntry {
                tx,
                last_seen: Instant::now(),
            },
        );
        rx
    }

    /// Remove a flow
    pub fn deregister(&self, remote: K) {
        self.flows.write().remove(&remote);
    }

    /// Whether `remote` has a registered flow
    #[must_use]
    pub fn contains(&self, remote: K) -> bool {
        self.flows.read().contains_key(&remote)
    }

    /// Number of live flows
    #[must_use]
    pub fn len(&self) -> usize {
        self.flows.read().len()
    }

    /// Whether the table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.flows.read().is_empty()
    }

    /// Route a datagram to `remote`'s queue. Returns false when no flow is
    /// registered or its queue is full/closed.
    pub fn route(&self, remote: K, datagram: Datagram) -> bool {
        let mut flows = self.flows.write();
        match flows.get_mut(&remote) {
            Some(entry) => {
                entry.last_seen = Instant::now();
                entry.tx.try_send(datagram).is_ok()
            }
            None => false,
        }
    }

    /// Remove flows idle longer than `max_idle`; returns how many.
    pub fn sweep(&self, max_idle: Duration) -> usize {
        let mut flows = self.flows.write();
        let before = flows.len();
        let now = Instant::now();
        flows.retain(|_, entry| {
            !entry.tx.is_closed() && now.duration_since(entry.last_seen) <= max_idle
        });
        before - flows.len()
    }

    /// Spawn the TTL sweeper, running until `cancel` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) {
        let table = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FLOW_SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let removed = table.sweep(FLOW_MAX_IDLE);
                        if removed > 0 {
                            debug!(removed, remaining = table.len(), "flow table sweep");
                        }
                    }
                }
            }
        });
    }
}

/// Shared inbound-queue state behind the `poll_recv_from` surface
#[derive(Debug)]
struct InboundQueue {
    rx: Mutex<mpsc::Receiver<Datagram>>,
    /// Remainder of a datagram that did not fit the caller's buffer
    leftover: Mutex<Option<Datagram>>,
}

impl InboundQueue {
    fn new(rx: mpsc::Receiver<Datagram>) -> Self {
        Self {
            rx: Mutex::new(rx),
            leftover: Mutex::new(None),
        }
    }

    fn poll_recv(
        &self,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<(usize, SocketAddr)>> {
        if let Some((bytes, addr)) = self.leftover.lock().take() {
            return Poll::Ready(Ok(self.copy_out(bytes, addr, buf)));
        }
        let mut rx = self.rx.lock();
        match rx.poll_recv(cx) {
            Poll::Ready(Some((bytes, addr))) => {
                Poll::Ready(Ok(self.copy_out(bytes, addr, buf)))
            }
            Poll::Ready(None) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "endpoint closed",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn copy_out(&self, bytes: Vec<u8>, addr: SocketAddr, buf: &mut [u8]) -> (usize, SocketAddr) {
        let n = bytes.len().min(buf.len());
        buf[..n].copy_from_slice(&bytes[..n]);
        if n < bytes.len() {
            *self.leftover.lock() = Some((bytes[n..].to_vec(), addr));
        }
        (n, addr)
    }
}

/// The pcap-backed datagram endpoint
///
/// Owns the fabric, the shadow table (with its GC), the send pipeline (with
/// its workers), and the dispatcher task. Everything is torn down by
/// `close()` or by cancelling the parent token.
pub struct PacketEndpoint {
    local: SocketAddr,
    fabric: Arc<PacketFabric>,
    pipeline: Arc<SendPipeline>,
    shadow: Arc<ShadowTable>,
    inbound: InboundQueue,
    recv_dropped: Arc<AtomicU64>,
    max_payload: usize,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl PacketEndpoint {
    /// Open the fabric on the configured interface and assemble the full
    /// receive/send machinery.
    ///
    /// # Errors
    ///
    /// Propagates fabric open failures (missing interface, permissions,
    /// libpcap errors).
    pub fn open(
        network: &NetworkConfig,
        packet_workers: usize,
        parent: &CancellationToken,
    ) -> Result<Arc<Self>, FabricError> {
        let (fabric, segments) = PacketFabric::open(network)?;
        let composer = Arc::new(FrameComposer::from_config(network, fabric.interface_mac()));

        let local = network
            .ipv4
            .as_ref()
            .or(network.ipv6.as_ref())
            .map(|t| t.addr)
            .ok_or_else(|| FabricError::pcap(&network.interface, "no local tuple configured"))?;

        let cancel = parent.child_token();
        let shadow = ShadowTable::new();
        shadow.spawn_gc(cancel.clone());

        let max_payload = composer.max_payload();
        let pipeline = SendPipeline::new(
            &network.pcap,
            composer,
            Arc::clone(&shadow),
            Arc::clone(&fabric) as Arc<dyn crate::fabric::sender::SegmentSink>,
        );
        pipeline.spawn_workers(packet_workers, &cancel);

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        let recv_dropped = Arc::new(AtomicU64::new(0));

        let endpoint = Arc::new(Self {
            local,
            fabric,
            pipeline,
            shadow: Arc::clone(&shadow),
            inbound: InboundQueue::new(inbound_rx),
            recv_dropped: Arc::clone(&recv_dropped),
            max_payload,
            closed: AtomicBool::new(false),
            cancel: cancel.clone(),
        });

        Self::spawn_dispatcher(segments, inbound_tx, shadow, recv_dropped, cancel);
        Ok(endpoint)
    }

    /// The dispatcher: captured segment -> plausibility check -> shadow
    /// update -> inbound queue.
    fn spawn_dispatcher(
        mut segments: mpsc::Receiver<CapturedSegment>,
        inbound: mpsc::Sender<Datagram>,
        shadow: Arc<ShadowTable>,
        recv_dropped: Arc<AtomicU64>,
        cancel: CancellationToken,
    ) {
        tokio::spawn(async move {
            loop {
                let segment = tokio::select! {
                    () = cancel.cancelled() => return,
                    segment = segments.recv() => segment,
                };
                let Some(segment) = segment else { return };

                // Lax on purpose: RSTs and handshake segments are never part
                // of the tunnel, everything else is for KCP/QUIC to judge.
                if segment.fields.rst || segment.fields.syn {
                    trace!(src = %segment.src, "discarding implausible segment");
                    continue;
                }

                shadow.observe(
                    segment.src,
                    segment.fields.seq,
                    segment.fields.ack,
                    segment.fields.window,
                );

                if segment.payload.is_empty() {
                    // Bare ACKs keep the shadow state fresh but carry nothing.
                    continue;
                }

                if inbound.try_send((segment.payload, segment.src)).is_err() {
                    recv_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        });
    }
}

impl DatagramSocket for PacketEndpoint {
    fn try_send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "endpoint closed"));
        }
        // A full queue already counted the drop; to the caller this is the
        // same as a congested UDP socket.
        let _ = self.pipeline.submit(buf.to_vec(), addr);
        Ok(())
    }

    fn poll_recv_from(
        &self,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<(usize, SocketAddr)>> {
        self.inbound.poll_recv(cx, buf)
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.cancel.cancel();
            self.fabric.close();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn max_payload(&self) -> usize {
        self.max_payload
    }

    fn stats(&self) -> EndpointStats {
        let pipeline = self.pipeline.stats();
        EndpointStats {
            send_dropped: pipeline.dropped,
            send_queue_depth: pipeline.queue_depth,
            recv_dropped: self.recv_dropped.load(Ordering::Relaxed)
                + self.fabric.recv_dropped(),
        }
    }

    fn shadow(&self) -> Option<Arc<ShadowTable>> {
        Some(Arc::clone(&self.shadow))
    }
}

impl std::fmt::Debug for PacketEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketEndpoint")
            .field("local", &self.local)
            .field("closed", &self.is_closed())
            .field("stats", &self.stats())
            .finish()
    }
}

impl Drop for PacketEndpoint {
    fn drop(&mut self) {
        self.close();
    }
}

/// In-process loopback endpoint
///
/// Two paired endpoints deliver datagrams to each other through channels,
/// with the same drop-on-saturation semantics as the real fabric. Tests and
/// the transport adapters exercise identical code paths over it.
pub struct MemoryEndpoint {
    local: SocketAddr,
    peer_tx: Mutex<Option<mpsc::Sender<Datagram>>>,
    inbound: InboundQueue,
    inbound_tx: mpsc::Sender<Datagram>,
    send_dropped: AtomicU64,
    shadow: Arc<ShadowTable>,
    closed: AtomicBool,
}

impl MemoryEndpoint {
    /// Default queue capacity for paired endpoints
    const CAPACITY: usize = 1024;

    /// Create two endpoints wired back-to-back
    #[must_use]
    pub fn pair(a: SocketAddr, b: SocketAddr) -> (Arc<Self>, Arc<Self>) {
        let ea = Arc::new(Self::unpaired(a));
        let eb = Arc::new(Self::unpaired(b));
        *ea.peer_tx.lock() = Some(eb.inbound_tx.clone());
        *eb.peer_tx.lock() = Some(ea.inbound_tx.clone());
        (ea, eb)
    }

    /// Create an endpoint with no peer; sends are dropped until paired
    #[must_use]
    pub fn unpaired(local: SocketAddr) -> Self {
        let (tx, rx) = mpsc::channel(Self::CAPACITY);
        Self {
            local,
            peer_tx: Mutex::new(None),
            inbound: InboundQueue::new(rx),
            inbound_tx: tx,
            send_dropped: AtomicU64::new(0),
            shadow: ShadowTable::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Inject a datagram as if it had arrived from `src` (test hook)
    pub fn inject(&self, payload: Vec<u8>, src: SocketAddr) -> bool {
        self.inbound_tx.try_send((payload, src)).is_ok()
    }
}

impl DatagramSocket for MemoryEndpoint {
    fn try_send_to(&self, buf: &[u8], _addr: SocketAddr) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "endpoint closed"));
        }
        let delivered = self
            .peer_tx
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.try_send((buf.to_vec(), self.local)).is_ok());
        if !delivered {
            self.send_dropped.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn poll_recv_from(
        &self,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<(usize, SocketAddr)>> {
        self.inbound.poll_recv(cx, buf)
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn max_payload(&self) -> usize {
        1400
    }

    fn stats(&self) -> EndpointStats {
        EndpointStats {
            send_dropped: self.send_dropped.load(Ordering::Relaxed),
            send_queue_depth: 0,
            recv_dropped: 0,
        }
    }

    fn shadow(&self) -> Option<Arc<ShadowTable>> {
        Some(Arc::clone(&self.shadow))
    }
}

impl std::fmt::Debug for MemoryEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEndpoint")
            .field("local", &self.local)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[tokio::test]
    async fn test_memory_pair_round_trip() {
        let (a, b) = MemoryEndpoint::pair(addr(1000), addr(2000));

        a.try_send_to(b"hello", addr(2000)).unwrap();
        let mut buf = [0u8; 64];
        let (n, src) = recv_from(b.as_ref(), &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(src, addr(1000));

        b.try_send_to(b"world", addr(1000)).unwrap();
        let (n, src) = recv_from(a.as_ref(), &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"world");
        assert_eq!(src, addr(2000));
    }

    #[tokio::test]
    async fn test_short_read_buffers_remainder() {
        let (a, b) = MemoryEndpoint::pair(addr(1), addr(2));
        a.try_send_to(b"0123456789", addr(2)).unwrap();

        let mut small = [0u8; 4];
        let (n, _) = recv_from(b.as_ref(), &mut small).await.unwrap();
        assert_eq!(&small[..n], b"0123");

        let (n, _) = recv_from(b.as_ref(), &mut small).await.unwrap();
        assert_eq!(&small[..n], b"4567");

        let (n, _) = recv_from(b.as_ref(), &mut small).await.unwrap();
        assert_eq!(&small[..n], b"89");
    }

    #[tokio::test]
    async fn test_capture_order_is_preserved_per_source() {
        let (a, b) = MemoryEndpoint::pair(addr(1), addr(2));
        for i in 0..100u8 {
            a.try_send_to(&[i], addr(2)).unwrap();
        }
        let mut buf = [0u8; 8];
        for i in 0..100u8 {
            let (n, _) = recv_from(b.as_ref(), &mut buf).await.unwrap();
            assert_eq!(&buf[..n], &[i]);
        }
    }

    #[tokio::test]
    async fn test_closed_endpoint_rejects_send() {
        let (a, _b) = MemoryEndpoint::pair(addr(1), addr(2));
        a.close();
        a.close(); // idempotent
        assert!(a.is_closed());
        assert!(a.try_send_to(b"x", addr(2)).is_err());
    }

    #[tokio::test]
    async fn test_unpaired_send_counts_drop() {
        let e = MemoryEndpoint::unpaired(addr(9));
        e.try_send_to(b"nowhere", addr(10)).unwrap();
        assert_eq!(e.stats().send_dropped, 1);
    }

    #[tokio::test]
    async fn test_flow_table_routing() {
        let table = FlowTable::new();
        let mut rx = table.register(addr(5), 8);

        assert!(table.route(addr(5), (b"one".to_vec(), addr(5))));
        assert!(!table.route(addr(6), (b"lost".to_vec(), addr(6))));

        let (bytes, src) = rx.recv().await.unwrap();
        assert_eq!(bytes, b"one");
        assert_eq!(src, addr(5));
    }

    #[tokio::test]
    async fn test_flow_table_sweep_drops_closed_flows() {
        let table = FlowTable::new();
        let rx = table.register(addr(5), 8);
        assert_eq!(table.len(), 1);

        drop(rx);
        assert_eq!(table.sweep(Duration::from_secs(600)), 1);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_flow_table_sweep_keeps_active_flows() {
        let table = FlowTable::new();
        let _rx = table.register(addr(5), 8);
        assert_eq!(table.sweep(Duration::from_secs(600)), 0);
        assert!(table.contains(addr(5)));
    }
}
