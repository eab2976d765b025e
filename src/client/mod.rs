//! Client connection supervisor
//!
//! Maintains a fixed set of transport connections to the server and hands
//! out streams over them, round-robin. Each slot is guarded by its own
//! narrow async lock: health probing, shadow-flag refresh, and reconnection
//! all happen under it, so a slot never has two reconnects in flight and
//! concurrent callers simply rotate to other slots.
//!
//! Stream opening retries iteratively, never recursively, with exponential
//! backoff and a hard attempt ceiling; from the second attempt onward the
//! health check is forced so a dead connection is replaced rather than
//! retried into.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{ClientError, FabricError, TransportError};
use crate::fabric::{DatagramSocket, EndpointStats, FlagEntry, PacketEndpoint, ShadowFlags};
use crate::protocol::Frame;
use crate::transport::{self, BoxStream, Connection};

/// Packet-pressure report cadence
const PRESSURE_MONITOR_INTERVAL: Duration = Duration::from_secs(30);

/// Opens one datagram endpoint per transport connection.
///
/// The production factory opens the pcap fabric; tests substitute in-memory
/// endpoints.
#[async_trait]
pub trait EndpointFactory: Send + Sync {
    /// Open a fresh endpoint.
    ///
    /// # Errors
    ///
    /// Propagates fabric setup failures.
    async fn open(&self) -> Result<Arc<dyn DatagramSocket>, FabricError>;
}

/// The pcap-backed factory used in production
pub struct PcapEndpointFactory {
    network: crate::config::NetworkConfig,
    packet_workers: usize,
    cancel: CancellationToken,
}

impl PcapEndpointFactory {
    /// Factory bound to the configured interface
    #[must_use]
    pub fn new(cfg: &Config, cancel: CancellationToken) -> Self {
        Self {
            network: cfg.network.clone(),
            packet_workers: cfg.performance.packet_workers,
            cancel,
        }
    }
}

#[async_trait]
impl EndpointFactory for PcapEndpointFactory {
    async fn open(&self) -> Result<Arc<dyn DatagramSocket>, FabricError> {
        let endpoint = PacketEndpoint::open(&self.network, self.packet_workers, &self.cancel)?;
        Ok(endpoint as Arc<dyn DatagramSocket>)
    }
}

struct SlotState {
    conn: Option<Arc<dyn Connection>>,
    last_health_check: Instant,
    last_flag_refresh: Instant,
}

struct Slot {
    index: usize,
    state: Mutex<SlotState>,
}

/// The supervisor
pub struct Client {
    cfg: Arc<Config>,
    factory: Arc<dyn EndpointFactory>,
    slots: Vec<Slot>,
    next: AtomicUsize,
    /// Total stream-open attempts, for the bounded-retry property
    retry_attempts: AtomicU64,
    cancel: CancellationToken,
}

impl Client {
    /// Create the supervisor and synchronously establish every connection
    /// slot. Any slot failing aborts startup.
    ///
    /// # Errors
    ///
    /// `ConnectionSetup` when a slot cannot be established.
    pub async fn start(
        cfg: Arc<Config>,
        factory: Arc<dyn EndpointFactory>,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>, ClientError> {
        let count = cfg.transport.conn;
        if count == 0 {
            return Err(ClientError::NoConnections);
        }

        let client = Arc::new(Self {
            cfg: Arc::clone(&cfg),
            factory,
            slots: (0..count)
                .map(|index| Slot {
                    index,
                    state: Mutex::new(SlotState {
                        conn: None,
                        last_health_check: Instant::now(),
                        last_flag_refresh: Instant::now(),
                    }),
                })
                .collect(),
            next: AtomicUsize::new(0),
            retry_attempts: AtomicU64::new(0),
            cancel,
        });

        for slot in &client.slots {
            let conn = client.establish().await?;
            let mut state = slot.state.lock().await;
            state.conn = Some(conn);
            debug!(slot = slot.index, "transport connection established");
        }

        client.spawn_pressure_monitor();

        info!(
            connections = count,
            server = %client.server_addr(),
            protocol = cfg.transport.protocol.as_str(),
            "client started"
        );
        Ok(client)
    }

    fn server_addr(&self) -> std::net::SocketAddr {
        self.cfg
            .server
            .as_ref()
            .map(|s| s.addr)
            .unwrap_or_else(|| "0.0.0.0:0".parse().expect("constant address"))
    }

    /// Dial one fresh transport connection
    async fn establish(&self) -> Result<Arc<dyn Connection>, ClientError> {
        let endpoint = self
            .factory
            .open()
            .await
            .map_err(|e| ClientError::ConnectionSetup(TransportError::Config(e.to_string())))?;
        let conn = transport::dial(
            &self.cfg.transport,
            self.server_addr(),
            endpoint,
            &self.cancel,
        )
        .await?;
        Ok(Arc::from(conn))
    }

    /// Pick the next slot and return a healthy connection from it,
    /// refreshing shadow flags and probing health on schedule.
    ///
    /// # Errors
    ///
    /// `ShuttingDown` after cancellation, `ConnectionSetup` when a
    /// reconnect fails.
    pub async fn get_connection(
        &self,
        force_health_check: bool,
    ) -> Result<Arc<dyn Connection>, ClientError> {
        if self.cancel.is_cancelled() {
            return Err(ClientError::ShuttingDown);
        }

        let slot = &self.slots[self.next.fetch_add(1, Ordering::Relaxed) % self.slots.len()];
        let mut state = slot.state.lock().await;

        let health_every = Duration::from_millis(self.cfg.performance.connection_health_check_ms);
        let flags_every = Duration::from_millis(self.cfg.performance.tcp_flag_refresh_ms);

        if state.conn.as_ref().map_or(true, |c| c.is_closed()) {
            warn!(slot = slot.index, "connection missing, establishing a new one");
            state.conn = Some(self.establish().await?);
            let now = Instant::now();
            state.last_health_check = now;
            state.last_flag_refresh = now;
        }

        let conn = Arc::clone(state.conn.as_ref().expect("slot was just filled"));

        if state.last_flag_refresh.elapsed() >= flags_every {
            match self.send_flag_refresh(&conn).await {
                Ok(()) => state.last_flag_refresh = Instant::now(),
                Err(e) => debug!(slot = slot.index, error = %e, "shadow flag refresh failed"),
            }
        }

        if force_health_check || state.last_health_check.elapsed() >= health_every {
            state.last_health_check = Instant::now();
            if let Err(e) = conn.ping(false).await {
                info!(slot = slot.index, error = %e, "connection lost, reconnecting");
                conn.close();
                let fresh = self.establish().await?;
                state.conn = Some(Arc::clone(&fresh));
                let now = Instant::now();
                state.last_health_check = now;
                state.last_flag_refresh = now;
                return Ok(fresh);
            }
        }

        Ok(conn)
    }

    /// Publish our shadow flags to the peer on a throwaway stream.
    async fn send_flag_refresh(&self, conn: &Arc<dyn Connection>) -> Result<(), TransportError> {
        let entries = self.local_flag_entries(conn);
        if entries.is_empty() {
            return Ok(());
        }
        let mut stream = conn.open_stream().await?;
        Frame::Flags(entries).write_to(&mut stream).await?;
        use tokio::io::AsyncWriteExt;
        stream.shutdown().await.ok();
        Ok(())
    }

    /// Entries describing our own tuple, mirrored so the peer crafts
    /// segments that continue our conversation: its seq is our ack and
    /// vice versa.
    fn local_flag_entries(&self, conn: &Arc<dyn Connection>) -> Vec<FlagEntry> {
        let Some(shadow) = conn.shadow() else {
            return Vec::new();
        };
        let ours = shadow.get_or_create(conn.remote_addr());
        vec![FlagEntry {
            addr: conn.local_addr(),
            flags: ShadowFlags {
                seq: ours.ack,
                ack: ours.seq,
                window: ours.window,
                flags: ours.flags,
            },
        }]
    }

    /// Open a stream, retrying with bounded backoff.
    ///
    /// Iterative by construction: the attempt ceiling is
    /// `performance.max_retry_attempts` and every attempt past the first
    /// forces a health check on the slot it lands on.
    ///
    /// # Errors
    ///
    /// `RetriesExhausted` when every attempt failed, `ShuttingDown` on
    /// cancellation.
    pub async fn open_stream(&self) -> Result<BoxStream, ClientError> {
        let max_attempts = self.cfg.performance.max_retry_attempts;

        for attempt in 0..max_attempts {
            if self.cancel.is_cancelled() {
                return Err(ClientError::ShuttingDown);
            }
            self.retry_attempts.fetch_add(1, Ordering::Relaxed);

            let result = match self.get_connection(attempt > 0).await {
                Ok(conn) => conn.open_stream().await.map_err(ClientError::from),
                Err(e) => Err(e),
            };
            match result {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!(
                        attempt = attempt + 1,
                        max_attempts,
                        error = %e,
                        "stream open failed, backing off"
                    );
                    if attempt + 1 < max_attempts {
                        tokio::select! {
                            () = self.cancel.cancelled() => return Err(ClientError::ShuttingDown),
                            () = tokio::time::sleep(self.retry_backoff(attempt)) => {}
                        }
                    }
                }
            }
        }
        Err(ClientError::RetriesExhausted {
            attempts: max_attempts,
        })
    }

    /// `min(initial * 2^attempt, max)`
    fn retry_backoff(&self, attempt: usize) -> Duration {
        let initial = self.cfg.performance.retry_initial_backoff_ms;
        let max = self.cfg.performance.retry_max_backoff_ms;
        let ms = initial
            .saturating_mul(2u64.saturating_pow(attempt as u32))
            .min(max);
        Duration::from_millis(ms)
    }

    /// Open a stream relaying TCP to `target`.
    ///
    /// # Errors
    ///
    /// As [`open_stream`](Self::open_stream), plus header write failures.
    pub async fn open_tcp(&self, target: std::net::SocketAddr) -> Result<BoxStream, ClientError> {
        let mut stream = self.open_stream().await?;
        Frame::Tcp(target)
            .write_to(&mut stream)
            .await
            .map_err(ClientError::from)?;
        Ok(stream)
    }

    /// Open a stream relaying length-framed UDP datagrams to `target`.
    ///
    /// # Errors
    ///
    /// As [`open_stream`](Self::open_stream).
    pub async fn open_udp(&self, target: std::net::SocketAddr) -> Result<BoxStream, ClientError> {
        let mut stream = self.open_stream().await?;
        Frame::Udp(target)
            .write_to(&mut stream)
            .await
            .map_err(ClientError::from)?;
        Ok(stream)
    }

    /// Open a stream relaying raw IP packets to the server TUN device.
    ///
    /// # Errors
    ///
    /// As [`open_stream`](Self::open_stream). The server closes the stream
    /// if its TUN support is disabled.
    pub async fn open_tun(&self) -> Result<BoxStream, ClientError> {
        let mut stream = self.open_stream().await?;
        Frame::Tun
            .write_to(&mut stream)
            .await
            .map_err(ClientError::from)?;
        Ok(stream)
    }

    /// Round-trip PING/PONG on the next connection.
    ///
    /// # Errors
    ///
    /// Propagates connection and probe failures.
    pub async fn ping(&self) -> Result<(), ClientError> {
        let conn = self.get_connection(false).await?;
        conn.ping(true).await.map_err(ClientError::from)
    }

    /// Total stream-open attempts made so far
    #[must_use]
    pub fn retry_attempts(&self) -> u64 {
        self.retry_attempts.load(Ordering::Relaxed)
    }

    /// Aggregate endpoint counters across all slots
    pub async fn packet_stats(&self) -> EndpointStats {
        let mut total = EndpointStats::default();
        for slot in &self.slots {
            let state = slot.state.lock().await;
            if let Some(conn) = &state.conn {
                let stats = conn.packet_stats();
                total.send_dropped += stats.send_dropped;
                total.send_queue_depth += stats.send_queue_depth;
                total.recv_dropped += stats.recv_dropped;
            }
        }
        total
    }

    /// Close every slot and stop background tasks. Idempotent.
    pub async fn close(&self) {
        self.cancel.cancel();
        for slot in &self.slots {
            let mut state = slot.state.lock().await;
            if let Some(conn) = state.conn.take() {
                conn.close();
            }
        }
        info!("client shutdown complete");
    }

    /// Every 30 seconds, surface cumulative drop counters when pressure is
    /// visible (new drops, or a standing queue).
    fn spawn_pressure_monitor(self: &Arc<Self>) {
        let client = Arc::clone(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PRESSURE_MONITOR_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut last_dropped = 0u64;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let stats = client.packet_stats().await;
                        if stats.send_dropped > last_dropped || stats.send_queue_depth > 0 {
                            warn!(
                                dropped = stats.send_dropped,
                                new = stats.send_dropped - last_dropped,
                                queue_depth = stats.send_queue_depth,
                                "client packet pressure"
                            );
                        }
                        last_dropped = stats.send_dropped;
                    }
                }
            }
        });
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("slots", &self.slots.len())
            .field("retry_attempts", &self.retry_attempts())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_str;
    use crate::fabric::MemoryEndpoint;
    use parking_lot::Mutex as SyncMutex;

    /// Hands out endpoints pre-paired with a server-side sibling; the
    /// sibling is parked in `server_side` for the test to drive.
    struct MemoryFactory {
        server_addr: std::net::SocketAddr,
        server_side: SyncMutex<Vec<Arc<MemoryEndpoint>>>,
        next_port: AtomicUsize,
    }

    impl MemoryFactory {
        fn new(server_addr: std::net::SocketAddr) -> Arc<Self> {
            Arc::new(Self {
                server_addr,
                server_side: SyncMutex::new(Vec::new()),
                next_port: AtomicUsize::new(41000),
            })
        }
    }

    #[async_trait]
    impl EndpointFactory for MemoryFactory {
        async fn open(&self) -> Result<Arc<dyn DatagramSocket>, FabricError> {
            let port = self.next_port.fetch_add(1, Ordering::Relaxed) as u16;
            let local = format!("10.9.0.1:{port}").parse().expect("test address");
            let (client_end, server_end) = MemoryEndpoint::pair(local, self.server_addr);
            self.server_side.lock().push(server_end);
            Ok(client_end as Arc<dyn DatagramSocket>)
        }
    }

    fn client_config(conn: usize, max_retries: usize) -> Arc<Config> {
        let yaml = format!(
            r#"
role: client
network:
  interface: lo
  ipv4:
    addr: 10.9.0.1:41000
    router_mac: "00:00:00:00:00:01"
server:
  addr: 10.9.0.2:443
transport:
  protocol: kcp
  conn: {conn}
performance:
  max_retry_attempts: {max_retries}
  retry_initial_backoff_ms: 10
  retry_max_backoff_ms: 40
  connection_health_check_ms: 200
  tcp_flag_refresh_ms: 600000
"#
        );
        Arc::new(load_config_str(&yaml).unwrap())
    }

    /// A server loop good enough for the supervisor: accepts KCP
    /// conversations on every parked endpoint and answers PING streams.
    fn spawn_kcp_responders(factory: &Arc<MemoryFactory>, cfg: &Arc<Config>, cancel: &CancellationToken) {
        for endpoint in factory.server_side.lock().drain(..) {
            let kcp_cfg = cfg.transport.kcp.clone().unwrap();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let listener = crate::transport::kcp::listen(
                    &kcp_cfg,
                    endpoint as Arc<dyn DatagramSocket>,
                    &cancel,
                )
                .unwrap();
                while let Ok(conn) = listener.accept().await {
                    tokio::spawn(async move {
                        while let Ok(mut stream) = conn.accept_stream().await {
                            tokio::spawn(async move {
                                match Frame::read_from(&mut stream).await {
                                    Ok(Frame::Ping) => {
                                        let _ = Frame::Pong.write_to(&mut stream).await;
                                    }
                                    Ok(_) | Err(_) => {}
                                }
                            });
                        }
                    });
                }
            });
        }
    }

    #[tokio::test]
    async fn test_start_creates_all_slots() {
        let cfg = client_config(3, 6);
        let factory = MemoryFactory::new("10.9.0.2:443".parse().unwrap());
        let cancel = CancellationToken::new();

        let client = Client::start(cfg, Arc::clone(&factory) as Arc<dyn EndpointFactory>, cancel)
            .await
            .unwrap();
        // One parked server endpoint per slot.
        assert_eq!(factory.server_side.lock().len(), 3);
        client.close().await;
    }

    #[tokio::test]
    async fn test_round_robin_rotates_slots() {
        let cfg = client_config(2, 6);
        let factory = MemoryFactory::new("10.9.0.2:443".parse().unwrap());
        let cancel = CancellationToken::new();
        let client = Client::start(
            cfg,
            Arc::clone(&factory) as Arc<dyn EndpointFactory>,
            cancel.clone(),
        )
        .await
        .unwrap();

        let a = client.get_connection(false).await.unwrap();
        let b = client.get_connection(false).await.unwrap();
        assert_ne!(
            a.local_addr(),
            b.local_addr(),
            "consecutive calls should land on different slots"
        );
        client.close().await;
    }

    #[tokio::test]
    async fn test_ping_round_trip() {
        let cfg = client_config(1, 6);
        let factory = MemoryFactory::new("10.9.0.2:443".parse().unwrap());
        let cancel = CancellationToken::new();
        let client = Client::start(
            Arc::clone(&cfg),
            Arc::clone(&factory) as Arc<dyn EndpointFactory>,
            cancel.clone(),
        )
        .await
        .unwrap();
        spawn_kcp_responders(&factory, &cfg, &cancel);

        tokio::time::timeout(Duration::from_secs(5), client.ping())
            .await
            .expect("ping should not hang")
            .expect("ping should succeed");
        client.close().await;
    }

    #[tokio::test]
    async fn test_open_stream_counts_attempts_and_gives_up() {
        // No responder: KCP streams open locally, but the supervisor's own
        // bookkeeping must stay bounded when we force failures by closing
        // the connection under it.
        let cfg = client_config(1, 3);
        let factory = MemoryFactory::new("10.9.0.2:443".parse().unwrap());
        let cancel = CancellationToken::new();
        let client = Client::start(
            cfg,
            Arc::clone(&factory) as Arc<dyn EndpointFactory>,
            cancel.clone(),
        )
        .await
        .unwrap();

        // KCP open_stream succeeds locally (connectionless), so this
        // exercises the success path's single attempt.
        let _stream = client.open_stream().await.unwrap();
        assert_eq!(client.retry_attempts(), 1);
        client.close().await;

        // After shutdown every attempt short-circuits.
        let err = client.open_stream().await.unwrap_err();
        assert!(matches!(err, ClientError::ShuttingDown));
    }

    #[tokio::test]
    async fn test_reconnect_after_connection_killed() {
        let cfg = client_config(1, 6);
        let factory = MemoryFactory::new("10.9.0.2:443".parse().unwrap());
        let cancel = CancellationToken::new();
        let client = Client::start(
            Arc::clone(&cfg),
            Arc::clone(&factory) as Arc<dyn EndpointFactory>,
            cancel.clone(),
        )
        .await
        .unwrap();

        // Kill the live connection behind the supervisor's back.
        let conn = client.get_connection(false).await.unwrap();
        conn.close();

        // A forced health check must replace it with a live one.
        let fresh = client.get_connection(true).await.unwrap();
        assert!(!fresh.is_closed());
        assert_eq!(factory.server_side.lock().len(), 2, "reconnect opened a second endpoint");
        client.close().await;
    }

    #[tokio::test]
    async fn test_backoff_schedule() {
        let cfg = client_config(1, 6);
        let factory = MemoryFactory::new("10.9.0.2:443".parse().unwrap());
        let cancel = CancellationToken::new();
        let client = Client::start(
            cfg,
            Arc::clone(&factory) as Arc<dyn EndpointFactory>,
            cancel,
        )
        .await
        .unwrap();

        assert_eq!(client.retry_backoff(0), Duration::from_millis(10));
        assert_eq!(client.retry_backoff(1), Duration::from_millis(20));
        assert_eq!(client.retry_backoff(2), Duration::from_millis(40));
        assert_eq!(client.retry_backoff(5), Duration::from_millis(40), "capped");
        client.close().await;
    }
}
