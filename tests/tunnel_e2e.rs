//! End-to-end tunnel tests over the in-memory datagram endpoint
//!
//! The full stack minus the wire: client supervisor -> KCP + mux ->
//! MemoryEndpoint pair -> KCP listener -> server dispatch -> real TCP/UDP
//! targets on localhost. Everything the pcap fabric would carry in
//! production crosses a channel instead, which keeps the tests hermetic
//! while exercising the same code paths.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use ghostwire::client::{Client, EndpointFactory};
use ghostwire::config::{load_config_str, Config};
use ghostwire::error::FabricError;
use ghostwire::fabric::{DatagramSocket, MemoryEndpoint};
use ghostwire::server::Server;
use ghostwire::transport;

const SERVER_ADDR: &str = "10.77.0.2:443";

fn client_config(conn: usize) -> Arc<Config> {
    let yaml = format!(
        r#"
role: client
network:
  interface: lo
  ipv4:
    addr: 10.77.0.1:41000
    router_mac: "00:00:00:00:00:01"
server:
  addr: {SERVER_ADDR}
transport:
  protocol: kcp
  conn: {conn}
performance:
  max_retry_attempts: 6
  retry_initial_backoff_ms: 10
  retry_max_backoff_ms: 100
  connection_health_check_ms: 500
  tcp_flag_refresh_ms: 1000
"#
    );
    Arc::new(load_config_str(&yaml).unwrap())
}

fn server_config() -> Arc<Config> {
    let yaml = format!(
        r#"
role: server
network:
  interface: lo
  ipv4:
    addr: {SERVER_ADDR}
    router_mac: "00:00:00:00:00:02"
transport:
  protocol: kcp
performance:
  max_concurrent_streams: 64
  enable_connection_pooling: true
  tcp_connection_pool_size: 4
"#
    );
    Arc::new(load_config_str(&yaml).unwrap())
}

/// Client endpoint factory whose endpoints are wired to a shared server
/// harness: every new client endpoint spawns a KCP listener + dispatch
/// task on its server-side sibling.
struct TunnelFactory {
    server_cfg: Arc<Config>,
    server: Arc<Server>,
    cancel: CancellationToken,
    next_port: AtomicUsize,
    endpoints_opened: AtomicUsize,
    server_shadows: Mutex<Vec<Arc<MemoryEndpoint>>>,
}

impl TunnelFactory {
    fn new(server_cfg: Arc<Config>, cancel: CancellationToken) -> Arc<Self> {
        let server = Server::new(Arc::clone(&server_cfg), None, cancel.clone());
        Arc::new(Self {
            server_cfg,
            server,
            cancel,
            next_port: AtomicUsize::new(42000),
            endpoints_opened: AtomicUsize::new(0),
            server_shadows: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl EndpointFactory for TunnelFactory {
    async fn open(&self) -> Result<Arc<dyn DatagramSocket>, FabricError> {
        let port = self.next_port.fetch_add(1, Ordering::Relaxed) as u16;
        let client_addr: SocketAddr = format!("10.77.0.1:{port}").parse().expect("test address");
        let server_addr: SocketAddr = SERVER_ADDR.parse().expect("test address");

        let (client_end, server_end) = MemoryEndpoint::pair(client_addr, server_addr);
        self.server_shadows.lock().push(Arc::clone(&server_end));
        self.endpoints_opened.fetch_add(1, Ordering::Relaxed);

        let kcp_cfg = self.server_cfg.transport.kcp.clone().unwrap();
        let listener = transport::kcp::listen(
            &kcp_cfg,
            server_end as Arc<dyn DatagramSocket>,
            &self.cancel,
        )
        .expect("kcp listen is infallible");

        let server = Arc::clone(&self.server);
        tokio::spawn(async move {
            let _ = server.run(listener).await;
        });

        Ok(client_end as Arc<dyn DatagramSocket>)
    }
}

struct Tunnel {
    client: Arc<Client>,
    factory: Arc<TunnelFactory>,
    cancel: CancellationToken,
}

async fn start_tunnel(conn: usize) -> Tunnel {
    let cancel = CancellationToken::new();
    let factory = TunnelFactory::new(server_config(), cancel.clone());
    let client = Client::start(
        client_config(conn),
        Arc::clone(&factory) as Arc<dyn EndpointFactory>,
        cancel.clone(),
    )
    .await
    .expect("tunnel should come up");
    Tunnel {
        client,
        factory,
        cancel,
    }
}

async fn spawn_http_target() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else { return };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 18];
                if sock.read_exact(&mut buf).await.is_err() {
                    return;
                }
                assert_eq!(&buf, b"GET / HTTP/1.0\r\n\r\n");
                let _ = sock.write_all(b"HTTP/1.0 200 OK\r\n\r\nhi").await;
            });
        }
    });
    addr
}

#[tokio::test]
async fn ping_pong_round_trip() {
    let tunnel = start_tunnel(1).await;

    tokio::time::timeout(Duration::from_secs(2), tunnel.client.ping())
        .await
        .expect("PONG within two seconds")
        .expect("ping should succeed");

    // The connection survives the probe.
    tokio::time::timeout(Duration::from_secs(2), tunnel.client.ping())
        .await
        .unwrap()
        .unwrap();

    tunnel.cancel.cancel();
    tunnel.client.close().await;
}

#[tokio::test]
async fn tcp_relay_through_the_tunnel() {
    let tunnel = start_tunnel(1).await;
    let target = spawn_http_target().await;

    let mut stream = tunnel.client.open_tcp(target).await.unwrap();
    stream.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
    stream.shutdown().await.unwrap();

    let mut reply = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut reply))
        .await
        .expect("relay should answer")
        .unwrap();
    assert_eq!(&reply, b"HTTP/1.0 200 OK\r\n\r\nhi");

    tunnel.cancel.cancel();
    tunnel.client.close().await;
}

#[tokio::test]
async fn parallel_tcp_relays_over_multiple_connections() {
    let tunnel = start_tunnel(2).await;
    let target = spawn_http_target().await;

    let mut tasks = Vec::new();
    for _ in 0..6 {
        let client = Arc::clone(&tunnel.client);
        tasks.push(tokio::spawn(async move {
            let mut stream = client.open_tcp(target).await.unwrap();
            stream.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
            stream.shutdown().await.unwrap();
            let mut reply = Vec::new();
            stream.read_to_end(&mut reply).await.unwrap();
            reply
        }));
    }
    for task in tasks {
        let reply = tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .expect("parallel relay in time")
            .unwrap();
        assert_eq!(&reply, b"HTTP/1.0 200 OK\r\n\r\nhi");
    }

    assert_eq!(
        tunnel.factory.endpoints_opened.load(Ordering::Relaxed),
        2,
        "one endpoint per supervisor slot"
    );

    tunnel.cancel.cancel();
    tunnel.client.close().await;
}

#[tokio::test]
async fn udp_relay_through_the_tunnel() {
    let tunnel = start_tunnel(1).await;

    let upstream = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target = upstream.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 1500];
        let (n, from) = upstream.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"lookup");
        upstream.send_to(b"resolved", from).await.unwrap();
    });

    let mut stream = tunnel.client.open_udp(target).await.unwrap();
    stream.write_u16(6).await.unwrap();
    stream.write_all(b"lookup").await.unwrap();
    stream.flush().await.unwrap();

    let len = tokio::time::timeout(Duration::from_secs(10), stream.read_u16())
        .await
        .expect("framed reply in time")
        .unwrap();
    assert_eq!(len, 8);
    let mut reply = vec![0u8; 8];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"resolved");

    tunnel.cancel.cancel();
    tunnel.client.close().await;
}

#[tokio::test]
async fn tun_stream_is_rejected_when_disabled() {
    let tunnel = start_tunnel(1).await;

    let mut stream = tunnel.client.open_tun().await.unwrap();
    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(10), stream.read(&mut buf))
        .await
        .expect("server should close the TUN stream")
        .unwrap_or(0);
    assert_eq!(n, 0, "TUN must be rejected with a close, never relayed");

    tunnel.cancel.cancel();
    tunnel.client.close().await;
}

#[tokio::test]
async fn shadow_flags_reach_the_server() {
    let tunnel = start_tunnel(1).await;

    // tcp_flag_refresh_ms is 1s; a connection touch past that triggers the
    // TCPF publish, which lands in the server endpoint's shadow table.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let _ = tunnel.client.ping().await;

    let shadow = tunnel.factory.server_shadows.lock()[0]
        .shadow()
        .expect("memory endpoints carry a shadow table");
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if !shadow.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("peer flags should be installed on the server side");

    tunnel.cancel.cancel();
    tunnel.client.close().await;
}
