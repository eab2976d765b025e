//! Configuration structures
//!
//! The YAML schema mirrors the runtime's component split: `network` feeds the
//! packet fabric, `transport` feeds the KCP/QUIC adapter, `performance` feeds
//! the supervisor, send pipeline, and server dispatch, and `gfw_resist`
//! controls the iptables rules that keep the kernel out of the way.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Which side of the tunnel this process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Dials the server and exposes local entry points
    Client,
    /// Accepts tunnel connections and relays to targets
    Server,
}

impl Role {
    /// String form used in log lines
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Server => "server",
        }
    }
}

/// Multiplexed transport carried over the raw fabric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    /// KCP ARQ with the in-tree stream multiplexer
    Kcp,
    /// QUIC via quinn
    Quic,
}

impl TransportProtocol {
    /// String form used in log lines
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Kcp => "kcp",
            Self::Quic => "quic",
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// `client` or `server`
    pub role: Role,

    /// Raw interface and local addressing
    pub network: NetworkConfig,

    /// Remote server address (client role)
    #[serde(default)]
    pub server: Option<ServerAddrConfig>,

    /// Listen port (server role); the raw tuple's port doubles as the
    /// listen port, this section only exists to make that explicit
    #[serde(default)]
    pub listen: Option<ListenConfig>,

    /// Transport protocol selection and tuning
    #[serde(default)]
    pub transport: TransportConfig,

    /// Supervisor, pipeline, and dispatch tuning
    #[serde(default)]
    pub performance: PerformanceConfig,

    /// Kernel-evasion iptables automation
    #[serde(default)]
    pub gfw_resist: GfwResistConfig,

    /// Server-side TUN relay toggle
    #[serde(default)]
    pub tun: TunConfig,

    /// Logging
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Fill every unset field with a role-aware default.
    pub fn apply_defaults(&mut self) {
        let role = self.role;
        self.network.apply_defaults(role);
        self.transport.apply_defaults(role);
        self.performance.apply_defaults(role);
    }

    /// Validate the whole document, collecting every violation.
    ///
    /// # Errors
    ///
    /// Returns the full list of violations when any field is out of range or
    /// a role-required section is missing.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        self.network.validate(&mut errors);
        self.transport.validate(&mut errors);
        self.performance.validate(&mut errors);

        match self.role {
            Role::Client => {
                if self.server.is_none() {
                    errors.push("server.addr is required when role is 'client'".into());
                }
            }
            Role::Server => {
                // The raw tuple's port is the listen port; an explicit
                // listen section must agree with it.
                if let Some(listen) = &self.listen {
                    if listen.port != self.raw_port() {
                        errors.push(format!(
                            "listen.port {} does not match the raw tuple port {}",
                            listen.port,
                            self.raw_port()
                        ));
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// The port the raw tuple listens/speaks on, used for iptables rules.
    #[must_use]
    pub fn raw_port(&self) -> u16 {
        self.network
            .ipv4
            .as_ref()
            .map(|t| t.addr.port())
            .or_else(|| self.network.ipv6.as_ref().map(|t| t.addr.port()))
            .unwrap_or(0)
    }
}

/// Remote server address (client role)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerAddrConfig {
    /// Address the client tunnels to
    pub addr: SocketAddr,
}

/// Listen parameters (server role)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    /// Port the server's raw tuple answers on
    pub port: u16,
}

/// One local address + the router to send crafted frames through
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetTuple {
    /// Local IP and port used as the crafted TCP tuple
    pub addr: SocketAddr,

    /// Destination MAC for outbound frames (the first-hop router)
    pub router_mac: String,
}

/// Raw interface and capture settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Interface pcap opens
    pub interface: String,

    /// IPv4 tuple, if tunneling over IPv4
    #[serde(default)]
    pub ipv4: Option<NetTuple>,

    /// IPv6 tuple, if tunneling over IPv6
    #[serde(default)]
    pub ipv6: Option<NetTuple>,

    /// Capture and send-pipeline tuning
    #[serde(default)]
    pub pcap: PcapConfig,
}

impl NetworkConfig {
    fn apply_defaults(&mut self, role: Role) {
        self.pcap.apply_defaults(role);
    }

    fn validate(&self, errors: &mut Vec<String>) {
        if self.interface.is_empty() {
            errors.push("network.interface must be set".into());
        }
        if self.ipv4.is_none() && self.ipv6.is_none() {
            errors.push("at least one of network.ipv4 or network.ipv6 must be set".into());
        }
        if let Some(t) = &self.ipv4 {
            if !t.addr.is_ipv4() {
                errors.push(format!("network.ipv4.addr is not an IPv4 address: {}", t.addr));
            }
            if parse_mac(&t.router_mac).is_none() {
                errors.push(format!("network.ipv4.router_mac is not a valid MAC: {}", t.router_mac));
            }
        }
        if let Some(t) = &self.ipv6 {
            if !t.addr.is_ipv6() {
                errors.push(format!("network.ipv6.addr is not an IPv6 address: {}", t.addr));
            }
            if parse_mac(&t.router_mac).is_none() {
                errors.push(format!("network.ipv6.router_mac is not a valid MAC: {}", t.router_mac));
            }
        }
        self.pcap.validate(errors);
    }
}

/// Capture handle and send-pipeline tuning
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PcapConfig {
    /// PCAP kernel buffer in bytes; scaled with RAM when 0
    #[serde(default)]
    pub sockbuf: usize,

    /// Send-pipeline queue capacity; scaled with CPU count when 0
    #[serde(default)]
    pub send_queue_size: usize,

    /// Injection retries before a packet is dropped
    #[serde(default)]
    pub max_retries: u32,

    /// First retry backoff in milliseconds
    #[serde(default)]
    pub initial_backoff_ms: u64,

    /// Retry backoff ceiling in milliseconds
    #[serde(default)]
    pub max_backoff_ms: u64,
}

impl PcapConfig {
    fn apply_defaults(&mut self, role: Role) {
        let cpus = num_cpus::get();
        let ram_mb = sys_ram_mb();

        if self.sockbuf == 0 {
            // Scale with RAM, snapped to a power of two for kernel buffer
            // alignment. Servers fan in more flows than clients.
            let mb = match role {
                Role::Server => next_power_of_two(clamp(ram_mb / 256, 16, 64)),
                Role::Client => next_power_of_two(clamp(ram_mb / 512, 8, 32)),
            };
            self.sockbuf = mb * 1024 * 1024;
        }
        if self.send_queue_size == 0 {
            self.send_queue_size = clamp(cpus * 10_000, 10_000, 100_000);
        }
        if self.max_retries == 0 {
            self.max_retries = 5;
        }
        if self.initial_backoff_ms == 0 {
            self.initial_backoff_ms = 15;
        }
        if self.max_backoff_ms == 0 {
            self.max_backoff_ms = 2000;
        }
    }

    fn validate(&self, errors: &mut Vec<String>) {
        if self.sockbuf < 1024 {
            errors.push("network.pcap.sockbuf must be >= 1024 bytes".into());
        }
        if self.sockbuf > 100 * 1024 * 1024 {
            errors.push("network.pcap.sockbuf too large (max 100MB)".into());
        }
        if self.send_queue_size < 1 || self.send_queue_size > 100_000 {
            errors.push("network.pcap.send_queue_size must be between 1 and 100000".into());
        }
        if self.max_retries > 10 {
            errors.push("network.pcap.max_retries must be between 0 and 10".into());
        }
        if self.initial_backoff_ms < 1 || self.initial_backoff_ms > 1000 {
            errors.push("network.pcap.initial_backoff_ms must be between 1 and 1000".into());
        }
        if self.max_backoff_ms < self.initial_backoff_ms || self.max_backoff_ms > 60_000 {
            errors.push(
                "network.pcap.max_backoff_ms must be between initial_backoff_ms and 60000".into(),
            );
        }
    }
}

/// Transport protocol selection and buffer sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// `kcp` or `quic`
    #[serde(default = "default_protocol")]
    pub protocol: TransportProtocol,

    /// Number of parallel transport connections the client maintains
    #[serde(default)]
    pub conn: usize,

    /// TCP relay buffer pool entry size
    #[serde(default)]
    pub tcpbuf: usize,

    /// UDP relay buffer pool entry size
    #[serde(default)]
    pub udpbuf: usize,

    /// TUN relay buffer pool entry size
    #[serde(default)]
    pub tunbuf: usize,

    /// KCP tuning (used when protocol is `kcp`)
    #[serde(default)]
    pub kcp: Option<KcpConfig>,

    /// QUIC tuning (used when protocol is `quic`)
    #[serde(default)]
    pub quic: Option<QuicConfig>,
}

fn default_protocol() -> TransportProtocol {
    TransportProtocol::Quic
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            protocol: TransportProtocol::Quic,
            conn: 0,
            tcpbuf: 0,
            udpbuf: 0,
            tunbuf: 0,
            kcp: None,
            quic: None,
        }
    }
}

impl TransportConfig {
    fn apply_defaults(&mut self, role: Role) {
        let cpus = num_cpus::get();

        if self.conn == 0 {
            self.conn = match (role, self.protocol) {
                (Role::Client, TransportProtocol::Quic) => clamp(cpus / 2, 1, 4),
                (Role::Client, TransportProtocol::Kcp) => clamp(cpus / 3, 1, 3),
                (Role::Server, _) => 1,
            };
        }

        if self.tcpbuf == 0 {
            self.tcpbuf = clamp(cpus * 16 * 1024, 64 * 1024, 4 * 1024 * 1024);
        }
        if self.udpbuf == 0 {
            self.udpbuf = clamp(cpus * 4 * 1024, 16 * 1024, 1024 * 1024);
        }
        if self.tunbuf == 0 {
            self.tunbuf = clamp(cpus * 64 * 1024, 256 * 1024, 16 * 1024 * 1024);
        }

        match self.protocol {
            TransportProtocol::Kcp => {
                let kcp = self.kcp.get_or_insert_with(KcpConfig::default);
                kcp.apply_defaults(role);
            }
            TransportProtocol::Quic => {
                let quic = self.quic.get_or_insert_with(QuicConfig::default);
                quic.apply_defaults(role);
            }
        }
    }

    fn validate(&self, errors: &mut Vec<String>) {
        if self.conn < 1 || self.conn > 256 {
            errors.push("transport.conn must be between 1 and 256".into());
        }
        if self.tcpbuf < 4 * 1024 || self.tcpbuf > 16 * 1024 * 1024 {
            errors.push("transport.tcpbuf must be between 4KB and 16MB".into());
        }
        if self.udpbuf < 2 * 1024 || self.udpbuf > 4 * 1024 * 1024 {
            errors.push("transport.udpbuf must be between 2KB and 4MB".into());
        }
        if self.tunbuf < 8 * 1024 || self.tunbuf > 32 * 1024 * 1024 {
            errors.push("transport.tunbuf must be between 8KB and 32MB".into());
        }
        match self.protocol {
            TransportProtocol::Kcp => {
                if let Some(kcp) = &self.kcp {
                    kcp.validate(errors);
                } else {
                    errors.push("transport.kcp is required when protocol is 'kcp'".into());
                }
            }
            TransportProtocol::Quic => {
                if let Some(quic) = &self.quic {
                    quic.validate(errors);
                } else {
                    errors.push("transport.quic is required when protocol is 'quic'".into());
                }
            }
        }
    }
}

/// KCP ARQ tuning, passed through the adapter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KcpConfig {
    /// Datagram MTU the ARQ segments against; must leave room for the
    /// crafted TCP/IP headers on the wire
    #[serde(default)]
    pub mtu: usize,

    /// Send window in segments
    #[serde(default)]
    pub snd_wnd: u16,

    /// Receive window in segments
    #[serde(default)]
    pub rcv_wnd: u16,

    /// Aggressive retransmission (kcp "nodelay" mode)
    #[serde(default)]
    pub nodelay: Option<bool>,

    /// Internal clock interval in milliseconds
    #[serde(default)]
    pub interval_ms: u32,

    /// Fast-retransmit trigger (duplicate ACK count, 0 disables)
    #[serde(default)]
    pub resend: u32,
}

impl KcpConfig {
    fn apply_defaults(&mut self, role: Role) {
        if self.mtu == 0 {
            self.mtu = 1350;
        }
        if self.snd_wnd == 0 {
            self.snd_wnd = match role {
                Role::Server => 1024,
                Role::Client => 256,
            };
        }
        if self.rcv_wnd == 0 {
            self.rcv_wnd = match role {
                Role::Server => 1024,
                Role::Client => 512,
            };
        }
        if self.nodelay.is_none() {
            self.nodelay = Some(true);
        }
        if self.interval_ms == 0 {
            self.interval_ms = 10;
        }
        if self.resend == 0 {
            self.resend = 2;
        }
    }

    fn validate(&self, errors: &mut Vec<String>) {
        if self.mtu < 512 || self.mtu > 1400 {
            errors.push("transport.kcp.mtu must be between 512 and 1400".into());
        }
        if self.interval_ms < 5 || self.interval_ms > 100 {
            errors.push("transport.kcp.interval_ms must be between 5 and 100".into());
        }
    }
}

/// QUIC tuning, passed through the adapter to quinn
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuicConfig {
    /// Connection idle timeout in milliseconds
    #[serde(default)]
    pub max_idle_timeout_ms: u64,

    /// Maximum concurrent incoming bidirectional streams
    #[serde(default)]
    pub max_incoming_streams: u32,

    /// Maximum concurrent incoming unidirectional streams
    #[serde(default)]
    pub max_incoming_uni_streams: u32,

    /// Initial per-stream receive window in bytes
    #[serde(default)]
    pub initial_stream_receive_window: u64,

    /// Per-stream receive window ceiling in bytes
    #[serde(default)]
    pub max_stream_receive_window: u64,

    /// Initial connection-wide receive window in bytes
    #[serde(default)]
    pub initial_connection_receive_window: u64,

    /// Connection-wide receive window ceiling in bytes
    #[serde(default)]
    pub max_connection_receive_window: u64,

    /// Keep-alive period in milliseconds (0 disables)
    #[serde(default)]
    pub keep_alive_period_ms: u64,

    /// Attempt 0-RTT on reconnect
    #[serde(default)]
    pub enable_0rtt: bool,
}

impl QuicConfig {
    fn apply_defaults(&mut self, role: Role) {
        if self.max_idle_timeout_ms == 0 {
            self.max_idle_timeout_ms = 30_000;
        }
        if self.max_incoming_streams == 0 {
            self.max_incoming_streams = match role {
                Role::Server => 4096,
                Role::Client => 256,
            };
        }
        if self.max_incoming_uni_streams == 0 {
            self.max_incoming_uni_streams = match role {
                Role::Server => 1024,
                Role::Client => 128,
            };
        }
        if self.initial_stream_receive_window == 0 {
            self.initial_stream_receive_window = match role {
                Role::Server => 4 * 1024 * 1024,
                Role::Client => 2 * 1024 * 1024,
            };
        }
        if self.max_stream_receive_window == 0 {
            self.max_stream_receive_window = match role {
                Role::Server => 16 * 1024 * 1024,
                Role::Client => 8 * 1024 * 1024,
            };
        }
        if self.initial_connection_receive_window == 0 {
            self.initial_connection_receive_window = match role {
                Role::Server => 16 * 1024 * 1024,
                Role::Client => 8 * 1024 * 1024,
            };
        }
        if self.max_connection_receive_window == 0 {
            self.max_connection_receive_window = match role {
                Role::Server => 64 * 1024 * 1024,
                Role::Client => 24 * 1024 * 1024,
            };
        }
        if self.keep_alive_period_ms == 0 {
            self.keep_alive_period_ms = 15_000;
        }
    }

    fn validate(&self, errors: &mut Vec<String>) {
        if self.max_idle_timeout_ms < 1000 || self.max_idle_timeout_ms > 600_000 {
            errors.push("transport.quic.max_idle_timeout_ms must be between 1000 and 600000".into());
        }
        if self.max_stream_receive_window < self.initial_stream_receive_window {
            errors.push(
                "transport.quic.max_stream_receive_window must be >= initial_stream_receive_window"
                    .into(),
            );
        }
        if self.max_connection_receive_window < self.initial_connection_receive_window {
            errors.push(
                "transport.quic.max_connection_receive_window must be >= initial_connection_receive_window"
                    .into(),
            );
        }
    }
}

/// Supervisor, pipeline, and dispatch tuning
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Concurrent stream handlers on the server; 0 means unlimited
    #[serde(default)]
    pub max_concurrent_streams: usize,

    /// Parallel packet serialization workers
    #[serde(default)]
    pub packet_workers: usize,

    /// Upper bound on live stream tasks
    #[serde(default)]
    pub stream_worker_pool_size: usize,

    /// Cached TCP connections per target; 0 with pooling enabled falls back
    /// to the role default
    #[serde(default)]
    pub tcp_connection_pool_size: usize,

    /// Seconds a pooled target connection may sit idle
    #[serde(default)]
    pub tcp_connection_idle_timeout: u64,

    /// Enables the server-side target connection pool
    #[serde(default)]
    pub enable_connection_pooling: Option<bool>,

    /// Retry ceiling for stream creation
    #[serde(default)]
    pub max_retry_attempts: usize,

    /// First stream-retry backoff in milliseconds
    #[serde(default)]
    pub retry_initial_backoff_ms: u64,

    /// Stream-retry backoff ceiling in milliseconds
    #[serde(default)]
    pub retry_max_backoff_ms: u64,

    /// Health probe cadence in milliseconds
    #[serde(default)]
    pub connection_health_check_ms: u64,

    /// Shadow-flag refresh cadence in milliseconds
    #[serde(default)]
    pub tcp_flag_refresh_ms: u64,
}

impl PerformanceConfig {
    fn apply_defaults(&mut self, role: Role) {
        let cpus = num_cpus::get();

        if self.max_concurrent_streams == 0 {
            self.max_concurrent_streams = match role {
                Role::Server => clamp(cpus * 12_500, 50_000, 100_000),
                Role::Client => clamp(cpus * 2500, 10_000, 50_000),
            };
        }
        if self.packet_workers == 0 {
            self.packet_workers = clamp(cpus, 2, 64);
            if role == Role::Server && self.packet_workers < 4 {
                self.packet_workers = 4;
            }
        }
        if self.stream_worker_pool_size == 0 {
            self.stream_worker_pool_size = match role {
                Role::Server => clamp(cpus * 2500, 10_000, 100_000),
                Role::Client => clamp(cpus * 1250, 5000, 50_000),
            };
        }
        if self.tcp_connection_pool_size == 0 {
            self.tcp_connection_pool_size = match role {
                Role::Server => clamp(cpus * 64, 256, 4096),
                Role::Client => clamp(cpus * 16, 64, 512),
            };
        }
        if self.tcp_connection_idle_timeout == 0 {
            self.tcp_connection_idle_timeout = 75;
        }
        if self.enable_connection_pooling.is_none() {
            self.enable_connection_pooling = Some(role == Role::Server);
        }
        if self.max_retry_attempts == 0 {
            self.max_retry_attempts = 6;
        }
        if self.retry_initial_backoff_ms == 0 {
            self.retry_initial_backoff_ms = 100;
        }
        if self.retry_max_backoff_ms == 0 {
            self.retry_max_backoff_ms = 5000;
        }
        if self.connection_health_check_ms == 0 {
            self.connection_health_check_ms = 1000;
        }
        if self.tcp_flag_refresh_ms == 0 {
            self.tcp_flag_refresh_ms = 5000;
        }
    }

    fn validate(&self, errors: &mut Vec<String>) {
        if self.max_concurrent_streams > 100_000 {
            errors.push("performance.max_concurrent_streams is very high (max 100000)".into());
        }
        if self.packet_workers < 1 || self.packet_workers > 64 {
            errors.push("performance.packet_workers must be between 1 and 64".into());
        }
        if self.stream_worker_pool_size < 10 || self.stream_worker_pool_size > 100_000 {
            errors.push("performance.stream_worker_pool_size must be between 10 and 100000".into());
        }
        if self.tcp_connection_pool_size > 10_000 {
            errors.push("performance.tcp_connection_pool_size must be between 0 and 10000".into());
        }
        if self.tcp_connection_idle_timeout < 10 || self.tcp_connection_idle_timeout > 3600 {
            errors.push(
                "performance.tcp_connection_idle_timeout must be between 10 and 3600 seconds"
                    .into(),
            );
        }
        if self.max_retry_attempts > 20 {
            errors.push("performance.max_retry_attempts must be between 0 and 20".into());
        }
        if self.retry_initial_backoff_ms < 10 || self.retry_initial_backoff_ms > 10_000 {
            errors.push("performance.retry_initial_backoff_ms must be between 10 and 10000".into());
        }
        if self.retry_max_backoff_ms < self.retry_initial_backoff_ms
            || self.retry_max_backoff_ms > 60_000
        {
            errors.push(
                "performance.retry_max_backoff_ms must be between retry_initial_backoff_ms and 60000"
                    .into(),
            );
        }
        if self.connection_health_check_ms < 100 || self.connection_health_check_ms > 60_000 {
            errors.push("performance.connection_health_check_ms must be between 100 and 60000".into());
        }
        if self.tcp_flag_refresh_ms < 500 || self.tcp_flag_refresh_ms > 600_000 {
            errors.push("performance.tcp_flag_refresh_ms must be between 500 and 600000".into());
        }
    }

    /// Whether the server-side target pool is enabled
    #[must_use]
    pub fn connection_pooling_enabled(&self) -> bool {
        self.enable_connection_pooling.unwrap_or(false)
    }
}

/// Kernel-evasion iptables automation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GfwResistConfig {
    /// Apply NOTRACK + RST-drop rules on startup and remove them on exit
    #[serde(default)]
    pub auto_iptables: bool,
}

/// Server-side TUN relay toggle
///
/// The device itself is an external collaborator; this flag only decides
/// whether TUN-typed streams are accepted or closed with an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TunConfig {
    /// Accept TUN-typed streams
    #[serde(default)]
    pub enabled: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// tracing filter directive, e.g. `info` or `ghostwire=debug`
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Parse a `aa:bb:cc:dd:ee:ff` MAC address
#[must_use]
pub(crate) fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let mut out = [0u8; 6];
    let mut parts = s.split(':');
    for byte in &mut out {
        let part = parts.next()?;
        if part.len() != 2 {
            return None;
        }
        *byte = u8::from_str_radix(part, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(out)
}

/// Total physical RAM in megabytes; `/proc/meminfo` on Linux, a 4 GB
/// fallback elsewhere.
fn sys_ram_mb() -> usize {
    const FALLBACK_MB: usize = 4096;

    let Ok(data) = std::fs::read_to_string("/proc/meminfo") else {
        return FALLBACK_MB;
    };
    for line in data.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            if let Some(kb) = rest.split_whitespace().next().and_then(|v| v.parse::<usize>().ok())
            {
                if kb > 0 {
                    return kb / 1024;
                }
            }
        }
    }
    FALLBACK_MB
}

const fn clamp(v: usize, lo: usize, hi: usize) -> usize {
    if v < lo {
        lo
    } else if v > hi {
        hi
    } else {
        v
    }
}

const fn next_power_of_two(v: usize) -> usize {
    if v <= 1 {
        return 1;
    }
    let mut p = 1;
    while p < v {
        p <<= 1;
    }
    p
}
