//! ghostwire: tunnel proxy over crafted TCP segments
//!
//! ghostwire moves application traffic through a stream-multiplexed,
//! reliable, encrypted transport (KCP or QUIC) whose datagrams never touch
//! the kernel's socket stack: they are wrapped in hand-built TCP PSH+ACK
//! segments, injected and captured with libpcap on a configured interface.
//! To on-path observers the tunnel looks like an established TCP flow; to
//! the local kernel it does not exist (a small iptables rule set keeps the
//! kernel from interfering with RSTs).
//!
//! # Architecture
//!
//! ```text
//! application front-ends (external)
//!        |
//!   client::Client ── open_tcp/open_udp/open_tun ──> transport streams
//!        |                                                  |
//!   transport::{kcp,quic}   <── Connection/Stream/Listener ─┘
//!        |
//!   fabric::DatagramSocket  (write_to / read_from datagrams)
//!        |
//!   fabric: shadow flags + send pipeline + pcap capture/inject
//!        |
//!   wire: Ethernet + IPv4/6 + TCP(PSH|ACK) frames
//! ```
//!
//! Server side, `server::Server` accepts connections from the listener and
//! dispatches each stream by its first protocol message to TCP, UDP, or TUN
//! relays (`pool::TargetPools` caches upstream sockets).
//!
//! # Modules
//!
//! - [`buffer`]: lock-free byte pools for the relay paths
//! - [`client`]: connection supervisor (slots, probes, bounded retry)
//! - [`config`]: YAML configuration with role-aware auto-tuned defaults
//! - [`error`]: per-subsystem error types
//! - [`fabric`]: the raw packet fabric and the datagram endpoint seam
//! - [`io`]: pooled bidirectional copy
//! - [`iptables`]: kernel-evasion rule management
//! - [`pool`]: server-side target connection pooling
//! - [`protocol`]: the one-message stream header protocol
//! - [`server`]: accept/dispatch and relay handlers
//! - [`transport`]: the KCP/QUIC adapter layer

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_possible_truncation)]

pub mod buffer;
pub mod client;
pub mod config;
pub mod error;
pub mod fabric;
pub mod io;
pub mod iptables;
pub mod pool;
pub mod protocol;
pub mod server;
pub mod transport;

pub use buffer::{BufferPools, BytePool, PooledBuf};
pub use client::{Client, EndpointFactory, PcapEndpointFactory};
pub use config::{load_config, load_config_str, Config, Role, TransportProtocol};
pub use error::{
    ClientError, ConfigError, FabricError, GhostwireError, IptablesError, Result, ServerError,
    TransportError,
};
pub use fabric::{
    DatagramSocket, EndpointStats, FlagEntry, FlowTable, MemoryEndpoint, PacketEndpoint,
    ShadowFlags, ShadowTable,
};
pub use iptables::IptablesManager;
pub use pool::TargetPools;
pub use protocol::Frame;
pub use server::{Server, TunIo, TunProvider};
pub use transport::{dial, listen, BoxStream, Connection, Listener, Stream};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
