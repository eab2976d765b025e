//! Outbound TCP segment composition
//!
//! Builds complete Ethernet + IPv4/IPv6 + TCP frames around tunnel
//! datagrams. Source MAC, router MAC, and the local tuple come from
//! configuration; seq/ACK/window/flags come from the shadow table.
//! Checksums are left to etherparse; nothing here computes one by hand.
//!
//! No TCP options are emitted and MSS is never negotiated: the payload is a
//! transport datagram that already fits the configured MTU.

use std::net::{IpAddr, SocketAddr};

use etherparse::PacketBuilder;

use crate::config::NetworkConfig;
use crate::error::FabricError;
use crate::fabric::shadow::{ShadowFlags, FLAG_ACK, FLAG_PSH};

/// Standard Ethernet payload budget
const LINK_MTU: usize = 1500;
/// IPv4 header (no options) + TCP header (no options)
const V4_OVERHEAD: usize = 20 + 20;
/// IPv6 fixed header + TCP header (no options)
const V6_OVERHEAD: usize = 40 + 20;

const TTL: u8 = 64;

/// TCP fields extracted from a captured segment
#[derive(Debug, Clone, Copy)]
pub struct TcpFields {
    /// Sequence number
    pub seq: u32,
    /// Acknowledgment number
    pub ack: u32,
    /// Advertised window
    pub window: u16,
    /// SYN flag
    pub syn: bool,
    /// RST flag
    pub rst: bool,
    /// FIN flag
    pub fin: bool,
}

#[derive(Debug, Clone, Copy)]
struct LocalTuple {
    ip: IpAddr,
    port: u16,
    router_mac: [u8; 6],
}

/// Composes wire frames for one fabric's local tuples
#[derive(Debug, Clone)]
pub struct FrameComposer {
    src_mac: [u8; 6],
    v4: Option<LocalTuple>,
    v6: Option<LocalTuple>,
}

impl FrameComposer {
    /// Build a composer from the network section and the interface's MAC.
    #[must_use]
    pub fn from_config(network: &NetworkConfig, src_mac: [u8; 6]) -> Self {
        let tuple = |t: &crate::config::NetTuple| LocalTuple {
            ip: t.addr.ip(),
            port: t.addr.port(),
            // Validation already proved the MAC parses.
            router_mac: crate::config::parse_mac(&t.router_mac).unwrap_or([0; 6]),
        };
        Self {
            src_mac,
            v4: network.ipv4.as_ref().map(tuple),
            v6: network.ipv6.as_ref().map(tuple),
        }
    }

    /// The local tuple used toward `dst`'s address family, if configured.
    #[must_use]
    pub fn local_for(&self, dst: SocketAddr) -> Option<SocketAddr> {
        let t = if dst.is_ipv4() { self.v4.as_ref() } else { self.v6.as_ref() };
        t.map(|t| SocketAddr::new(t.ip, t.port))
    }

    /// Largest datagram payload that still fits the link MTU after headers.
    #[must_use]
    pub fn max_payload(&self) -> usize {
        match (&self.v4, &self.v6) {
            (_, Some(_)) => LINK_MTU - V6_OVERHEAD,
            (Some(_), None) => LINK_MTU - V4_OVERHEAD,
            (None, None) => LINK_MTU - V6_OVERHEAD,
        }
    }

    /// Compose a full frame carrying `payload` toward `dst`.
    ///
    /// # Errors
    ///
    /// Fails when `dst`'s address family has no configured local tuple, when
    /// the payload exceeds the MTU budget, or when serialization fails.
    pub fn compose(
        &self,
        dst: SocketAddr,
        flags: &ShadowFlags,
        payload: &[u8],
    ) -> Result<Vec<u8>, FabricError> {
        match dst.ip() {
            IpAddr::V4(dst_ip) => {
                let local = self.v4.as_ref().ok_or(FabricError::FamilyUnavailable {
                    family: "IPv4",
                    dst,
                })?;
                let IpAddr::V4(src_ip) = local.ip else {
                    return Err(FabricError::FamilyUnavailable { family: "IPv4", dst });
                };
                if payload.len() > LINK_MTU - V4_OVERHEAD {
                    return Err(FabricError::craft(
                        dst,
                        format!("payload {} exceeds MTU budget", payload.len()),
                    ));
                }

                let builder = PacketBuilder::ethernet2(self.src_mac, local.router_mac)
                    .ipv4(src_ip.octets(), dst_ip.octets(), TTL);
                let tcp = apply_flags(
                    builder.tcp(local.port, dst.port(), flags.seq, flags.window),
                    flags,
                );

                let mut out = Vec::with_capacity(tcp.size(payload.len()));
                tcp.write(&mut out, payload)
                    .map_err(|e| FabricError::craft(dst, e.to_string()))?;
                Ok(out)
            }
            IpAddr::V6(dst_ip) => {
                let local = self.v6.as_ref().ok_or(FabricError::FamilyUnavailable {
                    family: "IPv6",
                    dst,
                })?;
                let IpAddr::V6(src_ip) = local.ip else {
                    return Err(FabricError::FamilyUnavailable { family: "IPv6", dst });
                };
                if payload.len() > LINK_MTU - V6_OVERHEAD {
                    return Err(FabricError::craft(
                        dst,
                        format!("payload {} exceeds MTU budget", payload.len()),
                    ));
                }

                let builder = PacketBuilder::ethernet2(self.src_mac, local.router_mac)
                    .ipv6(src_ip.octets(), dst_ip.octets(), TTL);
                let tcp = apply_flags(
                    builder.tcp(local.port, dst.port(), flags.seq, flags.window),
                    flags,
                );

                let mut out = Vec::with_capacity(tcp.size(payload.len()));
                tcp.write(&mut out, payload)
                    .map_err(|e| FabricError::craft(dst, e.to_string()))?;
                Ok(out)
            }
        }
    }
}

fn apply_flags(
    builder: etherparse::PacketBuilderStep<etherparse::TcpHeader>,
    flags: &ShadowFlags,
) -> etherparse::PacketBuilderStep<etherparse::TcpHeader> {
    let mut b = builder;
    if flags.flags & FLAG_PSH != 0 {
        b = b.psh();
    }
    if flags.flags & FLAG_ACK != 0 {
        b = b.ack(flags.ack);
    }
    b
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NetTuple, NetworkConfig, PcapConfig};
    use etherparse::{NetSlice, SlicedPacket, TransportSlice};

    fn composer() -> FrameComposer {
        let network = NetworkConfig {
            interface: "eth0".into(),
            ipv4: Some(NetTuple {
                addr: "192.0.2.10:38000".parse().unwrap(),
                router_mac: "aa:bb:cc:dd:ee:ff".into(),
            }),
            ipv6: None,
            pcap: PcapConfig::default(),
        };
        FrameComposer::from_config(&network, [2, 4, 6, 8, 10, 12])
    }

    #[test]
    fn test_compose_round_trips_through_parser() {
        let c = composer();
        let dst: SocketAddr = "203.0.113.1:443".parse().unwrap();
        let flags = ShadowFlags {
            seq: 1111,
            ack: 2222,
            window: 512,
            flags: FLAG_PSH | FLAG_ACK,
        };
        let frame = c.compose(dst, &flags, b"tunnel datagram").unwrap();

        let sliced = SlicedPacket::from_ethernet(&frame).unwrap();
        let Some(NetSlice::Ipv4(ip)) = sliced.net else {
            panic!("expected IPv4");
        };
        assert_eq!(ip.header().source_addr().to_string(), "192.0.2.10");
        assert_eq!(ip.header().destination_addr().to_string(), "203.0.113.1");

        let Some(TransportSlice::Tcp(tcp)) = sliced.transport else {
            panic!("expected TCP");
        };
        assert_eq!(tcp.source_port(), 38000);
        assert_eq!(tcp.destination_port(), 443);
        assert_eq!(tcp.sequence_number(), 1111);
        assert_eq!(tcp.acknowledgment_number(), 2222);
        assert_eq!(tcp.window_size(), 512);
        assert!(tcp.psh());
        assert!(tcp.ack());
        assert!(!tcp.syn());
        assert!(!tcp.rst());
        assert_eq!(tcp.payload(), b"tunnel datagram");
    }

    #[test]
    fn test_compose_rejects_unconfigured_family() {
        let c = composer();
        let dst: SocketAddr = "[2001:db8::1]:443".parse().unwrap();
        let err = c
            .compose(dst, &ShadowFlags::default(), b"x")
            .unwrap_err();
        assert!(matches!(err, FabricError::FamilyUnavailable { .. }));
    }

    #[test]
    fn test_compose_rejects_oversized_payload() {
        let c = composer();
        let dst: SocketAddr = "203.0.113.1:443".parse().unwrap();
        let payload = vec![0u8; LINK_MTU];
        let err = c.compose(dst, &ShadowFlags::default(), &payload).unwrap_err();
        assert!(matches!(err, FabricError::Craft { .. }));
    }

    #[test]
    fn test_max_payload_budget() {
        let c = composer();
        assert_eq!(c.max_payload(), 1460);
        let dst: SocketAddr = "203.0.113.1:443".parse().unwrap();
        let payload = vec![0u8; c.max_payload()];
        assert!(c.compose(dst, &ShadowFlags::default(), &payload).is_ok());
    }

    #[test]
    fn test_local_for() {
        let c = composer();
        let v4: SocketAddr = "203.0.113.1:443".parse().unwrap();
        assert_eq!(c.local_for(v4), Some("192.0.2.10:38000".parse().unwrap()));
        let v6: SocketAddr = "[2001:db8::1]:443".parse().unwrap();
        assert_eq!(c.local_for(v6), None);
    }
}
