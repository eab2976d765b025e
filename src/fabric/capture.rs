//! pcap capture and injection
//!
//! One fabric owns two handles on the configured interface: a promiscuous
//! capture handle with a pre-computed BPF filter matching our local tuple,
//! and an injection handle for crafted frames. A dedicated OS thread blocks
//! on the capture handle (5 second read timeout so shutdown is cooperative)
//! and feeds parsed segments into an async channel for the endpoint's
//! dispatcher.
//!
//! Malformed frames are logged and skipped; capture timeouts are non-fatal;
//! a closed fabric terminates the reader thread within one timeout.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use etherparse::{NetSlice, SlicedPacket, TransportSlice};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::config::NetworkConfig;
use crate::error::FabricError;
use crate::fabric::craft::TcpFields;
use crate::fabric::sender::SegmentSink;

/// Capture read timeout; bounds how long shutdown can lag
const READ_TIMEOUT_MS: i32 = 5000;

/// Capacity of the captured-segment channel toward the dispatcher
const SEGMENT_CHANNEL_CAPACITY: usize = 4096;

/// One captured TCP segment, parsed down to its tunnel payload
#[derive(Debug, Clone)]
pub struct CapturedSegment {
    /// Remote tuple the segment came from
    pub src: SocketAddr,
    /// Local tuple it was addressed to
    pub dst: SocketAddr,
    /// TCP header fields, for shadow-state updates and plausibility checks
    pub fields: TcpFields,
    /// The raw tunnel datagram
    pub payload: Vec<u8>,
}

/// The pcap-backed capture/injection fabric
pub struct PacketFabric {
    interface: String,
    injector: Mutex<pcap::Capture<pcap::Active>>,
    closed: AtomicBool,
    recv_dropped: Arc<AtomicU64>,
}

impl PacketFabric {
    /// Open capture and injection handles on the configured interface and
    /// start the reader thread.
    ///
    /// Returns the fabric plus the channel of captured segments.
    ///
    /// # Errors
    ///
    /// `InterfaceMissing` when the interface does not exist,
    /// `PermissionDenied` without CAP_NET_RAW, `Pcap` for other libpcap
    /// failures.
    pub fn open(
        network: &NetworkConfig,
    ) -> Result<(Arc<Self>, mpsc::Receiver<CapturedSegment>), FabricError> {
        let name = network.interface.clone();

        let devices = pcap::Device::list()
            .map_err(|e| FabricError::pcap(&name, e.to_string()))?;
        let device = devices
            .into_iter()
            .find(|d| d.name == name)
            .ok_or_else(|| FabricError::InterfaceMissing { name: name.clone() })?;

        let bpf = bpf_filter(network);
        debug!(interface = %name, filter = %bpf, "opening capture handle");

        let mut capture = pcap::Capture::from_device(device.clone())
            .map_err(|e| map_open_error(&name, &e))?
            .promisc(true)
            .snaplen(65535)
            .buffer_size(network.pcap.sockbuf as i32)
            .timeout(READ_TIMEOUT_MS)
            .immediate_mode(true)
            .open()
            .map_err(|e| map_open_error(&name, &e))?;
        capture
            .filter(&bpf, true)
            .map_err(|e| FabricError::pcap(&name, format!("BPF filter rejected: {e}")))?;

        let injector = pcap::Capture::from_device(device)
            .map_err(|e| map_open_error(&name, &e))?
            .timeout(READ_TIMEOUT_MS)
            .open()
            .map_err(|e| map_open_error(&name, &e))?;

        let fabric = Arc::new(Self {
            interface: name.clone(),
            injector: Mutex::new(injector),
            closed: AtomicBool::new(false),
            recv_dropped: Arc::new(AtomicU64::new(0)),
        });

        let (tx, rx) = mpsc::channel(SEGMENT_CHANNEL_CAPACITY);
        fabric.spawn_reader(capture, tx);

        info!(interface = %name, "packet fabric open");
        Ok((fabric, rx))
    }

    /// The interface this fabric is bound to
    #[must_use]
    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// MAC address of the interface, from sysfs. Zeroes when unavailable
    /// (non-Linux or virtual devices), which only matters to on-path
    /// cosmetics, not delivery through the first-hop router.
    #[must_use]
    pub fn interface_mac(&self) -> [u8; 6] {
        interface_mac(&self.interface).unwrap_or([0; 6])
    }

    /// Inject one serialized frame.
    ///
    /// # Errors
    ///
    /// `Closed` after `close()`, `Io` when libpcap rejects the frame.
    pub fn send_raw(&self, frame: &[u8]) -> Result<(), FabricError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FabricError::Closed);
        }
        self.injector
            .lock()
            .sendpacket(frame)
            .map_err(|e| FabricError::IoError(std::io::Error::other(e.to_string())))
    }

    /// Segments the reader thread had to discard because the dispatcher
    /// channel was full.
    #[must_use]
    pub fn recv_dropped(&self) -> u64 {
        self.recv_dropped.load(Ordering::Relaxed)
    }

    /// Stop the reader thread and refuse further sends. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!(interface = %self.interface, "packet fabric closed");
        }
    }

    /// Whether `close()` has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn spawn_reader(
        self: &Arc<Self>,
        mut capture: pcap::Capture<pcap::Active>,
        tx: mpsc::Sender<CapturedSegment>,
    ) {
        let fabric = Arc::clone(self);
        std::thread::Builder::new()
            .name(format!("pcap-rx-{}", self.interface))
            .spawn(move || loop {
                if fabric.closed.load(Ordering::Acquire) {
                    return;
                }
                match capture.next_packet() {
                    Ok(packet) => match parse_segment(packet.data) {
                        Ok(segment) => {
                            trace!(
                                src = %segment.src,
                                len = segment.payload.len(),
                                "captured segment"
                            );
                            if tx.try_send(segment).is_err() {
                                fabric.recv_dropped.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        Err(e) => {
                            trace!(error = %e, "skipping unparseable frame");
                        }
                    },
                    Err(pcap::Error::TimeoutExpired) => {
                        // Non-fatal; loop around and re-check the close flag.
                    }
                    Err(e) => {
                        if !fabric.closed.load(Ordering::Acquire) {
                            warn!(interface = %fabric.interface, error = %e, "capture read failed");
                        }
                        return;
                    }
                }
            })
            .expect("spawning the pcap reader thread cannot fail");
    }
}

impl Drop for PacketFabric {
    fn drop(&mut self) {
        self.close();
    }
}

impl SegmentSink for PacketFabric {
    fn send_segment(&self, frame: &[u8]) -> Result<(), FabricError> {
        self.send_raw(frame)
    }
}

impl std::fmt::Debug for PacketFabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketFabric")
            .field("interface", &self.interface)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// BPF program matching traffic addressed to our local tuple(s)
fn bpf_filter(network: &NetworkConfig) -> String {
    let mut clauses = Vec::new();
    if let Some(t) = &network.ipv4 {
        clauses.push(format!(
            "(tcp and dst host {} and dst port {})",
            t.addr.ip(),
            t.addr.port()
        ));
    }
    if let Some(t) = &network.ipv6 {
        clauses.push(format!(
            "(tcp and dst host {} and dst port {})",
            t.addr.ip(),
            t.addr.port()
        ));
    }
    clauses.join(" or ")
}

/// Parse a captured Ethernet frame down to (src, dst, tcp fields, payload).
///
/// # Errors
///
/// `Malformed` when any layer is missing or not TCP. Checksums were already
/// verified by the capture library's slicing.
pub fn parse_segment(data: &[u8]) -> Result<CapturedSegment, FabricError> {
    let sliced = SlicedPacket::from_ethernet(data)
        .map_err(|e| FabricError::malformed(e.to_string()))?;

    let (src_ip, dst_ip) = match &sliced.net {
        Some(NetSlice::Ipv4(v4)) => (
            std::net::IpAddr::V4(v4.header().source_addr()),
            std::net::IpAddr::V4(v4.header().destination_addr()),
        ),
        Some(NetSlice::Ipv6(v6)) => (
            std::net::IpAddr::V6(v6.header().source_addr()),
            std::net::IpAddr::V6(v6.header().destination_addr()),
        ),
        _ => return Err(FabricError::malformed("no IP layer")),
    };

    let Some(TransportSlice::Tcp(tcp)) = &sliced.transport else {
        return Err(FabricError::malformed("no TCP layer"));
    };

    Ok(CapturedSegment {
        src: SocketAddr::new(src_ip, tcp.source_port()),
        dst: SocketAddr::new(dst_ip, tcp.destination_port()),
        fields: TcpFields {
            seq: tcp.sequence_number(),
            ack: tcp.acknowledgment_number(),
            window: tcp.window_size(),
            syn: tcp.syn(),
            rst: tcp.rst(),
            fin: tcp.fin(),
        },
        payload: tcp.payload().to_vec(),
    })
}

fn map_open_error(name: &str, e: &pcap::Error) -> FabricError {
    let msg = e.to_string();
    if msg.to_lowercase().contains("permission") {
        FabricError::PermissionDenied { name: name.to_string() }
    } else {
        FabricError::pcap(name, msg)
    }
}

/// Read the interface MAC from sysfs (Linux)
fn interface_mac(name: &str) -> Option<[u8; 6]> {
    let path = format!("/sys/class/net/{name}/address");
    let text = std::fs::read_to_string(path).ok()?;
    crate::config::parse_mac(text.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NetTuple, PcapConfig};
    use crate::fabric::craft::FrameComposer;
    use crate::fabric::shadow::{ShadowFlags, FLAG_ACK, FLAG_PSH};

    fn network() -> NetworkConfig {
        NetworkConfig {
            interface: "eth0".into(),
            ipv4: Some(NetTuple {
                addr: "192.0.2.10:38000".parse().unwrap(),
                router_mac: "aa:bb:cc:dd:ee:ff".into(),
            }),
            ipv6: Some(NetTuple {
                addr: "[2001:db8::a]:38000".parse().unwrap(),
                router_mac: "aa:bb:cc:dd:ee:ff".into(),
            }),
            pcap: PcapConfig::default(),
        }
    }

    #[test]
    fn test_bpf_filter_both_families() {
        let filter = bpf_filter(&network());
        assert!(filter.contains("dst host 192.0.2.10"));
        assert!(filter.contains("dst host 2001:db8::a"));
        assert!(filter.contains("dst port 38000"));
        assert!(filter.contains(" or "));
    }

    #[test]
    fn test_bpf_filter_single_family() {
        let mut net = network();
        net.ipv6 = None;
        let filter = bpf_filter(&net);
        assert_eq!(filter, "(tcp and dst host 192.0.2.10 and dst port 38000)");
    }

    #[test]
    fn test_parse_segment_round_trip() {
        let composer = FrameComposer::from_config(&network(), [1, 2, 3, 4, 5, 6]);
        let dst: SocketAddr = "203.0.113.1:443".parse().unwrap();
        let flags = ShadowFlags {
            seq: 42,
            ack: 43,
            window: 1000,
            flags: FLAG_PSH | FLAG_ACK,
        };
        let frame = composer.compose(dst, &flags, b"payload bytes").unwrap();

        let segment = parse_segment(&frame).unwrap();
        assert_eq!(segment.src, "192.0.2.10:38000".parse().unwrap());
        assert_eq!(segment.dst, dst);
        assert_eq!(segment.fields.seq, 42);
        assert_eq!(segment.fields.ack, 43);
        assert_eq!(segment.fields.window, 1000);
        assert!(!segment.fields.syn);
        assert!(!segment.fields.rst);
        assert_eq!(segment.payload, b"payload bytes");
    }

    #[test]
    fn test_parse_segment_rejects_garbage() {
        assert!(parse_segment(&[0u8; 10]).is_err());
        // Valid Ethernet header but truncated IP payload.
        let mut frame = vec![0u8; 14];
        frame[12] = 0x08; // EtherType IPv4
        frame[13] = 0x00;
        assert!(parse_segment(&frame).is_err());
    }
}
