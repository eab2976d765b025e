//! The raw packet fabric
//!
//! Everything below the transport layer lives here: crafting TCP segments
//! that carry tunnel datagrams ([`craft`]), the pcap capture/injection
//! handles ([`capture`]), the per-remote TCP shadow state that makes crafted
//! segments look like a live connection ([`shadow`]), the parallel send
//! pipeline with drop-on-saturation backpressure ([`sender`]), and the
//! datagram endpoint the transports program against ([`endpoint`]).
//!
//! The kernel never owns the 4-tuple: segments go out through pcap
//! injection and come back through a BPF-filtered capture handle, so the
//! host's socket stack sees none of it (the iptables module keeps the
//! kernel's RSTs out of the way).

pub mod capture;
pub mod craft;
pub mod endpoint;
pub mod sender;
pub mod shadow;

pub use capture::{parse_segment, CapturedSegment, PacketFabric};
pub use craft::{FrameComposer, TcpFields};
pub use endpoint::{
    recv_from, Datagram, DatagramSocket, EndpointStats, FlowTable, MemoryEndpoint, PacketEndpoint,
};
pub use sender::{PipelineStats, SegmentSink, SendPipeline};
pub use shadow::{FlagEntry, ShadowFlags, ShadowTable, FLAG_ACK, FLAG_PSH};
