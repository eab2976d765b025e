//! Error types for ghostwire
//!
//! Errors are categorized by subsystem, following the same shape everywhere:
//! a `thiserror` enum with helper constructors and an `is_recoverable()`
//! classification that separates "retry makes sense" from "give up".

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Top-level error type for ghostwire
#[derive(Debug, Error)]
pub enum GhostwireError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Raw packet fabric errors (pcap, frame crafting, dispatch)
    #[error("Fabric error: {0}")]
    Fabric(#[from] FabricError),

    /// Transport adapter errors (KCP/QUIC dial, streams, listen)
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Client supervisor errors
    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    /// Server accept/dispatch errors
    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    /// iptables rule management errors
    #[error("iptables error: {0}")]
    Iptables(#[from] IptablesError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl GhostwireError {
    /// Check if this error is recoverable (can retry the operation)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Fabric(e) => e.is_recoverable(),
            Self::Transport(e) => e.is_recoverable(),
            Self::Client(e) => e.is_recoverable(),
            Self::Server(e) => e.is_recoverable(),
            Self::Iptables(_) => false,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// YAML parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error; carries every violation found, not just the first
    #[error("Configuration validation failed:\n{}", .0.join("\n"))]
    ValidationError(Vec<String>),

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Raw packet fabric errors (capture, injection, crafting, dispatch)
#[derive(Debug, Error)]
pub enum FabricError {
    /// The configured capture interface does not exist
    #[error("Network interface not found: {name}")]
    InterfaceMissing { name: String },

    /// Opening the capture handle failed due to missing privileges
    #[error("Permission denied opening {name}: packet capture requires CAP_NET_RAW")]
    PermissionDenied { name: String },

    /// Any other libpcap-level failure
    #[error("pcap error on {name}: {reason}")]
    Pcap { name: String, reason: String },

    /// No packet arrived within the capture read timeout
    #[error("Capture read timed out")]
    Timeout,

    /// The fabric has been closed
    #[error("Packet fabric is closed")]
    Closed,

    /// A captured frame could not be parsed down to a TCP payload
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// Outbound frame crafting failed
    #[error("Failed to craft segment for {dst}: {reason}")]
    Craft { dst: SocketAddr, reason: String },

    /// Address family of the destination has no configured local tuple
    #[error("No local {family} address configured for destination {dst}")]
    FamilyUnavailable { family: &'static str, dst: SocketAddr },

    /// I/O error on the injection path
    #[error("Fabric I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl FabricError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::InterfaceMissing { .. } | Self::PermissionDenied { .. } => false,
            Self::Pcap { .. } => false,
            Self::Timeout | Self::Malformed(_) => true,
            Self::Closed => false,
            Self::Craft { .. } | Self::FamilyUnavailable { .. } => false,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
        }
    }

    /// Create a pcap error
    pub fn pcap(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Pcap {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a malformed-frame error
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed(reason.into())
    }

    /// Create a crafting error
    pub fn craft(dst: SocketAddr, reason: impl Into<String>) -> Self {
        Self::Craft {
            dst,
            reason: reason.into(),
        }
    }
}

/// Transport adapter errors (uniform over KCP and QUIC)
#[derive(Debug, Error)]
pub enum TransportError {
    /// Dialing the remote failed
    #[error("Failed to connect to {addr}: {reason}")]
    ConnectFailed { addr: SocketAddr, reason: String },

    /// An operation exceeded its deadline
    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: &'static str, seconds: u64 },

    /// Opening a multiplexed stream failed
    #[error("Failed to open stream: {0}")]
    StreamOpen(String),

    /// Accepting a stream or connection failed
    #[error("Accept failed: {0}")]
    Accept(String),

    /// The connection is gone; the supervisor should reconnect
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// TLS or transport-parameter configuration failed
    #[error("Transport configuration error: {0}")]
    Config(String),

    /// The operation was cancelled by shutdown
    #[error("Operation cancelled")]
    Cancelled,

    /// The peer violated the stream protocol
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// I/O error from the underlying datagram endpoint
    #[error("Transport I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl TransportError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::ConnectFailed { .. }
            | Self::Timeout { .. }
            | Self::StreamOpen(_)
            | Self::Accept(_)
            | Self::ConnectionLost(_) => true,
            Self::Config(_) | Self::Cancelled | Self::Protocol(_) => false,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }

    /// Create a connect-failed error
    pub fn connect_failed(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::ConnectFailed {
            addr,
            reason: reason.into(),
        }
    }

    /// Create a timeout error
    #[must_use]
    pub const fn timeout(operation: &'static str, seconds: u64) -> Self {
        Self::Timeout { operation, seconds }
    }

    /// Create a connection-lost error
    pub fn lost(reason: impl Into<String>) -> Self {
        Self::ConnectionLost(reason.into())
    }

    /// Create a protocol-violation error
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol(reason.into())
    }
}

/// Client supervisor errors
#[derive(Debug, Error)]
pub enum ClientError {
    /// Stream creation failed after exhausting every retry attempt
    #[error("Failed to open stream after {attempts} attempts")]
    RetriesExhausted { attempts: usize },

    /// No connection slots are configured
    #[error("No transport connections available")]
    NoConnections,

    /// Creating a transport connection for a slot failed
    #[error("Failed to create connection: {0}")]
    ConnectionSetup(#[from] TransportError),

    /// The client is shutting down
    #[error("Client is shutting down")]
    ShuttingDown,
}

impl ClientError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::RetriesExhausted { .. } => false,
            Self::NoConnections => false,
            Self::ConnectionSetup(e) => e.is_recoverable(),
            Self::ShuttingDown => false,
        }
    }
}

/// Server accept/dispatch errors
#[derive(Debug, Error)]
pub enum ServerError {
    /// Listener setup failed
    #[error("Failed to start listener: {0}")]
    Listen(#[from] TransportError),

    /// Dialing the upstream target failed
    #[error("Failed to reach target {addr}: {reason}")]
    TargetUnreachable { addr: SocketAddr, reason: String },

    /// A stream carried an unknown or out-of-place header
    #[error("Protocol violation on stream: {0}")]
    Protocol(String),

    /// TUN relay requested while TUN support is disabled
    #[error("TUN relay requested but TUN is not enabled")]
    TunDisabled,

    /// The server is shutting down
    #[error("Server is shutting down")]
    ShuttingDown,

    /// I/O error while relaying
    #[error("Relay I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl ServerError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Listen(e) => e.is_recoverable(),
            Self::TargetUnreachable { .. } => true,
            Self::Protocol(_) => true,
            Self::TunDisabled => false,
            Self::ShuttingDown => false,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }

    /// Create a target-unreachable error
    pub fn target_unreachable(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::TargetUnreachable {
            addr,
            reason: reason.into(),
        }
    }

    /// Create a protocol-violation error
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol(reason.into())
    }
}

/// iptables rule management errors
#[derive(Debug, Error)]
pub enum IptablesError {
    /// Automatic rule management only works on Linux
    #[error("auto_iptables is only supported on Linux (current OS: {os})")]
    UnsupportedPlatform { os: &'static str },

    /// The port is outside the valid range
    #[error("Invalid port {port}: must be between 1 and 65535")]
    InvalidPort { port: u32 },

    /// A rule failed to apply; already-applied rules remain tracked for rollback
    #[error("Failed to add {binary} rule (table={table} chain={chain}): {reason}")]
    RuleFailed {
        binary: &'static str,
        table: &'static str,
        chain: &'static str,
        reason: String,
    },

    /// The iptables/ip6tables binary could not be executed
    #[error("Failed to run {binary}: {reason}")]
    ExecFailed { binary: &'static str, reason: String },
}

/// Type alias for Result with `GhostwireError`
pub type Result<T> = std::result::Result<T, GhostwireError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_recovery_classification() {
        let config_err = ConfigError::ValidationError(vec!["bad".into()]);
        assert!(!config_err.is_recoverable());

        assert!(FabricError::Timeout.is_recoverable());
        assert!(FabricError::malformed("truncated").is_recoverable());
        assert!(!FabricError::PermissionDenied { name: "eth0".into() }.is_recoverable());
        assert!(!FabricError::Closed.is_recoverable());

        let addr: SocketAddr = "203.0.113.9:443".parse().unwrap();
        assert!(TransportError::connect_failed(addr, "refused").is_recoverable());
        assert!(TransportError::timeout("dial", 30).is_recoverable());
        assert!(!TransportError::Cancelled.is_recoverable());
        assert!(!TransportError::protocol("bad header").is_recoverable());

        assert!(!ClientError::RetriesExhausted { attempts: 6 }.is_recoverable());
        assert!(ServerError::target_unreachable(addr, "refused").is_recoverable());
        assert!(!ServerError::TunDisabled.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = FabricError::InterfaceMissing { name: "wan0".into() };
        assert!(err.to_string().contains("wan0"));

        let err = TransportError::timeout("stream open", 30);
        let msg = err.to_string();
        assert!(msg.contains("stream open"));
        assert!(msg.contains("30"));

        let err = ConfigError::ValidationError(vec!["a".into(), "b".into()]);
        let msg = err.to_string();
        assert!(msg.contains('a'));
        assert!(msg.contains('b'));
    }

    #[test]
    fn test_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::TimedOut, "timeout");
        let err: GhostwireError = io_err.into();
        assert!(err.is_recoverable());

        let config_err = ConfigError::ParseError("bad yaml".into());
        let err: GhostwireError = config_err.into();
        assert!(!err.is_recoverable());
    }
}
