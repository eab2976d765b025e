//! Stream header protocol
//!
//! Every multiplexed stream opens with exactly one self-describing message:
//! a one-byte type, followed for payload-bearing types by a little-endian
//! u32 length and a bincode-serialized body. After the header the stream is
//! opaque relay bytes.
//!
//! | Type | Byte | Body |
//! |------|------|------|
//! | PING | 0x01 | none |
//! | PONG | 0x02 | none |
//! | TCPF | 0x03 | `Vec<FlagEntry>` — peer-published shadow flags |
//! | TCP  | 0x04 | `SocketAddr` — relay target |
//! | UDP  | 0x05 | `SocketAddr` — datagram relay target |
//! | TUN  | 0x06 | none |
//!
//! Both ends must agree byte-for-byte; the encoding is pinned by the bincode
//! default configuration (little-endian, varint-free).

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::TransportError;
use crate::fabric::shadow::FlagEntry;

/// PING type byte
pub const TYPE_PING: u8 = 0x01;
/// PONG type byte
pub const TYPE_PONG: u8 = 0x02;
/// TCPF type byte
pub const TYPE_TCPF: u8 = 0x03;
/// TCP relay type byte
pub const TYPE_TCP: u8 = 0x04;
/// UDP relay type byte
pub const TYPE_UDP: u8 = 0x05;
/// TUN relay type byte
pub const TYPE_TUN: u8 = 0x06;

/// Upper bound on an encoded header body; anything larger is a violation
const MAX_BODY_LEN: u32 = 64 * 1024;

/// The first message on every stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    /// Liveness probe; the receiver answers [`Frame::Pong`] on the same stream
    Ping,
    /// Probe reply
    Pong,
    /// Peer-published shadow flags, installed into the receiver's table
    Flags(Vec<FlagEntry>),
    /// The rest of the stream is a TCP relay to this target
    Tcp(SocketAddr),
    /// The rest of the stream is length-framed UDP datagrams to this target
    Udp(SocketAddr),
    /// The rest of the stream is raw IP packets for the server TUN device
    Tun,
}

impl Frame {
    /// The wire type byte
    #[must_use]
    pub const fn type_byte(&self) -> u8 {
        match self {
            Self::Ping => TYPE_PING,
            Self::Pong => TYPE_PONG,
            Self::Flags(_) => TYPE_TCPF,
            Self::Tcp(_) => TYPE_TCP,
            Self::Udp(_) => TYPE_UDP,
            Self::Tun => TYPE_TUN,
        }
    }

    /// Serialize to wire bytes.
    ///
    /// # Errors
    ///
    /// Fails only if bincode cannot serialize the body, which would be a
    /// programming error in practice.
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        let mut out = vec![self.type_byte()];
        let body = match self {
            Self::Ping | Self::Pong | Self::Tun => None,
            Self::Flags(entries) => Some(
                bincode::serialize(entries)
                    .map_err(|e| TransportError::protocol(e.to_string()))?,
            ),
            Self::Tcp(addr) | Self::Udp(addr) => Some(
                bincode::serialize(addr).map_err(|e| TransportError::protocol(e.to_string()))?,
            ),
        };
        if let Some(body) = body {
            let len = u32::try_from(body.len())
                .map_err(|_| TransportError::protocol("header body too large"))?;
            out.extend_from_slice(&len.to_le_bytes());
            out.extend_from_slice(&body);
        }
        Ok(out)
    }

    /// Write the frame to a stream.
    ///
    /// # Errors
    ///
    /// Propagates serialization and I/O failures.
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<(), TransportError>
    where
        W: AsyncWrite + Unpin,
    {
        let bytes = self.encode()?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read one frame from a stream.
    ///
    /// # Errors
    ///
    /// `Protocol` on unknown type bytes or oversized/undecodable bodies,
    /// `Io` on stream failures (EOF included).
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, TransportError>
    where
        R: AsyncRead + Unpin,
    {
        let ty = reader.read_u8().await?;
        match ty {
            TYPE_PING => Ok(Self::Ping),
            TYPE_PONG => Ok(Self::Pong),
            TYPE_TUN => Ok(Self::Tun),
            TYPE_TCPF => {
                let body = read_body(reader).await?;
                let entries: Vec<FlagEntry> = bincode::deserialize(&body)
                    .map_err(|e| TransportError::protocol(format!("bad TCPF body: {e}")))?;
                Ok(Self::Flags(entries))
            }
            TYPE_TCP => {
                let body = read_body(reader).await?;
                let addr: SocketAddr = bincode::deserialize(&body)
                    .map_err(|e| TransportError::protocol(format!("bad TCP target: {e}")))?;
                Ok(Self::Tcp(addr))
            }
            TYPE_UDP => {
                let body = read_body(reader).await?;
                let addr: SocketAddr = bincode::deserialize(&body)
                    .map_err(|e| TransportError::protocol(format!("bad UDP target: {e}")))?;
                Ok(Self::Udp(addr))
            }
            other => Err(TransportError::protocol(format!(
                "unknown stream type byte 0x{other:02x}"
            ))),
        }
    }
}

async fn read_body<R>(reader: &mut R) -> Result<Vec<u8>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32_le().await?;
    if len > MAX_BODY_LEN {
        return Err(TransportError::protocol(format!(
            "header body of {len} bytes exceeds limit"
        )));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::shadow::{ShadowFlags, FLAG_ACK, FLAG_PSH};
    use tokio::io::duplex;

    async fn round_trip(frame: Frame) -> Frame {
        let (mut a, mut b) = duplex(4096);
        frame.write_to(&mut a).await.unwrap();
        Frame::read_from(&mut b).await.unwrap()
    }

    #[tokio::test]
    async fn test_bodyless_frames() {
        assert_eq!(round_trip(Frame::Ping).await, Frame::Ping);
        assert_eq!(round_trip(Frame::Pong).await, Frame::Pong);
        assert_eq!(round_trip(Frame::Tun).await, Frame::Tun);
    }

    #[tokio::test]
    async fn test_tcp_frame_carries_target() {
        let addr: SocketAddr = "203.0.113.9:80".parse().unwrap();
        assert_eq!(round_trip(Frame::Tcp(addr)).await, Frame::Tcp(addr));

        let v6: SocketAddr = "[2001:db8::9]:8080".parse().unwrap();
        assert_eq!(round_trip(Frame::Udp(v6)).await, Frame::Udp(v6));
    }

    #[tokio::test]
    async fn test_flags_frame() {
        let entries = vec![FlagEntry {
            addr: "192.0.2.10:38000".parse().unwrap(),
            flags: ShadowFlags {
                seq: 123,
                ack: 456,
                window: 789,
                flags: FLAG_PSH | FLAG_ACK,
            },
        }];
        let Frame::Flags(decoded) = round_trip(Frame::Flags(entries.clone())).await else {
            panic!("expected Flags frame");
        };
        assert_eq!(decoded, entries);
    }

    #[tokio::test]
    async fn test_unknown_type_byte_is_violation() {
        let (mut a, mut b) = duplex(64);
        use tokio::io::AsyncWriteExt;
        a.write_all(&[0x7f]).await.unwrap();
        let err = Frame::read_from(&mut b).await.unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_oversized_body_is_violation() {
        let (mut a, mut b) = duplex(64);
        use tokio::io::AsyncWriteExt;
        a.write_all(&[TYPE_TCP]).await.unwrap();
        a.write_all(&(MAX_BODY_LEN + 1).to_le_bytes()).await.unwrap();
        let err = Frame::read_from(&mut b).await.unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_eof_surfaces_as_io() {
        let (a, mut b) = duplex(64);
        drop(a);
        let err = Frame::read_from(&mut b).await.unwrap_err();
        assert!(matches!(err, TransportError::IoError(_)));
    }

    #[test]
    fn test_wire_layout_is_stable() {
        // The type byte must sit first and bodyless frames must be exactly
        // one byte; peers decode this without negotiation.
        assert_eq!(Frame::Ping.encode().unwrap(), vec![0x01]);
        assert_eq!(Frame::Pong.encode().unwrap(), vec![0x02]);
        assert_eq!(Frame::Tun.encode().unwrap(), vec![0x06]);

        let addr: SocketAddr = "203.0.113.9:80".parse().unwrap();
        let bytes = Frame::Tcp(addr).encode().unwrap();
        assert_eq!(bytes[0], 0x04);
        let len = u32::from_le_bytes(bytes[1..5].try_into().unwrap());
        assert_eq!(bytes.len(), 5 + len as usize);
    }
}
