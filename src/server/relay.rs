//! Per-stream relay handlers
//!
//! Once the header is read, a stream is one of three relays: a TCP byte
//! pipe to an upstream target, a length-framed UDP exchange, or a raw IP
//! pipe to the TUN seam. All three use pooled buffers and end when either
//! side finishes or the server shuts down.
//!
//! UDP framing: each datagram crosses the stream as a big-endian u16 length
//! followed by that many payload bytes, in both directions. A datagram
//! larger than 65535 bytes cannot be represented and is dropped before
//! framing.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::buffer::BufferPools;
use crate::error::ServerError;
use crate::io::copy_bidirectional_pooled;
use crate::pool::{dial_target, TargetPools};
use crate::transport::BoxStream;

/// A UDP relay socket with no traffic in either direction this long is torn
/// down.
const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(65);

/// Relay `stream` to a TCP `target`, through the connection pool when one
/// is configured.
///
/// # Errors
///
/// `TargetUnreachable` when the target cannot be dialed; relay-phase I/O
/// errors end the relay silently, as either side hanging up is normal.
pub async fn relay_tcp(
    mut stream: BoxStream,
    target: SocketAddr,
    pools: Option<&Arc<TargetPools>>,
    buffers: &BufferPools,
    cancel: &CancellationToken,
) -> Result<(), ServerError> {
    let mut upstream = match pools {
        Some(pools) => pools.get(target).await?,
        None => dial_target(target).await?,
    };

    let result = tokio::select! {
        () = cancel.cancelled() => {
            return Err(ServerError::ShuttingDown);
        }
        result = copy_bidirectional_pooled(&mut stream, &mut upstream, &buffers.tcp) => result,
    };

    match result {
        Ok(copied) => {
            trace!(
                %target,
                to_target = copied.a_to_b,
                from_target = copied.b_to_a,
                "TCP relay finished"
            );
            // Mirror of the pool contract: a cleanly finished socket goes
            // back for reuse; a stale one fails fast on its next checkout.
            if let Some(pools) = pools {
                pools.put(target, upstream);
            }
            Ok(())
        }
        Err(e) => {
            debug!(%target, error = %e, "TCP relay ended with error");
            Ok(())
        }
    }
}

/// Relay length-framed datagrams between `stream` and a UDP socket toward
/// `target`.
///
/// # Errors
///
/// `IoError` when the relay socket cannot be created or connected.
pub async fn relay_udp(
    stream: BoxStream,
    target: SocketAddr,
    buffers: &BufferPools,
    cancel: &CancellationToken,
) -> Result<(), ServerError> {
    let bind_addr: SocketAddr = if target.is_ipv4() {
        "0.0.0.0:0".parse().expect("constant address")
    } else {
        "[::]:0".parse().expect("constant address")
    };
    let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
    socket.connect(target).await?;

    let (mut reader, mut writer) = tokio::io::split(stream);

    // Stream -> socket: unfame and forward.
    let outbound_socket = Arc::clone(&socket);
    let outbound_buffers = buffers.clone();
    let mut outbound = tokio::spawn(async move {
        loop {
            let len = match reader.read_u16().await {
                Ok(len) => usize::from(len),
                Err(_) => return,
            };
            let mut buf = outbound_buffers.udp.get_n(len);
            if len > 0 && reader.read_exact(&mut buf[..len]).await.is_err() {
                return;
            }
            if outbound_socket.send(&buf[..len]).await.is_err() {
                return;
            }
        }
    });

    // Socket -> stream: frame and return, with the idle timeout.
    let inbound_socket = Arc::clone(&socket);
    let inbound_buffers = buffers.clone();
    let mut inbound = tokio::spawn(async move {
        loop {
            let mut buf = inbound_buffers.udp.get();
            let n = match tokio::time::timeout(UDP_IDLE_TIMEOUT, inbound_socket.recv(&mut buf))
                .await
            {
                Ok(Ok(n)) => n,
                Ok(Err(_)) | Err(_) => return,
            };
            if n > usize::from(u16::MAX) {
                trace!(len = n, "dropping unframeable datagram");
                continue;
            }
            if writer.write_u16(n as u16).await.is_err()
                || writer.write_all(&buf[..n]).await.is_err()
                || writer.flush().await.is_err()
            {
                return;
            }
        }
    });

    tokio::select! {
        () = cancel.cancelled() => {}
        _ = &mut outbound => {}
        _ = &mut inbound => {}
    }
    outbound.abort();
    inbound.abort();
    trace!(%target, "UDP relay finished");
    Ok(())
}

/// Relay raw IP packets between `stream` and the TUN seam, using the large
/// buffer pool.
///
/// # Errors
///
/// Propagates nothing: the relay ends when either side finishes.
pub async fn relay_tun<T>(
    mut stream: BoxStream,
    tun: &mut T,
    buffers: &BufferPools,
    cancel: &CancellationToken,
) -> Result<(), ServerError>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin,
{
    tokio::select! {
        () = cancel.cancelled() => Err(ServerError::ShuttingDown),
        result = copy_bidirectional_pooled(&mut stream, tun, &buffers.tun) => {
            if let Ok(copied) = result {
                trace!(
                    to_tun = copied.a_to_b,
                    from_tun = copied.b_to_a,
                    "TUN relay finished"
                );
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::transport::Stream;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{duplex, AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

    /// Wraps a duplex half so it satisfies the boxed-stream contract.
    struct TestStream(DuplexStream);

    impl Stream for TestStream {
        fn sid(&self) -> u64 {
            0
        }
    }

    impl AsyncRead for TestStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.0).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for TestStream {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Pin::new(&mut self.0).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.0).poll_flush(cx)
        }

        fn poll_shutdown(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.0).poll_shutdown(cx)
        }
    }

    fn buffers() -> BufferPools {
        let transport = TransportConfig {
            tcpbuf: 16 * 1024,
            udpbuf: 64 * 1024,
            tunbuf: 64 * 1024,
            ..TransportConfig::default()
        };
        BufferPools::new(&transport)
    }

    #[tokio::test]
    async fn test_tcp_relay_round_trip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 18];
            sock.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"GET / HTTP/1.0\r\n\r\n");
            sock.write_all(b"HTTP/1.0 200 OK\r\n\r\nhi").await.unwrap();
        });

        let (tunnel_side, mut client_side) = duplex(4096);
        let cancel = CancellationToken::new();
        let buffers = buffers();
        let relay = tokio::spawn(async move {
            relay_tcp(
                Box::new(TestStream(tunnel_side)),
                target,
                None,
                &buffers,
                &cancel,
            )
            .await
        });

        client_side.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
        client_side.shutdown().await.unwrap();

        let mut reply = Vec::new();
        client_side.read_to_end(&mut reply).await.unwrap();
        assert_eq!(&reply, b"HTTP/1.0 200 OK\r\n\r\nhi");
        relay.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_tcp_relay_unreachable_target() {
        let (tunnel_side, _client_side) = duplex(256);
        let cancel = CancellationToken::new();
        let err = relay_tcp(
            Box::new(TestStream(tunnel_side)),
            "127.0.0.1:1".parse().unwrap(),
            None,
            &buffers(),
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ServerError::TargetUnreachable { .. }));
    }

    #[tokio::test]
    async fn test_udp_relay_frames_both_ways() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            let (n, from) = upstream.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"query");
            upstream.send_to(b"answer!", from).await.unwrap();
        });

        let (tunnel_side, mut client_side) = duplex(4096);
        let cancel = CancellationToken::new();
        let buffers = buffers();
        let _relay = tokio::spawn(async move {
            relay_udp(Box::new(TestStream(tunnel_side)), target, &buffers, &cancel).await
        });

        client_side.write_u16(5).await.unwrap();
        client_side.write_all(b"query").await.unwrap();

        let len = client_side.read_u16().await.unwrap();
        assert_eq!(len, 7);
        let mut reply = vec![0u8; 7];
        client_side.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"answer!");
    }

    #[tokio::test]
    async fn test_tun_relay_moves_packets() {
        let (tunnel_side, mut client_side) = duplex(4096);
        let (mut tun_device, mut tun_far_end) = duplex(4096);
        let cancel = CancellationToken::new();
        let buffers = buffers();

        let relay = tokio::spawn(async move {
            relay_tun(
                Box::new(TestStream(tunnel_side)),
                &mut tun_device,
                &buffers,
                &cancel,
            )
            .await
        });

        client_side.write_all(b"raw ip packet").await.unwrap();
        let mut buf = vec![0u8; 13];
        tun_far_end.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"raw ip packet");

        tun_far_end.write_all(b"return packet").await.unwrap();
        let mut buf = vec![0u8; 13];
        client_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"return packet");

        drop(client_side);
        drop(tun_far_end);
        relay.await.unwrap().unwrap();
    }
}
