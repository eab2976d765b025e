//! Stream multiplexer for the KCP transport
//!
//! KCP hands us one reliable ordered byte stream per connection; this module
//! carves it into independent bidirectional streams with a small framed
//! protocol:
//!
//! ```text
//! +-----+-----+----------+----------+=========+
//! | ver | cmd | len (BE) | sid (BE) | payload |
//! |  1  |  1  |    2     |    4     |  0..len |
//! +-----+-----+----------+----------+=========+
//! ```
//!
//! Commands: SYN opens a stream, PSH carries data, FIN half-closes, NOP is a
//! keepalive. The dialing side allocates odd stream ids, the accepting side
//! even ids, so the two ends never collide without negotiation.
//!
//! One reader task routes inbound frames to per-stream buffers (applying
//! backpressure to the whole session when a consumer lags, which KCP's
//! receive window then propagates to the peer); one writer task serializes
//! all outbound frames so writes from many streams interleave at frame
//! granularity.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, PollSender};
use tracing::{debug, trace};

use crate::error::TransportError;

const MUX_VERSION: u8 = 1;

const CMD_SYN: u8 = 0x00;
const CMD_FIN: u8 = 0x01;
const CMD_PSH: u8 = 0x02;
const CMD_NOP: u8 = 0x03;

/// Fixed header size
const HEADER_LEN: usize = 8;

/// Largest PSH payload per frame
const MAX_FRAME_PAYLOAD: usize = 16 * 1024;

/// Per-stream buffered frames before the reader stalls the session
const STREAM_BUFFER_FRAMES: usize = 64;

/// Keepalive cadence
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
struct WireFrame {
    cmd: u8,
    sid: u32,
    payload: Bytes,
}

impl WireFrame {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.push(MUX_VERSION);
        out.push(self.cmd);
        out.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.sid.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }
}

struct StreamEntry {
    data_tx: mpsc::Sender<Bytes>,
}

struct MuxShared {
    streams: Mutex<HashMap<u32, StreamEntry>>,
    frame_tx: mpsc::Sender<WireFrame>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl MuxShared {
    fn mark_closed(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.cancel.cancel();
            self.streams.lock().clear();
        }
    }
}

/// A multiplexed session over one reliable byte stream
pub struct Mux {
    shared: Arc<MuxShared>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<MuxStream>>,
    next_sid: AtomicU32,
}

impl Mux {
    /// Split `transport` into a multiplexed session.
    ///
    /// `dialer` decides stream-id parity; the session lives until the
    /// transport errors, EOF is seen, or `parent` is cancelled.
    pub fn new<T>(transport: T, dialer: bool, parent: &CancellationToken) -> Arc<Self>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let cancel = parent.child_token();
        let (frame_tx, frame_rx) = mpsc::channel::<WireFrame>(256);
        let (accept_tx, accept_rx) = mpsc::channel::<MuxStream>(64);

        let shared = Arc::new(MuxShared {
            streams: Mutex::new(HashMap::new()),
            frame_tx,
            closed: AtomicBool::new(false),
            cancel: cancel.clone(),
        });

        let (read_half, write_half) = tokio::io::split(transport);
        tokio::spawn(Self::read_loop(Arc::clone(&shared), read_half, accept_tx));
        tokio::spawn(Self::write_loop(Arc::clone(&shared), write_half, frame_rx));
        tokio::spawn(Self::keepalive_loop(Arc::clone(&shared)));

        Arc::new(Self {
            shared,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            next_sid: AtomicU32::new(if dialer { 1 } else { 2 }),
        })
    }

    /// Open a new stream toward the peer.
    ///
    /// # Errors
    ///
    /// `ConnectionLost` when the session is closed.
    pub async fn open_stream(&self) -> Result<MuxStream, TransportError> {
        if self.is_closed() {
            return Err(TransportError::lost("mux session closed"));
        }
        let sid = self.next_sid.fetch_add(2, Ordering::Relaxed);
        let stream = self.register(sid);
        self.shared
            .frame_tx
            .send(WireFrame {
                cmd: CMD_SYN,
                sid,
                payload: Bytes::new(),
            })
            .await
            .map_err(|_| TransportError::lost("mux writer gone"))?;
        trace!(sid, "mux stream opened");
        Ok(stream)
    }

    /// Accept the next peer-opened stream.
    ///
    /// # Errors
    ///
    /// `ConnectionLost` when the session is closed.
    pub async fn accept_stream(&self) -> Result<MuxStream, TransportError> {
        let mut rx = self.accept_rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| TransportError::lost("mux session closed"))
    }

    /// Whether the session is closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Tear down the session and every stream on it. Idempotent.
    pub fn close(&self) {
        self.shared.mark_closed();
    }

    fn register(&self, sid: u32) -> MuxStream {
        let (data_tx, data_rx) = mpsc::channel(STREAM_BUFFER_FRAMES);
        self.shared
            .streams
            .lock()
            .insert(sid, StreamEntry { data_tx });
        MuxStream {
            sid,
            shared: Arc::clone(&self.shared),
            frame_tx: PollSender::new(self.shared.frame_tx.clone()),
            data_rx,
            pending: Bytes::new(),
            read_closed: false,
            fin_sent: false,
        }
    }

    async fn read_loop<R>(shared: Arc<MuxShared>, mut reader: R, accept_tx: mpsc::Sender<MuxStream>)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let cancel = shared.cancel.clone();
        let run = async {
            let mut header = [0u8; HEADER_LEN];
            loop {
                if reader.read_exact(&mut header).await.is_err() {
                    return;
                }
                if header[0] != MUX_VERSION {
                    debug!(version = header[0], "mux peer speaks unknown version");
                    return;
                }
                let cmd = header[1];
                let len = u16::from_be_bytes([header[2], header[3]]) as usize;
                let sid = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);

                let payload = if len > 0 {
                    let mut body = vec![0u8; len];
                    if reader.read_exact(&mut body).await.is_err() {
                        return;
                    }
                    Bytes::from(body)
                } else {
                    Bytes::new()
                };

                match cmd {
                    CMD_SYN => {
                        let (data_tx, data_rx) = mpsc::channel(STREAM_BUFFER_FRAMES);
                        shared.streams.lock().insert(sid, StreamEntry { data_tx });
                        let stream = MuxStream {
                            sid,
                            shared: Arc::clone(&shared),
                            frame_tx: PollSender::new(shared.frame_tx.clone()),
                            data_rx,
                            pending: Bytes::new(),
                            read_closed: false,
                            fin_sent: false,
                        };
                        if accept_tx.send(stream).await.is_err() {
                            return;
                        }
                    }
                    CMD_PSH => {
                        let tx = shared
                            .streams
                            .lock()
                            .get(&sid)
                            .map(|entry| entry.data_tx.clone());
                        if let Some(tx) = tx {
                            // Await here on purpose: a slow consumer stalls
                            // the whole session, and KCP's receive window
                            // carries that backpressure to the peer.
                            if tx.send(payload).await.is_err() {
                                shared.streams.lock().remove(&sid);
                            }
                        }
                    }
                    CMD_FIN => {
                        // Dropping the sender drains into EOF after the
                        // buffered frames are consumed.
                        shared.streams.lock().remove(&sid);
                    }
                    CMD_NOP => {}
                    other => {
                        debug!(cmd = other, "unknown mux command, dropping session");
                        return;
                    }
                }
            }
        };
        tokio::select! {
            () = cancel.cancelled() => {}
            () = run => {}
        }
        shared.mark_closed();
    }

    async fn write_loop<W>(
        shared: Arc<MuxShared>,
        mut writer: W,
        mut frame_rx: mpsc::Receiver<WireFrame>,
    ) where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let cancel = shared.cancel.clone();
        loop {
            let frame = tokio::select! {
                () = cancel.cancelled() => break,
                frame = frame_rx.recv() => frame,
            };
            let Some(frame) = frame else { break };
            if writer.write_all(&frame.encode()).await.is_err() {
                break;
            }
            if writer.flush().await.is_err() {
                break;
            }
        }
        shared.mark_closed();
    }

    async fn keepalive_loop(shared: Arc<MuxShared>) {
        let cancel = shared.cancel.clone();
        let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    let nop = WireFrame { cmd: CMD_NOP, sid: 0, payload: Bytes::new() };
                    if shared.frame_tx.send(nop).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Mux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mux")
            .field("closed", &self.is_closed())
            .field("streams", &self.shared.streams.lock().len())
            .finish()
    }
}

/// One multiplexed stream
pub struct MuxStream {
    sid: u32,
    shared: Arc<MuxShared>,
    frame_tx: PollSender<WireFrame>,
    data_rx: mpsc::Receiver<Bytes>,
    pending: Bytes,
    read_closed: bool,
    fin_sent: bool,
}

impl MuxStream {
    /// Stream id within the session
    #[must_use]
    pub const fn sid(&self) -> u32 {
        self.sid
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.pending.is_empty() {
                let n = self.pending.len().min(buf.remaining());
                let chunk = self.pending.split_to(n);
                buf.put_slice(&chunk);
                return Poll::Ready(Ok(()));
            }
            if self.read_closed {
                return Poll::Ready(Ok(()));
            }
            match self.data_rx.poll_recv(cx) {
                Poll::Ready(Some(bytes)) => {
                    self.pending = bytes;
                }
                Poll::Ready(None) => {
                    self.read_closed = true;
                    return Poll::Ready(Ok(()));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "mux session closed",
            )));
        }
        match self.frame_tx.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(_)) => {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "mux writer gone",
                )));
            }
            Poll::Pending => return Poll::Pending,
        }
        let n = buf.len().min(MAX_FRAME_PAYLOAD);
        let sid = self.sid;
        let frame = WireFrame {
            cmd: CMD_PSH,
            sid,
            payload: Bytes::copy_from_slice(&buf[..n]),
        };
        if self.frame_tx.send_item(frame).is_err() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "mux writer gone",
            )));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are flushed by the writer task as they drain.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.fin_sent || self.shared.closed.load(Ordering::Acquire) {
            return Poll::Ready(Ok(()));
        }
        match self.frame_tx.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(_)) => return Poll::Ready(Ok(())),
            Poll::Pending => return Poll::Pending,
        }
        let sid = self.sid;
        let fin = WireFrame {
            cmd: CMD_FIN,
            sid,
            payload: Bytes::new(),
        };
        let _ = self.frame_tx.send_item(fin);
        self.fin_sent = true;
        Poll::Ready(Ok(()))
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        self.shared.streams.lock().remove(&self.sid);
        if !self.fin_sent && !self.shared.closed.load(Ordering::Acquire) {
            // Best effort: tell the peer this stream is gone.
            let _ = self.shared.frame_tx.try_send(WireFrame {
                cmd: CMD_FIN,
                sid: self.sid,
                payload: Bytes::new(),
            });
        }
    }
}

impl std::fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxStream").field("sid", &self.sid).finish()
    }
}

impl crate::transport::Stream for MuxStream {
    fn sid(&self) -> u64 {
        u64::from(self.sid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    fn session_pair() -> (Arc<Mux>, Arc<Mux>, CancellationToken) {
        let cancel = CancellationToken::new();
        let (a, b) = duplex(64 * 1024);
        let client = Mux::new(a, true, &cancel);
        let server = Mux::new(b, false, &cancel);
        (client, server, cancel)
    }

    #[tokio::test]
    async fn test_open_accept_and_exchange() {
        let (client, server, _cancel) = session_pair();

        let mut cs = client.open_stream().await.unwrap();
        cs.write_all(b"hello over mux").await.unwrap();

        let mut ss = server.accept_stream().await.unwrap();
        assert_eq!(ss.sid(), cs.sid());

        let mut buf = vec![0u8; 14];
        ss.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello over mux");

        ss.write_all(b"reply").await.unwrap();
        let mut buf = vec![0u8; 5];
        cs.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reply");
    }

    #[tokio::test]
    async fn test_sid_parity_never_collides() {
        let (client, server, _cancel) = session_pair();
        let c1 = client.open_stream().await.unwrap();
        let c2 = client.open_stream().await.unwrap();
        let s1 = server.open_stream().await.unwrap();

        assert_eq!(c1.sid() % 2, 1);
        assert_eq!(c2.sid() % 2, 1);
        assert_eq!(s1.sid() % 2, 0);
        assert_ne!(c1.sid(), c2.sid());
    }

    #[tokio::test]
    async fn test_concurrent_streams_stay_separate() {
        let (client, server, _cancel) = session_pair();

        let mut streams = Vec::new();
        for i in 0..4u8 {
            let mut s = client.open_stream().await.unwrap();
            s.write_all(&[i; 100]).await.unwrap();
            streams.push(s);
        }

        for _ in 0..4 {
            let mut s = server.accept_stream().await.unwrap();
            let mut buf = [0u8; 100];
            s.read_exact(&mut buf).await.unwrap();
            assert!(buf.iter().all(|&b| b == buf[0]), "streams must not interleave bytes");
        }
    }

    #[tokio::test]
    async fn test_shutdown_delivers_eof() {
        let (client, server, _cancel) = session_pair();

        let mut cs = client.open_stream().await.unwrap();
        cs.write_all(b"last words").await.unwrap();
        cs.shutdown().await.unwrap();

        let mut ss = server.accept_stream().await.unwrap();
        let mut all = Vec::new();
        ss.read_to_end(&mut all).await.unwrap();
        assert_eq!(&all, b"last words");
    }

    #[tokio::test]
    async fn test_large_transfer_preserves_order() {
        let (client, server, _cancel) = session_pair();

        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let mut cs = client.open_stream().await.unwrap();
        let writer = tokio::spawn(async move {
            cs.write_all(&payload).await.unwrap();
            cs.shutdown().await.unwrap();
        });

        let mut ss = server.accept_stream().await.unwrap();
        let mut received = Vec::new();
        ss.read_to_end(&mut received).await.unwrap();
        writer.await.unwrap();

        assert_eq!(received.len(), expected.len());
        assert_eq!(received, expected, "bytes must arrive in write order");
    }

    #[tokio::test]
    async fn test_session_close_fails_streams() {
        let (client, server, _cancel) = session_pair();
        let mut cs = client.open_stream().await.unwrap();
        let _ss = server.accept_stream().await.unwrap();

        client.close();
        client.close(); // idempotent
        assert!(client.is_closed());

        let err = cs.write_all(b"too late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert!(client.open_stream().await.is_err());
    }

    #[tokio::test]
    async fn test_transport_eof_closes_session() {
        let cancel = CancellationToken::new();
        let (a, b) = duplex(4096);
        let client = Mux::new(a, true, &cancel);
        drop(b);

        tokio::time::timeout(Duration::from_secs(2), async {
            while !client.is_closed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("EOF on the transport must close the session");
    }
}
