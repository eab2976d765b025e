//! Bidirectional copy between two async streams
//!
//! Used by every relay handler: tunnel stream on one side, target socket or
//! TUN seam on the other. Each direction is a small state machine (read a
//! chunk, drain it, then flush-and-shutdown the writer once the reader is
//! exhausted); both run inside one future so a relay is a single task.
//! Buffers come from the caller's pool and go back to it when the copy
//! ends.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

use crate::buffer::{BytePool, PooledBuf};

/// Byte counts of a completed relay
#[derive(Debug, Clone, Copy)]
pub struct CopyResult {
    /// Bytes moved from `a` to `b`
    pub a_to_b: u64,
    /// Bytes moved from `b` to `a`
    pub b_to_a: u64,
}

impl CopyResult {
    /// Total bytes in both directions
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.a_to_b + self.b_to_a
    }
}

/// Where one direction of the relay currently is
#[derive(Clone, Copy)]
enum PipeState {
    /// Buffer is empty; the next step is a read
    Idle,
    /// Buffer holds `len` bytes of which `pos` are already written out
    Draining { pos: usize, len: usize },
    /// Reader hit EOF; flush, then shut the writer down
    Closing { flushed: bool },
    /// Writer is shut down; nothing left to do
    Done,
}

/// One direction of the relay
struct Pipe {
    buf: PooledBuf,
    state: PipeState,
    moved: u64,
}

impl Pipe {
    fn new(buf: PooledBuf) -> Self {
        Self {
            buf,
            state: PipeState::Idle,
            moved: 0,
        }
    }

    /// Push this direction as far as it will go without blocking.
    ///
    /// Ready(Ok) means the direction is finished (EOF relayed and writer
    /// shut down); Ready(Err) means it died. Either way it never needs to
    /// be driven again.
    fn drive<R, W>(
        &mut self,
        cx: &mut Context<'_>,
        mut reader: Pin<&mut R>,
        mut writer: Pin<&mut W>,
    ) -> Poll<io::Result<()>>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            match self.state {
                PipeState::Idle => {
                    let mut read_buf = ReadBuf::new(&mut self.buf);
                    match reader.as_mut().poll_read(cx, &mut read_buf) {
                        Poll::Ready(Ok(())) => match read_buf.filled().len() {
                            0 => self.state = PipeState::Closing { flushed: false },
                            len => self.state = PipeState::Draining { pos: 0, len },
                        },
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                }
                PipeState::Draining { pos, len } => {
                    match writer.as_mut().poll_write(cx, &self.buf[pos..len]) {
                        Poll::Ready(Ok(0)) => {
                            return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                        }
                        Poll::Ready(Ok(n)) => {
                            self.moved += n as u64;
                            self.state = if pos + n == len {
                                PipeState::Idle
                            } else {
                                PipeState::Draining { pos: pos + n, len }
                            };
                        }
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                }
                PipeState::Closing { flushed } => {
                    if !flushed {
                        match writer.as_mut().poll_flush(cx) {
                            Poll::Ready(Ok(())) => {
                                self.state = PipeState::Closing { flushed: true };
                            }
                            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                            Poll::Pending => return Poll::Pending,
                        }
                        continue;
                    }
                    match writer.as_mut().poll_shutdown(cx) {
                        Poll::Ready(Ok(())) => self.state = PipeState::Done,
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                }
                PipeState::Done => return Poll::Ready(Ok(())),
            }
        }
    }
}

/// Copy in both directions until both sides reach EOF or fail, using two
/// buffers checked out of `pool`.
///
/// # Errors
///
/// Only fails on setup; a direction that dies mid-relay is logged at debug
/// level and treated as finished, since one side hanging up is how relays
/// normally end.
pub async fn copy_bidirectional_pooled<A, B>(
    a: &mut A,
    b: &mut B,
    pool: &Arc<BytePool>,
) -> io::Result<CopyResult>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let mut forward = Pipe::new(pool.get());
    let mut backward = Pipe::new(pool.get());
    let mut forward_live = true;
    let mut backward_live = true;

    std::future::poll_fn(move |cx| {
        if forward_live {
            if let Poll::Ready(result) = forward.drive(cx, Pin::new(&mut *a), Pin::new(&mut *b)) {
                forward_live = false;
                if let Err(e) = result {
                    debug!(direction = "forward", error = %e, "relay direction failed");
                }
            }
        }
        if backward_live {
            if let Poll::Ready(result) = backward.drive(cx, Pin::new(&mut *b), Pin::new(&mut *a)) {
                backward_live = false;
                if let Err(e) = result {
                    debug!(direction = "backward", error = %e, "relay direction failed");
                }
            }
        }

        if forward_live || backward_live {
            Poll::Pending
        } else {
            Poll::Ready(Ok(CopyResult {
                a_to_b: forward.moved,
                b_to_a: backward.moved,
            }))
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_copy_relays_both_directions() {
        let pool = BytePool::new(4096);

        // left <-> relay <-> right, with the relay built from two duplexes.
        let (mut left, mut relay_left) = duplex(1024);
        let (mut relay_right, mut right) = duplex(1024);

        let relay = tokio::spawn(async move {
            copy_bidirectional_pooled(&mut relay_left, &mut relay_right, &pool)
                .await
                .unwrap()
        });

        left.write_all(b"request").await.unwrap();
        left.shutdown().await.unwrap();

        let mut buf = vec![0u8; 7];
        right.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"request");

        right.write_all(b"response!").await.unwrap();
        right.shutdown().await.unwrap();

        let mut all = Vec::new();
        left.read_to_end(&mut all).await.unwrap();
        assert_eq!(&all, b"response!");

        let result = relay.await.unwrap();
        assert_eq!(result.a_to_b, 7);
        assert_eq!(result.b_to_a, 9);
        assert_eq!(result.total(), 16);
    }

    #[tokio::test]
    async fn test_half_close_still_relays_the_other_direction() {
        let pool = BytePool::new(1024);
        let (mut left, mut relay_left) = duplex(1024);
        let (mut relay_right, mut right) = duplex(1024);

        let relay = tokio::spawn(async move {
            copy_bidirectional_pooled(&mut relay_left, &mut relay_right, &pool)
                .await
                .unwrap()
        });

        // Left closes immediately; right can still answer into the relay.
        left.shutdown().await.unwrap();
        right.write_all(b"late reply").await.unwrap();
        right.shutdown().await.unwrap();

        let mut all = Vec::new();
        left.read_to_end(&mut all).await.unwrap();
        assert_eq!(&all, b"late reply");

        let result = relay.await.unwrap();
        assert_eq!(result.a_to_b, 0);
        assert_eq!(result.b_to_a, 10);
    }

    #[tokio::test]
    async fn test_buffers_return_to_pool() {
        let pool = BytePool::new(1024);
        let (mut a, mut a_peer) = duplex(64);
        let (mut b_peer, mut b) = duplex(64);

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
        drop(a);
        drop(b);

        copy_bidirectional_pooled(&mut a_peer, &mut b_peer, &pool)
            .await
            .unwrap();
        assert_eq!(pool.available(), 2, "both copy buffers should be pooled again");
    }
}
