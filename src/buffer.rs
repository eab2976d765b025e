//! Byte buffer pools for the relay paths
//!
//! Three pools back the three relay kinds: TCP (stream copies), UDP
//! (datagram records), and TUN (raw IP packets, large). Pools are lock-free
//! (`crossbeam_queue::ArrayQueue`) and created by an explicit
//! [`BufferPools::new`] call whose handle is owned by the runtime; there is
//! no process-global state, so tests can run pools in parallel.
//!
//! Checkout rules:
//! - `get()` hands out a buffer of the pool's default size.
//! - `get_n(n)` with `n <= default` reuses a pooled buffer truncated to `n`.
//! - `get_n(n)` with `n > default` allocates fresh; that buffer bypasses the
//!   pool on release so oversized checkouts never become pool entries.
//! - A buffer returned with less capacity than the default is discarded
//!   rather than pooled, so later `get()` calls never shrink.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

use crate::config::TransportConfig;

/// Number of pooled entries kept per pool
const POOL_CAPACITY: usize = 512;

/// Statistics for one buffer pool
#[derive(Debug, Default)]
pub struct PoolStats {
    allocations: AtomicU64,
    reuses: AtomicU64,
    discards: AtomicU64,
}

impl PoolStats {
    /// Number of fresh allocations (pool empty or oversized request)
    #[must_use]
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Number of checkouts served from the pool
    #[must_use]
    pub fn reuses(&self) -> u64 {
        self.reuses.load(Ordering::Relaxed)
    }

    /// Number of buffers discarded on return (undersized or pool full)
    #[must_use]
    pub fn discards(&self) -> u64 {
        self.discards.load(Ordering::Relaxed)
    }
}

/// A lock-free pool of fixed-size byte buffers
#[derive(Debug)]
pub struct BytePool {
    entries: ArrayQueue<Vec<u8>>,
    default_size: usize,
    stats: PoolStats,
}

impl BytePool {
    /// Create a pool whose entries are `default_size` bytes
    #[must_use]
    pub fn new(default_size: usize) -> Arc<Self> {
        Arc::new(Self {
            entries: ArrayQueue::new(POOL_CAPACITY),
            default_size,
            stats: PoolStats::default(),
        })
    }

    /// Entry size handed out by `get()`
    #[must_use]
    pub const fn default_size(&self) -> usize {
        self.default_size
    }

    /// Check out a buffer of the default size
    #[must_use]
    pub fn get(self: &Arc<Self>) -> PooledBuf {
        self.get_n(self.default_size)
    }

    /// Check out a buffer of at least `n` bytes.
    ///
    /// Requests up to the default size reuse pooled entries; larger requests
    /// allocate fresh and are not returned to the pool on drop.
    #[must_use]
    pub fn get_n(self: &Arc<Self>, n: usize) -> PooledBuf {
        if n <= self.default_size {
            if let Some(mut buf) = self.entries.pop() {
                self.stats.reuses.fetch_add(1, Ordering::Relaxed);
                // Pooled entries always have default_size capacity; contents
                // are about to be overwritten by the caller's read.
                buf.clear();
                buf.resize(n, 0);
                return PooledBuf {
                    buf: Some(buf),
                    pool: Some(Arc::clone(self)),
                };
            }
            self.stats.allocations.fetch_add(1, Ordering::Relaxed);
            let mut buf = Vec::with_capacity(self.default_size);
            buf.resize(n, 0);
            return PooledBuf {
                buf: Some(buf),
                pool: Some(Arc::clone(self)),
            };
        }

        // Oversized checkout: never pooled on release.
        self.stats.allocations.fetch_add(1, Ordering::Relaxed);
        PooledBuf {
            buf: Some(vec![0u8; n]),
            pool: None,
        }
    }

    /// Number of entries currently pooled
    #[must_use]
    pub fn available(&self) -> usize {
        self.entries.len()
    }

    /// Pool statistics
    #[must_use]
    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    fn put_back(&self, buf: Vec<u8>) {
        // A buffer that lost capacity (swapped, shrunk) would pollute the
        // pool: later get() calls would silently hand out short buffers.
        if buf.capacity() < self.default_size {
            self.stats.discards.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if self.entries.push(buf).is_err() {
            self.stats.discards.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// A buffer checked out of a [`BytePool`]
///
/// Returns to its pool on drop unless it was an oversized checkout.
#[derive(Debug)]
pub struct PooledBuf {
    buf: Option<Vec<u8>>,
    pool: Option<Arc<BytePool>>,
}

impl PooledBuf {
    /// Consume the buffer without returning it to the pool
    #[must_use]
    pub fn into_vec(mut self) -> Vec<u8> {
        self.buf.take().unwrap_or_default()
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let (Some(buf), Some(pool)) = (self.buf.take(), self.pool.take()) {
            pool.put_back(buf);
        }
    }
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.buf.as_ref().map_or(&[], Vec::as_slice)
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buf.as_mut().map_or(&mut [], Vec::as_mut_slice)
    }
}

impl AsRef<[u8]> for PooledBuf {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl AsMut<[u8]> for PooledBuf {
    fn as_mut(&mut self) -> &mut [u8] {
        self
    }
}

/// The three relay pools, created once and handed to the runtime
#[derive(Debug, Clone)]
pub struct BufferPools {
    /// Stream relay buffers (`transport.tcpbuf`)
    pub tcp: Arc<BytePool>,
    /// Datagram record buffers (`transport.udpbuf`)
    pub udp: Arc<BytePool>,
    /// Raw IP packet buffers (`transport.tunbuf`)
    pub tun: Arc<BytePool>,
}

impl BufferPools {
    /// Build the pools from the transport buffer sizes
    #[must_use]
    pub fn new(transport: &TransportConfig) -> Self {
        Self {
            tcp: BytePool::new(transport.tcpbuf),
            udp: BytePool::new(transport.udpbuf),
            tun: BytePool::new(transport.tunbuf),
        }
    }
}
