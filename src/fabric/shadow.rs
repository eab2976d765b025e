//! Per-remote TCP shadow state
//!
//! Crafted segments need sequence/ACK/window values that look like a live
//! connection to on-path observers. The kernel never tracks these flows, so
//! the fabric keeps its own "shadow" of the last-seen TCP fields per remote:
//! updated opportunistically from captured segments, pre-seeded by peers via
//! the TCPF stream message, and read every time a segment is composed.
//!
//! The table is read-mostly: a shared lock serves the craft path, a short
//! exclusive lock covers create/update, with the usual double-check after
//! lock upgrade.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// TCP PSH flag bit
pub const FLAG_PSH: u8 = 0x08;
/// TCP ACK flag bit
pub const FLAG_ACK: u8 = 0x10;

/// Sweep cadence for the garbage collector
const GC_INTERVAL: Duration = Duration::from_secs(300);
/// Entries idle longer than this are evicted
const GC_MAX_IDLE: Duration = Duration::from_secs(600);

/// Last-seen TCP fields for one remote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowFlags {
    /// Sequence number to place in the next crafted segment
    pub seq: u32,
    /// Acknowledgment number to place in the next crafted segment
    pub ack: u32,
    /// Advertised window
    pub window: u16,
    /// TCP flag bits, normally PSH|ACK
    pub flags: u8,
}

impl Default for ShadowFlags {
    fn default() -> Self {
        Self {
            seq: 0,
            ack: 0,
            window: 65535,
            flags: FLAG_PSH | FLAG_ACK,
        }
    }
}

/// One remote's shadow flags, as carried in a TCPF stream message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagEntry {
    /// The address the flags describe (the sender's own tuple)
    pub addr: SocketAddr,
    /// The fields a peer should craft toward that address
    pub flags: ShadowFlags,
}

#[derive(Debug, Clone, Copy)]
struct ShadowState {
    flags: ShadowFlags,
    updated: Instant,
}

/// Map of remote address to shadow TCP state
///
/// Exactly one entry exists per remote; mutations are serialized by the
/// write lock.
#[derive(Debug, Default)]
pub struct ShadowTable {
    inner: RwLock<HashMap<SocketAddr, ShadowState>>,
}

impl ShadowTable {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Current flags for `remote`, instantiating defaults atomically on
    /// first use.
    #[must_use]
    pub fn get_or_create(&self, remote: SocketAddr) -> ShadowFlags {
        if let Some(state) = self.inner.read().get(&remote) {
            return state.flags;
        }

        let mut table = self.inner.write();
        // Double-check: another writer may have created the entry between
        // the read unlock and the write lock.
        let state = table.entry(remote).or_insert_with(|| ShadowState {
            flags: ShadowFlags::default(),
            updated: Instant::now(),
        });
        state.flags
    }

    /// Fold the fields of a captured segment into `remote`'s entry.
    ///
    /// The captured segment's own seq becomes our next ACK, and its ACK our
    /// next seq, so replies look like the continuation of the same
    /// conversation.
    pub fn observe(&self, remote: SocketAddr, seq: u32, ack: u32, window: u16) {
        let mut table = self.inner.write();
        let state = table.entry(remote).or_insert_with(|| ShadowState {
            flags: ShadowFlags::default(),
            updated: Instant::now(),
        });
        state.flags.seq = ack;
        state.flags.ack = seq;
        state.flags.window = window;
        state.updated = Instant::now();
    }

    /// Install peer-provided flags (TCPF message) verbatim for `addr`.
    pub fn install(&self, addr: SocketAddr, flags: ShadowFlags) {
        let mut table = self.inner.write();
        table.insert(
            addr,
            ShadowState {
                flags,
                updated: Instant::now(),
            },
        );
    }

    /// Snapshot every live entry as TCPF payload entries
    #[must_use]
    pub fn snapshot(&self) -> Vec<FlagEntry> {
        self.inner
            .read()
            .iter()
            .map(|(addr, state)| FlagEntry {
                addr: *addr,
                flags: state.flags,
            })
            .collect()
    }

    /// Number of tracked remotes
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Whether the table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Remove entries idle longer than `max_idle`; returns how many.
    pub fn sweep(&self, max_idle: Duration) -> usize {
        let mut table = self.inner.write();
        let before = table.len();
        let now = Instant::now();
        table.retain(|_, state| now.duration_since(state.updated) <= max_idle);
        before - table.len()
    }

    /// Spawn the background GC: every 5 minutes, drop entries idle > 10
    /// minutes. Runs until `cancel` fires.
    pub fn spawn_gc(self: &Arc<Self>, cancel: CancellationToken) {
        let table = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(GC_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let removed = table.sweep(GC_MAX_IDLE);
                        if removed > 0 {
                            debug!(removed, remaining = table.len(), "shadow table GC");
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("203.0.113.7:{port}").parse().unwrap()
    }

    #[test]
    fn test_get_or_create_defaults() {
        let table = ShadowTable::new();
        let flags = table.get_or_create(addr(443));
        assert_eq!(flags.seq, 0);
        assert_eq!(flags.ack, 0);
        assert_eq!(flags.window, 65535);
        assert_eq!(flags.flags, FLAG_PSH | FLAG_ACK);
        assert_eq!(table.len(), 1);

        // Second call returns the same entry, not a new one.
        let _ = table.get_or_create(addr(443));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_observe_mirrors_seq_and_ack() {
        let table = ShadowTable::new();
        table.observe(addr(443), 1000, 2000, 4096);

        let flags = table.get_or_create(addr(443));
        assert_eq!(flags.seq, 2000, "their ack becomes our seq");
        assert_eq!(flags.ack, 1000, "their seq becomes our ack");
        assert_eq!(flags.window, 4096);
    }

    #[test]
    fn test_install_overwrites() {
        let table = ShadowTable::new();
        table.observe(addr(443), 1, 2, 3);
        table.install(
            addr(443),
            ShadowFlags {
                seq: 77,
                ack: 88,
                window: 99,
                flags: FLAG_PSH | FLAG_ACK,
            },
        );
        let flags = table.get_or_create(addr(443));
        assert_eq!(flags.seq, 77);
        assert_eq!(flags.ack, 88);
        assert_eq!(flags.window, 99);
    }

    #[test]
    fn test_snapshot_covers_all_entries() {
        let table = ShadowTable::new();
        table.observe(addr(1), 1, 1, 1);
        table.observe(addr(2), 2, 2, 2);
        let mut snap = table.snapshot();
        snap.sort_by_key(|e| e.addr.port());
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].addr, addr(1));
        assert_eq!(snap[1].addr, addr(2));
    }

    #[test]
    fn test_sweep_removes_idle_entries() {
        let table = ShadowTable::new();
        table.observe(addr(1), 1, 1, 1);
        assert_eq!(table.sweep(Duration::from_secs(600)), 0);
        assert_eq!(table.len(), 1);

        // Zero idle budget evicts everything that is not brand new.
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(table.sweep(Duration::ZERO), 1);
        assert!(table.is_empty());
    }
}
