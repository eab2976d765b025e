//! Parallel send pipeline
//!
//! Outbound datagrams are queued as [`PendingPacket`]s on a bounded channel
//! and drained by `packet_workers` tasks that serialize each one into a full
//! frame (shadow flags looked up at send time, not enqueue time) and push it
//! through the injection sink. Failed injections retry with jittered
//! exponential backoff up to `max_retries`, then the packet is discarded and
//! counted.
//!
//! `submit` never blocks: when the queue is full the packet is dropped and
//! the drop counter incremented. The transport above (KCP or QUIC) treats
//! that as path loss and retransmits, which is the intended backpressure.
//! Workers give no ordering guarantee; sequencing is also the transport's
//! job.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::PcapConfig;
use crate::error::FabricError;
use crate::fabric::craft::FrameComposer;
use crate::fabric::shadow::ShadowTable;

/// Drop-warning cadence, in dropped packets
const DROP_WARN_EVERY: u64 = 1000;

/// Where serialized frames go; the pcap injection handle in production,
/// a recording sink in tests.
pub trait SegmentSink: Send + Sync + 'static {
    /// Inject one serialized frame.
    ///
    /// # Errors
    ///
    /// Returns `FabricError` when injection fails; the pipeline retries.
    fn send_segment(&self, frame: &[u8]) -> Result<(), FabricError>;
}

/// One queued datagram awaiting serialization and injection
#[derive(Debug)]
struct PendingPacket {
    payload: Vec<u8>,
    dst: SocketAddr,
    enqueued: Instant,
}

/// Counters exported for observability
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Packets dropped (queue full, serialization failure, retries exhausted)
    pub dropped: u64,
    /// Packets currently queued
    pub queue_depth: usize,
}

/// The bounded queue plus its worker pool
pub struct SendPipeline {
    tx: mpsc::Sender<PendingPacket>,
    rx: Arc<Mutex<mpsc::Receiver<PendingPacket>>>,
    composer: Arc<FrameComposer>,
    shadow: Arc<ShadowTable>,
    sink: Arc<dyn SegmentSink>,
    dropped: AtomicU64,
    depth: AtomicUsize,
    max_retries: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl SendPipeline {
    /// Create the pipeline. Workers are not started until
    /// [`spawn_workers`](Self::spawn_workers) is called.
    #[must_use]
    pub fn new(
        pcap: &PcapConfig,
        composer: Arc<FrameComposer>,
        shadow: Arc<ShadowTable>,
        sink: Arc<dyn SegmentSink>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(pcap.send_queue_size);
        Arc::new(Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            composer,
            shadow,
            sink,
            dropped: AtomicU64::new(0),
            depth: AtomicUsize::new(0),
            max_retries: pcap.max_retries,
            initial_backoff: Duration::from_millis(pcap.initial_backoff_ms),
            max_backoff: Duration::from_millis(pcap.max_backoff_ms),
        })
    }

    /// Enqueue a datagram toward `dst`. Never blocks; returns whether the
    /// packet was accepted. A `false` return has already been counted.
    pub fn submit(&self, payload: Vec<u8>, dst: SocketAddr) -> bool {
        let packet = PendingPacket {
            payload,
            dst,
            enqueued: Instant::now(),
        };
        match self.tx.try_send(packet) {
            Ok(()) => {
                self.depth.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(_) | mpsc::error::TrySendError::Closed(_)) => {
                self.count_drop();
                false
            }
        }
    }

    /// Start `workers` drain tasks that run until `cancel` fires.
    pub fn spawn_workers(self: &Arc<Self>, workers: usize, cancel: &CancellationToken) {
        for id in 0..workers.max(1) {
            let pipeline = Arc::clone(self);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                pipeline.worker_loop(id, cancel).await;
            });
        }
    }

    /// Current counters
    #[must_use]
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            dropped: self.dropped.load(Ordering::Relaxed),
            queue_depth: self.depth.load(Ordering::Relaxed),
        }
    }

    fn count_drop(&self) {
        let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        if total % DROP_WARN_EVERY == 0 {
            warn!(
                dropped = total,
                queue_depth = self.depth.load(Ordering::Relaxed),
                "send pipeline saturated, dropping packets"
            );
        }
    }

    async fn worker_loop(self: Arc<Self>, id: usize, cancel: CancellationToken) {
        loop {
            let packet = {
                let mut rx = self.rx.lock().await;
                tokio::select! {
                    () = cancel.cancelled() => return,
                    packet = rx.recv() => packet,
                }
            };
            let Some(packet) = packet else {
                return;
            };
            self.depth.fetch_sub(1, Ordering::Relaxed);
            trace!(
                worker = id,
                dst = %packet.dst,
                len = packet.payload.len(),
                queued_us = packet.enqueued.elapsed().as_micros() as u64,
                "serializing packet"
            );
            self.deliver(packet, &cancel).await;
        }
    }

    /// Serialize and inject one packet, retrying transient failures.
    async fn deliver(&self, packet: PendingPacket, cancel: &CancellationToken) {
        let flags = self.shadow.get_or_create(packet.dst);
        let frame = match self.composer.compose(packet.dst, &flags, &packet.payload) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(dst = %packet.dst, error = %e, "packet serialization failed");
                self.count_drop();
                return;
            }
        };

        let mut attempt: u32 = 0;
        loop {
            match self.sink.send_segment(&frame) {
                Ok(()) => return,
                Err(e) if attempt >= self.max_retries => {
                    debug!(
                        dst = %packet.dst,
                        attempts = attempt + 1,
                        error = %e,
                        "injection retries exhausted"
                    );
                    self.count_drop();
                    return;
                }
                Err(e) => {
                    let backoff = self.backoff_for(attempt);
                    trace!(
                        dst = %packet.dst,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "injection failed, backing off"
                    );
                    attempt += 1;
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        () = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
    }

    /// `min(initial * 2^attempt, max)` plus random jitter in `[0, d/2)`.
    fn backoff_for(&self, attempt: u32) -> Duration {
        let base = self
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_backoff);
        let half = base.as_millis() as u64 / 2;
        let jitter = if half == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..half)
        };
        base + Duration::from_millis(jitter)
    }
}

impl std::fmt::Debug for SendPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendPipeline")
            .field("stats", &self.stats())
            .field("max_retries", &self.max_retries)
            .finish()
    }
}
