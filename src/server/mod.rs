//! Server accept/dispatch
//!
//! One accept loop pulls transport connections off the listener; each
//! connection gets a supervised task that accepts streams; each stream gets
//! a child task gated by the concurrency semaphore. The first message on a
//! stream decides its fate: TCP/UDP/TUN relays, a PING answered in place,
//! TCPF folded into the shadow table, anything else closed as a protocol
//! violation — the violator loses its stream, never the process.

mod relay;

pub use relay::{relay_tcp, relay_tun, relay_udp};

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::BufferPools;
use crate::config::Config;
use crate::error::{ServerError, TransportError};
use crate::pool::TargetPools;
use crate::protocol::Frame;
use crate::transport::{BoxStream, Connection, Listener};

/// The server-side TUN seam. The device itself (and its routing setup) is
/// an external collaborator; the server only needs something to pipe raw IP
/// packets through.
pub trait TunIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TunIo for T {}

/// Opens the TUN pipe for each TUN-typed stream
#[async_trait]
pub trait TunProvider: Send + Sync {
    /// Open an I/O handle onto the TUN device.
    ///
    /// # Errors
    ///
    /// Propagates device open failures.
    async fn open(&self) -> io::Result<Box<dyn TunIo>>;
}

/// The server runtime
pub struct Server {
    cfg: Arc<Config>,
    buffers: BufferPools,
    target_pools: Option<Arc<TargetPools>>,
    semaphore: Option<Arc<Semaphore>>,
    tun: Option<Arc<dyn TunProvider>>,
    active_streams: Arc<AtomicUsize>,
    cancel: CancellationToken,
}

impl Server {
    /// Assemble the server from configuration.
    ///
    /// `tun` supplies the device seam when `tun.enabled` is set; without a
    /// provider TUN streams are rejected regardless of the flag.
    #[must_use]
    pub fn new(
        cfg: Arc<Config>,
        tun: Option<Arc<dyn TunProvider>>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let buffers = BufferPools::new(&cfg.transport);

        let target_pools = if cfg.performance.connection_pooling_enabled() {
            let pools = TargetPools::new(
                cfg.performance.tcp_connection_pool_size,
                Duration::from_secs(cfg.performance.tcp_connection_idle_timeout),
            );
            pools.spawn_sweepers(&cancel);
            Some(pools)
        } else {
            None
        };

        let semaphore = match cfg.performance.max_concurrent_streams {
            0 => {
                warn!("max_concurrent_streams is 0: stream concurrency is unbounded");
                None
            }
            cap => Some(Arc::new(Semaphore::new(cap))),
        };

        Arc::new(Self {
            cfg,
            buffers,
            target_pools,
            semaphore,
            tun,
            active_streams: Arc::new(AtomicUsize::new(0)),
            cancel,
        })
    }

    /// Run the accept loop until shutdown. Consumes the listener.
    ///
    /// # Errors
    ///
    /// Only startup-grade listener failures; individual accept errors are
    /// logged and retried.
    pub async fn run(self: &Arc<Self>, listener: Box<dyn Listener>) -> Result<(), ServerError> {
        let pooling = match &self.target_pools {
            Some(_) => format!(
                "enabled (pool size: {}, idle timeout: {}s)",
                self.cfg.performance.tcp_connection_pool_size,
                self.cfg.performance.tcp_connection_idle_timeout
            ),
            None => "disabled".to_string(),
        };
        info!(
            local = %listener.local_addr(),
            protocol = self.cfg.transport.protocol.as_str(),
            max_concurrent_streams = self.cfg.performance.max_concurrent_streams,
            pooling = %pooling,
            "server listening"
        );

        loop {
            match listener.accept().await {
                Ok(conn) => {
                    let conn: Arc<dyn Connection> = Arc::from(conn);
                    info!(remote = %conn.remote_addr(), "accepted connection");
                    let server = Arc::clone(self);
                    tokio::spawn(async move {
                        server.handle_connection(conn).await;
                    });
                }
                Err(TransportError::Cancelled) => break,
                Err(e) => {
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    error!(error = %e, "accept failed");
                }
            }
        }

        listener.close();
        info!("server accept loop stopped");
        Ok(())
    }

    /// Streams currently inside handlers (observability and tests)
    #[must_use]
    pub fn active_streams(&self) -> usize {
        self.active_streams.load(Ordering::Relaxed)
    }

    async fn handle_connection(self: Arc<Self>, conn: Arc<dyn Connection>) {
        loop {
            let stream = tokio::select! {
                () = self.cancel.cancelled() => break,
                stream = conn.accept_stream() => stream,
            };
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    debug!(remote = %conn.remote_addr(), error = %e, "connection finished");
                    break;
                }
            };

            // Take the permit before scheduling the handler; when shutdown
            // arrives while we would block here, the stream is dropped.
            let permit = match &self.semaphore {
                Some(semaphore) => {
                    let acquired = tokio::select! {
                        () = self.cancel.cancelled() => break,
                        acquired = Arc::clone(semaphore).acquire_owned() => acquired,
                    };
                    match acquired {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    }
                }
                None => None,
            };

            let server = Arc::clone(&self);
            let conn = Arc::clone(&conn);
            tokio::spawn(async move {
                let _permit = permit;
                server.active_streams.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = server.handle_stream(&conn, stream).await {
                    debug!(error = %e, "stream handler ended with error");
                }
                server.active_streams.fetch_sub(1, Ordering::Relaxed);
            });
        }
        conn.close();
    }

    async fn handle_stream(
        &self,
        conn: &Arc<dyn Connection>,
        mut stream: BoxStream,
    ) -> Result<(), ServerError> {
        let frame = match Frame::read_from(&mut stream).await {
            Ok(frame) => frame,
            Err(TransportError::Protocol(reason)) => {
                // Close the offending stream; the connection survives.
                return Err(ServerError::protocol(reason));
            }
            Err(_) => return Ok(()),
        };

        match frame {
            Frame::Ping => {
                Frame::Pong
                    .write_to(&mut stream)
                    .await
                    .map_err(|e| ServerError::protocol(e.to_string()))?;
                use tokio::io::AsyncWriteExt;
                stream.shutdown().await.ok();
                Ok(())
            }
            Frame::Pong => Err(ServerError::protocol("unsolicited PONG")),
            Frame::Flags(entries) => {
                if let Some(shadow) = conn.shadow() {
                    let count = entries.len();
                    for entry in entries {
                        shadow.install(entry.addr, entry.flags);
                    }
                    debug!(count, "installed peer shadow flags");
                }
                Ok(())
            }
            Frame::Tcp(target) => {
                relay_tcp(
                    stream,
                    target,
                    self.target_pools.as_ref(),
                    &self.buffers,
                    &self.cancel,
                )
                .await
            }
            Frame::Udp(target) => {
                relay_udp(stream, target, &self.buffers, &self.cancel).await
            }
            Frame::Tun => {
                let provider = match (&self.tun, self.cfg.tun.enabled) {
                    (Some(provider), true) => provider,
                    _ => {
                        // Reject with close, never a silent TCP fallback.
                        debug!("rejecting TUN stream: TUN is disabled");
                        return Err(ServerError::TunDisabled);
                    }
                };
                let mut tun = provider
                    .open()
                    .await
                    .map_err(ServerError::IoError)?;
                relay_tun(stream, &mut tun, &self.buffers, &self.cancel).await
            }
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("active_streams", &self.active_streams())
            .field("pooling", &self.target_pools.is_some())
            .finish()
    }
}
