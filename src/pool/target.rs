//! Per-target TCP connection pool
//!
//! Relaying many short streams to the same upstream pays a connect round
//! trip each time; the pool keeps finished target connections for reuse.
//! One LIFO pool per target address (most recently returned connection is
//! handed out first, keeping the working set warm), a map of pools guarded
//! by a read-write lock with double-check creation, and two sweepers:
//! every 30 seconds idle connections are dropped, every 10 minutes pools
//! nobody touched for half an hour are destroyed whole.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::ServerError;

/// Deadline for dialing an upstream target
pub const TARGET_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Idle-connection sweep cadence
const CONN_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
/// Whole-pool sweep cadence
const POOL_SWEEP_INTERVAL: Duration = Duration::from_secs(600);
/// Pools untouched this long are destroyed
const POOL_MAX_UNTOUCHED: Duration = Duration::from_secs(1800);

/// Dial `target` directly, without pooling.
///
/// # Errors
///
/// `TargetUnreachable` on connect failure or timeout.
pub async fn dial_target(target: SocketAddr) -> Result<TcpStream, ServerError> {
    let stream = tokio::time::timeout(TARGET_DIAL_TIMEOUT, TcpStream::connect(target))
        .await
        .map_err(|_| {
            ServerError::target_unreachable(
                target,
                format!("connect timed out after {}s", TARGET_DIAL_TIMEOUT.as_secs()),
            )
        })?
        .map_err(|e| ServerError::target_unreachable(target, e.to_string()))?;
    stream.set_nodelay(true).ok();
    Ok(stream)
}

struct PooledConn {
    stream: TcpStream,
    idle_since: Instant,
}

struct TargetPool {
    conns: Mutex<Vec<PooledConn>>,
    last_access: Mutex<Instant>,
}

impl TargetPool {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            conns: Mutex::new(Vec::new()),
            last_access: Mutex::new(Instant::now()),
        })
    }

    fn touch(&self) {
        *self.last_access.lock() = Instant::now();
    }
}

/// The map of per-target pools
pub struct TargetPools {
    pools: RwLock<HashMap<SocketAddr, Arc<TargetPool>>>,
    max_size: usize,
    idle_timeout: Duration,
}

impl TargetPools {
    /// Create the pool map.
    ///
    /// `max_size` bounds cached connections per target; `idle_timeout` is
    /// how long a returned connection may wait for reuse.
    #[must_use]
    pub fn new(max_size: usize, idle_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            pools: RwLock::new(HashMap::new()),
            max_size,
            idle_timeout,
        })
    }

    /// Get a connection to `target`: pooled if one is fresh, dialed
    /// otherwise.
    ///
    /// # Errors
    ///
    /// `TargetUnreachable` when a new dial is needed and fails.
    pub async fn get(&self, target: SocketAddr) -> Result<TcpStream, ServerError> {
        let pool = self.pool_for(target);
        pool.touch();

        let reused = {
            let mut conns = pool.conns.lock();
            loop {
                match conns.pop() {
                    Some(conn) if conn.idle_since.elapsed() <= self.idle_timeout => {
                        break Some(conn.stream);
                    }
                    Some(_) => {
                        // Stale; keep popping, fresher ones are above it.
                    }
                    None => break None,
                }
            }
        };

        if let Some(stream) = reused {
            trace!(%target, "reusing pooled target connection");
            return Ok(stream);
        }
        dial_target(target).await
    }

    /// Return a finished connection for reuse. Full pools drop it.
    pub fn put(&self, target: SocketAddr, stream: TcpStream) {
        let pool = self.pool_for(target);
        pool.touch();
        let mut conns = pool.conns.lock();
        if conns.len() < self.max_size {
            conns.push(PooledConn {
                stream,
                idle_since: Instant::now(),
            });
        }
    }

    /// Number of pooled connections for `target`
    #[must_use]
    pub fn pooled(&self, target: SocketAddr) -> usize {
        self.pools
            .read()
            .get(&target)
            .map_or(0, |pool| pool.conns.lock().len())
    }

    /// Number of per-target pools
    #[must_use]
    pub fn pool_count(&self) -> usize {
        self.pools.read().len()
    }

    fn pool_for(&self, target: SocketAddr) -> Arc<TargetPool> {
        if let Some(pool) = self.pools.read().get(&target) {
            return Arc::clone(pool);
        }
        let mut pools = self.pools.write();
        // Double-check after the lock upgrade.
        Arc::clone(pools.entry(target).or_insert_with(TargetPool::new))
    }

    /// Drop connections idle past the timeout; returns how many.
    pub fn sweep_idle_conns(&self) -> usize {
        let pools = self.pools.read();
        let mut removed = 0;
        for pool in pools.values() {
            let mut conns = pool.conns.lock();
            let before = conns.len();
            conns.retain(|c| c.idle_since.elapsed() <= self.idle_timeout);
            removed += before - conns.len();
        }
        removed
    }

    /// Destroy pools untouched longer than `max_untouched`; returns how
    /// many.
    pub fn sweep_stale_pools(&self, max_untouched: Duration) -> usize {
        let mut pools = self.pools.write();
        let before = pools.len();
        pools.retain(|_, pool| pool.last_access.lock().elapsed() <= max_untouched);
        before - pools.len()
    }

    /// Start both background sweepers; they run until `cancel` fires.
    pub fn spawn_sweepers(self: &Arc<Self>, cancel: &CancellationToken) {
        let pools = Arc::clone(self);
        let conn_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CONN_SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = conn_cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let removed = pools.sweep_idle_conns();
                        if removed > 0 {
                            debug!(removed, "dropped idle target connections");
                        }
                    }
                }
            }
        });

        let pools = Arc::clone(self);
        let pool_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(POOL_SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = pool_cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let removed = pools.sweep_stale_pools(POOL_MAX_UNTOUCHED);
                        if removed > 0 {
                            debug!(removed, "destroyed untouched target pools");
                        }
                    }
                }
            }
        });
    }
}

impl std::fmt::Debug for TargetPools {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetPools")
            .field("pools", &self.pool_count())
            .field("max_size", &self.max_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn echo_listener() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    #[tokio::test]
    async fn test_get_dials_then_reuses() {
        let (listener, addr) = echo_listener().await;
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else { return };
                tokio::spawn(async move {
                    let mut buf = [0u8; 64];
                    while let Ok(n) = sock.read(&mut buf).await {
                        if n == 0 || sock.write_all(&buf[..n]).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        let pools = TargetPools::new(4, Duration::from_secs(60));

        let mut conn = pools.get(addr).await.unwrap();
        conn.write_all(b"abc").await.unwrap();
        let mut buf = [0u8; 3];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abc");

        pools.put(addr, conn);
        assert_eq!(pools.pooled(addr), 1);

        let _conn = pools.get(addr).await.unwrap();
        assert_eq!(pools.pooled(addr), 0, "LIFO reuse should empty the pool");
    }

    #[tokio::test]
    async fn test_pool_caps_at_max_size() {
        let (listener, addr) = echo_listener().await;
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((sock, _)) = listener.accept().await {
                held.push(sock);
            }
        });

        let pools = TargetPools::new(2, Duration::from_secs(60));
        let mut conns = Vec::new();
        for _ in 0..3 {
            conns.push(pools.get(addr).await.unwrap());
        }
        for conn in conns {
            pools.put(addr, conn);
        }
        assert_eq!(pools.pooled(addr), 2, "third return should be dropped");
    }

    #[tokio::test]
    async fn test_idle_sweep() {
        let (listener, addr) = echo_listener().await;
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((sock, _)) = listener.accept().await {
                held.push(sock);
            }
        });

        let pools = TargetPools::new(4, Duration::from_millis(10));
        let conn = pools.get(addr).await.unwrap();
        pools.put(addr, conn);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(pools.sweep_idle_conns(), 1);
        assert_eq!(pools.pooled(addr), 0);
    }

    #[tokio::test]
    async fn test_stale_pool_sweep() {
        let pools = TargetPools::new(4, Duration::from_secs(60));
        // Creating a pool without traffic: get() against a dead target.
        let dead: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let _ = pools.get(dead).await;
        assert_eq!(pools.pool_count(), 1);

        assert_eq!(pools.sweep_stale_pools(Duration::ZERO), 1);
        assert_eq!(pools.pool_count(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_target_errors() {
        let pools = TargetPools::new(4, Duration::from_secs(60));
        let dead: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let err = pools.get(dead).await.unwrap_err();
        assert!(matches!(err, ServerError::TargetUnreachable { .. }));
    }
}
