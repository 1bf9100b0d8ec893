//! Bounded connection pool for TDS sessions.
//!
//! A semaphore caps the number of live connections; idle sessions wait on a
//! LIFO stack so recently used connections are handed out first. Leased
//! connections carry their permit with them and give it back on return,
//! which keeps the cap strict: at no point can `total` exceed `max_size`.
//!
//! Acquisition charges every step against a single deadline. Waiting for a
//! permit, re-validating a stale session, and dialing a fresh one all spend
//! from the same `acquire_timeout` budget, so a caller is never blocked for
//! longer than the configured bound.

use std::fmt;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use schemars::JsonSchema;
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::timeout_at;
use tracing::{debug, info, warn};

use crate::config::PoolSettings;
use crate::error::{DbError, DbResult};

/// A connection the pool can manage.
pub trait PoolableConnection: Send + 'static {
    /// Stable identifier for log correlation.
    fn id(&self) -> u64;

    /// Cheap server round-trip proving the session is still alive.
    fn ping(&mut self) -> impl Future<Output = DbResult<()>> + Send;

    /// Orderly logout. Dropping a connection instead closes the socket
    /// abruptly, which the server treats as a client abort.
    fn close(self) -> impl Future<Output = ()> + Send;
}

/// Mints connections for the pool. Implemented by [`MssqlFactory`] in
/// production and by in-memory fakes in tests.
///
/// [`MssqlFactory`]: crate::db::connection::MssqlFactory
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: PoolableConnection;

    fn connect(&self) -> impl Future<Output = DbResult<Self::Connection>> + Send;
}

/// Point-in-time pool occupancy, as reported by the `mssql_pool_stats` tool.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct PoolStats {
    /// Connections currently alive, leased or idle.
    pub total_connections: u32,
    /// Connections sitting idle, ready to lease.
    pub available_connections: u32,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Default)]
struct PoolCounters {
    created: AtomicU64,
    closed: AtomicU64,
    reused: AtomicU64,
    recycled: AtomicU64,
    exhausted: AtomicU64,
}

struct IdleEntry<C> {
    conn: C,
    created_at: Instant,
    last_used: Instant,
    last_validated: Instant,
}

impl<C> IdleEntry<C> {
    fn new(conn: C) -> Self {
        let now = Instant::now();
        Self {
            conn,
            created_at: now,
            last_used: now,
            last_validated: now,
        }
    }
}

/// Semaphore-bounded pool over any [`ConnectionFactory`].
pub struct SqlPool<F: ConnectionFactory> {
    settings: PoolSettings,
    factory: F,
    idle: Mutex<Vec<IdleEntry<F::Connection>>>,
    permits: Semaphore,
    total: AtomicUsize,
    closing: AtomicBool,
    counters: PoolCounters,
}

impl<F: ConnectionFactory> SqlPool<F> {
    pub fn new(settings: PoolSettings, factory: F) -> Arc<Self> {
        Arc::new(Self {
            permits: Semaphore::new(settings.max_size as usize),
            idle: Mutex::new(Vec::with_capacity(settings.max_size as usize)),
            settings,
            factory,
            total: AtomicUsize::new(0),
            closing: AtomicBool::new(false),
            counters: PoolCounters::default(),
        })
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Eagerly open `min_size` connections. Any failure bubbles up so a
    /// misconfigured server is caught at startup, not on the first call.
    pub async fn warm_up(self: &Arc<Self>) -> DbResult<()> {
        for _ in 0..self.settings.min_size {
            let Ok(permit) = self.permits.try_acquire() else {
                break;
            };
            let conn = self.factory.connect().await?;
            self.total.fetch_add(1, Ordering::Release);
            self.counters.created.fetch_add(1, Ordering::Relaxed);
            self.idle.lock().await.push(IdleEntry::new(conn));
            // idle connections hold no permit
            drop(permit);
        }
        info!(
            connections = self.total.load(Ordering::Acquire),
            "pool warmed up"
        );
        Ok(())
    }

    /// Lease a connection, waiting at most `acquire_timeout` in total.
    ///
    /// Preference order: newest idle connection, re-validated if it has not
    /// been checked within `validation_interval`; otherwise a fresh dial with
    /// exactly one retry. Expired idle entries are discarded on the way.
    pub async fn acquire(self: &Arc<Self>) -> DbResult<PooledConnection<F>> {
        if self.closing.load(Ordering::Acquire) {
            return Err(DbError::PoolClosed);
        }

        let deadline = tokio::time::Instant::now() + self.settings.acquire_timeout;
        let waited_secs = self.settings.acquire_timeout.as_secs();

        let permit = match timeout_at(deadline, self.permits.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(DbError::PoolClosed),
            Err(_) => {
                self.counters.exhausted.fetch_add(1, Ordering::Relaxed);
                return Err(DbError::pool_exhausted(waited_secs));
            }
        };

        let (conn, created_at) = loop {
            let candidate = {
                let mut idle = self.idle.lock().await;
                loop {
                    match idle.pop() {
                        Some(entry) => {
                            if entry.created_at.elapsed() > self.settings.max_lifetime
                                || entry.last_used.elapsed() > self.settings.idle_timeout
                            {
                                // expired: drop closes the socket
                                self.total.fetch_sub(1, Ordering::Release);
                                self.counters.recycled.fetch_add(1, Ordering::Relaxed);
                                continue;
                            }
                            break Some(entry);
                        }
                        None => break None,
                    }
                }
            };

            match candidate {
                Some(mut entry) => {
                    if entry.last_validated.elapsed() > self.settings.validation_interval {
                        match timeout_at(deadline, entry.conn.ping()).await {
                            Ok(Ok(())) => {}
                            Ok(Err(err)) => {
                                debug!(id = entry.conn.id(), error = %err, "idle connection failed validation");
                                self.total.fetch_sub(1, Ordering::Release);
                                self.counters.recycled.fetch_add(1, Ordering::Relaxed);
                                continue;
                            }
                            Err(_) => {
                                // deadline hit mid-ping; the session state is
                                // unknown, so it cannot go back on the stack
                                self.total.fetch_sub(1, Ordering::Release);
                                self.counters.exhausted.fetch_add(1, Ordering::Relaxed);
                                return Err(DbError::pool_exhausted(waited_secs));
                            }
                        }
                    }
                    self.counters.reused.fetch_add(1, Ordering::Relaxed);
                    break (entry.conn, entry.created_at);
                }
                None => {
                    let conn = self.create_with_retry(deadline, waited_secs).await?;
                    break (conn, Instant::now());
                }
            }
        };

        // the lease carries the permit until restore() gives it back
        permit.forget();

        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(self),
            created_at,
            broken: false,
        })
    }

    async fn create_with_retry(
        &self,
        deadline: tokio::time::Instant,
        waited_secs: u64,
    ) -> DbResult<F::Connection> {
        let first_err = match timeout_at(deadline, self.factory.connect()).await {
            Ok(Ok(conn)) => {
                self.total.fetch_add(1, Ordering::Release);
                self.counters.created.fetch_add(1, Ordering::Relaxed);
                return Ok(conn);
            }
            Ok(Err(err)) => err,
            Err(_) => return Err(DbError::pool_exhausted(waited_secs)),
        };

        warn!(error = %first_err, "connection attempt failed, retrying once");
        match timeout_at(deadline, self.factory.connect()).await {
            Ok(Ok(conn)) => {
                self.total.fetch_add(1, Ordering::Release);
                self.counters.created.fetch_add(1, Ordering::Relaxed);
                Ok(conn)
            }
            Ok(Err(err)) => Err(match err {
                unavailable @ DbError::ConnectionUnavailable { .. } => unavailable,
                other => DbError::connection_unavailable(other.to_string()),
            }),
            Err(_) => Err(DbError::pool_exhausted(waited_secs)),
        }
    }

    /// Take back a leased connection. Broken and over-lifetime sessions are
    /// closed; everything else returns to the idle stack. The permit is
    /// released only after bookkeeping settles, so the cap stays strict.
    async fn restore(self: &Arc<Self>, conn: F::Connection, created_at: Instant, broken: bool) {
        let shutting_down = self.closing.load(Ordering::Acquire);
        let expired = created_at.elapsed() > self.settings.max_lifetime;

        if broken || shutting_down || expired {
            debug!(id = conn.id(), broken, expired, "closing returned connection");
            self.total.fetch_sub(1, Ordering::Release);
            self.counters.closed.fetch_add(1, Ordering::Relaxed);
            self.permits.add_permits(1);
            conn.close().await;
            if !shutting_down {
                self.replenish();
            }
            return;
        }

        {
            let mut idle = self.idle.lock().await;
            idle.push(IdleEntry {
                conn,
                created_at,
                last_used: Instant::now(),
                last_validated: Instant::now(),
            });
        }
        self.permits.add_permits(1);
    }

    /// Top the pool back up to `min_size` in the background after a discard.
    /// Best-effort: if the pool is busy or the dial fails, the next acquire
    /// covers the gap.
    fn replenish(self: &Arc<Self>) {
        if self.total.load(Ordering::Acquire) >= self.settings.min_size as usize {
            return;
        }
        let Ok(permit) = self.permits.try_acquire() else {
            return;
        };
        permit.forget();

        let pool = Arc::clone(self);
        tokio::spawn(async move {
            match pool.factory.connect().await {
                Ok(conn) => {
                    pool.total.fetch_add(1, Ordering::Release);
                    pool.counters.created.fetch_add(1, Ordering::Relaxed);
                    pool.idle.lock().await.push(IdleEntry::new(conn));
                    pool.permits.add_permits(1);
                }
                Err(err) => {
                    pool.permits.add_permits(1);
                    debug!(error = %err, "background replenish failed");
                }
            }
        });
    }

    /// Occupancy snapshot. Holds the idle lock only long enough to count.
    pub async fn stats(&self) -> PoolStats {
        let available = self.idle.lock().await.len() as u32;
        PoolStats {
            total_connections: self.total.load(Ordering::Acquire) as u32,
            available_connections: available,
            max_connections: self.settings.max_size,
            min_connections: self.settings.min_size,
        }
    }

    /// Refuse new leases, close idle connections, and wait up to `grace`
    /// for outstanding leases to drain. Leases returned after shutdown are
    /// closed instead of re-idled.
    pub async fn shutdown(&self, grace: Duration) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.permits.close();

        let drained: Vec<IdleEntry<F::Connection>> =
            { self.idle.lock().await.drain(..).collect() };
        for entry in drained {
            self.total.fetch_sub(1, Ordering::Release);
            self.counters.closed.fetch_add(1, Ordering::Relaxed);
            entry.conn.close().await;
        }

        let deadline = Instant::now() + grace;
        while self.total.load(Ordering::Acquire) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let leftover = self.total.load(Ordering::Acquire);
        if leftover > 0 {
            warn!(leftover, "shutdown grace expired with connections still leased");
        }
        info!(
            created = self.counters.created.load(Ordering::Relaxed),
            closed = self.counters.closed.load(Ordering::Relaxed),
            reused = self.counters.reused.load(Ordering::Relaxed),
            recycled = self.counters.recycled.load(Ordering::Relaxed),
            exhausted = self.counters.exhausted.load(Ordering::Relaxed),
            "pool shut down"
        );
    }
}

/// A leased connection. Dereferences to the underlying session; give it
/// back with [`release`](Self::release), or let Drop return it as a
/// fallback when a future is cancelled mid-call.
pub struct PooledConnection<F: ConnectionFactory> {
    conn: Option<F::Connection>,
    pool: Arc<SqlPool<F>>,
    created_at: Instant,
    broken: bool,
}

impl<F: ConnectionFactory> PooledConnection<F> {
    pub fn id(&self) -> u64 {
        self.as_conn().id()
    }

    /// Flag the session as unusable; restore will close it instead of
    /// re-idling. Called after timeouts and protocol-level failures.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Return the connection to the pool.
    pub async fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            let pool = Arc::clone(&self.pool);
            pool.restore(conn, self.created_at, self.broken).await;
        }
    }

    fn as_conn(&self) -> &F::Connection {
        self.conn
            .as_ref()
            .expect("BUG: pooled connection used after release")
    }
}

impl<F: ConnectionFactory> fmt::Debug for PooledConnection<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("created_at", &self.created_at)
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

impl<F: ConnectionFactory> Deref for PooledConnection<F> {
    type Target = F::Connection;

    fn deref(&self) -> &Self::Target {
        self.as_conn()
    }
}

impl<F: ConnectionFactory> DerefMut for PooledConnection<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn
            .as_mut()
            .expect("BUG: pooled connection used after release")
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let pool = Arc::clone(&self.pool);
            let created_at = self.created_at;
            let broken = self.broken;
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    pool.restore(conn, created_at, broken).await;
                });
            } else {
                // runtime already gone: the socket closes with the drop and
                // no further leases can be served anyway
                warn!("connection dropped outside a runtime, skipping pool bookkeeping");
            }
        }
    }
}
