//! Connection pool integration tests.
//!
//! These tests drive the pool through an in-memory factory, so every
//! lifecycle path (reuse, revalidation, expiry, retry, shutdown) runs
//! without a SQL Server. The concurrency tests assert the two pool
//! invariants: never more than `max_size` live connections, and no
//! connection leased to two callers at once.

use mssql_mcp_server::config::PoolSettings;
use mssql_mcp_server::db::pool::{ConnectionFactory, PoolableConnection, SqlPool};
use mssql_mcp_server::error::{DbError, DbResult};
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// In-memory stand-in for a TDS session.
struct FakeConnection {
    id: u64,
    closed: Arc<AtomicUsize>,
    fail_pings: Arc<AtomicBool>,
}

impl PoolableConnection for FakeConnection {
    fn id(&self) -> u64 {
        self.id
    }

    async fn ping(&mut self) -> DbResult<()> {
        if self.fail_pings.load(Ordering::SeqCst) {
            Err(DbError::driver("ping failed"))
        } else {
            Ok(())
        }
    }

    async fn close(self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Factory with failure knobs: fail the next N dials, fail pings on demand.
struct FakeFactory {
    next_id: AtomicU64,
    dials: Arc<AtomicUsize>,
    fail_next_dials: AtomicUsize,
    closed: Arc<AtomicUsize>,
    fail_pings: Arc<AtomicBool>,
}

impl FakeFactory {
    fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            dials: Arc::new(AtomicUsize::new(0)),
            fail_next_dials: AtomicUsize::new(0),
            closed: Arc::new(AtomicUsize::new(0)),
            fail_pings: Arc::new(AtomicBool::new(false)),
        }
    }

    fn failing_first(dials: usize) -> Self {
        let factory = Self::new();
        factory.fail_next_dials.store(dials, Ordering::SeqCst);
        factory
    }
}

impl ConnectionFactory for FakeFactory {
    type Connection = FakeConnection;

    async fn connect(&self) -> DbResult<FakeConnection> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let should_fail = self
            .fail_next_dials
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(DbError::connection_unavailable("dial refused"));
        }
        Ok(FakeConnection {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            closed: self.closed.clone(),
            fail_pings: self.fail_pings.clone(),
        })
    }
}

/// Settings with long lifecycle windows so only the path under test fires.
fn settings(min: u32, max: u32) -> PoolSettings {
    PoolSettings {
        min_size: min,
        max_size: max,
        acquire_timeout: Duration::from_secs(1),
        max_lifetime: Duration::from_secs(300),
        idle_timeout: Duration::from_secs(300),
        validation_interval: Duration::from_secs(300),
    }
}

/// warm_up opens exactly min_size connections and parks them idle.
#[tokio::test]
async fn test_warm_up_reaches_min_size() {
    let pool = SqlPool::new(settings(2, 10), FakeFactory::new());
    pool.warm_up().await.unwrap();

    let stats = pool.stats().await;
    assert_eq!(stats.total_connections, 2);
    assert_eq!(stats.available_connections, 2);
    assert_eq!(stats.max_connections, 10);
    assert_eq!(stats.min_connections, 2);
}

/// A failing dial during warm_up surfaces instead of being swallowed;
/// startup is the right moment to learn the server is unreachable.
#[tokio::test]
async fn test_warm_up_surfaces_dial_failure() {
    let pool = SqlPool::new(settings(2, 10), FakeFactory::failing_first(1));
    assert!(matches!(
        pool.warm_up().await,
        Err(DbError::ConnectionUnavailable { .. })
    ));
}

/// Released connections are reused instead of redialed.
#[tokio::test]
async fn test_acquire_reuses_idle_connection() {
    let factory = FakeFactory::new();
    let dials = factory.dials.clone();
    let pool = SqlPool::new(settings(0, 4), factory);

    let lease = pool.acquire().await.unwrap();
    let first_id = lease.id();
    lease.release().await;

    let lease = pool.acquire().await.unwrap();
    assert_eq!(lease.id(), first_id, "idle connection should be reused");
    lease.release().await;

    assert_eq!(dials.load(Ordering::SeqCst), 1, "exactly one dial expected");
}

/// The idle stack is LIFO: the most recently used connection goes out
/// first, letting older ones age toward recycling.
#[tokio::test]
async fn test_idle_stack_is_lifo() {
    let pool = SqlPool::new(settings(2, 4), FakeFactory::new());
    pool.warm_up().await.unwrap();

    // warm_up pushed ids 1 then 2; the stack top is 2
    let lease = pool.acquire().await.unwrap();
    assert_eq!(lease.id(), 2);
    lease.release().await;
}

/// With every connection leased, acquire waits and then reports
/// exhaustion; the cap is never exceeded to serve the extra caller.
#[tokio::test]
async fn test_exhausted_pool_rejects_after_timeout() {
    let mut config = settings(0, 2);
    config.acquire_timeout = Duration::from_millis(100);
    let pool = SqlPool::new(config, FakeFactory::new());

    let a = pool.acquire().await.unwrap();
    let b = pool.acquire().await.unwrap();

    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, DbError::PoolExhausted { .. }));
    assert!(err.is_retryable());

    let stats = pool.stats().await;
    assert_eq!(stats.total_connections, 2, "cap must hold under pressure");

    a.release().await;
    b.release().await;
}

/// A parked waiter is served as soon as the holder releases.
#[tokio::test]
async fn test_waiter_served_after_release() {
    let pool = SqlPool::new(settings(0, 1), FakeFactory::new());

    let holder = pool.acquire().await.unwrap();
    let held_id = holder.id();

    let waiter_pool = pool.clone();
    let waiter = tokio::spawn(async move {
        let lease = waiter_pool.acquire().await.unwrap();
        let id = lease.id();
        lease.release().await;
        id
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    holder.release().await;

    let waiter_id = waiter.await.unwrap();
    assert_eq!(waiter_id, held_id, "waiter should get the released connection");
}

/// A lease marked broken is closed on release, never re-idled, and the
/// next acquire dials a fresh connection.
#[tokio::test]
async fn test_broken_lease_closed_not_reidled() {
    let factory = FakeFactory::new();
    let dials = factory.dials.clone();
    let closed = factory.closed.clone();
    let pool = SqlPool::new(settings(0, 4), factory);

    let mut lease = pool.acquire().await.unwrap();
    let broken_id = lease.id();
    lease.mark_broken();
    assert!(lease.is_broken());
    lease.release().await;

    assert_eq!(closed.load(Ordering::SeqCst), 1, "broken lease should be closed");
    let stats = pool.stats().await;
    assert_eq!(stats.total_connections, 0);
    assert_eq!(stats.available_connections, 0);

    let lease = pool.acquire().await.unwrap();
    assert_ne!(lease.id(), broken_id, "broken connection must not come back");
    assert_eq!(dials.load(Ordering::SeqCst), 2);
    lease.release().await;
}

/// One failed dial is retried transparently within the same acquire.
#[tokio::test]
async fn test_single_dial_failure_retried() {
    let factory = FakeFactory::failing_first(1);
    let dials = factory.dials.clone();
    let pool = SqlPool::new(settings(0, 2), factory);

    let lease = pool.acquire().await.unwrap();
    assert_eq!(dials.load(Ordering::SeqCst), 2, "failure then retry");
    lease.release().await;
}

/// Two failed dials exhaust the single retry and surface as a
/// retryable connection error.
#[tokio::test]
async fn test_double_dial_failure_surfaces() {
    let factory = FakeFactory::failing_first(2);
    let dials = factory.dials.clone();
    let pool = SqlPool::new(settings(0, 2), factory);

    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, DbError::ConnectionUnavailable { .. }));
    assert!(err.is_retryable());
    assert_eq!(dials.load(Ordering::SeqCst), 2, "exactly one retry");
}

/// An idle connection past its validation interval is pinged before
/// handoff; a dead one is discarded and replaced within the same call.
#[tokio::test]
async fn test_stale_idle_connection_revalidated() {
    let factory = FakeFactory::new();
    let dials = factory.dials.clone();
    let fail_pings = factory.fail_pings.clone();
    let mut config = settings(0, 4);
    config.validation_interval = Duration::ZERO;
    let pool = SqlPool::new(config, factory);

    let lease = pool.acquire().await.unwrap();
    let first_id = lease.id();
    lease.release().await;

    // healthy ping: the same connection comes back
    let lease = pool.acquire().await.unwrap();
    assert_eq!(lease.id(), first_id);
    lease.release().await;

    // dead ping: the idle candidate is discarded and a new one dialed
    fail_pings.store(true, Ordering::SeqCst);
    let lease = pool.acquire().await.unwrap();
    assert_ne!(lease.id(), first_id, "dead idle connection must be replaced");
    assert_eq!(dials.load(Ordering::SeqCst), 2);

    let stats = pool.stats().await;
    assert_eq!(stats.total_connections, 1, "discard must not leak the count");
    lease.release().await;
}

/// A connection past max_lifetime is not handed out again.
#[tokio::test]
async fn test_expired_connection_recycled_on_acquire() {
    let factory = FakeFactory::new();
    let dials = factory.dials.clone();
    let mut config = settings(0, 4);
    config.max_lifetime = Duration::from_millis(40);
    let pool = SqlPool::new(config, factory);

    let lease = pool.acquire().await.unwrap();
    let first_id = lease.id();
    lease.release().await;

    tokio::time::sleep(Duration::from_millis(80)).await;

    let lease = pool.acquire().await.unwrap();
    assert_ne!(lease.id(), first_id, "expired connection must be recycled");
    assert_eq!(dials.load(Ordering::SeqCst), 2);
    assert_eq!(pool.stats().await.total_connections, 1);
    lease.release().await;
}

/// A connection idle past idle_timeout is pruned at the next acquire.
#[tokio::test]
async fn test_idle_timeout_prunes_parked_connection() {
    let factory = FakeFactory::new();
    let dials = factory.dials.clone();
    let mut config = settings(0, 4);
    config.idle_timeout = Duration::from_millis(40);
    let pool = SqlPool::new(config, factory);

    let lease = pool.acquire().await.unwrap();
    let first_id = lease.id();
    lease.release().await;

    tokio::time::sleep(Duration::from_millis(80)).await;

    let lease = pool.acquire().await.unwrap();
    assert_ne!(lease.id(), first_id, "idle-expired connection must be pruned");
    assert_eq!(dials.load(Ordering::SeqCst), 2);
    lease.release().await;
}

/// A lease returned past max_lifetime is closed instead of re-idled.
#[tokio::test]
async fn test_over_lifetime_lease_closed_on_release() {
    let factory = FakeFactory::new();
    let closed = factory.closed.clone();
    let mut config = settings(0, 4);
    config.max_lifetime = Duration::from_millis(40);
    let pool = SqlPool::new(config, factory);

    let lease = pool.acquire().await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    lease.release().await;

    assert_eq!(closed.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().await.available_connections, 0);
}

/// Dropping a lease without release still returns it to the pool
/// through the Drop hook.
#[tokio::test]
async fn test_dropped_lease_restored_in_background() {
    let pool = SqlPool::new(settings(0, 2), FakeFactory::new());

    let lease = pool.acquire().await.unwrap();
    drop(lease);

    // restore happens on a spawned task; poll briefly
    for _ in 0..50 {
        if pool.stats().await.available_connections == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(pool.stats().await.available_connections, 1);
}

/// shutdown closes idle connections and fails later acquires fast.
#[tokio::test]
async fn test_shutdown_closes_idle_and_rejects_acquire() {
    let factory = FakeFactory::new();
    let closed = factory.closed.clone();
    let pool = SqlPool::new(settings(2, 4), factory);
    pool.warm_up().await.unwrap();

    pool.shutdown(Duration::from_millis(100)).await;

    assert_eq!(closed.load(Ordering::SeqCst), 2, "idle connections closed");
    assert_eq!(pool.stats().await.total_connections, 0);

    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, DbError::PoolClosed));
}

/// shutdown wakes parked waiters with PoolClosed and closes in-flight
/// leases as they come back during the grace window.
#[tokio::test]
async fn test_shutdown_drains_holders_and_fails_waiters() {
    let factory = FakeFactory::new();
    let closed = factory.closed.clone();
    let pool = SqlPool::new(settings(0, 1), factory);

    let holder = pool.acquire().await.unwrap();

    let waiter_pool = pool.clone();
    let waiter = tokio::spawn(async move { waiter_pool.acquire().await });

    tokio::time::sleep(Duration::from_millis(50)).await;

    let shutdown_pool = pool.clone();
    let shutdown = tokio::spawn(async move {
        shutdown_pool.shutdown(Duration::from_secs(2)).await;
    });

    // the waiter is parked on the permit queue; closing the semaphore
    // must wake it with a terminal error
    let waiter_err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(waiter_err, DbError::PoolClosed));

    // returning the held lease during the grace window closes it
    tokio::time::sleep(Duration::from_millis(50)).await;
    holder.release().await;

    shutdown.await.unwrap();
    assert_eq!(closed.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().await.total_connections, 0);
}

/// No connection is ever leased to two tasks at once, under real
/// scheduler interleaving.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_duplicate_handoff_under_concurrency() {
    let pool = SqlPool::new(settings(0, 4), FakeFactory::new());
    let leased: Arc<Mutex<HashSet<u64>>> = Arc::new(Mutex::new(HashSet::new()));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let pool = pool.clone();
        let leased = leased.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..20 {
                let lease = pool.acquire().await.unwrap();
                let id = lease.id();
                {
                    let mut out = leased.lock().unwrap();
                    assert!(out.insert(id), "connection {id} leased twice");
                }
                let pause = rand::thread_rng().gen_range(1..4);
                tokio::time::sleep(Duration::from_millis(pause)).await;
                {
                    let mut out = leased.lock().unwrap();
                    out.remove(&id);
                }
                lease.release().await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
}

/// Occupancy never exceeds the configured bounds while tasks churn.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stats_stay_within_bounds_under_churn() {
    let pool = SqlPool::new(settings(1, 3), FakeFactory::new());
    pool.warm_up().await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..6 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..15 {
                let lease = pool.acquire().await.unwrap();
                let pause = rand::thread_rng().gen_range(1..3);
                tokio::time::sleep(Duration::from_millis(pause)).await;
                lease.release().await;
            }
        }));
    }

    let sampler_pool = pool.clone();
    let sampler = tokio::spawn(async move {
        for _ in 0..40 {
            let stats = sampler_pool.stats().await;
            assert!(
                stats.total_connections <= stats.max_connections,
                "total {} exceeded max {}",
                stats.total_connections,
                stats.max_connections
            );
            assert!(stats.available_connections <= stats.max_connections);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    });

    for task in tasks {
        task.await.unwrap();
    }
    sampler.await.unwrap();
}
