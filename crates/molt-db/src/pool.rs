//! A hand-rolled bounded connection pool with FIFO-fair acquire, in the
//! custom-pool style of `pgcat`/`pg_doorman` rather than wrapping
//! `bb8`/`deadpool`: those crates don't expose the exact
//! `Busy`-on-`max_wait_ms` / cooperative-cancel / protocol-cancel split
//! this worker needs.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tracing::debug;

use crate::cancel::CancelToken;
use crate::config::PoolConfig;
use crate::connection::DbConnection;
use crate::error::DbError;

/// How often a queued acquire re-polls the cooperative cancel token while
/// racing against `max_wait_ms` — the pool has no way to be woken by a
/// cancellation, only to notice it at its own yield points.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(20);

type Connector<C> =
    Box<dyn Fn() -> Pin<Box<dyn Future<Output = Result<C, DbError>> + Send>> + Send + Sync>;

struct IdleSlot<C> {
    conn: C,
    idle_since: Instant,
}

struct Inner<C> {
    idle: AsyncMutex<VecDeque<IdleSlot<C>>>,
    semaphore: Semaphore,
    connector: Connector<C>,
    config: PoolConfig,
    in_flight: AtomicUsize,
    waiters: AtomicUsize,
}

/// A bounded pool of `C: DbConnection`. Cheap to clone (shares one `Arc`).
pub struct Pool<C: DbConnection + 'static> {
    inner: Arc<Inner<C>>,
}

impl<C: DbConnection + 'static> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<C: DbConnection + 'static> Pool<C> {
    pub fn new<F, Fut>(config: PoolConfig, connector: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<C, DbError>> + Send + 'static,
    {
        let inner = Arc::new(Inner {
            idle: AsyncMutex::new(VecDeque::new()),
            semaphore: Semaphore::new(config.max_conns),
            connector: Box::new(move || Box::pin(connector())),
            config,
            in_flight: AtomicUsize::new(0),
            waiters: AtomicUsize::new(0),
        });
        Self { inner }
    }

    /// Current number of checked-out connections.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Relaxed)
    }

    /// Current number of callers queued waiting for a permit.
    pub fn waiters(&self) -> usize {
        self.inner.waiters.load(Ordering::Relaxed)
    }

    /// Current number of idle (checked-in, ready-to-reuse) connections.
    pub async fn idle_count(&self) -> usize {
        self.inner.idle.lock().await.len()
    }

    /// The configuration this pool was built with, so callers (e.g. the
    /// query helpers) can read `query_timeout` without threading it through
    /// separately.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Acquires a connection, waiting up to `max_wait_ms` in FIFO order for
    /// a permit. Races the wait against the caller's cancel token: a
    /// cancellation observed before a permit is granted returns
    /// `DbError::Cancelled`; running out the clock first returns
    /// `DbError::Busy`.
    pub async fn acquire(&self, cancel: &CancelToken) -> Result<PoolGuard<C>, DbError> {
        self.inner.waiters.fetch_add(1, Ordering::SeqCst);
        let result = self.acquire_inner(cancel).await;
        self.inner.waiters.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn acquire_inner(&self, cancel: &CancelToken) -> Result<PoolGuard<C>, DbError> {
        let acquire = self.inner.semaphore.clone().acquire_owned();
        tokio::pin!(acquire);

        let deadline = Instant::now() + self.inner.config.max_wait;
        let permit = loop {
            if cancel.is_cancelled() {
                return Err(DbError::Cancelled);
            }
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) if !remaining.is_zero() => remaining,
                _ => return Err(DbError::Busy),
            };
            let tick = CANCEL_POLL_INTERVAL.min(remaining);
            match tokio::time::timeout(tick, &mut acquire).await {
                Ok(Ok(permit)) => break permit,
                Ok(Err(_)) => return Err(DbError::Internal("pool closed".to_string())),
                Err(_) => continue,
            }
        };

        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);

        let slot = self.inner.idle.lock().await.pop_front();
        let conn = match slot {
            Some(slot) if slot.idle_since.elapsed() < self.inner.config.max_idle => slot.conn,
            Some(_stale) => (self.inner.connector)().await?,
            None => (self.inner.connector)().await?,
        };

        Ok(PoolGuard {
            pool: self.clone(),
            conn: Some(conn),
            permit: Some(permit),
        })
    }

    /// Returns a connection to the idle queue and only then releases the
    /// semaphore permit that guarded it — releasing the permit first would
    /// let a concurrent `acquire` claim the freed capacity before the
    /// connection is actually back in `idle`, observe an empty queue, and
    /// open a brand-new connection, pushing live connections past
    /// `max_conns`.
    fn check_in(&self, conn: C, permit: tokio::sync::OwnedSemaphorePermit)
    where
        C: Send,
    {
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.idle.lock().await.push_back(IdleSlot {
                conn,
                idle_since: Instant::now(),
            });
            drop(permit);
        });
    }

    /// Eagerly connects up to `min_conns` idle connections so the pool
    /// starts warm rather than lazily paying connect latency on the first
    /// `min_conns` acquires. Best-effort: a connect failure here is logged
    /// and otherwise ignored, since a later `acquire` will retry and
    /// surface the error to its caller instead.
    pub async fn prewarm(&self)
    where
        C: Send,
    {
        let target = self.inner.config.min_conns;
        for _ in 0..target {
            if self.inner.idle.lock().await.len() + self.in_flight() >= target {
                break;
            }
            match (self.inner.connector)().await {
                Ok(conn) => {
                    self.inner.idle.lock().await.push_back(IdleSlot {
                        conn,
                        idle_since: Instant::now(),
                    });
                }
                Err(err) => {
                    debug!(error = %err, "prewarm connect failed; leaving pool below min_conns");
                    break;
                }
            }
        }
    }

    /// Spawns a background task that periodically health-checks and evicts
    /// idle connections older than `max_idle_ms`. Intended to be called
    /// once per pool at worker startup.
    pub fn spawn_reaper(&self)
    where
        C: Send,
    {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(inner.config.health_check_interval);
            loop {
                interval.tick().await;
                let mut idle = inner.idle.lock().await;
                // Never reap below min_conns total live connections; the
                // in-flight count doesn't change across this pass.
                let floor = inner
                    .config
                    .min_conns
                    .saturating_sub(inner.in_flight.load(Ordering::Relaxed));
                let mut keep = VecDeque::with_capacity(idle.len());
                while let Some(mut slot) = idle.pop_front() {
                    let remaining_after_evict = keep.len() + idle.len();
                    if slot.idle_since.elapsed() > inner.config.max_idle && remaining_after_evict >= floor {
                        debug!("evicting idle connection past max_idle_ms");
                        continue;
                    }
                    if slot.conn.health_check().await {
                        keep.push_back(slot);
                    } else {
                        debug!("evicting idle connection that failed health check");
                    }
                }
                *idle = keep;
            }
        });
    }
}

/// A single checked-out connection. Returns the connection to the idle
/// queue on drop rather than closing it, unless the pool is shrinking.
pub struct PoolGuard<C: DbConnection + 'static> {
    pool: Pool<C>,
    conn: Option<C>,
    permit: Option<tokio::sync::OwnedSemaphorePermit>,
}

impl<C: DbConnection + 'static> std::ops::Deref for PoolGuard<C> {
    type Target = C;
    fn deref(&self) -> &C {
        self.conn.as_ref().expect("connection taken before drop")
    }
}

impl<C: DbConnection + 'static> std::ops::DerefMut for PoolGuard<C> {
    fn deref_mut(&mut self) -> &mut C {
        self.conn.as_mut().expect("connection taken before drop")
    }
}

impl<C: DbConnection + 'static> PoolGuard<C> {
    /// Discards the held connection instead of returning it to the idle
    /// queue on drop. Used after a cancelled or timed-out query, where the
    /// connection may still be mid-protocol-cancel and unsafe to hand to
    /// the next acquirer.
    pub fn invalidate(&mut self) {
        self.conn.take();
    }
}

impl<C: DbConnection + 'static> Drop for PoolGuard<C> {
    fn drop(&mut self) {
        match (self.conn.take(), self.permit.take()) {
            (Some(conn), Some(permit)) => self.pool.check_in(conn, permit),
            _ => {
                self.pool.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::fake::FakeConnection;
    use crate::value::QueryResult;

    fn test_config(max_conns: usize, max_wait_ms: u64) -> PoolConfig {
        PoolConfig {
            max_conns,
            max_wait: Duration::from_millis(max_wait_ms),
            ..PoolConfig::default()
        }
    }

    #[tokio::test]
    async fn acquire_reuses_checked_in_connections() {
        let pool = Pool::new(test_config(1, 200), || async { Ok(FakeConnection::default()) });
        let cancel = CancelToken::new();
        {
            let _guard = pool.acquire(&cancel).await.unwrap();
            assert_eq!(pool.in_flight(), 1);
        }
        assert_eq!(pool.in_flight(), 0);
        assert_eq!(pool.idle_count().await, 1);
        let _guard = pool.acquire(&cancel).await.unwrap();
        assert_eq!(pool.in_flight(), 1);
    }

    #[tokio::test]
    async fn acquire_returns_busy_once_max_wait_elapses() {
        let pool = Pool::new(test_config(1, 50), || async { Ok(FakeConnection::default()) });
        let cancel = CancelToken::new();
        let _held = pool.acquire(&cancel).await.unwrap();

        let result = tokio::time::timeout(Duration::from_millis(500), pool.acquire(&cancel)).await;
        match result {
            Ok(Err(DbError::Busy)) => {}
            Ok(Err(other)) => panic!("expected Busy, got {other:?}"),
            Ok(Ok(_)) => panic!("expected Busy, got a connection"),
            Err(_) => panic!("acquire should have returned Busy well within the outer timeout"),
        }
    }

    #[tokio::test]
    async fn acquire_observes_cancellation_before_a_permit_is_available() {
        let pool = Pool::new(test_config(1, 5_000), || async { Ok(FakeConnection::default()) });
        let cancel = CancelToken::new();
        let _held = pool.acquire(&cancel).await.unwrap();

        let waiter_cancel = cancel.clone();
        let waiter = tokio::spawn(async move {
            let pool2 = pool.clone();
            pool2.acquire(&waiter_cancel).await
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(DbError::Cancelled)));
    }

    #[tokio::test]
    async fn invalidated_connections_are_not_returned_to_idle() {
        let pool = Pool::new(test_config(2, 200), || async { Ok(FakeConnection::default()) });
        let cancel = CancelToken::new();
        {
            let mut guard = pool.acquire(&cancel).await.unwrap();
            guard.invalidate();
        }
        assert_eq!(pool.in_flight(), 0);
        assert_eq!(pool.idle_count().await, 0);
    }

    #[tokio::test]
    async fn concurrent_acquire_after_drop_reuses_checked_in_connection() {
        let connect_count = Arc::new(AtomicUsize::new(0));
        let counter = connect_count.clone();
        let pool = Pool::new(test_config(1, 500), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(FakeConnection::default())
            }
        });
        let cancel = CancelToken::new();
        let guard = pool.acquire(&cancel).await.unwrap();

        let pool2 = pool.clone();
        let cancel2 = cancel.clone();
        let waiter = tokio::spawn(async move { pool2.acquire(&cancel2).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(guard);

        let _second = waiter.await.unwrap().unwrap();
        assert_eq!(
            connect_count.load(Ordering::SeqCst),
            1,
            "the checked-in connection must be reused rather than a second one opened"
        );
    }

    #[tokio::test]
    async fn prewarm_fills_idle_slots_up_to_min_conns() {
        let pool = Pool::new(
            PoolConfig { min_conns: 3, max_conns: 5, ..PoolConfig::default() },
            || async { Ok(FakeConnection::default()) },
        );
        pool.prewarm().await;
        assert_eq!(pool.idle_count().await, 3);
        assert_eq!(pool.in_flight(), 0);
    }

    #[allow(dead_code)]
    fn assert_query_result_shape(_: QueryResult) {}
}
