//! A generic bounded pool of reusable backend handles.
//!
//! The pool is parameterized by a [`Manager`] that knows how to open a fresh
//! handle and how to probe one for liveness. Database connections and RPC
//! stubs both go through here; only the database variant runs the periodic
//! maintenance pass.
//!
//! Locking rule: the pool mutex is never held across a network operation.
//! Handles are popped under the lock, probed or replaced unlocked, then
//! pushed back under the lock. The mutex is a `std::sync::Mutex`, so holding
//! its guard across an `.await` would not compile in a spawned task.

use crate::{Error, Result};
use std::collections::VecDeque;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// A handle idle for at least this long gets a liveness probe on the next
/// maintenance pass.
const STALE_AFTER_SECS: u64 = 5;

/// Connection-specific behaviour plugged into [`Pool`].
pub trait Manager: Send + Sync + 'static {
    type Conn: Send + 'static;

    /// Open a fresh handle.
    fn connect(&self) -> impl Future<Output = Result<Self::Conn>> + Send;

    /// Cheap liveness probe, e.g. a ping.
    fn check(&self, conn: &mut Self::Conn) -> impl Future<Output = Result<()>> + Send;
}

struct Idle<C> {
    conn: C,
    /// Seconds since the epoch of the last successful operation.
    last_used: u64,
}

struct PoolState<C> {
    idle: VecDeque<Idle<C>>,
    /// Handles alive anywhere: idle here plus borrowed by callers.
    total: usize,
}

struct PoolInner<M: Manager> {
    manager: M,
    size: usize,
    state: Mutex<PoolState<M::Conn>>,
    /// Woken once per returned handle, and broadcast on close.
    notify: Notify,
    closed: AtomicBool,
}

/// Bounded, thread-safe pool of reusable handles.
///
/// Cloning is shallow; all clones share the same handles.
pub struct Pool<M: Manager> {
    inner: Arc<PoolInner<M>>,
}

impl<M: Manager> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Pool {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: Manager> std::fmt::Debug for Pool<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("size", &self.inner.size)
            .field("idle", &self.idle_count())
            .finish()
    }
}

impl<M: Manager> Pool<M> {
    /// Create a pool that opens handles lazily, up to `size`.
    pub fn new(manager: M, size: usize) -> Pool<M> {
        assert!(size > 0, "pool needs room for at least one handle");
        Pool {
            inner: Arc::new(PoolInner {
                manager,
                size,
                state: Mutex::new(PoolState {
                    idle: VecDeque::with_capacity(size),
                    total: 0,
                }),
                notify: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Create a pool and eagerly open all `size` handles.
    ///
    /// Fails if any of the initial connects fails, so a misconfigured backend
    /// is caught at startup rather than on first use.
    pub async fn connect(manager: M, size: usize) -> Result<Pool<M>> {
        let pool = Pool::new(manager, size);
        let now = now_secs();
        for _ in 0..size {
            let conn = pool.inner.manager.connect().await?;
            let mut state = pool.inner.state.lock().unwrap();
            state.idle.push_back(Idle { conn, last_used: now });
            state.total += 1;
        }
        Ok(pool)
    }

    /// Borrow a handle, waiting until one is idle or the pool closes.
    ///
    /// When every handle is borrowed and the pool is below capacity, a fresh
    /// one is opened; a connect failure surfaces to this caller and leaves
    /// the capacity for the next one.
    pub async fn acquire(&self) -> Result<PooledConn<M>> {
        loop {
            // Register for a wakeup before looking at the state, so a release
            // or close that lands in between is not missed.
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.closed.load(Ordering::Acquire) {
                return Err(Error::PoolClosed);
            }

            let open_fresh = {
                let mut state = self.inner.state.lock().unwrap();
                if let Some(idle) = state.idle.pop_front() {
                    return Ok(self.guard(idle.conn));
                }
                if state.total < self.inner.size {
                    state.total += 1;
                    true
                } else {
                    false
                }
            };

            if open_fresh {
                match self.inner.manager.connect().await {
                    Ok(conn) => return Ok(self.guard(conn)),
                    Err(e) => {
                        self.inner.state.lock().unwrap().total -= 1;
                        self.inner.notify.notify_one();
                        return Err(e);
                    }
                }
            }

            notified.await;
        }
    }

    /// Stop the pool: subsequent and waiting `acquire` calls get
    /// [`Error::PoolClosed`], and returned handles are dropped.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    pub fn idle_count(&self) -> usize {
        self.inner.state.lock().unwrap().idle.len()
    }

    /// Handles currently borrowed by callers.
    pub fn borrowed_count(&self) -> usize {
        let state = self.inner.state.lock().unwrap();
        state.total - state.idle.len()
    }

    /// Run the maintenance pass every `period` until the pool closes.
    ///
    /// Intended for database pools; RPC stub pools heal through
    /// [`PooledConn::discard`] plus lazy reconnect instead.
    pub fn spawn_maintenance(&self, period: Duration) -> tokio::task::JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; the pool was just filled.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if pool.is_closed() {
                    break;
                }
                pool.maintain(now_secs()).await;
            }
            debug!("pool maintenance stopped");
        })
    }

    /// One maintenance pass: probe stale idle handles, replace the dead.
    ///
    /// Takes a snapshot of the idle count first and processes at most that
    /// many handles, so handles released mid-pass are not re-probed forever.
    pub(crate) async fn maintain(&self, now: u64) {
        let target = self.inner.state.lock().unwrap().idle.len();
        let mut processed = 0;
        let mut failed = 0usize;

        while processed < target {
            let popped = self.inner.state.lock().unwrap().idle.pop_front();
            let Some(mut idle) = popped else { break };
            processed += 1;

            if now.saturating_sub(idle.last_used) < STALE_AFTER_SECS {
                self.push_idle(idle);
                continue;
            }

            // Probe with no lock held.
            match self.inner.manager.check(&mut idle.conn).await {
                Ok(()) => {
                    idle.last_used = now;
                    self.push_idle(idle);
                }
                Err(e) => {
                    warn!(error = %e, "dropping dead pooled handle");
                    self.inner.state.lock().unwrap().total -= 1;
                    failed += 1;
                }
            }
        }

        // Replace what was dropped; the first connect failure ends the pass
        // and leaves the remainder for the next cycle.
        while failed > 0 {
            match self.inner.manager.connect().await {
                Ok(conn) => {
                    {
                        let mut state = self.inner.state.lock().unwrap();
                        if state.total < self.inner.size {
                            state.total += 1;
                            state.idle.push_back(Idle {
                                conn,
                                last_used: now,
                            });
                        }
                    }
                    self.inner.notify.notify_one();
                    failed -= 1;
                }
                Err(e) => {
                    warn!(error = %e, remaining = failed, "reconnect failed, retrying next cycle");
                    break;
                }
            }
        }
    }

    fn push_idle(&self, idle: Idle<M::Conn>) {
        self.inner.state.lock().unwrap().idle.push_back(idle);
        self.inner.notify.notify_one();
    }

    fn guard(&self, conn: M::Conn) -> PooledConn<M> {
        PooledConn {
            conn: Some(conn),
            inner: Arc::clone(&self.inner),
        }
    }
}

/// A borrowed handle. Returns itself to the pool on drop.
pub struct PooledConn<M: Manager> {
    conn: Option<M::Conn>,
    inner: Arc<PoolInner<M>>,
}

impl<M: Manager> PooledConn<M> {
    /// Drop the underlying handle instead of returning it.
    ///
    /// Frees the capacity so the next `acquire` opens a fresh handle. Callers
    /// use this after an error that leaves the handle unusable.
    pub fn discard(mut self) {
        if self.conn.take().is_some() {
            self.inner.state.lock().unwrap().total -= 1;
            self.inner.notify.notify_one();
        }
    }
}

impl<M: Manager> Deref for PooledConn<M> {
    type Target = M::Conn;

    fn deref(&self) -> &M::Conn {
        // Only `discard` and `drop` take the handle out.
        self.conn.as_ref().expect("pooled handle already released")
    }
}

impl<M: Manager> DerefMut for PooledConn<M> {
    fn deref_mut(&mut self) -> &mut M::Conn {
        self.conn.as_mut().expect("pooled handle already released")
    }
}

impl<M: Manager> Drop for PooledConn<M> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else { return };

        if self.inner.closed.load(Ordering::Acquire) {
            // Closed pool: the handle is dropped, not recycled.
            let mut state = self.inner.state.lock().unwrap();
            state.total -= 1;
            return;
        }

        let mut state = self.inner.state.lock().unwrap();
        state.idle.push_back(Idle {
            conn,
            last_used: now_secs(),
        });
        drop(state);
        self.inner.notify.notify_one();
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct TestManager {
        next_id: AtomicUsize,
        fail_connect: AtomicBool,
        fail_check: AtomicBool,
    }

    impl TestManager {
        fn new() -> TestManager {
            TestManager {
                next_id: AtomicUsize::new(0),
                fail_connect: AtomicBool::new(false),
                fail_check: AtomicBool::new(false),
            }
        }
    }

    impl Manager for TestManager {
        type Conn = usize;

        async fn connect(&self) -> Result<usize> {
            if self.fail_connect.load(Ordering::SeqCst) {
                return Err(Error::Cache("connection refused".into()));
            }
            Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
        }

        async fn check(&self, _conn: &mut usize) -> Result<()> {
            if self.fail_check.load(Ordering::SeqCst) {
                return Err(Error::Cache("ping failed".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_conservation_and_blocking_acquire() {
        let pool = Pool::connect(TestManager::new(), 2).await.unwrap();
        assert_eq!(pool.idle_count(), 2);
        assert_eq!(pool.borrowed_count(), 0);

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.borrowed_count(), 2);

        // Third caller must block until a handle comes back.
        let waited = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(waited.is_err(), "acquire returned with an exhausted pool");

        drop(a);
        let c = pool.acquire().await.unwrap();
        assert_eq!(pool.borrowed_count(), 2);

        drop(b);
        drop(c);
        assert_eq!(pool.idle_count(), 2);
        assert_eq!(pool.borrowed_count(), 0);
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let pool = Pool::connect(TestManager::new(), 1).await.unwrap();
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };
        // Let the waiter park on the notify.
        tokio::task::yield_now().await;

        pool.close();
        let got = waiter.await.unwrap();
        assert!(matches!(got, Err(Error::PoolClosed)));

        // A handle returned after close is dropped, not recycled.
        drop(held);
        assert_eq!(pool.idle_count(), 0);
        assert!(matches!(pool.acquire().await, Err(Error::PoolClosed)));
    }

    #[tokio::test]
    async fn test_discard_frees_capacity_for_a_fresh_handle() {
        let pool = Pool::connect(TestManager::new(), 1).await.unwrap();
        let first = pool.acquire().await.unwrap();
        let first_id = *first;

        first.discard();
        let second = pool.acquire().await.unwrap();
        assert_ne!(*second, first_id);
    }

    #[tokio::test]
    async fn test_connect_failure_surfaces_and_releases_capacity() {
        let manager = TestManager::new();
        manager.fail_connect.store(true, Ordering::SeqCst);
        let pool = Pool::new(manager, 1);

        assert!(pool.acquire().await.is_err());

        // Capacity was not leaked by the failed attempt.
        pool.inner.manager.fail_connect.store(false, Ordering::SeqCst);
        let conn = pool.acquire().await.unwrap();
        drop(conn);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_maintenance_replaces_dead_handles() {
        let pool = Pool::connect(TestManager::new(), 2).await.unwrap();
        let stale = now_secs() + STALE_AFTER_SECS + 1;

        // Both handles are stale and the backend is down: the pass drops both
        // and reconnects both once the backend recovers.
        pool.inner.manager.fail_check.store(true, Ordering::SeqCst);
        pool.inner.manager.fail_connect.store(true, Ordering::SeqCst);
        pool.maintain(stale).await;
        assert_eq!(pool.idle_count(), 0);

        pool.inner.manager.fail_connect.store(false, Ordering::SeqCst);
        // Lazy reconnect on acquire still works while maintenance lags.
        let conn = pool.acquire().await.unwrap();
        drop(conn);
        assert_eq!(pool.idle_count(), 1);

        pool.maintain(now_secs()).await;
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_maintenance_refreshes_healthy_stale_handles() {
        let pool = Pool::connect(TestManager::new(), 2).await.unwrap();
        let ids: Vec<usize> = {
            let a = pool.acquire().await.unwrap();
            let b = pool.acquire().await.unwrap();
            vec![*a, *b]
        };

        let stale = now_secs() + STALE_AFTER_SECS + 1;
        pool.maintain(stale).await;

        // Healthy handles survive the probe and stay the same handles.
        assert_eq!(pool.idle_count(), 2);
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert!(ids.contains(&*a));
        assert!(ids.contains(&*b));
    }

    #[tokio::test]
    async fn test_fresh_handles_are_not_probed() {
        let pool = Pool::connect(TestManager::new(), 1).await.unwrap();
        pool.inner.manager.fail_check.store(true, Ordering::SeqCst);

        // Just-released handle is younger than the staleness bar: the failing
        // probe must not even run.
        pool.maintain(now_secs()).await;
        assert_eq!(pool.idle_count(), 1);
    }
}
