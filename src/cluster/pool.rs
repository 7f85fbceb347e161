//! Per-node connection pool.
//!
//! Holds between `min` and `max` transport handles for one node. Idle
//! handles are kept most-recently-used first so the tail holds the
//! coldest handles; idle trimming inspects the tail without touching the
//! hot end. Checkout is bounded by a semaphore sized to `max`; what
//! happens when it is exhausted depends on [`MaxCommandAction`].

use crate::config::MaxCommandAction;
use crate::error::{ClientError, Result};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

struct IdleConnection<C> {
    conn: C,
    last_used: Instant,
}

pub struct ConnectionPool<C> {
    node: String,
    idle: Mutex<VecDeque<IdleConnection<C>>>,
    permits: Arc<Semaphore>,
    /// Open handles, idle plus checked out
    total: AtomicUsize,
    /// Callers parked in the delay queue
    waiting: AtomicUsize,
    min: usize,
    max: usize,
    action: MaxCommandAction,
    queue_limit: usize,
}

impl<C: Send> ConnectionPool<C> {
    pub fn new(
        node: impl Into<String>,
        min: usize,
        max: usize,
        action: MaxCommandAction,
        queue_limit: usize,
    ) -> Self {
        let max = max.max(1);
        Self {
            node: node.into(),
            idle: Mutex::new(VecDeque::with_capacity(max)),
            permits: Arc::new(Semaphore::new(max)),
            total: AtomicUsize::new(0),
            waiting: AtomicUsize::new(0),
            min: min.min(max),
            max,
            action,
            queue_limit,
        }
    }

    fn idle_list(&self) -> MutexGuard<'_, VecDeque<IdleConnection<C>>> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn min(&self) -> usize {
        self.min
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Open handles, idle plus checked out.
    pub fn open(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    pub fn idle(&self) -> usize {
        self.idle_list().len()
    }

    pub fn in_use(&self) -> usize {
        self.max - self.permits.available_permits()
    }

    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::Acquire)
    }

    /// Check out a handle, opening a new one with `connect` when no idle
    /// handle is available. `wait` bounds how long a blocked or delayed
    /// caller waits for a free slot.
    pub async fn acquire<F, Fut>(
        &self,
        connect: F,
        wait: Option<Duration>,
    ) -> Result<PooledConnection<'_, C>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C>>,
    {
        let permit = self.acquire_permit(wait).await?;

        if let Some(idle) = self.idle_list().pop_front() {
            return Ok(PooledConnection {
                pool: self,
                conn: Some(idle.conn),
                _permit: permit,
            });
        }

        let conn = connect().await?;
        self.total.fetch_add(1, Ordering::AcqRel);
        Ok(PooledConnection {
            pool: self,
            conn: Some(conn),
            _permit: permit,
        })
    }

    async fn acquire_permit(&self, wait: Option<Duration>) -> Result<OwnedSemaphorePermit> {
        match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => return Ok(permit),
            Err(TryAcquireError::Closed) => return Err(self.closed_error()),
            Err(TryAcquireError::NoPermits) => {}
        }

        match self.action {
            MaxCommandAction::Reject => Err(ClientError::CommandRejected {
                node: self.node.clone(),
                reason: format!("max connections ({}) reached", self.max),
            }),
            MaxCommandAction::Block => self.wait_for_permit(wait).await,
            MaxCommandAction::Delay => {
                let queued = self.waiting.fetch_add(1, Ordering::AcqRel) + 1;
                let _slot = QueueSlot(&self.waiting);
                if self.queue_limit > 0 && queued > self.queue_limit {
                    return Err(ClientError::CommandRejected {
                        node: self.node.clone(),
                        reason: format!("delay queue full ({})", self.queue_limit),
                    });
                }
                self.wait_for_permit(wait).await
            }
        }
    }

    /// An expired `wait` is a rejection; it never counts against the node.
    async fn wait_for_permit(&self, wait: Option<Duration>) -> Result<OwnedSemaphorePermit> {
        let acquire = Arc::clone(&self.permits).acquire_owned();
        let permit = match wait {
            Some(timeout) => tokio::time::timeout(timeout, acquire)
                .await
                .map_err(|_| ClientError::CommandRejected {
                    node: self.node.clone(),
                    reason: format!("no free connection slot within {:?}", timeout),
                })?,
            None => acquire.await,
        };
        permit.map_err(|_| self.closed_error())
    }

    fn closed_error(&self) -> ClientError {
        ClientError::Connection {
            node: self.node.clone(),
            message: "connection pool closed".to_string(),
        }
    }

    fn put_back(&self, conn: C) {
        if self.permits.is_closed() {
            drop(conn);
            self.forget();
            return;
        }
        self.idle_list().push_front(IdleConnection {
            conn,
            last_used: Instant::now(),
        });
    }

    fn forget(&self) {
        self.total.fetch_sub(1, Ordering::AcqRel);
    }

    /// Retire idle handles unused for at least `max_idle`, coldest first,
    /// never dropping below the pool minimum. Returns how many were closed.
    pub fn trim_idle(&self, max_idle: Duration) -> usize {
        let mut idle = self.idle_list();
        let mut closed = 0;
        while self.open() > self.min {
            match idle.back() {
                Some(tail) if tail.last_used.elapsed() >= max_idle => {
                    idle.pop_back();
                    self.forget();
                    closed += 1;
                }
                _ => break,
            }
        }
        closed
    }

    /// Open handles until the pool holds at least `min`. Stops early when
    /// every slot is checked out. Returns how many were opened.
    pub async fn fill_to_min<F, Fut>(&self, mut connect: F) -> Result<usize>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<C>>,
    {
        let mut opened = 0;
        while self.open() < self.min {
            let Ok(_permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                break;
            };
            let conn = connect().await?;
            self.total.fetch_add(1, Ordering::AcqRel);
            self.put_back(conn);
            opened += 1;
        }
        Ok(opened)
    }

    /// Refuse further checkouts and drop every idle handle. Handles still
    /// checked out are dropped when their holders finish.
    pub fn close(&self) -> usize {
        self.permits.close();
        let mut idle = self.idle_list();
        let closed = idle.len();
        idle.clear();
        self.total.fetch_sub(closed, Ordering::AcqRel);
        closed
    }
}

struct QueueSlot<'a>(&'a AtomicUsize);

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A checked-out handle. Return it with [`PooledConnection::release`];
/// dropping it (or calling [`PooledConnection::discard`]) closes it.
pub struct PooledConnection<'a, C: Send> {
    pool: &'a ConnectionPool<C>,
    conn: Option<C>,
    _permit: OwnedSemaphorePermit,
}

impl<C: Send> PooledConnection<'_, C> {
    pub fn get_mut(&mut self) -> &mut C {
        self.conn
            .as_mut()
            .unwrap_or_else(|| unreachable!("connection taken before drop"))
    }

    /// Return the handle to the pool for reuse.
    pub fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put_back(conn);
        }
    }

    /// Close the handle instead of reusing it.
    pub fn discard(mut self) {
        if self.conn.take().is_some() {
            self.pool.forget();
        }
    }
}

impl<C: Send> Drop for PooledConnection<'_, C> {
    fn drop(&mut self) {
        if self.conn.take().is_some() {
            self.pool.forget();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn pool(min: usize, max: usize, action: MaxCommandAction, queue: usize) -> ConnectionPool<u32> {
        ConnectionPool::new("A", min, max, action, queue)
    }

    #[tokio::test]
    async fn test_reuses_released_connection() {
        let pool = pool(0, 2, MaxCommandAction::Block, 0);
        let counter = AtomicU32::new(0);
        let opened = &counter;

        let mut conn = pool
            .acquire(move || async move { Ok(opened.fetch_add(1, Ordering::SeqCst)) }, None)
            .await
            .unwrap();
        assert_eq!(*conn.get_mut(), 0);
        conn.release();
        assert_eq!(pool.idle(), 1);

        let mut conn = pool
            .acquire(move || async move { Ok(opened.fetch_add(1, Ordering::SeqCst)) }, None)
            .await
            .unwrap();
        assert_eq!(*conn.get_mut(), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(pool.open(), 1);
        conn.discard();
        assert_eq!(pool.open(), 0);
        assert_eq!(pool.idle(), 0);
    }

    #[tokio::test]
    async fn test_reject_when_exhausted() {
        let pool = pool(0, 1, MaxCommandAction::Reject, 0);
        let held = pool.acquire(|| async { Ok(1) }, None).await.unwrap();
        let err = pool.acquire(|| async { Ok(2) }, None).await.err().unwrap();
        assert!(matches!(err, ClientError::CommandRejected { .. }));
        drop(held);
        assert_eq!(pool.open(), 0);
    }

    #[tokio::test]
    async fn test_block_wait_expires_as_rejection() {
        let pool = pool(0, 1, MaxCommandAction::Block, 0);
        let _held = pool.acquire(|| async { Ok(1) }, None).await.unwrap();
        let err = pool
            .acquire(|| async { Ok(2) }, Some(Duration::from_millis(20)))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ClientError::CommandRejected { .. }));
        assert!(!err.counts_toward_error_rate());
    }

    #[tokio::test]
    async fn test_block_waits_for_release() {
        let pool = Arc::new(pool(0, 1, MaxCommandAction::Block, 0));
        let held = pool.acquire(|| async { Ok(7) }, None).await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                let mut conn = pool
                    .acquire(|| async { Ok(8) }, Some(Duration::from_secs(5)))
                    .await
                    .unwrap();
                *conn.get_mut()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        held.release();
        assert_eq!(waiter.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_delay_queue_limit() {
        let pool = Arc::new(pool(0, 1, MaxCommandAction::Delay, 1));
        let held = pool.acquire(|| async { Ok(1) }, None).await.unwrap();

        let queued = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                pool.acquire(|| async { Ok(2) }, Some(Duration::from_secs(5)))
                    .await
                    .map(|c| c.release())
            })
        };
        while pool.waiting() == 0 {
            tokio::task::yield_now().await;
        }

        let err = pool.acquire(|| async { Ok(3) }, None).await.err().unwrap();
        assert!(matches!(err, ClientError::CommandRejected { .. }));

        held.release();
        assert!(queued.await.unwrap().is_ok());
        assert_eq!(pool.waiting(), 0);
    }

    #[tokio::test]
    async fn test_fill_and_trim() {
        let pool = pool(2, 4, MaxCommandAction::Block, 0);
        let opened = pool.fill_to_min(|| async { Ok(0) }).await.unwrap();
        assert_eq!(opened, 2);
        assert_eq!(pool.idle(), 2);

        let a = pool.acquire(|| async { Ok(1) }, None).await.unwrap();
        let b = pool.acquire(|| async { Ok(2) }, None).await.unwrap();
        let c = pool.acquire(|| async { Ok(3) }, None).await.unwrap();
        a.release();
        b.release();
        c.release();
        assert_eq!(pool.open(), 3);

        // Peak trimmed back toward the minimum, never below it.
        let closed = pool.trim_idle(Duration::ZERO);
        assert_eq!(closed, 1);
        assert_eq!(pool.open(), 2);
        assert_eq!(pool.trim_idle(Duration::ZERO), 0);
    }

    #[tokio::test]
    async fn test_close_refuses_checkout() {
        let pool = pool(0, 2, MaxCommandAction::Block, 0);
        pool.acquire(|| async { Ok(1) }, None).await.unwrap().release();
        assert_eq!(pool.close(), 1);
        assert_eq!(pool.open(), 0);
        let err = pool.acquire(|| async { Ok(2) }, None).await.err().unwrap();
        assert!(matches!(err, ClientError::Connection { .. }));
    }

    #[tokio::test]
    async fn test_release_after_close_drops_handle() {
        let pool = pool(0, 2, MaxCommandAction::Block, 0);
        let held = pool.acquire(|| async { Ok(1) }, None).await.unwrap();
        assert_eq!(pool.close(), 0);
        assert_eq!(pool.open(), 1);

        held.release();
        assert_eq!(pool.idle(), 0);
        assert_eq!(pool.open(), 0);
    }
}
