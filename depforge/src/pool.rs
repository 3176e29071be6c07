//! Worker slot pool.
//!
//! The pool bounds how many actions *run* at once without owning any
//! threads itself: the async runtime supplies execution, the pool supplies
//! slots. A job holds one [`PoolSlot`] while it is doing work and drops it
//! across suspension points (dependency builds, resource waits, fences), so
//! a suspended action never counts against the limit.
//!
//! Slot waiters are served priority-first and FIFO within a priority class,
//! using a monotonic sequence number. [`JobPriority::Resume`] lets a failed
//! or interrupted action re-enter ahead of fresh work so its error surfaces
//! promptly.
//!
//! `Pool` is a cheap handle: clones share the same slots, job counter and
//! cancellation token.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Scheduling class for slot acquisition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum JobPriority {
    /// Fresh work.
    Normal,
    /// Re-entry of an already-running action; served before fresh work.
    Resume,
}

struct SlotWaiter {
    priority: JobPriority,
    seq: u64,
    tx: oneshot::Sender<()>,
}

impl PartialEq for SlotWaiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for SlotWaiter {}

impl Ord for SlotWaiter {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: higher priority first, then lower sequence (FIFO).
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for SlotWaiter {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

struct PoolState {
    limit: usize,
    active: usize,
    waiters: BinaryHeap<SlotWaiter>,
    seq: u64,
}

struct PoolInner {
    state: Mutex<PoolState>,
    jobs: AtomicUsize,
    idle: Notify,
    cancel: CancellationToken,
}

impl PoolInner {
    /// Releases one slot, handing it to the best waiter if any.
    fn release_slot(&self) {
        let mut state = self.state.lock().expect("pool lock poisoned");
        if state.active > state.limit {
            // Capacity was lowered while we ran; absorb the overshoot.
            state.active -= 1;
            return;
        }
        loop {
            match state.waiters.pop() {
                Some(waiter) => {
                    if waiter.tx.send(()).is_ok() {
                        // Slot transferred; `active` is unchanged.
                        return;
                    }
                    // Waiter gave up; try the next one.
                }
                None => {
                    state.active -= 1;
                    return;
                }
            }
        }
    }

    fn job_finished(&self) {
        if self.jobs.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Bounded cooperative slot pool.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Creates a pool with `limit` concurrent slots.
    ///
    /// # Panics
    ///
    /// Panics if `limit` is 0.
    pub fn new(limit: usize) -> Self {
        assert!(limit > 0, "pool limit must be > 0");
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    limit,
                    active: 0,
                    waiters: BinaryHeap::new(),
                    seq: 0,
                }),
                jobs: AtomicUsize::new(0),
                idle: Notify::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Acquires a slot, waiting behind higher-priority and earlier waiters.
    pub async fn acquire(&self, priority: JobPriority) -> PoolSlot {
        let rx = {
            let mut state = self.inner.state.lock().expect("pool lock poisoned");
            if state.active < state.limit && state.waiters.is_empty() {
                state.active += 1;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.seq += 1;
                let seq = state.seq;
                state.waiters.push(SlotWaiter { priority, seq, tx });
                Some(rx)
            }
        };
        if let Some(rx) = rx {
            // The granter has already accounted the slot to us.
            rx.await.expect("pool dropped while waiting for a slot");
        }
        PoolSlot {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Temporarily raises the concurrency limit by one. The caller must
    /// later restore it with [`Pool::decrease`].
    pub fn increase(&self) {
        let mut state = self.inner.state.lock().expect("pool lock poisoned");
        state.limit += 1;
        debug!(limit = state.limit, "pool capacity raised");
        while state.active < state.limit {
            match state.waiters.pop() {
                Some(waiter) => {
                    if waiter.tx.send(()).is_ok() {
                        state.active += 1;
                    }
                }
                None => break,
            }
        }
    }

    /// Restores a limit previously raised with [`Pool::increase`].
    pub fn decrease(&self) {
        let mut state = self.inner.state.lock().expect("pool lock poisoned");
        debug_assert!(state.limit > 0);
        state.limit -= 1;
        debug!(limit = state.limit, "pool capacity restored");
    }

    /// Submits a job. The job is responsible for acquiring its own slot; the
    /// pool only tracks outstanding work for [`Pool::wait_idle`].
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.jobs.fetch_add(1, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            fut.await;
            inner.job_finished();
        });
    }

    /// Resolves once every submitted job has finished.
    pub async fn wait_idle(&self) {
        loop {
            if self.inner.jobs.load(Ordering::SeqCst) == 0 {
                return;
            }
            let notified = self.inner.idle.notified();
            if self.inner.jobs.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Requests cooperative cancellation: jobs that have not started yet
    /// should skip their work. Running jobs drain normally.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Current concurrency limit.
    pub fn limit(&self) -> usize {
        self.inner.state.lock().expect("pool lock poisoned").limit
    }

    /// Slots currently held.
    pub fn active(&self) -> usize {
        self.inner.state.lock().expect("pool lock poisoned").active
    }
}

/// A held worker slot; released on drop.
pub struct PoolSlot {
    inner: Arc<PoolInner>,
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        self.inner.release_slot();
    }
}

impl std::fmt::Debug for PoolSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolSlot").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    #[should_panic(expected = "pool limit must be > 0")]
    fn test_zero_limit_panics() {
        Pool::new(0);
    }

    #[tokio::test]
    async fn test_acquire_release() {
        let pool = Pool::new(2);

        let a = pool.acquire(JobPriority::Normal).await;
        let b = pool.acquire(JobPriority::Normal).await;
        assert_eq!(pool.active(), 2);

        drop(a);
        assert_eq!(pool.active(), 1);
        drop(b);
        assert_eq!(pool.active(), 0);
    }

    #[tokio::test]
    async fn test_limit_is_enforced() {
        let pool = Pool::new(2);
        let peak = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let pool2 = pool.clone();
            let peak = Arc::clone(&peak);
            let current = Arc::clone(&current);
            pool.spawn(async move {
                let _slot = pool2.acquire(JobPriority::Normal).await;
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                current.fetch_sub(1, Ordering::SeqCst);
            });
        }

        pool.wait_idle().await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_resume_priority_served_first() {
        let pool = Pool::new(1);
        let held = pool.acquire(JobPriority::Normal).await;

        let order = Arc::new(Mutex::new(Vec::new()));

        // Queue a normal waiter first, then a resume waiter.
        let pool_a = pool.clone();
        let order_a = Arc::clone(&order);
        let normal = tokio::spawn(async move {
            let _slot = pool_a.acquire(JobPriority::Normal).await;
            order_a.lock().unwrap().push("normal");
        });

        tokio::time::sleep(Duration::from_millis(10)).await;

        let pool_b = pool.clone();
        let order_b = Arc::clone(&order);
        let resume = tokio::spawn(async move {
            let _slot = pool_b.acquire(JobPriority::Resume).await;
            order_b.lock().unwrap().push("resume");
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(held);

        normal.await.unwrap();
        resume.await.unwrap();
        assert_eq!(*order.lock().unwrap(), ["resume", "normal"]);
    }

    #[tokio::test]
    async fn test_fifo_within_priority() {
        let pool = Pool::new(1);
        let held = pool.acquire(JobPriority::Normal).await;

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..4 {
            let pool2 = pool.clone();
            let order2 = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let _slot = pool2.acquire(JobPriority::Normal).await;
                order2.lock().unwrap().push(i);
            }));
            // Ensure a deterministic queueing order.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        drop(held);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), [0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_increase_admits_waiter() {
        let pool = Pool::new(1);
        let _held = pool.acquire(JobPriority::Normal).await;

        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move {
            let _slot = pool2.acquire(JobPriority::Normal).await;
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        pool.increase();
        waiter.await.unwrap();
        pool.decrease();

        // The extra slot has been released and capacity restored.
        assert_eq!(pool.limit(), 1);
        assert_eq!(pool.active(), 1);
    }

    #[tokio::test]
    async fn test_wait_idle_with_no_jobs() {
        let pool = Pool::new(1);
        pool.wait_idle().await;
    }

    #[tokio::test]
    async fn test_cancel_flag() {
        let pool = Pool::new(1);
        assert!(!pool.is_cancelled());
        pool.cancel();
        assert!(pool.is_cancelled());
    }
}
