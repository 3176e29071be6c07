//! Finite and throttled resources.
//!
//! Resources gate segments of actions that contend for something the
//! dependency graph does not know about: an external license server, a
//! memory budget, an API rate limit. A [`Resource`] is either *finite*
//! (`capacity` units held at once) or a *throttle* (tokens that return a
//! fixed period after release).
//!
//! Waiting for a resource is a suspension point: the waiting action holds
//! no worker slot, and the wait is credited to its discount. Waiters are
//! served strictly in submission order — the queue head blocks later
//! requests even if they would fit — so a large request cannot starve.
//!
//! Every resource carries a process-unique id; `with_resources` acquires
//! multiple resources in id order, which rules out lock-ordering deadlock
//! between concurrent callers.

use crate::action::ActionContext;
use crate::error::{ActionResult, BuildError, ErrorKind};
use crate::pool::JobPriority;
use futures::future::BoxFuture;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

/// Process-wide counter giving every resource a place in the acquisition
/// order.
static RESOURCE_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

struct WaitQueue {
    available: usize,
    waiters: VecDeque<(usize, oneshot::Sender<()>)>,
}

impl WaitQueue {
    fn new(available: usize) -> Self {
        Self {
            available,
            waiters: VecDeque::new(),
        }
    }

    /// Takes `n` units now, or enqueues and returns a receiver to await.
    fn take_or_wait(&mut self, n: usize) -> Option<oneshot::Receiver<()>> {
        if self.waiters.is_empty() && self.available >= n {
            self.available -= n;
            return None;
        }
        let (tx, rx) = oneshot::channel();
        self.waiters.push_back((n, tx));
        Some(rx)
    }

    /// Returns `n` units and grants queued waiters, head first, while they
    /// fit. A waiter that gave up is skipped.
    fn put_back(&mut self, n: usize) {
        self.available += n;
        while let Some((need, _)) = self.waiters.front() {
            let need = *need;
            if need > self.available {
                break;
            }
            if let Some((_, tx)) = self.waiters.pop_front() {
                if tx.send(()).is_ok() {
                    self.available -= need;
                }
            }
        }
    }
}

enum ResourceKind {
    /// At most `capacity` units held at once.
    Finite { capacity: usize },
    /// Tokens that come back `period` after release.
    Throttle { period: Duration },
}

/// A named gating primitive for [`with_resource`](ActionContext::with_resource).
pub struct Resource {
    id: u64,
    name: String,
    kind: ResourceKind,
    queue: Arc<Mutex<WaitQueue>>,
}

impl Resource {
    /// A finite resource: up to `capacity` units may be held at once.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub fn finite(name: impl Into<String>, capacity: usize) -> Self {
        assert!(capacity > 0, "resource capacity must be > 0");
        Self {
            id: RESOURCE_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            kind: ResourceKind::Finite { capacity },
            queue: Arc::new(Mutex::new(WaitQueue::new(capacity))),
        }
    }

    /// A throttled resource: `count` tokens, each returning `period` after
    /// it is released. With `count = 1` consecutive uses are spaced at
    /// least `period` apart.
    ///
    /// # Panics
    ///
    /// Panics if `count` is 0.
    pub fn throttle(name: impl Into<String>, count: usize, period: Duration) -> Self {
        assert!(count > 0, "throttle count must be > 0");
        Self {
            id: RESOURCE_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            kind: ResourceKind::Throttle { period },
            queue: Arc::new(Mutex::new(WaitQueue::new(count))),
        }
    }

    /// The resource's name, as given at construction.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquires `n` units, waiting in submission order.
    pub(crate) async fn acquire(&self, n: usize) -> ActionResult<()> {
        if let ResourceKind::Finite { capacity } = self.kind {
            if n > capacity {
                return Err(BuildError::new(ErrorKind::ResourceOverCapacity {
                    resource: self.name.clone(),
                    capacity,
                    n,
                }));
            }
        }
        if n == 0 {
            return Ok(());
        }
        let rx = self
            .queue
            .lock()
            .expect("resource lock poisoned")
            .take_or_wait(n);
        if let Some(rx) = rx {
            debug!(resource = %self.name, n, "waiting for resource");
            rx.await.expect("resource dropped while waiting");
        }
        Ok(())
    }

    /// Releases `n` units. Finite units return immediately; throttle tokens
    /// return `period` after this call.
    pub(crate) fn release(&self, n: usize) {
        if n == 0 {
            return;
        }
        match self.kind {
            ResourceKind::Finite { .. } => {
                self.queue
                    .lock()
                    .expect("resource lock poisoned")
                    .put_back(n);
            }
            ResourceKind::Throttle { period } => {
                let queue = Arc::clone(&self.queue);
                tokio::spawn(async move {
                    tokio::time::sleep(period).await;
                    queue.lock().expect("resource lock poisoned").put_back(n);
                });
            }
        }
    }

    /// Units currently available (for diagnostics and tests).
    pub fn available(&self) -> usize {
        self.queue.lock().expect("resource lock poisoned").available
    }
}

impl PartialEq for Resource {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Resource {}

impl PartialOrd for Resource {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Resource {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.id.cmp(&other.id)
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            ResourceKind::Finite { capacity } => format!("finite, capacity {capacity}"),
            ResourceKind::Throttle { period } => format!("throttle, period {period:?}"),
        };
        write!(f, "Resource({}, {kind})", self.name)
    }
}

/// Releases held units on drop, covering every exit path.
struct Held<'r> {
    resource: &'r Resource,
    n: usize,
}

impl Drop for Held<'_> {
    fn drop(&mut self) {
        self.resource.release(self.n);
        debug!(resource = %self.resource.name, n = self.n, "resource released");
    }
}

impl ActionContext {
    /// Runs `act` while holding `n` units of `resource`.
    ///
    /// The wait for the resource suspends the action (no worker slot held)
    /// and is credited to its discount. Inside `act`, `apply` is blocked:
    /// demanding dependencies while holding a resource could deadlock
    /// against other holders. The units are released on every exit path.
    pub async fn with_resource<T>(
        &mut self,
        resource: &Resource,
        n: usize,
        act: impl for<'a> FnOnce(&'a mut ActionContext) -> BoxFuture<'a, ActionResult<T>>,
    ) -> ActionResult<T> {
        self.global
            .output
            .diagnostic(|| format!("Resource {}: waiting to acquire {n}", resource.name()));

        let (acquired, waited) = self
            .suspend(JobPriority::Normal, resource.acquire(n))
            .await;
        acquired?;
        self.local.discount += waited;
        self.global
            .output
            .diagnostic(|| format!("Resource {}: acquired {n}", resource.name()));

        let held = Held { resource, n };
        let out = self
            .with_apply_blocked(
                format!("Within withResource ({})", resource.name()),
                act,
            )
            .await;
        drop(held);
        out
    }

    /// Runs `act` while holding several resources at once.
    ///
    /// Requests are validated (negative quantities are an error), grouped
    /// by resource with quantities summed, and acquired in the process-wide
    /// resource order — so concurrent callers that all go through
    /// `with_resources` cannot deadlock on ordering. Zero-quantity groups
    /// are skipped.
    pub async fn with_resources<T>(
        &mut self,
        requests: &[(&Resource, i64)],
        act: impl for<'a> FnOnce(&'a mut ActionContext) -> BoxFuture<'a, ActionResult<T>>,
    ) -> ActionResult<T> {
        for (resource, n) in requests {
            if *n < 0 {
                return Err(BuildError::new(ErrorKind::NegativeResourceRequest {
                    resource: resource.name().to_owned(),
                    n: *n,
                }));
            }
        }

        // Sum per resource; BTreeMap over the id gives the acquisition order.
        let mut grouped: BTreeMap<u64, (&Resource, usize)> = BTreeMap::new();
        for (resource, n) in requests {
            let entry = grouped.entry(resource.id).or_insert((*resource, 0));
            entry.1 += *n as usize;
        }

        let mut held = Vec::with_capacity(grouped.len());
        for (resource, n) in grouped.into_values() {
            if n == 0 {
                continue;
            }
            self.global
                .output
                .diagnostic(|| format!("Resource {}: waiting to acquire {n}", resource.name()));
            let (acquired, waited) = self
                .suspend(JobPriority::Normal, resource.acquire(n))
                .await;
            // Held units release via drop if a later acquire fails.
            acquired?;
            self.local.discount += waited;
            held.push(Held { resource, n });
        }

        let names: Vec<&str> = held.iter().map(|h| h.resource.name()).collect();
        let out = self
            .with_apply_blocked(format!("Within withResources ({})", names.join(", ")), act)
            .await;
        // Release in reverse acquisition order.
        held.reverse();
        drop(held);
        out
    }
}
