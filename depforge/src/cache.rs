//! Memoised sub-actions with dependency replay.
//!
//! [`new_cache`] wraps a key-to-value action so it runs at most once per
//! key per cache instance, no matter how many actions ask concurrently.
//! The first caller runs the body; everyone else waits on a one-shot
//! fence. Because the body may demand dependencies, the cache records the
//! dependency delta of the first run and replays it into every waiter's
//! local state — a cached answer carries the same dependencies as a fresh
//! one.
//!
//! Distinct cache instances are completely independent, even for the same
//! key type.

use crate::action::{ActionContext, Depends};
use crate::error::{ActionResult, BuildError};
use crate::fence::Fence;
use crate::pool::JobPriority;
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::hash::Hash;
use std::sync::Arc;

type CacheOutcome<V> = Result<(Vec<Depends>, V), BuildError>;

type CacheBody<K, V> =
    Arc<dyn for<'a> Fn(&'a mut ActionContext, K) -> BoxFuture<'a, ActionResult<V>> + Send + Sync>;

/// A per-key memoisation of an action, created by [`new_cache`].
pub struct Cache<K, V> {
    entries: DashMap<K, Arc<Fence<CacheOutcome<V>>>>,
    body: CacheBody<K, V>,
}

/// Creates a cache around `body`. See the module docs for semantics.
pub fn new_cache<K, V, F>(body: F) -> Cache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    F: for<'a> Fn(&'a mut ActionContext, K) -> BoxFuture<'a, ActionResult<V>>
        + Send
        + Sync
        + 'static,
{
    Cache {
        entries: DashMap::new(),
        body: Arc::new(body),
    }
}

enum Plan<V> {
    /// We installed the fence; run the body and signal it.
    Run(Arc<Fence<V>>),
    /// Someone else is (or was) responsible; wait for their fence.
    Wait(Arc<Fence<V>>),
}

impl<K, V> Cache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Returns the cached value for `key`, running the body if this is the
    /// first demand. Waiting for a concurrent first run counts as discount;
    /// the first run's dependency delta is replayed into the caller.
    pub async fn get(&self, ctx: &mut ActionContext, key: K) -> ActionResult<V> {
        let plan = match self.entries.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => Plan::Wait(Arc::clone(entry.get())),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let fence = Arc::new(Fence::new());
                entry.insert(Arc::clone(&fence));
                Plan::Run(fence)
            }
        };

        match plan {
            Plan::Wait(fence) => {
                let outcome = match fence.try_get() {
                    Some(outcome) => outcome,
                    None => {
                        let (outcome, waited) =
                            ctx.suspend(JobPriority::Normal, fence.wait()).await;
                        ctx.local.discount += waited;
                        outcome
                    }
                };
                let (depends, value) = outcome?;
                ctx.local.depends.extend(depends);
                Ok(value)
            }
            Plan::Run(fence) => {
                let mark = ctx.local.depends.len();
                match (self.body)(ctx, key).await {
                    Ok(value) => {
                        let delta = ctx.local.depends[mark..].to_vec();
                        fence.signal(Ok((delta, value.clone())));
                        Ok(value)
                    }
                    Err(err) => {
                        fence.signal(Err(err.clone()));
                        Err(err)
                    }
                }
            }
        }
    }

    /// Number of keys this cache has seen.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether this cache has seen any key yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
