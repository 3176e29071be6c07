//! Structured sub-action parallelism.
//!
//! `parallel` fans a set of branches out as pool jobs and suspends the
//! parent until the last branch finishes or the first one fails. Each
//! branch runs with a branch-clone of the parent's local state; on overall
//! success the branches' dependencies, traces, discount and tracking state
//! merge back into the parent in submission order.
//!
//! `extra_thread` is the escape hatch for rules that must run something
//! outside the concurrency budget (an interactive tool, say): it raises the
//! pool limit by one for the duration and re-enters the slot queue
//! afterwards so the budget settles back down.

use super::ActionContext;
use crate::error::{ActionResult, BuildError};
use crate::pool::JobPriority;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

/// A branch of a [`parallel`](ActionContext::parallel) call.
pub type ParallelAction<T> =
    Box<dyn for<'a> FnOnce(&'a mut ActionContext) -> BoxFuture<'a, ActionResult<T>> + Send + 'static>;

struct ParallelState<T> {
    /// Branches still outstanding; `None` once the parent has been resumed
    /// (all done, or a branch failed). Branches that observe `None` before
    /// starting skip their work.
    remaining: Option<usize>,
    slots: Vec<Option<(ActionResult<T>, super::Local)>>,
    first_error: Option<BuildError>,
    done: Option<oneshot::Sender<()>>,
}

impl ActionContext {
    /// Runs the branches concurrently, returning their results in
    /// submission order. The first failure (in completion order) wins and
    /// resumes the parent early; branches that have not started by then are
    /// skipped.
    pub async fn parallel<T: Send + 'static>(
        &mut self,
        mut acts: Vec<ParallelAction<T>>,
    ) -> ActionResult<Vec<T>> {
        match acts.len() {
            0 => Ok(Vec::new()),
            1 => {
                let act = acts.remove(0);
                let value = act(self).await?;
                Ok(vec![value])
            }
            count => {
                let (done_tx, done_rx) = oneshot::channel();
                let shared = Arc::new(Mutex::new(ParallelState {
                    remaining: Some(count),
                    slots: (0..count).map(|_| None).collect(),
                    first_error: None,
                    done: Some(done_tx),
                }));

                for (index, act) in acts.into_iter().enumerate() {
                    let shared = Arc::clone(&shared);
                    let global = Arc::clone(&self.global);
                    let local = self.local.branch();
                    self.global.pool.spawn(async move {
                        {
                            let state = shared.lock().expect("parallel lock poisoned");
                            if state.remaining.is_none() {
                                // A sibling already failed; the parent is gone.
                                return;
                            }
                        }

                        let slot = global.pool.acquire(JobPriority::Normal).await;
                        let mut ctx = ActionContext::new(global, local, slot);
                        let (result, local) =
                            match AssertUnwindSafe(act(&mut ctx)).catch_unwind().await {
                                Ok(result) => {
                                    let ActionContext { local, slot, .. } = ctx;
                                    drop(slot);
                                    (result, local)
                                }
                                Err(_panic) => {
                                    let ActionContext { local, slot, .. } = ctx;
                                    drop(slot);
                                    (Err(BuildError::user("parallel branch panicked")), local)
                                }
                            };

                        let mut state = shared.lock().expect("parallel lock poisoned");
                        let failed = result.is_err();
                        if failed && state.first_error.is_none() {
                            if let Err(err) = &result {
                                state.first_error = Some(err.clone());
                            }
                        }
                        if let Some(slot) = state.slots.get_mut(index) {
                            *slot = Some((result, local));
                        }

                        let finished = match state.remaining {
                            None => false,
                            Some(left) => {
                                if failed || left == 1 {
                                    true
                                } else {
                                    state.remaining = Some(left - 1);
                                    false
                                }
                            }
                        };
                        if finished {
                            state.remaining = None;
                            if let Some(tx) = state.done.take() {
                                let _ = tx.send(());
                            }
                        }
                    });
                }

                self.suspend(JobPriority::Normal, async {
                    let _ = done_rx.await;
                })
                .await;

                // On failure, leave `slots` in place: branches that were
                // already running still record into it when they finish.
                let slots = {
                    let mut state = shared.lock().expect("parallel lock poisoned");
                    if let Some(err) = state.first_error.take() {
                        return Err(err);
                    }
                    std::mem::take(&mut state.slots)
                };

                let mut values = Vec::with_capacity(count);
                for slot in slots {
                    let (result, local) = slot.ok_or_else(|| {
                        BuildError::user("parallel branch finished without recording a result")
                    })?;
                    values.push(result?);
                    self.local.merge(local);
                }
                Ok(values)
            }
        }
    }

    /// Runs `act` on a temporarily widened pool: the concurrency limit is
    /// raised by one for the duration, dependencies cannot be demanded
    /// inside, and afterwards the action re-enters the slot queue — ahead
    /// of fresh work when `act` failed, so the failure surfaces promptly.
    pub async fn extra_thread<T>(
        &mut self,
        act: impl for<'a> FnOnce(&'a mut ActionContext) -> BoxFuture<'a, ActionResult<T>>,
    ) -> ActionResult<T> {
        self.global.pool.increase();
        let out = self
            .with_apply_blocked("Within extraThread".to_owned(), act)
            .await;
        self.global.pool.decrease();

        let priority = if out.is_err() {
            JobPriority::Resume
        } else {
            JobPriority::Normal
        };
        self.suspend(priority, async {}).await;
        out
    }
}
