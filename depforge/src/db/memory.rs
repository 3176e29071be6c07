//! In-memory build database.
//!
//! Per-key state lives in a concurrent map of fenced entries: the first
//! demand for a key installs a fence and schedules the rule as a pool job;
//! every concurrent demand waits on the same fence, so a rule executes at
//! most once per build no matter how many actions ask.
//!
//! Staleness is generation-based: `begin_build` starts a new generation,
//! and a completed entry from an earlier generation is revalidated against
//! the rule's `stored`/`equal` handlers on first demand — matching entries
//! are kept, the rest rebuild. Cycle detection is stack-based: a demand for
//! a key already on the demander's chain fails immediately. A cross-demand
//! cycle that sneaks past the stacks parks both demands forever; those
//! surface through [`assert_finished`](super::Database::assert_finished)
//! after the pool drains.

use super::{BuildOps, BuildOutcome, BuildReport, Database, Progress, ReportEntry, ReportTrace};
use crate::action::{Depends, Trace};
use crate::error::{ActionResult, BuildError, ErrorKind};
use crate::fence::Fence;
use crate::key::{Key, Stack, Value};
use crate::pool::Pool;
use crate::rules::{EqualFn, StoredFn};
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

type EntryFence = Arc<Fence<Result<FinishedEntry, BuildError>>>;

/// A key that finished building.
#[derive(Clone)]
struct FinishedEntry {
    value: Value,
    depends: Vec<Key>,
    duration: Duration,
    traces: Vec<Trace>,
    generation: u64,
}

enum KeyState {
    Building(EntryFence),
    Done(FinishedEntry),
    Failed { err: BuildError, generation: u64 },
}

/// How one demand will be satisfied.
enum Demand {
    Ready(Value),
    Wait(EntryFence),
    Fail(BuildError),
}

/// The bundled [`Database`] implementation; state lives for the lifetime of
/// the value, so reusing one across runs keeps still-valid results.
#[derive(Default)]
pub struct MemoryDatabase {
    states: Arc<DashMap<Key, KeyState>>,
    generation: AtomicU64,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decides how to satisfy one key, scheduling a rule job if needed.
    fn demand(&self, pool: &Pool, ops: &BuildOps, stack: &Stack, key: Key) -> Demand {
        let generation = self.generation.load(Ordering::SeqCst);
        match self.states.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => match entry.get() {
                KeyState::Done(finished) => {
                    if finished.generation == generation {
                        return Demand::Ready(finished.value.clone());
                    }
                    // An entry from an earlier build: revalidate.
                    match (ops.stored)(&key) {
                        Some(now) if (ops.equal)(&key, &finished.value, &now) => {
                            let mut kept = finished.clone();
                            kept.generation = generation;
                            let value = kept.value.clone();
                            entry.insert(KeyState::Done(kept));
                            Demand::Ready(value)
                        }
                        Some(_) => {
                            debug!(key = %key, "stored value changed, rebuilding");
                            let fence: EntryFence = Arc::new(Fence::new());
                            entry.insert(KeyState::Building(Arc::clone(&fence)));
                            self.schedule(pool, ops, stack, key, Arc::clone(&fence));
                            Demand::Wait(fence)
                        }
                        None => {
                            let mut kept = finished.clone();
                            kept.generation = generation;
                            let value = kept.value.clone();
                            entry.insert(KeyState::Done(kept));
                            Demand::Ready(value)
                        }
                    }
                }
                KeyState::Building(fence) => Demand::Wait(Arc::clone(fence)),
                KeyState::Failed {
                    err,
                    generation: failed_generation,
                } => {
                    if *failed_generation == generation {
                        Demand::Fail(err.clone())
                    } else {
                        // A failure from an earlier build gets another try.
                        let fence: EntryFence = Arc::new(Fence::new());
                        entry.insert(KeyState::Building(Arc::clone(&fence)));
                        self.schedule(pool, ops, stack, key, Arc::clone(&fence));
                        Demand::Wait(fence)
                    }
                }
            },
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let fence: EntryFence = Arc::new(Fence::new());
                entry.insert(KeyState::Building(Arc::clone(&fence)));
                self.schedule(pool, ops, stack, key, Arc::clone(&fence));
                Demand::Wait(fence)
            }
        }
    }

    /// Submits the rule for `key` as a pool job.
    fn schedule(&self, pool: &Pool, ops: &BuildOps, stack: &Stack, key: Key, fence: EntryFence) {
        let exec = Arc::clone(&ops.exec);
        let child_stack = stack.push(key.clone());
        let states = Arc::clone(&self.states);
        let generation = self.generation.load(Ordering::SeqCst);
        pool.spawn(async move {
            // A panicking rule must still resolve its fence, or every
            // waiter parks forever.
            let run = AssertUnwindSafe((exec)(child_stack, key.clone()))
                .catch_unwind()
                .await
                .unwrap_or_else(|_panic| {
                    Err(BuildError::user(format!("rule for {key} panicked")))
                });
            let outcome = match run {
                Ok(result) => {
                    let finished = FinishedEntry {
                        value: result.value,
                        depends: result
                            .depends
                            .iter()
                            .flat_map(|d| d.keys().iter().cloned())
                            .collect(),
                        duration: result.duration,
                        traces: result.traces,
                        generation,
                    };
                    states.insert(key, KeyState::Done(finished.clone()));
                    Ok(finished)
                }
                Err(err) => {
                    states.insert(
                        key,
                        KeyState::Failed {
                            err: err.clone(),
                            generation,
                        },
                    );
                    Err(err)
                }
            };
            fence.signal(outcome);
        });
    }
}

impl Database for MemoryDatabase {
    fn begin_build(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    fn build(
        &self,
        pool: Pool,
        ops: BuildOps,
        stack: Stack,
        keys: Vec<Key>,
    ) -> BoxFuture<'_, ActionResult<BuildOutcome>> {
        Box::pin(async move {
            let started = Instant::now();

            for key in &keys {
                if stack.contains(key) {
                    return Err(BuildError::new(ErrorKind::CycleDetected {
                        key: key.to_string(),
                    })
                    .with_context(stack.push(key.clone()).to_strings()));
                }
            }

            // Schedule everything before waiting on anything, so a demand
            // for several keys builds them concurrently.
            let demands: Vec<Demand> = keys
                .iter()
                .map(|key| self.demand(&pool, &ops, &stack, key.clone()))
                .collect();

            let mut values = Vec::with_capacity(demands.len());
            for demand in demands {
                let value = match demand {
                    Demand::Ready(value) => value,
                    Demand::Fail(err) => return Err(err),
                    Demand::Wait(fence) => fence.wait().await?.value,
                };
                values.push(value);
            }

            Ok(BuildOutcome {
                duration: started.elapsed(),
                depends: Depends(keys),
                values,
            })
        })
    }

    fn list_depends(&self, depends: &Depends) -> Vec<Key> {
        depends.keys().to_vec()
    }

    fn lookup_dependencies(&self, key: &Key) -> Option<Vec<Key>> {
        match self.states.get(key)?.value() {
            KeyState::Done(finished) => Some(finished.depends.clone()),
            _ => None,
        }
    }

    fn check_valid(
        &self,
        stored: &StoredFn,
        equal: &EqualFn,
        absent: &[(Key, Key)],
    ) -> Result<(), BuildError> {
        let mut problems = Vec::new();

        for entry in self.states.iter() {
            if let KeyState::Done(finished) = entry.value() {
                if let Some(now) = stored(entry.key()) {
                    if !equal(entry.key(), &finished.value, &now) {
                        problems.push(format!(
                            "key {} changed since it was built",
                            entry.key()
                        ));
                    }
                }
            }
        }

        for (owner, claimed) in absent {
            if self.states.contains_key(claimed) {
                problems.push(format!(
                    "rule {owner} wrote {claimed}, which is tracked by the build"
                ));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(BuildError::new(ErrorKind::LintCheckFailed { problems }))
        }
    }

    fn list_live(&self) -> Vec<Key> {
        self.states
            .iter()
            .filter(|entry| matches!(entry.value(), KeyState::Done(_)))
            .map(|entry| entry.key().clone())
            .collect()
    }

    fn to_report(&self) -> BuildReport {
        let mut entries: Vec<ReportEntry> = self
            .states
            .iter()
            .filter_map(|entry| match entry.value() {
                KeyState::Done(finished) => Some(ReportEntry {
                    key: entry.key().to_string(),
                    type_name: entry.key().type_name().to_owned(),
                    duration_s: finished.duration.as_secs_f64(),
                    depends: finished.depends.iter().map(|k| k.to_string()).collect(),
                    traces: finished
                        .traces
                        .iter()
                        .map(|t| ReportTrace {
                            message: t.message.clone(),
                            start: t.start,
                            end: t.end,
                        })
                        .collect(),
                }),
                _ => None,
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        BuildReport { entries }
    }

    fn assert_finished(&self) -> Result<(), BuildError> {
        let stuck: Vec<String> = self
            .states
            .iter()
            .filter(|entry| matches!(entry.value(), KeyState::Building(_)))
            .map(|entry| entry.key().to_string())
            .collect();
        if stuck.is_empty() {
            Ok(())
        } else {
            Err(BuildError::new(ErrorKind::IncompleteBuild { keys: stuck }))
        }
    }

    fn progress(&self) -> Progress {
        let mut progress = Progress::default();
        for entry in self.states.iter() {
            match entry.value() {
                KeyState::Done(_) => progress.done += 1,
                KeyState::Building(_) => progress.building += 1,
                KeyState::Failed { .. } => progress.failed += 1,
            }
        }
        progress
    }
}
