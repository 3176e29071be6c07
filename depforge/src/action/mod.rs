//! The action context.
//!
//! User rules and top-level actions receive a `&mut ActionContext`: read
//! access to the build-wide [`Global`](global::Global), ownership of their
//! [`Local`](local::Local), and the slot they currently occupy on the
//! worker pool. Everything an action can do — demand dependencies, gate on
//! resources, branch in parallel, record traces and tracking events — is a
//! method here or in a sibling module.
//!
//! Suspension is cooperative: [`ActionContext::suspend`] drops the held
//! slot, awaits an event, then re-enters the slot queue. While suspended an
//! action costs nothing against the concurrency limit.

mod apply;
mod global;
mod local;
mod parallel;
mod track;

pub use local::{Depends, Trace};
pub use parallel::ParallelAction;

pub(crate) use apply::build_ops;
pub(crate) use global::{Global, GlobalOptions, OutputSink};
pub(crate) use local::Local;

use crate::error::ActionResult;
use crate::key::Stack;
use crate::options::Verbosity;
use crate::pool::{JobPriority, PoolSlot};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Ambient state handed to every running action.
pub struct ActionContext {
    pub(crate) global: Arc<Global>,
    pub(crate) local: Local,
    pub(crate) slot: Option<PoolSlot>,
}

impl ActionContext {
    pub(crate) fn new(global: Arc<Global>, local: Local, slot: PoolSlot) -> Self {
        Self {
            global,
            local,
            slot: Some(slot),
        }
    }

    /// Releases the worker slot, awaits `fut`, then re-enters the slot
    /// queue at `priority`. Returns the output and the time spent away.
    pub(crate) async fn suspend<T>(
        &mut self,
        priority: JobPriority,
        fut: impl Future<Output = T>,
    ) -> (T, Duration) {
        self.slot = None;
        let away = Instant::now();
        let out = fut.await;
        let slot = self.global.pool.acquire(priority).await;
        self.slot = Some(slot);
        (out, away.elapsed())
    }

    /// The action's current output threshold.
    pub fn verbosity(&self) -> Verbosity {
        self.local.verbosity
    }

    /// Overrides the output threshold for the rest of this action.
    pub fn set_verbosity(&mut self, verbosity: Verbosity) {
        self.local.verbosity = verbosity;
    }

    /// The chain of keys being built on this action's path; the top is the
    /// key this action executes for (empty for top-level actions).
    pub fn stack(&self) -> &Stack {
        &self.local.stack
    }

    /// Dependency records accumulated so far, one per `apply` call.
    pub fn recorded_depends(&self) -> &[Depends] {
        &self.local.depends
    }

    /// Time this action has spent suspended or waiting so far.
    pub fn discount(&self) -> Duration {
        self.local.discount
    }

    /// Spans recorded by [`traced`](Self::traced) so far.
    pub fn traces(&self) -> &[Trace] {
        &self.local.traces
    }

    /// Emits a build-output line at the given level.
    pub fn emit(&self, level: Verbosity, message: &str) {
        self.global.output.write(level, message);
    }

    /// Emits at `Quiet` (shown unless silent).
    pub fn put_quiet(&self, message: &str) {
        self.emit(Verbosity::Quiet, message);
    }

    /// Emits at `Normal`.
    pub fn put_normal(&self, message: &str) {
        self.emit(Verbosity::Normal, message);
    }

    /// Emits at `Loud`.
    pub fn put_loud(&self, message: &str) {
        self.emit(Verbosity::Loud, message);
    }

    /// Runs `fut` on the current worker, recording a [`Trace`] span with
    /// offsets relative to the build start. Holds the slot throughout.
    pub async fn traced<T>(
        &mut self,
        message: impl Into<String>,
        fut: impl Future<Output = T>,
    ) -> T {
        let start = self.global.elapsed_secs();
        let out = fut.await;
        let end = self.global.elapsed_secs();
        self.local.traces.push(Trace {
            message: message.into(),
            start,
            end,
        });
        out
    }

    /// Registers a finaliser to run after the build completes successfully.
    /// Finalisers run in reverse registration order.
    pub fn run_after(&self, f: impl FnOnce() + Send + 'static) {
        self.global
            .after
            .lock()
            .expect("after lock poisoned")
            .push(Box::new(f));
    }

    /// Runs `act` and discards any dependencies it records, keeping its
    /// other effects (traces, discount, tracking state). The work still
    /// happens; it just does not become a dependency of this action.
    pub async fn order_only<T>(
        &mut self,
        act: impl for<'a> FnOnce(&'a mut ActionContext) -> futures::future::BoxFuture<'a, ActionResult<T>>,
    ) -> ActionResult<T> {
        let mark = self.local.depends.len();
        let out = act(self).await;
        self.local.depends.truncate(mark);
        out
    }

    /// Runs `f` with `apply` blocked, restoring the previous block state
    /// afterwards even on failure.
    pub(crate) async fn with_apply_blocked<T>(
        &mut self,
        reason: String,
        act: impl for<'a> FnOnce(&'a mut ActionContext) -> futures::future::BoxFuture<'a, ActionResult<T>>,
    ) -> ActionResult<T> {
        let previous = self.local.block_apply.replace(reason);
        let out = act(self).await;
        self.local.block_apply = previous;
        out
    }
}
