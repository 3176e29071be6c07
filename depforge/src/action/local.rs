//! Per-action state.
//!
//! A [`Local`] is born when an action is scheduled and travels with the
//! action's future; it is never shared between tasks. Parallel branches get
//! a [`Local::branch`] clone (context inherited, accumulators fresh) and
//! merge back into the parent with [`Local::merge`] when every branch
//! succeeds.

use crate::key::{Key, Stack};
use crate::options::Verbosity;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// The dependency record of one `apply` call: the demanded keys, in order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Depends(pub(crate) Vec<Key>);

impl Depends {
    /// The keys demanded by this `apply` call.
    pub fn keys(&self) -> &[Key] {
        &self.0
    }
}

/// A timed span recorded by [`traced`](crate::ActionContext::traced),
/// in seconds relative to the start of the build.
#[derive(Clone, Debug)]
pub struct Trace {
    pub message: String,
    pub start: f64,
    pub end: f64,
}

/// Predicate installed by `track_allow`.
pub(crate) type TrackAllow = Arc<dyn Fn(&Key) -> bool + Send + Sync>;

/// Mutable state owned by one running action.
#[derive(Clone)]
pub(crate) struct Local {
    /// Keys being built on this action's call chain; top is this action's
    /// own key (empty for top-level actions).
    pub stack: Stack,
    /// Output threshold for this action.
    pub verbosity: Verbosity,
    /// One entry per `apply` call, in invocation order.
    pub depends: Vec<Depends>,
    /// Time spent suspended or waiting; subtracted from the reported
    /// duration of the rule.
    pub discount: Duration,
    /// Spans recorded by `traced`, in invocation order.
    pub traces: Vec<Trace>,
    /// Keys recorded by `track_use` pending end-of-rule validation.
    pub track_used: Vec<Key>,
    /// Predicates that suppress tracking checks for matching keys.
    pub track_allows: Vec<TrackAllow>,
    /// When set, `apply` fails with this reason.
    pub block_apply: Option<String>,
}

impl Local {
    pub fn new(stack: Stack, verbosity: Verbosity) -> Self {
        Self {
            stack,
            verbosity,
            depends: Vec::new(),
            discount: Duration::ZERO,
            traces: Vec::new(),
            track_used: Vec::new(),
            track_allows: Vec::new(),
            block_apply: None,
        }
    }

    /// Clone for a parallel branch: context inherited, accumulators fresh.
    pub fn branch(&self) -> Self {
        Self {
            stack: self.stack.clone(),
            verbosity: self.verbosity,
            depends: Vec::new(),
            discount: Duration::ZERO,
            traces: Vec::new(),
            track_used: Vec::new(),
            track_allows: self.track_allows.clone(),
            block_apply: self.block_apply.clone(),
        }
    }

    /// Folds a completed branch back into this local.
    pub fn merge(&mut self, branch: Local) {
        self.depends.extend(branch.depends);
        self.discount += branch.discount;
        self.traces.extend(branch.traces);
        self.track_used.extend(branch.track_used);
    }

    /// All recorded dependency keys, flattened in `apply` order.
    pub fn flat_depends(&self) -> impl Iterator<Item = &Key> {
        self.depends.iter().flat_map(|d| d.0.iter())
    }
}

impl fmt::Debug for Local {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Local")
            .field("stack", &self.stack)
            .field("verbosity", &self.verbosity)
            .field("depends", &self.depends)
            .field("discount", &self.discount)
            .field("traces", &self.traces.len())
            .field("track_used", &self.track_used)
            .field("track_allows", &self.track_allows.len())
            .field("block_apply", &self.block_apply)
            .finish()
    }
}
