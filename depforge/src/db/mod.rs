//! The build database interface.
//!
//! The scheduler does not decide what is stale, how values persist, or how
//! cycles are detected — the database does. The engine hands every demand
//! to [`Database::build`] together with a [`BuildOps`] handler triple and
//! the demanding action's key stack; the database calls `ops.exec` back
//! for keys that genuinely need building and resolves everything else from
//! its own state.
//!
//! [`MemoryDatabase`] is the bundled per-process implementation.

mod memory;

pub use memory::MemoryDatabase;

use crate::action::{Depends, Trace};
use crate::error::{ActionResult, BuildError};
use crate::key::{Key, Stack, Value};
use crate::pool::Pool;
use crate::rules::{EqualFn, StoredFn};
use futures::future::BoxFuture;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Callback that executes one rule for one key; the stack already carries
/// the key on top.
pub type ExecFn =
    Arc<dyn Fn(Stack, Key) -> BoxFuture<'static, ActionResult<ExecResult>> + Send + Sync>;

/// Handlers the engine supplies for one build call.
pub struct BuildOps {
    /// Reads a key's current value from the environment, if it has one.
    pub stored: StoredFn,
    /// Compares a recorded value against a stored one; `true` = still valid.
    pub equal: EqualFn,
    /// Executes the rule for a key that needs building.
    pub exec: ExecFn,
}

/// What executing one rule produced.
#[derive(Clone)]
pub struct ExecResult {
    /// The value the rule produced.
    pub value: Value,
    /// Dependency records accumulated by the rule, in `apply` order.
    pub depends: Vec<Depends>,
    /// Execution time with suspended waits already subtracted.
    pub duration: Duration,
    /// Spans recorded by `traced` during the rule.
    pub traces: Vec<Trace>,
}

/// Result of one [`Database::build`] call.
pub struct BuildOutcome {
    /// Wall time from demand to completion, credited to the demander's
    /// discount.
    pub duration: Duration,
    /// The demand as a dependency record.
    pub depends: Depends,
    /// The demanded keys' values, in demand order.
    pub values: Vec<Value>,
}

/// A point-in-time view of build progress.
#[derive(Clone, Debug, Default)]
pub struct Progress {
    /// Keys finished building.
    pub done: usize,
    /// Keys currently mid-build.
    pub building: usize,
    /// Keys whose rule failed.
    pub failed: usize,
    /// Target label of the first recorded failure, if any.
    pub is_failure: Option<String>,
}

/// One key's entry in the build report.
#[derive(Clone, Debug, Serialize)]
pub struct ReportEntry {
    pub key: String,
    pub type_name: String,
    pub duration_s: f64,
    pub depends: Vec<String>,
    pub traces: Vec<ReportTrace>,
}

/// A recorded span in the build report.
#[derive(Clone, Debug, Serialize)]
pub struct ReportTrace {
    pub message: String,
    pub start: f64,
    pub end: f64,
}

/// The build report: everything built this run, with timings.
#[derive(Clone, Debug, Default, Serialize)]
pub struct BuildReport {
    pub entries: Vec<ReportEntry>,
}

/// Store of key state consulted and updated by the engine.
pub trait Database: Send + Sync {
    /// Marks the start of a build; entries from earlier builds become
    /// candidates for revalidation against `stored`/`equal`.
    fn begin_build(&self);

    /// Brings `keys` up to date, executing rules through `ops.exec` as
    /// needed, and returns their values. `stack` is the demanding action's
    /// key chain, used for cycle detection.
    fn build(
        &self,
        pool: Pool,
        ops: BuildOps,
        stack: Stack,
        keys: Vec<Key>,
    ) -> BoxFuture<'_, ActionResult<BuildOutcome>>;

    /// Expands one dependency record into its keys.
    fn list_depends(&self, depends: &Depends) -> Vec<Key>;

    /// The recorded dependencies of a built key. `None` when the key has
    /// not been built.
    fn lookup_dependencies(&self, key: &Key) -> Option<Vec<Key>>;

    /// Lint validation: recorded values still match their stored state, and
    /// keys claimed absent by `track_change` are genuinely untracked.
    fn check_valid(
        &self,
        stored: &StoredFn,
        equal: &EqualFn,
        absent: &[(Key, Key)],
    ) -> Result<(), BuildError>;

    /// Keys built (and therefore live) this run.
    fn list_live(&self) -> Vec<Key>;

    /// The profile report for this run.
    fn to_report(&self) -> BuildReport;

    /// Asserts no key is left mid-build once the pool has drained.
    fn assert_finished(&self) -> Result<(), BuildError>;

    /// Current progress counters.
    fn progress(&self) -> Progress;
}
