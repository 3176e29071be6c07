//! depforge — a dependency-directed build engine.
//!
//! Rules map typed keys to actions that produce typed values; the engine
//! discovers dependencies as actions execute, memoises results per key,
//! runs independent work in parallel under a bounded worker pool, gates
//! contended segments on user-defined resources, and reports failures as
//! structured errors.
//!
//! # Example
//!
//! ```ignore
//! use depforge::{run, ActionContext, ActionResult, Rules, RunOptions};
//! use futures::future::BoxFuture;
//!
//! fn build_object(ctx: &mut ActionContext, key: ObjectFile)
//!     -> BoxFuture<'_, ActionResult<String>>
//! {
//!     Box::pin(async move {
//!         let source = ctx.apply1(SourceFile(key.stem())).await?;
//!         Ok(compile(&source))
//!     })
//! }
//!
//! let mut rules = Rules::new();
//! rules.rule(build_object);
//! rules.action(|ctx| Box::pin(async move {
//!     ctx.apply1(ObjectFile("main".into())).await?;
//!     Ok(())
//! }));
//! run(RunOptions::default(), rules).await?;
//! ```
//!
//! The scheduler is cooperative: an action holds one worker slot while it
//! runs and none while it waits — on dependencies, resources, parallel
//! branches, or cache fences — so a thread budget of `n` bounds running
//! actions, not suspended ones.

mod action;
mod cache;
mod error;
mod fence;
mod key;
mod options;
mod pool;
mod resource;
mod rules;
mod run;

pub mod db;

// Context and state
pub use action::{ActionContext, Depends, ParallelAction, Trace};

// Keys, values, rules
pub use key::{Key, RuleKey, Stack, Value};
pub use rules::{RuleOptions, Rules};

// Driver
pub use options::{LintMode, OutputFn, ProgressFn, RunOptions, Verbosity};
pub use run::{run, run_with_database};

// Errors
pub use error::{ActionResult, BuildError, ErrorKind};

// Concurrency primitives
pub use cache::{new_cache, Cache};
pub use pool::{JobPriority, Pool, PoolSlot};
pub use resource::Resource;

/// Version of the depforge library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
