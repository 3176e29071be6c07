//! Demanding dependencies.
//!
//! `apply` is the only way an action acquires dependencies: it validates
//! the demanded key family against the registry, erases the keys, suspends
//! the action, and hands the demand to the database. The database decides
//! what is stale and calls back into [`exec_key`] for keys that actually
//! need building; the resumed action records the demand as one
//! [`Depends`](super::Depends) entry and is credited the wait as discount.

use super::{ActionContext, Global, Local};
use crate::db::{BuildOps, ExecFn, ExecResult};
use crate::error::{ActionResult, BuildError, ErrorKind};
use crate::key::{Key, RuleKey, Stack, Value};
use crate::options::{LintMode, Verbosity};
use crate::pool::JobPriority;
use std::any::TypeId;
use std::sync::Arc;
use std::time::Instant;

impl ActionContext {
    /// Demands a single key, returning its value once built.
    pub async fn apply1<K: RuleKey>(&mut self, key: K) -> ActionResult<K::Value> {
        let mut values = self.apply(vec![key]).await?;
        values
            .pop()
            .ok_or_else(|| BuildError::user("database returned no value for a demanded key"))
    }

    /// Demands a list of keys of one family, in parallel, returning their
    /// values in the same order and recording the demand as one dependency
    /// entry.
    pub async fn apply<K: RuleKey>(&mut self, keys: Vec<K>) -> ActionResult<Vec<K::Value>> {
        if let Some(reason) = &self.local.block_apply {
            return Err(BuildError::new(ErrorKind::NoApplyHere {
                reason: reason.clone(),
            }));
        }

        let info = self
            .global
            .rules
            .lookup(TypeId::of::<K>())
            .ok_or_else(|| {
                BuildError::new(ErrorKind::NoRuleToBuild {
                    type_name: std::any::type_name::<K>().to_owned(),
                    key: keys.first().map(|k| k.to_string()),
                })
            })?;
        let registered_result = info.result_type;
        let registered_result_name = info.result_type_name;
        if registered_result != TypeId::of::<K::Value>() {
            return Err(BuildError::new(ErrorKind::RuleTypeMismatch {
                type_name: std::any::type_name::<K>().to_owned(),
                want: std::any::type_name::<K::Value>().to_owned(),
                got: registered_result_name.to_owned(),
            }));
        }

        let erased: Vec<Key> = keys.into_iter().map(Key::new).collect();
        let values = self.apply_key_value(erased).await?;
        values
            .into_iter()
            .map(|value| {
                let got = value.type_name().to_owned();
                value.downcast_clone::<K::Value>().ok_or_else(|| {
                    BuildError::new(ErrorKind::RuleTypeMismatch {
                        type_name: std::any::type_name::<K>().to_owned(),
                        want: std::any::type_name::<K::Value>().to_owned(),
                        got,
                    })
                })
            })
            .collect()
    }

    /// Erased demand: suspend, drive the database, record the dependency.
    pub(crate) async fn apply_key_value(&mut self, keys: Vec<Key>) -> ActionResult<Vec<Value>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let ops = build_ops(&self.global);
        let stack = self.local.stack.clone();
        let database = Arc::clone(&self.global.database);
        let pool = self.global.pool.clone();

        let (outcome, _) = self
            .suspend(JobPriority::Normal, database.build(pool, ops, stack, keys))
            .await;
        let outcome = outcome?;

        self.local.discount += outcome.duration;
        self.local.depends.push(outcome.depends);
        Ok(outcome.values)
    }
}

/// The handler triple handed to the database for one build call.
pub(crate) fn build_ops(global: &Arc<Global>) -> BuildOps {
    let stored = {
        let global = Arc::clone(global);
        Arc::new(move |key: &Key| {
            global
                .rules
                .lookup(key.type_tag())
                .and_then(|info| (info.stored)(key))
        })
    };

    let equal = {
        let global = Arc::clone(global);
        Arc::new(move |key: &Key, old: &Value, new: &Value| {
            global
                .rules
                .lookup(key.type_tag())
                .is_some_and(|info| (info.equal)(key, old, new))
        })
    };

    let exec: ExecFn = {
        let global = Arc::clone(global);
        Arc::new(move |stack: Stack, key: Key| {
            let global = Arc::clone(&global);
            Box::pin(exec_key(global, stack, key))
        })
    };

    BuildOps {
        stored,
        equal,
        exec,
    }
}

/// Executes one rule for one key. Invoked by the database when the key
/// genuinely needs building; `stack` already has `key` on top.
async fn exec_key(global: Arc<Global>, stack: Stack, key: Key) -> ActionResult<ExecResult> {
    let info = match global.rules.lookup(key.type_tag()) {
        Some(info) => info.clone(),
        None => {
            return Err(BuildError::new(ErrorKind::NoRuleToBuild {
                type_name: key.type_name().to_owned(),
                key: Some(key.to_string()),
            }))
        }
    };

    let slot = global.pool.acquire(JobPriority::Normal).await;
    let started = Instant::now();
    global.output.write(Verbosity::Chatty, &format!("# {key}"));

    let local = Local::new(stack.clone(), global.options.verbosity);
    let mut ctx = ActionContext::new(Arc::clone(&global), local, slot);
    let mut result = (info.execute)(&mut ctx, key).await;

    if result.is_ok() && global.options.lint == LintMode::Tracked {
        if let Err(err) = ctx.track_check_used() {
            result = Err(err);
        }
    }
    if result.is_ok() {
        if let Some(wanted) = &global.lint_cwd {
            match std::env::current_dir() {
                Ok(got) if &got == wanted => {}
                Ok(got) => {
                    result = Err(BuildError::new(ErrorKind::LintCwdChanged {
                        wanted: wanted.display().to_string(),
                        got: got.display().to_string(),
                    }));
                }
                Err(err) => result = Err(err.into()),
            }
        }
    }

    let ActionContext { local, slot, .. } = ctx;
    drop(slot);

    match result {
        Ok(value) => Ok(ExecResult {
            value,
            depends: local.depends,
            duration: started.elapsed().saturating_sub(local.discount),
            traces: local.traces,
        }),
        Err(err) => Err(global.wrap_failure(stack.to_strings(), err)),
    }
}
