//! Rule registry and the rules builder.
//!
//! A [`Rules`] value collects everything a build runs: one rule per key
//! type (how to produce a value from a key) and any number of top-level
//! actions (what to build). Registered handlers are stored erased, keyed by
//! the key type's `TypeId`; `apply` re-checks the registered value type at
//! the typed boundary.
//!
//! Per key family the registry carries the same handler triple the database
//! consumes: `execute` (run the rule), `stored` (read the value from the
//! environment, e.g. a file stat), and `equal` (compare a recorded value
//! against a stored one to decide staleness).

use crate::action::ActionContext;
use crate::error::ActionResult;
use crate::key::{Key, RuleKey, Value};
use futures::future::BoxFuture;
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

/// Erased rule body: produce a value for a key.
pub type ExecuteFn =
    Arc<dyn for<'a> Fn(&'a mut ActionContext, Key) -> BoxFuture<'a, ActionResult<Value>> + Send + Sync>;

/// Erased environment read: the value a key currently has outside the
/// build, if any.
pub type StoredFn = Arc<dyn Fn(&Key) -> Option<Value> + Send + Sync>;

/// Erased staleness comparison between a recorded and a stored value.
pub type EqualFn = Arc<dyn Fn(&Key, &Value, &Value) -> bool + Send + Sync>;

/// A top-level action submitted by the driver.
pub type TopLevelAction =
    Box<dyn for<'a> FnOnce(&'a mut ActionContext) -> BoxFuture<'a, ActionResult<()>> + Send>;

/// Registered handlers for one key family.
#[derive(Clone)]
pub struct RuleInfo {
    pub(crate) execute: ExecuteFn,
    pub(crate) stored: StoredFn,
    pub(crate) equal: EqualFn,
    pub(crate) result_type: TypeId,
    pub(crate) result_type_name: &'static str,
    pub(crate) file_key: bool,
}

/// Lookup table from key type tag to rule handlers.
#[derive(Default)]
pub struct RuleRegistry {
    rules: HashMap<TypeId, RuleInfo>,
}

impl RuleRegistry {
    /// The handlers registered for a key family, if any.
    pub(crate) fn lookup(&self, tag: TypeId) -> Option<&RuleInfo> {
        self.rules.get(&tag)
    }

    /// Whether the key family was registered as producing files.
    pub(crate) fn is_file_key(&self, key: &Key) -> bool {
        self.lookup(key.type_tag()).is_some_and(|info| info.file_key)
    }
}

/// Builder for a build's rules and top-level actions.
#[derive(Default)]
pub struct Rules {
    rules: HashMap<TypeId, RuleInfo>,
    actions: Vec<TopLevelAction>,
}

impl Rules {
    /// Creates an empty rule set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a rule for key type `K` with no stored-value lookup: keys
    /// of this family are rebuilt-on-demand and memoised per run.
    ///
    /// Registering the same key type twice keeps the later registration.
    pub fn rule<K, F>(&mut self, execute: F)
    where
        K: RuleKey,
        F: for<'a> Fn(&'a mut ActionContext, K) -> BoxFuture<'a, ActionResult<K::Value>>
            + Send
            + Sync
            + 'static,
    {
        self.rule_full::<K, F>(execute, RuleOptions::default());
    }

    /// Registers a rule with explicit stored/equal handlers and flags.
    pub fn rule_full<K, F>(&mut self, execute: F, options: RuleOptions<K>)
    where
        K: RuleKey,
        F: for<'a> Fn(&'a mut ActionContext, K) -> BoxFuture<'a, ActionResult<K::Value>>
            + Send
            + Sync
            + 'static,
    {
        let execute: ExecuteFn = Arc::new(
            move |ctx: &mut ActionContext, key: Key| -> BoxFuture<'_, ActionResult<Value>> {
                match key.downcast_ref::<K>().cloned() {
                    Some(typed) => {
                        let fut = execute(ctx, typed);
                        Box::pin(async move { fut.await.map(Value::new) })
                    }
                    None => {
                        let err = crate::error::BuildError::new(
                            crate::error::ErrorKind::RuleTypeMismatch {
                                type_name: key.type_name().to_owned(),
                                want: std::any::type_name::<K>().to_owned(),
                                got: key.type_name().to_owned(),
                            },
                        );
                        Box::pin(async move { Err(err) })
                    }
                }
            },
        );

        let stored_typed = options.stored;
        let stored: StoredFn = Arc::new(move |key: &Key| {
            let stored_typed = stored_typed.as_ref()?;
            let typed = key.downcast_ref::<K>()?;
            stored_typed(typed).map(Value::new)
        });

        let equal_typed = options.equal;
        let equal: EqualFn = Arc::new(move |key: &Key, old: &Value, new: &Value| {
            let (Some(key), Some(old), Some(new)) = (
                key.downcast_ref::<K>(),
                old.downcast_ref::<K::Value>(),
                new.downcast_ref::<K::Value>(),
            ) else {
                return false;
            };
            match &equal_typed {
                Some(equal) => equal(key, old, new),
                None => false,
            }
        });

        self.rules.insert(
            TypeId::of::<K>(),
            RuleInfo {
                execute,
                stored,
                equal,
                result_type: TypeId::of::<K::Value>(),
                result_type_name: std::any::type_name::<K::Value>(),
                file_key: options.file_key,
            },
        );
    }

    /// Adds a top-level action to run.
    pub fn action<F>(&mut self, act: F)
    where
        F: for<'a> FnOnce(&'a mut ActionContext) -> BoxFuture<'a, ActionResult<()>>
            + Send
            + 'static,
    {
        self.actions.push(Box::new(act));
    }

    /// Number of top-level actions added so far.
    pub fn action_count(&self) -> usize {
        self.actions.len()
    }

    pub(crate) fn into_parts(self) -> (Vec<TopLevelAction>, RuleRegistry) {
        (self.actions, RuleRegistry { rules: self.rules })
    }
}

/// Optional per-rule handlers and flags.
pub struct RuleOptions<K: RuleKey> {
    /// Reads the key's value from the environment, for staleness checks and
    /// lint validation. `None` means the key has no external state.
    pub stored: Option<Box<dyn Fn(&K) -> Option<K::Value> + Send + Sync>>,

    /// Compares a recorded value against a freshly stored one; `true` means
    /// still valid. Defaults to "never equal" when a `stored` handler is
    /// present, so such rules re-run unless told otherwise.
    pub equal: Option<Box<dyn Fn(&K, &K::Value, &K::Value) -> bool + Send + Sync>>,

    /// Marks this key family as producing files, for live-file listings.
    pub file_key: bool,
}

impl<K: RuleKey> Default for RuleOptions<K> {
    fn default() -> Self {
        Self {
            stored: None,
            equal: None,
            file_key: false,
        }
    }
}

impl<K: RuleKey> RuleOptions<K> {
    /// Sets the stored-value handler.
    pub fn stored(mut self, f: impl Fn(&K) -> Option<K::Value> + Send + Sync + 'static) -> Self {
        self.stored = Some(Box::new(f));
        self
    }

    /// Sets the staleness comparison.
    pub fn equal(
        mut self,
        f: impl Fn(&K, &K::Value, &K::Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.equal = Some(Box::new(f));
        self
    }

    /// Marks the key family as producing files.
    pub fn file_key(mut self) -> Self {
        self.file_key = true;
        self
    }
}
