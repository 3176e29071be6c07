//! Usage tracking and lint bookkeeping.
//!
//! Rules that shell out to external tools can report what those tools
//! actually touched: `track_use` for reads, `track_change` for writes.
//! The engine checks the reports against the recorded dependency graph —
//! immediately where possible, at end of rule otherwise — so untracked
//! file access surfaces as a lint error instead of a stale build.

use super::ActionContext;
use crate::error::{ActionResult, BuildError, ErrorKind};
use crate::key::{Key, RuleKey};
use std::collections::HashSet;
use std::sync::Arc;

impl ActionContext {
    /// Reports that this rule read `key`.
    ///
    /// Accepted silently when `key` is the rule's own key, already a
    /// recorded dependency, or covered by a `track_allow` predicate;
    /// otherwise queued for the end-of-rule check.
    pub fn track_use<K: RuleKey>(&mut self, key: K) {
        self.track_use_key(Key::new(key));
    }

    pub(crate) fn track_use_key(&mut self, key: Key) {
        if self.local.stack.top() == Some(&key) {
            return;
        }
        if self.local.flat_depends().any(|dep| dep == &key) {
            return;
        }
        if self.local.track_allows.iter().any(|allow| allow(&key)) {
            return;
        }
        self.local.track_used.push(key);
    }

    /// Reports that this rule wrote `key`.
    ///
    /// Writing your own key or an allowed key is fine. Anything else is
    /// recorded as a claim that `key` is not tracked by the build, checked
    /// by the database's lint validation after the run.
    pub fn track_change<K: RuleKey>(&mut self, key: K) {
        let key = Key::new(key);
        if self.local.stack.top() == Some(&key) {
            return;
        }
        if self.local.track_allows.iter().any(|allow| allow(&key)) {
            return;
        }
        let owner = self
            .local
            .stack
            .top()
            .cloned()
            .unwrap_or_else(|| key.clone());
        self.global
            .absent
            .lock()
            .expect("absent lock poisoned")
            .push((owner, key));
    }

    /// Installs a predicate that suppresses tracking checks for matching
    /// keys, scoped to the rest of this action. The predicate only ever
    /// matches keys of type `K`.
    pub fn track_allow<K: RuleKey>(
        &mut self,
        predicate: impl Fn(&K) -> bool + Send + Sync + 'static,
    ) {
        self.local.track_allows.push(Arc::new(move |key: &Key| {
            key.downcast_ref::<K>().is_some_and(&predicate)
        }));
    }

    /// End-of-rule validation of queued `track_use` reports.
    ///
    /// Every queued key must (a) have become a dependency by now, and
    /// (b) be a source — a key with no dependencies of its own. A built key
    /// that was read before being depended upon means the rule saw a
    /// possibly-stale value.
    pub(crate) fn track_check_used(&self) -> ActionResult<()> {
        if self.local.track_used.is_empty() {
            return Ok(());
        }

        let depends: HashSet<&Key> = self.local.flat_depends().collect();

        let not_depended: Vec<String> = self
            .local
            .track_used
            .iter()
            .filter(|key| !depends.contains(key))
            .map(|key| key.to_string())
            .collect();
        if !not_depended.is_empty() {
            return Err(BuildError::new(ErrorKind::LintUsedNotDepended {
                keys: not_depended,
            }));
        }

        let not_source: Vec<String> = self
            .local
            .track_used
            .iter()
            .filter(|key| {
                self.global
                    .database
                    .lookup_dependencies(key)
                    .is_some_and(|deps| !deps.is_empty())
            })
            .map(|key| key.to_string())
            .collect();
        if !not_source.is_empty() {
            return Err(BuildError::new(ErrorKind::LintDependedAfterUsed {
                keys: not_source,
            }));
        }

        Ok(())
    }
}
