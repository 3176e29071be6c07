//! Erased key and value handles.
//!
//! Rules are registered per key *type*; at run time keys and values travel
//! through the scheduler and the database in erased form. A [`Key`] pairs a
//! `TypeId` tag (identifying the rule family) with a hashable, equatable
//! payload; a [`Value`] pairs a tag with an `Any` payload recovered by
//! downcast at the `apply` boundary.

use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A key type that can be demanded through [`apply`](crate::ActionContext::apply).
///
/// The associated `Value` is what the registered rule produces for keys of
/// this type.
pub trait RuleKey:
    fmt::Debug + fmt::Display + Hash + Eq + Clone + Send + Sync + 'static
{
    /// The value type produced by this key family's rule.
    type Value: Clone + Send + Sync + 'static;
}

/// Object-safe view of a key payload.
trait ErasedKey: Any + fmt::Debug + fmt::Display + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn erased_hash(&self, state: &mut dyn Hasher);
    fn erased_eq(&self, other: &dyn ErasedKey) -> bool;
}

impl<K> ErasedKey for K
where
    K: fmt::Debug + fmt::Display + Hash + Eq + Send + Sync + 'static,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn erased_hash(&self, mut state: &mut dyn Hasher) {
        self.hash(&mut state);
    }

    fn erased_eq(&self, other: &dyn ErasedKey) -> bool {
        other
            .as_any()
            .downcast_ref::<K>()
            .is_some_and(|other| self == other)
    }
}

/// An erased, typed key handle.
#[derive(Clone)]
pub struct Key {
    type_tag: TypeId,
    type_name: &'static str,
    payload: Arc<dyn ErasedKey>,
}

impl Key {
    /// Erases a typed key.
    pub fn new<K: RuleKey>(key: K) -> Self {
        Self {
            type_tag: TypeId::of::<K>(),
            type_name: std::any::type_name::<K>(),
            payload: Arc::new(key),
        }
    }

    /// The tag identifying this key's rule family.
    pub fn type_tag(&self) -> TypeId {
        self.type_tag
    }

    /// The key type's name, for error messages.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Recovers the typed key, if the tag matches.
    pub fn downcast_ref<K: RuleKey>(&self) -> Option<&K> {
        self.payload.as_any().downcast_ref()
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.type_tag == other.type_tag && self.payload.erased_eq(other.payload.as_ref())
    }
}

impl Eq for Key {}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_tag.hash(state);
        self.payload.erased_hash(state);
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.payload, f)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({:?})", self.payload)
    }
}

/// An erased rule result.
#[derive(Clone)]
pub struct Value {
    type_tag: TypeId,
    type_name: &'static str,
    payload: Arc<dyn Any + Send + Sync>,
}

impl Value {
    /// Erases a typed value.
    pub fn new<V: Clone + Send + Sync + 'static>(value: V) -> Self {
        Self {
            type_tag: TypeId::of::<V>(),
            type_name: std::any::type_name::<V>(),
            payload: Arc::new(value),
        }
    }

    /// The tag of the contained value type.
    pub fn type_tag(&self) -> TypeId {
        self.type_tag
    }

    /// The value type's name, for error messages.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Borrows the typed value, if the tag matches.
    pub fn downcast_ref<V: 'static>(&self) -> Option<&V> {
        self.payload.downcast_ref()
    }

    /// Clones out the typed value, if the tag matches.
    pub fn downcast_clone<V: Clone + 'static>(&self) -> Option<V> {
        self.payload.downcast_ref::<V>().cloned()
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Value({})", self.type_name)
    }
}

/// The chain of keys currently being built on one action's path.
///
/// The top (last element) is the key the action is executing for; top-level
/// actions carry an empty stack. Used for cycle reporting and error
/// attribution.
#[derive(Clone, Debug, Default)]
pub struct Stack(Vec<Key>);

impl Stack {
    /// An empty stack, for top-level actions.
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of this stack with `key` pushed on top.
    pub fn push(&self, key: Key) -> Self {
        let mut keys = self.0.clone();
        keys.push(key);
        Self(keys)
    }

    /// The key currently being executed, if any.
    pub fn top(&self) -> Option<&Key> {
        self.0.last()
    }

    /// Whether `key` is anywhere on this chain.
    pub fn contains(&self, key: &Key) -> bool {
        self.0.contains(key)
    }

    /// The chain, outermost first.
    pub fn keys(&self) -> &[Key] {
        &self.0
    }

    /// The chain rendered for error messages, outermost first.
    pub fn to_strings(&self) -> Vec<String> {
        self.0.iter().map(|k| k.to_string()).collect()
    }
}
