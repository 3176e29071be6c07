//! Structured build errors.
//!
//! A failure anywhere in a build is carried as a [`BuildError`]: the
//! underlying [`ErrorKind`] plus the key stack that was being built and a
//! short target label. The kind is shared (`Arc`-backed) because a single
//! failure can be observed by many waiters at once — every action demanding
//! a failed key, and every cache caller behind the same fence, receives a
//! clone of the same cause.
//!
//! Attribution happens exactly once per propagation chain:
//! [`BuildError::with_context`] is a no-op on an error that already carries
//! a target, so an error re-raised through several rule frames keeps the
//! stack of the frame where it was first attributed.

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Result alias used throughout the engine and by user rules.
pub type ActionResult<T> = Result<T, BuildError>;

/// The specific failure that occurred.
#[derive(Debug, Error)]
pub enum ErrorKind {
    /// `apply` was called in a scope where building dependencies is
    /// forbidden (inside `with_resource` or `extra_thread`).
    #[error("apply is not allowed here: {reason}")]
    NoApplyHere { reason: String },

    /// No rule is registered for the demanded key family.
    #[error("no rule to build key of type {type_name}{}", match key { Some(k) => format!(", first key: {k}"), None => String::new() })]
    NoRuleToBuild {
        type_name: String,
        key: Option<String>,
    },

    /// The registered rule produces a different value type than requested.
    #[error("rule for {type_name} produces values of type {got}, but {want} was requested")]
    RuleTypeMismatch {
        type_name: String,
        want: String,
        got: String,
    },

    /// Lint: the working directory drifted while a rule was running.
    #[error("lint: current directory changed\n  Wanted: {wanted}\n  Got:    {got}")]
    LintCwdChanged { wanted: String, got: String },

    /// Lint: keys recorded by `track_use` never became dependencies.
    #[error("lint: keys used but not depended upon:\n  {}", keys.join("\n  "))]
    LintUsedNotDepended { keys: Vec<String> },

    /// Lint: keys recorded by `track_use` are themselves built keys.
    #[error("lint: keys depended upon after being used:\n  {}", keys.join("\n  "))]
    LintDependedAfterUsed { keys: Vec<String> },

    /// Lint: the database validity check found problems.
    #[error("lint: check failed:\n  {}", problems.join("\n  "))]
    LintCheckFailed { problems: Vec<String> },

    /// `with_resources` was asked for a negative quantity.
    #[error("negative resource request: {n} of {resource}")]
    NegativeResourceRequest { resource: String, n: i64 },

    /// A finite resource was asked for more units than its capacity.
    #[error("resource {resource} has capacity {capacity}, but {n} units were requested")]
    ResourceOverCapacity {
        resource: String,
        capacity: usize,
        n: usize,
    },

    /// A key transitively demanded itself.
    #[error("dependency cycle detected while building {key}")]
    CycleDetected { key: String },

    /// The build finished with keys still mid-build (a scheduling bug or an
    /// undetected cross-demand cycle).
    #[error("build finished with keys still building:\n  {}", keys.join("\n  "))]
    IncompleteBuild { keys: Vec<String> },

    /// A failure raised from user action code.
    #[error("{0}")]
    UserFailure(Box<dyn std::error::Error + Send + Sync>),

    /// An I/O failure from the driver (report or live-file output).
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A structured build failure: target label, key stack, and cause.
///
/// Cloning is cheap; the cause is shared between clones. Each clone carries
/// its own attribution, so two actions observing the same memoised failure
/// each report it against their own key chain.
#[derive(Clone, Debug)]
pub struct BuildError {
    target: Option<Arc<str>>,
    stack: Arc<[String]>,
    kind: Arc<ErrorKind>,
}

impl BuildError {
    /// Creates an error that has not yet been attributed to a target.
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            target: None,
            stack: Arc::new([]),
            kind: Arc::new(kind),
        }
    }

    /// Creates a `UserFailure` from a message.
    pub fn user(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UserFailure(message.into().into()))
    }

    /// Creates a `UserFailure` from an arbitrary error.
    pub fn from_error(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::new(ErrorKind::UserFailure(Box::new(err)))
    }

    /// The underlying failure.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// The target label, once the error has been attributed.
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    /// The key stack captured at attribution time (innermost last).
    pub fn stack(&self) -> &[String] {
        &self.stack
    }

    /// Whether this error already carries a target and stack.
    pub fn is_structured(&self) -> bool {
        self.target.is_some()
    }

    /// Attributes the error to a key stack. No-op when already structured,
    /// so the innermost attribution wins. The target is the deepest frame,
    /// or a placeholder for an empty stack.
    pub(crate) fn with_context(mut self, stack: Vec<String>) -> Self {
        if self.is_structured() {
            return self;
        }
        let target = stack
            .last()
            .map(|s| s.as_str())
            .unwrap_or("Unknown call stack");
        self.target = Some(Arc::from(target));
        self.stack = stack.into();
        self
    }
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(target) = &self.target {
            writeln!(f, "Error when running {target}:")?;
            for frame in self.stack.iter().rev() {
                writeln!(f, "  at {frame}")?;
            }
        }
        write!(f, "{}", self.kind)
    }
}

impl std::error::Error for BuildError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.kind.as_ref())
    }
}

impl From<std::io::Error> for BuildError {
    fn from(err: std::io::Error) -> Self {
        Self::new(ErrorKind::Io(err))
    }
}
