//! Build-wide shared state.
//!
//! One [`Global`] exists per run, shared by every action through an `Arc`.
//! It is immutable apart from a few interior-mutable cells: the `after`
//! finaliser list, the `absent` tracking claims, and the first-error cell.
//! None of those locks is ever held across an await.

use crate::db::Database;
use crate::error::BuildError;
use crate::key::Key;
use crate::options::{apply_abbreviations, LintMode, OutputFn, ProgressFn, Verbosity};
use crate::pool::Pool;
use crate::rules::RuleRegistry;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// An IO finaliser registered by `run_after`, executed after the build.
pub(crate) type AfterFn = Box<dyn FnOnce() + Send>;

/// Serialised, abbreviation-applying sink for user-facing build output.
pub(crate) struct OutputSink {
    verbosity: Verbosity,
    abbreviations: Vec<(String, String)>,
    line_buffering: bool,
    sink: Mutex<Option<OutputFn>>,
}

impl OutputSink {
    pub fn new(
        verbosity: Verbosity,
        abbreviations: Vec<(String, String)>,
        line_buffering: bool,
        sink: Option<OutputFn>,
    ) -> Self {
        Self {
            verbosity,
            abbreviations,
            line_buffering,
            sink: Mutex::new(sink),
        }
    }

    /// Emits `message` when `level` is within the configured verbosity.
    pub fn write(&self, level: Verbosity, message: &str) {
        if level > self.verbosity || self.verbosity == Verbosity::Silent {
            return;
        }
        let message = apply_abbreviations(&self.abbreviations, message);
        let mut sink = self.sink.lock().expect("output lock poisoned");
        match sink.as_mut() {
            Some(f) => f(level, &message),
            None => {
                if level <= Verbosity::Quiet {
                    eprintln!("{message}");
                    let _ = std::io::stderr().flush();
                } else {
                    println!("{message}");
                    if self.line_buffering {
                        let _ = std::io::stdout().flush();
                    }
                }
            }
        }
    }

    /// Emits a lazily-built diagnostic line.
    pub fn diagnostic(&self, message: impl FnOnce() -> String) {
        if self.verbosity >= Verbosity::Diagnostic {
            self.write(Verbosity::Diagnostic, &message());
        }
    }
}

/// Settings the engine consults while actions run.
pub(crate) struct GlobalOptions {
    pub verbosity: Verbosity,
    pub keep_going: bool,
    pub lint: LintMode,
    pub reports: Vec<PathBuf>,
    pub live_files: Vec<PathBuf>,
    pub timings: bool,
    pub progress: Option<ProgressFn>,
    pub progress_interval: Duration,
}

/// State shared by all actions of one build.
pub(crate) struct Global {
    pub database: Arc<dyn Database>,
    pub pool: Pool,
    pub rules: Arc<RuleRegistry>,
    pub start: Instant,
    pub options: GlobalOptions,
    pub output: OutputSink,
    /// Finalisers to run after the build, in reverse registration order.
    pub after: Mutex<Vec<AfterFn>>,
    /// `(owner, key)` claims recorded by `track_change`: the owner rule
    /// asserts `key` is not tracked by the build.
    pub absent: Mutex<Vec<(Key, Key)>>,
    /// First failure observed, with its target label.
    pub first_error: Mutex<Option<BuildError>>,
    /// Working directory snapshot for the lint check.
    pub lint_cwd: Option<PathBuf>,
}

impl Global {
    /// Seconds elapsed since the build started.
    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    /// Records a failure. The first error is kept for the run result; in
    /// keep-going mode later errors were already reported at wrap time. With
    /// keep-going off, the pool is cancelled so queued work drains quickly.
    pub fn raise_error(&self, err: BuildError) {
        let mut cell = self.first_error.lock().expect("error lock poisoned");
        if cell.is_none() {
            *cell = Some(err);
        }
        drop(cell);
        if !self.options.keep_going {
            self.pool.cancel();
        }
    }

    /// The target label of the first failure, if any.
    pub fn first_error_target(&self) -> Option<String> {
        self.first_error
            .lock()
            .expect("error lock poisoned")
            .as_ref()
            .map(|e| e.target().unwrap_or("unknown").to_owned())
    }

    /// Attributes an unstructured failure to a key stack and, in keep-going
    /// mode, reports it through the output sink.
    pub fn wrap_failure(&self, stack: Vec<String>, err: BuildError) -> BuildError {
        let already_structured = err.is_structured();
        let wrapped = err.with_context(stack);
        if !already_structured
            && self.options.keep_going
            && self.options.verbosity >= Verbosity::Quiet
        {
            self.output.write(
                Verbosity::Quiet,
                &format!("{wrapped}\nContinuing due to keep-going mode"),
            );
        }
        wrapped
    }
}
