//! Build run configuration.
//!
//! [`RunOptions`] collects everything the driver consumes: thread budget,
//! verbosity, error policy, lint level, report and live-file outputs, and
//! the optional output/progress callbacks. Defaults match a plain
//! interactive build (auto thread count, `Normal` verbosity, fail fast).

use crate::db::Progress;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Default tick interval for the progress reporter task.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// How much build output to emit.
///
/// A message is shown when its level is at or below the configured
/// verbosity: `Quiet` shows errors only, `Diagnostic` shows everything.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Verbosity {
    /// No output at all, not even errors.
    Silent,
    /// Errors only.
    Quiet,
    /// Errors and important messages.
    #[default]
    Normal,
    /// Errors and detailed messages.
    Loud,
    /// One line per executed rule, plus everything above.
    Chatty,
    /// Internal scheduler and resource diagnostics.
    Diagnostic,
}

/// Post-build invariant checking level.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LintMode {
    /// No lint checks.
    #[default]
    Off,
    /// Working-directory stability and database validity checks.
    Basic,
    /// `Basic` plus end-of-rule usage-tracking checks.
    Tracked,
}

impl LintMode {
    /// Whether any lint checking is enabled.
    pub fn enabled(self) -> bool {
        self != LintMode::Off
    }
}

/// Sink for user-facing build output.
pub type OutputFn = Box<dyn FnMut(Verbosity, &str) + Send>;

/// Callback invoked with periodic progress snapshots.
pub type ProgressFn = Arc<dyn Fn(&Progress) + Send + Sync>;

/// Configuration for a single [`run`](crate::run).
pub struct RunOptions {
    /// Worker slots. `0` means use the detected processor count.
    pub threads: usize,

    /// Flush the default output sink after every line.
    pub line_buffering: bool,

    /// `(from, to)` replacements applied to every output line. Longer
    /// `from` strings are applied first.
    pub abbreviations: Vec<(String, String)>,

    /// Output threshold.
    pub verbosity: Verbosity,

    /// Continue after failures, recording the first error and reporting the
    /// rest through the output sink.
    pub keep_going: bool,

    /// Print per-phase durations when the run finishes.
    pub timings: bool,

    /// Lint checking level.
    pub lint: LintMode,

    /// Paths to write the build report to (`-` means stdout).
    pub reports: Vec<PathBuf>,

    /// Paths to write the live file list to (`-` means stdout).
    pub live_files: Vec<PathBuf>,

    /// Periodic progress callback, driven by a dedicated reporter task.
    pub progress: Option<ProgressFn>,

    /// Tick interval for the progress reporter.
    pub progress_interval: Duration,

    /// Replacement output sink. When `None`, messages at `Normal` and above
    /// go to stdout and errors to stderr.
    pub output: Option<OutputFn>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            threads: 0,
            line_buffering: false,
            abbreviations: Vec::new(),
            verbosity: Verbosity::default(),
            keep_going: false,
            timings: false,
            lint: LintMode::default(),
            reports: Vec::new(),
            live_files: Vec::new(),
            progress: None,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            output: None,
        }
    }
}

impl RunOptions {
    /// Resolves the worker slot count, defaulting to the processor count.
    pub(crate) fn effective_threads(&self) -> usize {
        if self.threads > 0 {
            return self.threads;
        }
        std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(4)
    }
}

/// Applies abbreviations to a message, longest `from` first so that
/// overlapping abbreviations compose predictably.
pub(crate) fn apply_abbreviations(abbreviations: &[(String, String)], message: &str) -> String {
    let mut ordered: Vec<&(String, String)> = abbreviations.iter().collect();
    ordered.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

    let mut out = message.to_owned();
    for (from, to) in ordered {
        if !from.is_empty() {
            out = out.replace(from, to);
        }
    }
    out
}
