//! The build driver.
//!
//! [`run`] takes a configured [`RunOptions`] and a [`Rules`] value, spins
//! up the worker pool and the progress reporter, submits every top-level
//! action, and drives the build to completion. Afterwards it performs the
//! post-build steps in order: database integrity assertion, lint
//! validation, report and live-file outputs, registered finalisers
//! (reverse registration order), and the timing dump.
//!
//! Error policy: with `keep_going` off the first failure cancels the pool
//! and is returned once running work drains; with it on, every failure is
//! reported through the output sink as it happens and only the first is
//! returned at the end.

use crate::action::{build_ops, ActionContext, Global, GlobalOptions, Local, OutputSink};
use crate::db::{Database, MemoryDatabase};
use crate::error::BuildError;
use crate::key::Stack;
use crate::options::{RunOptions, Verbosity};
use crate::pool::{JobPriority, Pool};
use crate::rules::Rules;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Runs a build against a fresh in-memory database.
pub async fn run(options: RunOptions, rules: Rules) -> Result<(), BuildError> {
    run_with_database(options, rules, Arc::new(MemoryDatabase::new())).await
}

/// Runs a build against the given database. Reusing a database across runs
/// keeps still-valid results.
pub async fn run_with_database(
    mut options: RunOptions,
    rules: Rules,
    database: Arc<dyn Database>,
) -> Result<(), BuildError> {
    let start = Instant::now();
    let mut phases: Vec<(&'static str, Duration)> = Vec::new();

    let threads = options.effective_threads();
    let (actions, registry) = rules.into_parts();
    let action_count = actions.len();

    let output = OutputSink::new(
        options.verbosity,
        std::mem::take(&mut options.abbreviations),
        options.line_buffering,
        options.output.take(),
    );

    let lint_cwd = if options.lint.enabled() {
        std::env::current_dir().ok()
    } else {
        None
    };

    let pool = Pool::new(threads);
    database.begin_build();

    let global = Arc::new(Global {
        database: Arc::clone(&database),
        pool: pool.clone(),
        rules: Arc::new(registry),
        start,
        options: GlobalOptions {
            verbosity: options.verbosity,
            keep_going: options.keep_going,
            lint: options.lint,
            reports: options.reports,
            live_files: options.live_files,
            timings: options.timings,
            progress: options.progress,
            progress_interval: options.progress_interval,
        },
        output,
        after: Mutex::new(Vec::new()),
        absent: Mutex::new(Vec::new()),
        first_error: Mutex::new(None),
        lint_cwd,
    });

    info!(threads, actions = action_count, "build started");

    let progress_cancel = CancellationToken::new();
    let progress_task = global.options.progress.clone().map(|callback| {
        let database = Arc::clone(&database);
        let global = Arc::clone(&global);
        let token = progress_cancel.clone();
        let interval = global.options.progress_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let mut snapshot = database.progress();
                        snapshot.is_failure = global.first_error_target();
                        callback(&snapshot);
                    }
                }
            }
        })
    });

    for act in actions {
        let global = Arc::clone(&global);
        pool.spawn(async move {
            if global.pool.is_cancelled() {
                // A fatal error elsewhere; this action never starts.
                return;
            }
            let slot = global.pool.acquire(JobPriority::Normal).await;
            let local = Local::new(Stack::new(), global.options.verbosity);
            let mut ctx = ActionContext::new(Arc::clone(&global), local, slot);
            let result = AssertUnwindSafe(act(&mut ctx))
                .catch_unwind()
                .await
                .unwrap_or_else(|_panic| Err(BuildError::user("top-level action panicked")));
            if let Err(err) = result {
                let err = global.wrap_failure(vec!["top-level action".to_owned()], err);
                global.raise_error(err);
            }
        });
    }

    pool.wait_idle().await;
    phases.push(("build", start.elapsed()));
    let post_started = Instant::now();

    progress_cancel.cancel();
    if let Some(task) = progress_task {
        let _ = task.await;
    }

    let first_error = global
        .first_error
        .lock()
        .expect("error lock poisoned")
        .take();
    if let Some(err) = first_error {
        dump_timings(&global, &phases);
        return Err(err);
    }

    database.assert_finished()?;

    if action_count == 0 {
        global
            .output
            .write(Verbosity::Normal, "warning: no actions specified");
    }

    if global.options.lint.enabled() {
        let ops = build_ops(&global);
        let absent = global
            .absent
            .lock()
            .expect("absent lock poisoned")
            .clone();
        database.check_valid(&ops.stored, &ops.equal, &absent)?;
        global
            .output
            .write(Verbosity::Loud, "Lint checking succeeded");
    }

    if !global.options.reports.is_empty() {
        let report = database.to_report();
        let json = serde_json::to_string_pretty(&report)
            .map_err(|err| BuildError::user(format!("failed to serialise report: {err}")))?;
        for path in &global.options.reports {
            write_output(&global, path, &json)?;
        }
    }

    if !global.options.live_files.is_empty() {
        let mut live: Vec<String> = database
            .list_live()
            .into_iter()
            .filter(|key| global.rules.is_file_key(key))
            .map(|key| key.to_string())
            .collect();
        live.sort();
        let listing = live.join("\n");
        for path in &global.options.live_files {
            write_output(&global, path, &listing)?;
        }
    }

    let finalisers = std::mem::take(&mut *global.after.lock().expect("after lock poisoned"));
    for finaliser in finalisers.into_iter().rev() {
        // One failing finaliser must not stop the rest.
        if std::panic::catch_unwind(AssertUnwindSafe(finaliser)).is_err() {
            warn!("a post-build finaliser panicked");
            global
                .output
                .write(Verbosity::Quiet, "warning: a post-build finaliser panicked");
        }
    }

    phases.push(("post-build", post_started.elapsed()));
    dump_timings(&global, &phases);
    info!(elapsed = ?start.elapsed(), "build finished");
    Ok(())
}

/// Writes driver output to a path, with `-` meaning the output sink.
fn write_output(global: &Global, path: &Path, content: &str) -> Result<(), BuildError> {
    if path.as_os_str() == "-" {
        global.output.write(Verbosity::Quiet, content);
        Ok(())
    } else {
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Prints per-phase durations when timings are enabled.
fn dump_timings(global: &Global, phases: &[(&'static str, Duration)]) {
    if !global.options.timings {
        return;
    }
    for (name, duration) in phases {
        global.output.write(
            Verbosity::Normal,
            &format!("{name}: {:.3}s", duration.as_secs_f64()),
        );
    }
}
