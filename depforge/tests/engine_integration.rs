//! Integration tests for the build engine core.
//!
//! These tests verify the end-to-end engine workflow:
//! - Dependency recording through `apply`
//! - Rule memoisation (one execution per key per build)
//! - Cycle detection
//! - Keep-going error collection
//! - Order-only dependency suppression
//! - Post-build finalisers and lint tracking checks

use depforge::{
    run, run_with_database, ActionContext, ActionResult, BuildError, ErrorKind, Key, LintMode,
    Rules, RunOptions, Verbosity,
};
use depforge::db::{Database, MemoryDatabase};
use futures::future::BoxFuture;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// =============================================================================
// Test Helpers
// =============================================================================

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct Named(&'static str);

impl fmt::Display for Named {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl depforge::RuleKey for Named {
    type Value = String;
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct Unregistered(&'static str);

impl fmt::Display for Unregistered {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl depforge::RuleKey for Unregistered {
    type Value = String;
}

/// Captures every output line the driver emits.
fn capture_output(options: &mut RunOptions) -> Arc<Mutex<Vec<String>>> {
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&lines);
    options.output = Some(Box::new(move |_verbosity: Verbosity, message: &str| {
        sink.lock().unwrap().push(message.to_owned());
    }));
    lines
}

fn quiet() -> RunOptions {
    RunOptions {
        verbosity: Verbosity::Silent,
        ..RunOptions::default()
    }
}

// =============================================================================
// Dependency recording
// =============================================================================

#[tokio::test]
async fn test_chain_build_records_dependencies() {
    // k1 -> k2 -> "v": the top level sees k1, k1's entry records k2.
    fn chain(ctx: &mut ActionContext, key: Named) -> BoxFuture<'_, ActionResult<String>> {
        Box::pin(async move {
            match key.0 {
                "k1" => ctx.apply1(Named("k2")).await,
                "k2" => Ok("v".to_owned()),
                other => Err(BuildError::user(format!("unexpected key {other}"))),
            }
        })
    }

    let database = Arc::new(MemoryDatabase::new());
    let observed = Arc::new(Mutex::new((Vec::new(), Vec::new())));

    let mut rules = Rules::new();
    rules.rule(chain);
    {
        let observed = Arc::clone(&observed);
        rules.action(move |ctx: &mut ActionContext| -> BoxFuture<'_, ActionResult<()>> {
            Box::pin(async move {
                let values = ctx.apply(vec![Named("k1")]).await?;
                let depends: Vec<Vec<String>> = ctx
                    .recorded_depends()
                    .iter()
                    .map(|d| d.keys().iter().map(|k| k.to_string()).collect())
                    .collect();
                *observed.lock().unwrap() = (values, depends);
                Ok(())
            })
        });
    }

    run_with_database(quiet(), rules, database.clone())
        .await
        .unwrap();

    let (values, depends) = observed.lock().unwrap().clone();
    assert_eq!(values, ["v"]);
    assert_eq!(depends, [vec!["k1".to_owned()]]);

    // The database recorded k1 -> k2.
    let k1_deps = database
        .lookup_dependencies(&Key::new(Named("k1")))
        .expect("k1 was built");
    assert_eq!(
        k1_deps.iter().map(|k| k.to_string()).collect::<Vec<_>>(),
        ["k2"]
    );
    // k2 is a source: no dependencies of its own.
    let k2_deps = database
        .lookup_dependencies(&Key::new(Named("k2")))
        .expect("k2 was built");
    assert!(k2_deps.is_empty());
}

#[tokio::test]
async fn test_rule_runs_once_per_key_across_concurrent_demands() {
    static EXECUTIONS: AtomicUsize = AtomicUsize::new(0);

    fn counted(_ctx: &mut ActionContext, key: Named) -> BoxFuture<'_, ActionResult<String>> {
        Box::pin(async move {
            EXECUTIONS.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(format!("built-{}", key.0))
        })
    }

    let mut rules = Rules::new();
    rules.rule(counted);
    let values = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..4 {
        let values = Arc::clone(&values);
        rules.action(move |ctx: &mut ActionContext| -> BoxFuture<'_, ActionResult<()>> {
            Box::pin(async move {
                let value = ctx.apply1(Named("shared")).await?;
                values.lock().unwrap().push(value);
                Ok(())
            })
        });
    }

    let options = RunOptions {
        threads: 4,
        ..quiet()
    };
    run(options, rules).await.unwrap();

    assert_eq!(EXECUTIONS.load(Ordering::SeqCst), 1);
    let values = values.lock().unwrap();
    assert_eq!(values.len(), 4);
    assert!(values.iter().all(|v| v == "built-shared"));
}

#[tokio::test]
async fn test_order_only_discards_dependencies() {
    fn leaf(_ctx: &mut ActionContext, key: Named) -> BoxFuture<'_, ActionResult<String>> {
        Box::pin(async move { Ok(key.0.to_owned()) })
    }

    let depend_counts = Arc::new(Mutex::new((0usize, 0usize)));

    let mut rules = Rules::new();
    rules.rule(leaf);
    {
        let depend_counts = Arc::clone(&depend_counts);
        rules.action(move |ctx: &mut ActionContext| -> BoxFuture<'_, ActionResult<()>> {
            Box::pin(async move {
                ctx.apply1(Named("tracked")).await?;
                let before = ctx.recorded_depends().len();
                ctx.order_only(|ctx: &mut ActionContext| -> BoxFuture<'_, ActionResult<String>> {
                    Box::pin(async move { ctx.apply1(Named("untracked")).await })
                })
                .await?;
                let after = ctx.recorded_depends().len();
                *depend_counts.lock().unwrap() = (before, after);
                Ok(())
            })
        });
    }

    run(quiet(), rules).await.unwrap();

    let (before, after) = *depend_counts.lock().unwrap();
    assert_eq!(before, 1);
    assert_eq!(after, before, "order-only work must not add dependencies");
}

// =============================================================================
// Errors
// =============================================================================

#[tokio::test]
async fn test_cycle_is_detected() {
    fn cyclic(ctx: &mut ActionContext, key: Named) -> BoxFuture<'_, ActionResult<String>> {
        Box::pin(async move {
            let _ = key;
            ctx.apply1(Named("k1")).await
        })
    }

    let mut rules = Rules::new();
    rules.rule(cyclic);
    rules.action(|ctx: &mut ActionContext| -> BoxFuture<'_, ActionResult<()>> {
        Box::pin(async move {
            ctx.apply1(Named("k1")).await?;
            Ok(())
        })
    });

    let err = run(quiet(), rules).await.unwrap_err();
    assert!(
        matches!(err.kind(), ErrorKind::CycleDetected { key } if key == "k1"),
        "unexpected error: {err}"
    );
    assert_eq!(err.target(), Some("k1"));
}

#[tokio::test]
async fn test_missing_rule_is_reported() {
    let mut rules = Rules::new();
    rules.action(|ctx: &mut ActionContext| -> BoxFuture<'_, ActionResult<()>> {
        Box::pin(async move {
            ctx.apply1(Unregistered("orphan")).await?;
            Ok(())
        })
    });

    let err = run(quiet(), rules).await.unwrap_err();
    assert!(
        matches!(err.kind(), ErrorKind::NoRuleToBuild { key: Some(k), .. } if k == "orphan"),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn test_keep_going_collects_all_failures() {
    let mut options = RunOptions {
        keep_going: true,
        verbosity: Verbosity::Normal,
        ..RunOptions::default()
    };
    let lines = capture_output(&mut options);

    let mut rules = Rules::new();
    rules.action(|_ctx: &mut ActionContext| -> BoxFuture<'_, ActionResult<()>> {
        Box::pin(async move { Err(BuildError::user("failure A")) })
    });
    rules.action(|_ctx: &mut ActionContext| -> BoxFuture<'_, ActionResult<()>> {
        Box::pin(async move { Err(BuildError::user("failure B")) })
    });

    let err = run(options, rules).await.unwrap_err();
    assert_eq!(err.target(), Some("top-level action"));

    let joined = lines.lock().unwrap().join("\n");
    assert!(joined.contains("failure A"), "missing A in: {joined}");
    assert!(joined.contains("failure B"), "missing B in: {joined}");
    assert!(joined.contains("Continuing due to keep-going mode"));
}

#[tokio::test]
async fn test_fail_fast_returns_first_error() {
    let mut rules = Rules::new();
    rules.action(|_ctx: &mut ActionContext| -> BoxFuture<'_, ActionResult<()>> {
        Box::pin(async move { Err(BuildError::user("boom")) })
    });

    let err = run(quiet(), rules).await.unwrap_err();
    assert!(err.to_string().contains("boom"));
    assert!(err.is_structured());
}

#[tokio::test]
async fn test_failing_rule_failure_reaches_every_demander() {
    fn failing(_ctx: &mut ActionContext, _key: Named) -> BoxFuture<'_, ActionResult<String>> {
        Box::pin(async move { Err(BuildError::user("rule exploded")) })
    }

    let failures = Arc::new(AtomicUsize::new(0));

    let mut rules = Rules::new();
    rules.rule(failing);
    for _ in 0..3 {
        let failures = Arc::clone(&failures);
        rules.action(move |ctx: &mut ActionContext| -> BoxFuture<'_, ActionResult<()>> {
            Box::pin(async move {
                let result = ctx.apply1(Named("bad")).await;
                if result.is_err() {
                    failures.fetch_add(1, Ordering::SeqCst);
                }
                result.map(|_| ())
            })
        });
    }

    let options = RunOptions {
        keep_going: true,
        ..quiet()
    };
    let err = run(options, rules).await.unwrap_err();
    assert!(err.to_string().contains("rule exploded"));
    assert_eq!(failures.load(Ordering::SeqCst), 3);
}

// =============================================================================
// Driver behaviour
// =============================================================================

#[tokio::test]
async fn test_empty_build_warns() {
    let mut options = RunOptions::default();
    let lines = capture_output(&mut options);

    run(options, Rules::new()).await.unwrap();

    let joined = lines.lock().unwrap().join("\n");
    assert!(joined.contains("no actions specified"));
}

#[tokio::test]
async fn test_finalisers_run_in_reverse_order() {
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut rules = Rules::new();
    {
        let order = Arc::clone(&order);
        rules.action(move |ctx: &mut ActionContext| -> BoxFuture<'_, ActionResult<()>> {
            Box::pin(async move {
                let first = Arc::clone(&order);
                ctx.run_after(move || first.lock().unwrap().push("first"));
                let second = Arc::clone(&order);
                ctx.run_after(move || second.lock().unwrap().push("second"));
                Ok(())
            })
        });
    }

    run(quiet(), rules).await.unwrap();
    assert_eq!(*order.lock().unwrap(), ["second", "first"]);
}

#[tokio::test]
async fn test_abbreviations_are_applied_to_output() {
    let mut options = RunOptions {
        abbreviations: vec![("/very/long/prefix".to_owned(), "$P".to_owned())],
        ..RunOptions::default()
    };
    let lines = capture_output(&mut options);

    let mut rules = Rules::new();
    rules.action(|ctx: &mut ActionContext| -> BoxFuture<'_, ActionResult<()>> {
        Box::pin(async move {
            ctx.put_normal("compiling /very/long/prefix/main.c");
            Ok(())
        })
    });

    run(options, rules).await.unwrap();

    let joined = lines.lock().unwrap().join("\n");
    assert!(joined.contains("compiling $P/main.c"), "got: {joined}");
}

#[tokio::test]
async fn test_progress_reports_reach_callback() {
    let snapshots = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&snapshots);

    let options = RunOptions {
        progress: Some(Arc::new(move |_progress: &depforge::db::Progress| {
            seen.fetch_add(1, Ordering::SeqCst);
        })),
        progress_interval: Duration::from_millis(10),
        ..quiet()
    };

    let mut rules = Rules::new();
    rules.action(|_ctx: &mut ActionContext| -> BoxFuture<'_, ActionResult<()>> {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(())
        })
    });

    run(options, rules).await.unwrap();
    assert!(snapshots.load(Ordering::SeqCst) >= 1);
}

// =============================================================================
// Tracking lint
// =============================================================================

#[tokio::test]
async fn test_track_use_of_undeclared_key_fails_lint() {
    fn sloppy(ctx: &mut ActionContext, _key: Named) -> BoxFuture<'_, ActionResult<String>> {
        Box::pin(async move {
            // Reads a key it never depends on.
            ctx.track_use(Named("config"));
            Ok("done".to_owned())
        })
    }

    let mut rules = Rules::new();
    rules.rule(sloppy);
    rules.action(|ctx: &mut ActionContext| -> BoxFuture<'_, ActionResult<()>> {
        Box::pin(async move {
            ctx.apply1(Named("target")).await?;
            Ok(())
        })
    });

    let options = RunOptions {
        lint: LintMode::Tracked,
        ..quiet()
    };
    let err = run(options, rules).await.unwrap_err();
    assert!(
        matches!(err.kind(), ErrorKind::LintUsedNotDepended { keys } if keys == &["config"]),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn test_track_use_of_dependency_passes_lint() {
    fn tidy(ctx: &mut ActionContext, key: Named) -> BoxFuture<'_, ActionResult<String>> {
        Box::pin(async move {
            match key.0 {
                "target" => {
                    let value = ctx.apply1(Named("config")).await?;
                    ctx.track_use(Named("config"));
                    Ok(value)
                }
                _ => Ok("source".to_owned()),
            }
        })
    }

    let mut rules = Rules::new();
    rules.rule(tidy);
    rules.action(|ctx: &mut ActionContext| -> BoxFuture<'_, ActionResult<()>> {
        Box::pin(async move {
            ctx.apply1(Named("target")).await?;
            Ok(())
        })
    });

    let options = RunOptions {
        lint: LintMode::Tracked,
        ..quiet()
    };
    run(options, rules).await.unwrap();
}

#[tokio::test]
async fn test_track_allow_suppresses_lint() {
    fn allowed(ctx: &mut ActionContext, _key: Named) -> BoxFuture<'_, ActionResult<String>> {
        Box::pin(async move {
            ctx.track_allow(|key: &Named| key.0.starts_with("gen-"));
            ctx.track_use(Named("gen-header"));
            Ok("done".to_owned())
        })
    }

    let mut rules = Rules::new();
    rules.rule(allowed);
    rules.action(|ctx: &mut ActionContext| -> BoxFuture<'_, ActionResult<()>> {
        Box::pin(async move {
            ctx.apply1(Named("target")).await?;
            Ok(())
        })
    });

    let options = RunOptions {
        lint: LintMode::Tracked,
        ..quiet()
    };
    run(options, rules).await.unwrap();
}

// =============================================================================
// Reports and live files
// =============================================================================

#[tokio::test]
async fn test_report_written_to_file() {
    fn leaf(_ctx: &mut ActionContext, key: Named) -> BoxFuture<'_, ActionResult<String>> {
        Box::pin(async move { Ok(key.0.to_owned()) })
    }

    let dir = tempfile::tempdir().unwrap();
    let report_path = dir.path().join("report.json");

    let mut rules = Rules::new();
    rules.rule(leaf);
    rules.action(|ctx: &mut ActionContext| -> BoxFuture<'_, ActionResult<()>> {
        Box::pin(async move {
            ctx.apply1(Named("a")).await?;
            Ok(())
        })
    });

    let options = RunOptions {
        reports: vec![report_path.clone()],
        ..quiet()
    };
    run(options, rules).await.unwrap();

    let text = std::fs::read_to_string(&report_path).unwrap();
    let report: serde_json::Value = serde_json::from_str(&text).unwrap();
    let entries = report["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["key"], "a");
}

#[tokio::test]
async fn test_live_files_lists_file_keys_only() {
    use depforge::RuleOptions;

    #[derive(Clone, Debug, Hash, PartialEq, Eq)]
    struct FileOut(&'static str);

    impl fmt::Display for FileOut {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl depforge::RuleKey for FileOut {
        type Value = String;
    }

    fn file_rule(_ctx: &mut ActionContext, key: FileOut) -> BoxFuture<'_, ActionResult<String>> {
        Box::pin(async move { Ok(key.0.to_owned()) })
    }

    fn plain_rule(_ctx: &mut ActionContext, key: Named) -> BoxFuture<'_, ActionResult<String>> {
        Box::pin(async move { Ok(key.0.to_owned()) })
    }

    let dir = tempfile::tempdir().unwrap();
    let live_path = dir.path().join("live.txt");

    let mut rules = Rules::new();
    rules.rule_full(file_rule, RuleOptions::default().file_key());
    rules.rule(plain_rule);
    rules.action(|ctx: &mut ActionContext| -> BoxFuture<'_, ActionResult<()>> {
        Box::pin(async move {
            ctx.apply1(FileOut("out/main.o")).await?;
            ctx.apply1(Named("phony")).await?;
            Ok(())
        })
    });

    let options = RunOptions {
        live_files: vec![live_path.clone()],
        ..quiet()
    };
    run(options, rules).await.unwrap();

    let listing = std::fs::read_to_string(&live_path).unwrap();
    assert!(listing.contains("out/main.o"));
    assert!(!listing.contains("phony"));
}

// =============================================================================
// Database reuse
// =============================================================================

#[tokio::test]
async fn test_second_run_reuses_memoised_values() {
    static EXECUTIONS: AtomicUsize = AtomicUsize::new(0);

    fn counted(_ctx: &mut ActionContext, key: Named) -> BoxFuture<'_, ActionResult<String>> {
        Box::pin(async move {
            EXECUTIONS.fetch_add(1, Ordering::SeqCst);
            Ok(key.0.to_owned())
        })
    }

    let database: Arc<MemoryDatabase> = Arc::new(MemoryDatabase::new());

    for _ in 0..2 {
        let mut rules = Rules::new();
        rules.rule(counted);
        rules.action(|ctx: &mut ActionContext| -> BoxFuture<'_, ActionResult<()>> {
            Box::pin(async move {
                ctx.apply1(Named("stable")).await?;
                Ok(())
            })
        });
        run_with_database(quiet(), rules, database.clone())
            .await
            .unwrap();
    }

    // No stored handler: the recorded value stays valid across runs.
    assert_eq!(EXECUTIONS.load(Ordering::SeqCst), 1);
}
