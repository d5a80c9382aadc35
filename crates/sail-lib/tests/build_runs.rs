//! End-to-end build scenarios: cold and warm runs, shared-cache
//! restoration, partial invalidation, failure propagation, cycles.

mod common;

use common::{mtime_ms, Fixture};
use sail_lib::{run::summary::TaskResultKind, CleanOpts, RunOpts};

fn timing<'a>(
    summary: &'a sail_lib::run::ExecutionSummary,
    id: &str,
) -> &'a sail_lib::run::summary::TaskTiming {
    summary
        .timings
        .iter()
        .find(|t| t.id == id)
        .unwrap_or_else(|| panic!("no timing for {id}"))
}

#[tokio::test]
async fn test_simple_chain_cold_then_warm() {
    let fixture = Fixture::with_build_config();
    fixture.add_copy_package("lib", &[]);
    fixture.add_copy_package("app", &["lib"]);

    // Cold: both tasks execute, dependency first.
    let outcome = sail_lib::run(&fixture.root, fixture.run_opts(&["build"]))
        .await
        .unwrap();
    assert_eq!(outcome.failed, 0);
    assert_eq!(outcome.summary.counts.built, 2);
    assert_eq!(outcome.summary.counts.total(), 2);

    let lib = timing(&outcome.summary, "lib#build");
    let app = timing(&outcome.summary, "app#build");
    assert!(
        lib.end_ms <= app.start_ms,
        "lib finished at {} but app started at {}",
        lib.end_ms,
        app.start_ms
    );
    assert!(fixture.package_file("app", "dist/index.txt").exists());

    // Warm: donefiles short-circuit everything.
    let outcome = sail_lib::run(&fixture.root, fixture.run_opts(&["build"]))
        .await
        .unwrap();
    assert_eq!(outcome.summary.counts.built, 0);
    assert_eq!(outcome.summary.counts.up_to_date, 2);
}

#[tokio::test]
async fn test_shared_cache_restores_outputs_and_mtimes() {
    let fixture = Fixture::with_build_config();
    fixture.add_copy_package("lib", &[]);
    fixture.add_copy_package("app", &["lib"]);

    let outcome = sail_lib::run(&fixture.root, fixture.run_opts(&["build"]))
        .await
        .unwrap();
    assert_eq!(outcome.summary.counts.built, 2);

    let lib_out = fixture.package_file("lib", "dist/index.txt");
    let original_contents = std::fs::read_to_string(&lib_out).unwrap();
    let original_mtime = mtime_ms(&lib_out);

    // Wipe outputs and donefiles; the shared cache must reconstruct
    // everything without executing a single task.
    let removed = sail_lib::clean(&fixture.root, CleanOpts::default()).unwrap();
    assert!(removed >= 4, "outputs and donefiles removed, got {removed}");
    assert!(!lib_out.exists());

    let outcome = sail_lib::run(&fixture.root, fixture.run_opts(&["build"]))
        .await
        .unwrap();
    assert_eq!(outcome.summary.counts.built, 0, "nothing executes");
    assert!(outcome.summary.counts.restored >= 1);
    assert_eq!(
        outcome.summary.counts.restored + outcome.summary.counts.up_to_date,
        2
    );

    assert_eq!(std::fs::read_to_string(&lib_out).unwrap(), original_contents);
    assert_eq!(
        mtime_ms(&lib_out),
        original_mtime,
        "restored mtimes must equal the stored ones"
    );
}

#[tokio::test]
async fn test_partial_invalidation_rebuilds_only_dependents() {
    let fixture = Fixture::with_build_config();
    fixture.add_copy_package("lib", &[]);
    fixture.add_copy_package("app", &["lib"]);
    fixture.add_copy_package("docs", &[]);

    let outcome = sail_lib::run(&fixture.root, fixture.run_opts(&["build"]))
        .await
        .unwrap();
    assert_eq!(outcome.summary.counts.built, 3);

    // Touching lib's source invalidates lib and, through the donefile
    // cascade, app; docs is untouched.
    fixture.write_package_file("lib", "src/index.txt", "modified contents\n");
    let outcome = sail_lib::run(&fixture.root, fixture.run_opts(&["build"]))
        .await
        .unwrap();

    assert_eq!(timing(&outcome.summary, "lib#build").result, TaskResultKind::Built);
    assert_eq!(timing(&outcome.summary, "app#build").result, TaskResultKind::Built);
    assert_eq!(
        timing(&outcome.summary, "docs#build").result,
        TaskResultKind::UpToDateLocal
    );
}

#[tokio::test]
async fn test_failure_skips_dependents_and_sets_failed_count() {
    let fixture = Fixture::with_build_config();
    fixture.add_package_with_script("lib", "build", "exit 7");
    fixture.add_copy_package("app", &["lib"]);

    let outcome = sail_lib::run(&fixture.root, fixture.run_opts(&["build"]))
        .await
        .unwrap();
    assert_eq!(outcome.failed, 1);
    assert_eq!(outcome.summary.counts.failed, 1);
    assert_eq!(outcome.summary.counts.skipped, 1);
    assert_eq!(
        timing(&outcome.summary, "app#build").result,
        TaskResultKind::Skipped
    );
}

#[tokio::test]
async fn test_unrelated_package_still_builds_after_failure() {
    let fixture = Fixture::with_build_config();
    fixture.add_package_with_script("broken", "build", "exit 1");
    fixture.add_copy_package("docs", &[]);

    let outcome = sail_lib::run(&fixture.root, fixture.run_opts(&["build"]))
        .await
        .unwrap();
    // Default mode drains rather than bailing: docs still builds.
    assert_eq!(outcome.summary.counts.failed, 1);
    assert_eq!(
        timing(&outcome.summary, "docs#build").result,
        TaskResultKind::Built
    );
}

#[tokio::test]
async fn test_package_cycle_is_a_dependency_error() {
    let fixture = Fixture::with_build_config();
    fixture.add_copy_package("a", &["b"]);
    fixture.add_copy_package("b", &["c"]);
    fixture.add_copy_package("c", &["a"]);

    let err = sail_lib::run(&fixture.root, fixture.run_opts(&["build"]))
        .await
        .unwrap_err();
    assert_eq!(err.exit_code(), 3);
    assert!(err.to_string().contains("Cyclic dependency"), "{err}");
}

#[tokio::test]
async fn test_empty_task_list_succeeds_with_zero_tasks() {
    let fixture = Fixture::with_build_config();
    fixture.add_copy_package("lib", &[]);

    let outcome = sail_lib::run(&fixture.root, fixture.run_opts(&[]))
        .await
        .unwrap();
    assert_eq!(outcome.failed, 0);
    assert_eq!(outcome.summary.counts.total(), 0);
}

#[tokio::test]
async fn test_unknown_task_is_a_config_error() {
    let fixture = Fixture::with_build_config();
    fixture.add_copy_package("lib", &[]);

    let err = sail_lib::run(&fixture.root, fixture.run_opts(&["deploy"]))
        .await
        .unwrap_err();
    assert_eq!(err.exit_code(), 2);
}

#[tokio::test]
async fn test_filter_restricts_entry_packages() {
    let fixture = Fixture::with_build_config();
    fixture.add_copy_package("lib", &[]);
    fixture.add_copy_package("app", &["lib"]);
    fixture.add_copy_package("docs", &[]);

    let mut opts = fixture.run_opts(&["build"]);
    opts.filter = Some("app".to_string());
    let outcome = sail_lib::run(&fixture.root, opts).await.unwrap();

    // app plus its transitively required dependency, but not docs.
    assert_eq!(outcome.summary.counts.built, 2);
    assert!(outcome.summary.timings.iter().all(|t| t.id != "docs#build"));
}

#[tokio::test]
async fn test_force_rebuilds_despite_warm_caches() {
    let fixture = Fixture::with_build_config();
    fixture.add_copy_package("lib", &[]);

    sail_lib::run(&fixture.root, fixture.run_opts(&["build"]))
        .await
        .unwrap();
    let opts = RunOpts {
        force: true,
        ..fixture.run_opts(&["build"])
    };
    let outcome = sail_lib::run(&fixture.root, opts).await.unwrap();
    assert_eq!(outcome.summary.counts.built, 1);
    assert_eq!(outcome.summary.counts.up_to_date, 0);
}

#[tokio::test]
async fn test_deleted_outputs_with_intact_donefiles_restore_from_shared() {
    let fixture = Fixture::with_build_config();
    fixture.add_copy_package("lib", &[]);

    sail_lib::run(&fixture.root, fixture.run_opts(&["build"]))
        .await
        .unwrap();

    // Remove outputs only; the donefile survives but cannot vouch for
    // files that are gone.
    let dist = fixture.package_file("lib", "dist");
    std::fs::remove_dir_all(&dist).unwrap();

    let outcome = sail_lib::run(&fixture.root, fixture.run_opts(&["build"]))
        .await
        .unwrap();
    assert_eq!(outcome.summary.counts.built, 0);
    assert_eq!(outcome.summary.counts.restored, 1);
    assert!(fixture.package_file("lib", "dist/index.txt").exists());
}

#[tokio::test]
async fn test_execute_reruns_roots_but_not_dependencies() {
    let fixture = Fixture::with_build_config();
    fixture.add_copy_package("lib", &[]);
    fixture.add_copy_package("app", &["lib"]);

    sail_lib::run(&fixture.root, fixture.run_opts(&["build"]))
        .await
        .unwrap();

    let opts = RunOpts {
        execute: true,
        filter: Some("app".to_string()),
        ..fixture.run_opts(&["build"])
    };
    let outcome = sail_lib::run(&fixture.root, opts).await.unwrap();
    // The requested root re-runs; its dependency still hits.
    assert_eq!(timing(&outcome.summary, "app#build").result, TaskResultKind::Built);
    assert_eq!(
        timing(&outcome.summary, "lib#build").result,
        TaskResultKind::UpToDateLocal
    );
}

#[tokio::test]
async fn test_before_hint_does_not_block_on_predecessor_finishing() {
    // codegen runs for seconds; build is instant. `codegen before build`
    // only promises start-before-start, so build must complete while
    // codegen is still running rather than wait for it to finish.
    let fixture = Fixture::new(
        r#"{
            "version": 1,
            "tasks": {
                "codegen": { "before": ["build"] },
                "build": {}
            }
        }"#,
    );
    common::write(
        &fixture.root.join("packages/web/package.json"),
        r#"{
            "name": "web",
            "version": "1.0.0",
            "scripts": { "codegen": "sleep 2", "build": "echo fast" }
        }"#,
    );

    let opts = RunOpts {
        concurrency: Some(2),
        ..fixture.run_opts(&["build", "codegen"])
    };
    let outcome = sail_lib::run(&fixture.root, opts).await.unwrap();
    assert_eq!(outcome.summary.counts.built, 2);

    let build = timing(&outcome.summary, "web#build");
    let codegen = timing(&outcome.summary, "web#codegen");
    assert!(
        build.end_ms < codegen.end_ms,
        "build finished at {} but codegen (the start-order hint) ran until {}",
        build.end_ms,
        codegen.end_ms
    );
}

#[tokio::test]
async fn test_before_hint_plus_strong_dependency_still_builds() {
    // A start hint pointing against a hard edge must be ignored, not
    // rejected as a dependency cycle.
    let fixture = Fixture::new(
        r#"{
            "version": 1,
            "tasks": {
                "a": { "dependsOn": ["b"], "before": ["b"] },
                "b": {}
            }
        }"#,
    );
    common::write(
        &fixture.root.join("packages/web/package.json"),
        r#"{
            "name": "web",
            "version": "1.0.0",
            "scripts": { "a": "echo a", "b": "echo b" }
        }"#,
    );

    let outcome = sail_lib::run(&fixture.root, fixture.run_opts(&["a"]))
        .await
        .unwrap();
    assert_eq!(outcome.failed, 0);
    assert_eq!(outcome.summary.counts.built, 2);
    let a = timing(&outcome.summary, "web#a");
    let b = timing(&outcome.summary, "web#b");
    assert!(b.end_ms <= a.start_ms, "the strong edge still orders b first");
}

#[tokio::test]
async fn test_group_task_runs_children() {
    let fixture = Fixture::new(
        r#"{
            "version": 1,
            "tasks": {
                "ci": { "script": false, "children": ["build", "lint"] },
                "build": { "outputs": ["dist/**"] },
                "lint": {}
            },
            "sharedCache": { "directory": ".sail-cache" }
        }"#,
    );
    common::write(
        &fixture.root.join("packages/web/package.json"),
        r#"{
            "name": "web",
            "version": "1.0.0",
            "scripts": {
                "build": "mkdir -p dist && echo built > dist/out.txt",
                "lint": "echo lint ok"
            }
        }"#,
    );

    let outcome = sail_lib::run(&fixture.root, fixture.run_opts(&["ci"]))
        .await
        .unwrap();
    assert_eq!(outcome.failed, 0);
    // Both children executed; the group itself is not counted.
    assert_eq!(outcome.summary.counts.built, 2);
    assert!(fixture.package_file("web", "dist/out.txt").exists());
}

#[tokio::test]
async fn test_read_only_cache_dir_degrades_to_execution() {
    let fixture = Fixture::with_build_config();
    fixture.add_copy_package("lib", &[]);

    sail_lib::run(&fixture.root, fixture.run_opts(&["build"]))
        .await
        .unwrap();
    sail_lib::clean(&fixture.root, CleanOpts::default()).unwrap();

    // Make the whole shared cache unreadable; the build must fall back to
    // executing, not crash.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let cache_dir = fixture.root.join(".sail-cache");
        std::fs::set_permissions(&cache_dir, std::fs::Permissions::from_mode(0o000)).unwrap();

        let outcome = sail_lib::run(&fixture.root, fixture.run_opts(&["build"]))
            .await
            .unwrap();
        assert_eq!(outcome.failed, 0);
        assert_eq!(outcome.summary.counts.built, 1);

        // Restore permissions so the tempdir can be deleted.
        std::fs::set_permissions(&cache_dir, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
}
