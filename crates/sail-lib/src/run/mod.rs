//! The run driver: loads configuration and the workspace, builds the task
//! graph, and drives it through the scheduler.

mod context;
pub mod done_file;
pub mod progress;
pub mod summary;
mod visitor;

use std::{collections::HashSet, sync::atomic::Ordering, sync::Arc, time::Duration};

use camino::{Utf8Path, Utf8PathBuf};
pub use context::BuildContext;
use sail_config::SailConfig;
use sail_repo::PackageGraph;
use sail_task_id::{TaskId, TaskName};
pub use summary::ExecutionSummary;
use tracing::{debug, warn};
pub use visitor::Visitor;

use crate::{
    engine::{Built, Engine, EngineBuilder},
    task::simple_glob,
    Error,
};

/// How many failing tasks get their output echoed at the end.
const REPORTED_FAILURES: usize = 5;

#[derive(Debug, Clone, Default)]
pub struct RunOpts {
    /// Task names to run; may be package-qualified (`pkg#build`).
    pub tasks: Vec<String>,
    /// Package name glob restricting entry packages.
    pub filter: Option<String>,
    pub concurrency: Option<usize>,
    /// Disable the shared cache for this run (donefiles still apply).
    pub no_cache: bool,
    /// Ignore all caches and rebuild every scheduled task.
    pub force: bool,
    /// Re-run the requested root tasks even when caches are warm;
    /// dependencies may still hit.
    pub execute: bool,
    pub bail: bool,
    pub dry_run: bool,
    pub quiet: bool,
    pub graph_file: Option<Utf8PathBuf>,
    pub profile_file: Option<Utf8PathBuf>,
    pub task_timeout: Option<Duration>,
    /// Program + args for worker host processes; defaults to
    /// `sail-worker-host` on PATH.
    pub worker_host_command: Option<Vec<String>>,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub summary: ExecutionSummary,
    pub failed: usize,
}

pub async fn run(repo_root: &Utf8Path, opts: RunOpts) -> Result<RunOutcome, Error> {
    let config = SailConfig::load(repo_root)?;
    let workspace = sail_repo::discover_workspace(repo_root)?;
    let package_graph = PackageGraph::build(&workspace.packages, |_, _| true)?;

    let entry_packages: Vec<String> = workspace
        .packages
        .keys()
        .filter(|name| match &opts.filter {
            Some(pattern) => simple_glob::glob_match(pattern, name),
            None => true,
        })
        .cloned()
        .collect();
    debug!(
        packages = entry_packages.len(),
        tasks = ?opts.tasks,
        "starting run"
    );

    let tasks: Vec<TaskName<'static>> = opts
        .tasks
        .iter()
        .map(|name| TaskName::from(name.as_str()).into_owned())
        .collect();
    let engine = Arc::new(
        EngineBuilder::new(&config, &workspace, &package_graph)
            .with_tasks(tasks.clone())
            .with_packages(entry_packages.clone())
            .build()?,
    );

    if let Some(path) = &opts.graph_file {
        let mut file = std::fs::File::create(path).map_err(Error::Io)?;
        crate::engine::write_dot(&engine, &mut file).map_err(Error::Io)?;
    }
    if opts.dry_run {
        print_dry_run(&engine);
        return Ok(RunOutcome {
            summary: ExecutionSummary {
                counts: summary::Counts::default(),
                wall_ms: 0,
                cpu_ms: 0,
                critical_path: Vec::new(),
                critical_path_ms: 0,
                timings: Vec::new(),
            },
            failed: 0,
        });
    }

    let concurrency = opts
        .concurrency
        .or(config.concurrency)
        .unwrap_or_else(num_cpus::get)
        .max(1);
    let bail = opts.bail || config.bail_on_failure;

    let execute_roots: HashSet<TaskId<'static>> = if opts.execute {
        root_task_ids(&engine, &tasks, &entry_packages)
    } else {
        HashSet::new()
    };

    let ctx = Arc::new(BuildContext::new(repo_root, &workspace, &config, &opts));
    let leaf_total = engine
        .task_ids()
        .filter(|id| engine.spec(id).is_some_and(|s| s.is_leaf()))
        .count();
    ctx.progress.set_total(leaf_total);

    // SIGINT drains: no new tasks start, running tasks finish.
    let cancelled = Arc::new(std::sync::atomic::AtomicBool::new(false));
    {
        let cancelled = cancelled.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, draining");
                cancelled.store(true, Ordering::SeqCst);
            }
        });
    }

    let visitor = Arc::new(Visitor::new(
        ctx.clone(),
        engine.clone(),
        bail,
        opts.force,
        execute_roots,
        opts.task_timeout,
        cancelled,
    ));
    visitor.visit(concurrency).await?;
    ctx.workers.reset().await;

    let failures = ctx.tracker.failures();
    for failure in failures.iter().take(REPORTED_FAILURES) {
        eprintln!(
            "\n{} failed (exit {}) in {}\n  $ {}\n{}",
            failure.id,
            failure.exit_code,
            failure.cwd,
            failure.command,
            indent(&failure.output_tail)
        );
    }
    if failures.len() > REPORTED_FAILURES {
        eprintln!("... and {} more failures", failures.len() - REPORTED_FAILURES);
    }

    let summary = ctx.tracker.summarize(&engine);
    if !opts.quiet {
        println!("\n{}", summary.render());
    }
    if let Some(path) = &opts.profile_file {
        let json = serde_json::to_string_pretty(&summary)
            .expect("summary always serializes");
        std::fs::write(path, json).map_err(Error::Io)?;
    }

    Ok(RunOutcome {
        failed: failures.len(),
        summary,
    })
}

/// The concrete root tasks the user's request matched.
fn root_task_ids(
    engine: &Engine<Built>,
    tasks: &[TaskName<'static>],
    entry_packages: &[String],
) -> HashSet<TaskId<'static>> {
    let mut roots = HashSet::new();
    for task in tasks {
        match task.package() {
            Some(package) => {
                let id = TaskId::new(package, task.task()).into_owned();
                if engine.spec(&id).is_some() {
                    roots.insert(id);
                }
            }
            None => {
                for package in entry_packages {
                    let id = TaskId::new(package, task.task()).into_owned();
                    if engine.spec(&id).is_some() {
                        roots.insert(id);
                    }
                }
            }
        }
    }
    roots
}

fn print_dry_run(engine: &Engine<Built>) {
    let mut ids: Vec<_> = engine.task_ids().collect();
    ids.sort();
    println!("{} tasks scheduled", ids.len());
    for id in ids {
        // Levels are offset by one for the root sentinel.
        let level = engine.level(id).unwrap_or(1).saturating_sub(1);
        let mut deps: Vec<String> = engine
            .strong_dep_ids(id)
            .iter()
            .map(ToString::to_string)
            .collect();
        deps.sort();
        if deps.is_empty() {
            println!("  [{level}] {id}");
        } else {
            println!("  [{level}] {id} <- {}", deps.join(", "));
        }
    }
}

fn indent(text: &str) -> String {
    text.lines()
        .map(|line| format!("  {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}
