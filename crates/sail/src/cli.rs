use std::process::ExitCode;

use camino::{Utf8Path, Utf8PathBuf};
use clap::{Args, Parser, Subcommand};
use sail_lib::{CleanOpts, RunOpts};
use tracing::error;

#[derive(Debug, Parser)]
#[command(name = "sail", version, about = "A monorepo task runner with a two-tier build cache")]
pub struct Cli {
    /// Run as if started in this directory.
    #[arg(long, global = true, value_name = "DIR")]
    cwd: Option<Utf8PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run tasks across the workspace.
    Run(RunArgs),
    /// Remove task outputs and donefiles (never the shared cache).
    Clean(CleanArgs),
    /// Internal: serve jobs as a worker host over stdio.
    #[command(hide = true, name = "worker-host")]
    WorkerHost,
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Task names, optionally package-qualified (`build`, `web#lint`).
    #[arg(required = true)]
    tasks: Vec<String>,

    /// Only run tasks of packages matching this glob.
    #[arg(long, value_name = "GLOB")]
    filter: Option<String>,

    /// Maximum concurrently running tasks (default: CPU count).
    #[arg(long, value_name = "N")]
    concurrency: Option<usize>,

    /// Disable the shared cache; donefiles still apply.
    #[arg(long)]
    no_cache: bool,

    /// Ignore all caches and rebuild everything scheduled.
    #[arg(long)]
    force: bool,

    /// Re-run the requested tasks even when caches are warm.
    #[arg(long)]
    execute: bool,

    /// Stop scheduling new tasks after the first failure.
    #[arg(long)]
    bail: bool,

    /// Print the scheduled task graph without running anything.
    #[arg(long)]
    dry_run: bool,

    /// Suppress progress lines and the summary.
    #[arg(long)]
    quiet: bool,

    /// Write the task graph in DOT format to this file.
    #[arg(long, value_name = "FILE")]
    graph: Option<Utf8PathBuf>,

    /// Write per-task timing records as JSON to this file.
    #[arg(long, value_name = "FILE")]
    profile: Option<Utf8PathBuf>,

    /// Per-task wall-clock deadline in seconds.
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,
}

#[derive(Debug, Args)]
struct CleanArgs {
    /// Only clean packages matching this glob.
    #[arg(long, value_name = "GLOB")]
    filter: Option<String>,

    /// Clean every package, ignoring the filter.
    #[arg(long)]
    all: bool,
}

pub async fn main() -> ExitCode {
    let cli = Cli::parse();

    if matches!(cli.command, Command::WorkerHost) {
        return match sail_workers::host::run().await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("worker host failed: {e}");
                ExitCode::from(4)
            }
        };
    }

    let repo_root = match find_repo_root(cli.cwd.as_deref()) {
        Ok(root) => root,
        Err(message) => {
            error!("{message}");
            return ExitCode::from(2);
        }
    };

    match cli.command {
        Command::Run(args) => run(&repo_root, args).await,
        Command::Clean(args) => clean(&repo_root, args),
        Command::WorkerHost => unreachable!("handled above"),
    }
}

async fn run(repo_root: &Utf8Path, args: RunArgs) -> ExitCode {
    let opts = RunOpts {
        tasks: args.tasks,
        filter: args.filter,
        concurrency: args.concurrency,
        no_cache: args.no_cache,
        force: args.force,
        execute: args.execute,
        bail: args.bail,
        dry_run: args.dry_run,
        quiet: args.quiet,
        graph_file: args.graph,
        profile_file: args.profile,
        task_timeout: args.timeout.map(std::time::Duration::from_secs),
        // Worker children run this same binary in host mode.
        worker_host_command: std::env::current_exe()
            .ok()
            .and_then(|exe| Utf8PathBuf::from_path_buf(exe).ok())
            .map(|exe| vec![exe.to_string(), "worker-host".to_string()]),
    };

    match sail_lib::run(repo_root, opts).await {
        Ok(outcome) if outcome.failed == 0 => ExitCode::SUCCESS,
        Ok(outcome) => {
            error!("{} task(s) failed", outcome.failed);
            ExitCode::from(1)
        }
        Err(e) => {
            error!("{e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn clean(repo_root: &Utf8Path, args: CleanArgs) -> ExitCode {
    let opts = CleanOpts {
        filter: args.filter,
        all: args.all,
    };
    match sail_lib::clean(repo_root, opts) {
        Ok(removed) => {
            println!("removed {removed} file(s)");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

/// Walks up from the starting directory to the first one containing
/// `sail.json`.
fn find_repo_root(cwd: Option<&Utf8Path>) -> Result<Utf8PathBuf, String> {
    let start = match cwd {
        Some(dir) => dir.to_owned(),
        None => std::env::current_dir()
            .map_err(|e| format!("unable to read the current directory: {e}"))
            .and_then(|dir| {
                Utf8PathBuf::from_path_buf(dir)
                    .map_err(|p| format!("current directory is not valid UTF-8: {}", p.display()))
            })?,
    };
    let mut dir = start.as_path();
    loop {
        if dir.join(sail_lib::CONFIG_FILE).exists() {
            return Ok(dir.to_owned());
        }
        match dir.parent() {
            Some(parent) => dir = parent,
            None => {
                return Err(format!(
                    "no {} found in {start} or any parent directory",
                    sail_lib::CONFIG_FILE
                ))
            }
        }
    }
}
