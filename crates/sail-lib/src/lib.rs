//! Core build orchestration for sail.
//!
//! Composes per-package script definitions and inter-package dependency
//! rules into a task graph, schedules it with bounded parallelism, and
//! serves results from a two-tier cache (donefiles locally, a
//! content-addressed shared cache across machines).

pub mod clean;
pub mod engine;
pub mod run;
pub mod task;

pub use clean::{clean, CleanOpts};
pub use run::{run, RunOpts, RunOutcome};
pub use sail_config::CONFIG_FILE;

/// Top-level error with the process exit code mapping: configuration
/// errors exit 2, dependency cycles exit 3, infrastructure failures exit
/// 4. Task failures are not errors of this type; they surface through
/// [`RunOutcome::failed`] and exit 1.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] sail_config::Error),
    #[error(transparent)]
    Repo(#[from] sail_repo::Error),
    #[error(transparent)]
    Builder(#[from] engine::BuilderError),
    #[error(transparent)]
    Execute(#[from] engine::ExecuteError),
    #[error(transparent)]
    Io(std::io::Error),
}

impl Error {
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) => 2,
            Error::Repo(sail_repo::Error::Graph(_)) => 3,
            Error::Repo(_) => 2,
            Error::Builder(engine::BuilderError::Graph(_)) => 3,
            Error::Builder(_) => 2,
            Error::Execute(_) | Error::Io(_) => 4,
        }
    }
}
