//! A pool of reusable workers for hot tools.
//!
//! Tools like the TypeScript compiler pay a substantial startup cost on
//! every invocation. The pool amortizes that cost by keeping worker
//! processes alive between jobs: a worker is tagged with a worker name
//! (`tsc`, `eslint`, ...), and an idle worker with the right tag is
//! preferred over starting a new one.
//!
//! Two dispatch modes exist. With `use_threads` the pool runs each command
//! directly on its own runtime; otherwise jobs are sent to persistent
//! worker child processes running the [`host`] loop, which is where the
//! amortization actually happens.

pub mod host;
mod pool;
pub mod protocol;
mod worker;

pub use pool::{JobOutput, WorkerPool, WorkerPoolConfig};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("unable to spawn worker process: {0}")]
    Spawn(std::io::Error),
    #[error("worker {worker_name} crashed mid-job")]
    Crashed { worker_name: String },
    #[error("worker protocol error: {0}")]
    Protocol(#[from] serde_json::Error),
    #[error("worker IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("worker pool is shut down")]
    PoolShutDown,
}
