use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use sysinfo::{PidExt, ProcessExt, System, SystemExt};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

use crate::{host, worker::Worker, WorkerError};

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Dispatch jobs on the pool's own runtime instead of persistent
    /// worker processes.
    pub use_threads: bool,
    /// A worker whose RSS exceeds this after a job is killed instead of
    /// returned to the pool.
    pub memory_limit_bytes: Option<u64>,
    /// Upper bound on concurrently executing jobs (and therefore busy
    /// workers).
    pub max_count: Option<usize>,
    /// Program + arguments for worker host processes.
    pub host_command: Vec<String>,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        WorkerPoolConfig {
            use_threads: true,
            memory_limit_bytes: None,
            max_count: None,
            host_command: vec!["sail-worker-host".to_string()],
        }
    }
}

/// The result of one job, independent of which dispatch mode ran it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
    pub rss_bytes: u64,
}

impl JobOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Pool of reusable workers keyed by worker name.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    idle: Mutex<HashMap<String, Vec<Worker>>>,
    limiter: Option<Arc<Semaphore>>,
    closed: AtomicBool,
    spawned_total: AtomicUsize,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Self {
        let limiter = config
            .max_count
            .map(|count| Arc::new(Semaphore::new(count.max(1))));
        WorkerPool {
            config,
            idle: Mutex::new(HashMap::new()),
            limiter,
            closed: AtomicBool::new(false),
            spawned_total: AtomicUsize::new(0),
        }
    }

    /// Total workers ever started, for diagnostics and tests.
    pub fn spawned_workers(&self) -> usize {
        self.spawned_total.load(Ordering::SeqCst)
    }

    /// Runs `command` in `cwd` on a worker tagged `worker_name`. An idle
    /// worker with the same tag is reused when available.
    pub async fn run_on_worker(
        &self,
        worker_name: &str,
        command: &str,
        cwd: &str,
    ) -> Result<JobOutput, WorkerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WorkerError::PoolShutDown);
        }
        let _permit = match &self.limiter {
            Some(semaphore) => Some(
                semaphore
                    .acquire()
                    .await
                    .map_err(|_| WorkerError::PoolShutDown)?,
            ),
            None => None,
        };

        if self.config.use_threads {
            return run_in_process(command, cwd).await;
        }

        let mut worker = match self.checkout(worker_name).await {
            Some(worker) => worker,
            None => {
                self.spawned_total.fetch_add(1, Ordering::SeqCst);
                Worker::spawn(worker_name, &self.config.host_command)?
            }
        };

        let result = worker.run_job(command, cwd).await;
        match &result {
            Ok(output) => {
                let over_limit = self
                    .config
                    .memory_limit_bytes
                    .is_some_and(|limit| output.rss_bytes > limit);
                if over_limit {
                    warn!(
                        worker_name,
                        rss = output.rss_bytes,
                        "worker exceeded memory limit, recycling"
                    );
                    worker.shutdown();
                } else if self.closed.load(Ordering::SeqCst) {
                    worker.shutdown();
                } else {
                    self.check_in(worker).await;
                }
            }
            Err(e) => {
                // A crashed or misbehaving worker is never reused; the
                // next job for this name gets a fresh one.
                debug!(worker_name, "dropping worker after error: {e}");
                worker.shutdown();
            }
        }
        result
    }

    async fn checkout(&self, worker_name: &str) -> Option<Worker> {
        self.idle
            .lock()
            .await
            .get_mut(worker_name)
            .and_then(Vec::pop)
    }

    async fn check_in(&self, worker: Worker) {
        self.idle
            .lock()
            .await
            .entry(worker.worker_name().to_string())
            .or_default()
            .push(worker);
    }

    /// Shuts the pool down: idle workers are terminated, the job limiter
    /// is closed so queued callers fail, and workers finishing in-flight
    /// jobs are discarded instead of returned. Callers that abort their
    /// job futures kill the corresponding workers through `kill_on_drop`.
    pub async fn reset(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(semaphore) = &self.limiter {
            semaphore.close();
        }
        let mut idle = self.idle.lock().await;
        for (_, workers) in idle.drain() {
            for worker in workers {
                worker.shutdown();
            }
        }
    }
}

/// In-process dispatch: spawn the command directly and sample its RSS
/// while it runs so memory reporting stays comparable with worker mode.
async fn run_in_process(command: &str, cwd: &str) -> Result<JobOutput, WorkerError> {
    use std::process::Stdio;

    let mut child = host::shell_command(command, cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(WorkerError::Spawn)?;

    let pid = child.id();
    let stdout_pipe = child.stdout.take().expect("stdout was piped");
    let stderr_pipe = child.stderr.take().expect("stderr was piped");
    let stdout_task = tokio::spawn(read_to_end(stdout_pipe));
    let stderr_task = tokio::spawn(read_to_end(stderr_pipe));

    let mut max_rss = 0u64;
    let mut sample_interval = tokio::time::interval(Duration::from_millis(50));
    let status = loop {
        tokio::select! {
            status = child.wait() => break status?,
            _ = sample_interval.tick() => {
                if let Some(pid) = pid {
                    max_rss = max_rss.max(process_rss_bytes(pid));
                }
            }
        }
    };

    let stdout = stdout_task.await.expect("stdout reader panicked")?;
    let stderr = stderr_task.await.expect("stderr reader panicked")?;
    Ok(JobOutput {
        code: status.code().unwrap_or(-1),
        stdout,
        stderr,
        rss_bytes: max_rss,
    })
}

async fn read_to_end(
    mut pipe: impl tokio::io::AsyncRead + Unpin,
) -> Result<String, WorkerError> {
    use tokio::io::AsyncReadExt;
    let mut buf = String::new();
    pipe.read_to_string(&mut buf).await?;
    Ok(buf)
}

fn process_rss_bytes(pid: u32) -> u64 {
    let pid = sysinfo::Pid::from_u32(pid);
    let mut system = System::new();
    if !system.refresh_process(pid) {
        return 0;
    }
    system.process(pid).map(|p| p.memory()).unwrap_or(0)
}
