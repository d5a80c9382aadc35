use std::process::Stdio;

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    process::{Child, ChildStdin, ChildStdout, Command},
};
use tracing::debug;

use crate::{
    pool::JobOutput,
    protocol::{JobEvent, JobRequest},
    WorkerError,
};

/// A persistent worker child process speaking the job protocol.
///
/// The child is spawned with `kill_on_drop`, so a worker abandoned for any
/// reason (crash, memory cap, pool shutdown, an aborted job future) takes
/// its subprocess down with it.
pub(crate) struct Worker {
    worker_name: String,
    child: Child,
    stdin: ChildStdin,
    events: Lines<BufReader<ChildStdout>>,
}

impl Worker {
    pub fn spawn(worker_name: &str, host_command: &[String]) -> Result<Self, WorkerError> {
        let (program, args) = host_command.split_first().ok_or_else(|| {
            WorkerError::Spawn(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty worker host command",
            ))
        })?;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(WorkerError::Spawn)?;

        let stdin = child.stdin.take().expect("stdin was piped");
        let stdout = child.stdout.take().expect("stdout was piped");
        debug!(worker_name, pid = child.id(), "spawned worker");
        Ok(Worker {
            worker_name: worker_name.to_string(),
            child,
            stdin,
            events: BufReader::new(stdout).lines(),
        })
    }

    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    /// Sends one job and collects its events until the exit event. A
    /// worker that stops responding mid-job is reported as crashed; the
    /// caller must not reuse it.
    pub async fn run_job(&mut self, command: &str, cwd: &str) -> Result<JobOutput, WorkerError> {
        let request = JobRequest {
            worker_name: self.worker_name.clone(),
            command: command.to_string(),
            cwd: cwd.to_string(),
        };
        let mut line = serde_json::to_vec(&request)?;
        line.push(b'\n');
        self.stdin
            .write_all(&line)
            .await
            .map_err(|_| self.crashed())?;
        self.stdin.flush().await.map_err(|_| self.crashed())?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        loop {
            let Some(line) = self.events.next_line().await.map_err(|_| self.crashed())? else {
                return Err(self.crashed());
            };
            match serde_json::from_str::<JobEvent>(&line)? {
                JobEvent::Stdout { line } => {
                    stdout.push_str(&line);
                    stdout.push('\n');
                }
                JobEvent::Stderr { line } => {
                    stderr.push_str(&line);
                    stderr.push('\n');
                }
                JobEvent::Exit { code, rss_bytes } => {
                    return Ok(JobOutput {
                        code,
                        stdout,
                        stderr,
                        rss_bytes,
                    })
                }
            }
        }
    }

    fn crashed(&self) -> WorkerError {
        WorkerError::Crashed {
            worker_name: self.worker_name.clone(),
        }
    }

    /// Terminates the child immediately. Dropping has the same effect;
    /// this just makes the intent explicit at call sites.
    pub fn shutdown(mut self) {
        let _ = self.child.start_kill();
    }
}
