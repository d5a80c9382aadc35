//! The worker host loop.
//!
//! A host process stays alive across jobs, reading [`JobRequest`] lines on
//! stdin and answering with [`JobEvent`] lines on stdout. The `sail`
//! binary runs this loop when invoked as `sail worker-host`; the
//! `sail-worker-host` binary in this crate is the standalone equivalent.

use std::process::Stdio;

use sysinfo::{PidExt, ProcessExt, System, SystemExt};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::Command,
};

use crate::protocol::{JobEvent, JobRequest};

/// Runs jobs from stdin until it closes. Never returns job failures as
/// errors; those travel back as `Exit` events.
pub async fn run() -> std::io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut out = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<JobRequest>(&line) {
            Ok(request) => execute_job(&request, &mut out).await?,
            Err(e) => {
                emit(&mut out, &JobEvent::Stderr {
                    line: format!("unparseable job request: {e}"),
                })
                .await?;
                emit(&mut out, &JobEvent::Exit {
                    code: 127,
                    rss_bytes: current_rss_bytes(),
                })
                .await?;
            }
        }
    }
    Ok(())
}

async fn execute_job(
    request: &JobRequest,
    out: &mut (impl tokio::io::AsyncWrite + Unpin),
) -> std::io::Result<()> {
    let mut child = match shell_command(&request.command, &request.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            emit(out, &JobEvent::Stderr {
                line: format!("unable to spawn '{}': {e}", request.command),
            })
            .await?;
            emit(out, &JobEvent::Exit {
                code: 127,
                rss_bytes: current_rss_bytes(),
            })
            .await?;
            return Ok(());
        }
    };

    let mut stdout_lines =
        BufReader::new(child.stdout.take().expect("stdout was piped")).lines();
    let mut stderr_lines =
        BufReader::new(child.stderr.take().expect("stderr was piped")).lines();
    let mut stdout_open = true;
    let mut stderr_open = true;

    while stdout_open || stderr_open {
        tokio::select! {
            line = stdout_lines.next_line(), if stdout_open => match line? {
                Some(line) => emit(out, &JobEvent::Stdout { line }).await?,
                None => stdout_open = false,
            },
            line = stderr_lines.next_line(), if stderr_open => match line? {
                Some(line) => emit(out, &JobEvent::Stderr { line }).await?,
                None => stderr_open = false,
            },
        }
    }

    let status = child.wait().await?;
    emit(out, &JobEvent::Exit {
        code: status.code().unwrap_or(-1),
        rss_bytes: current_rss_bytes(),
    })
    .await
}

/// Package scripts are shell fragments, so jobs go through the platform
/// shell.
pub fn shell_command(command: &str, cwd: &str) -> Command {
    let mut cmd = if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    };
    cmd.current_dir(cwd);
    cmd
}

async fn emit(
    out: &mut (impl tokio::io::AsyncWrite + Unpin),
    event: &JobEvent,
) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(event).expect("job events always serialize");
    line.push(b'\n');
    out.write_all(&line).await?;
    out.flush().await
}

/// Resident set size of this worker process. The pool compares it against
/// the configured memory limit after each job.
pub fn current_rss_bytes() -> u64 {
    let Ok(pid) = sysinfo::get_current_pid() else {
        return 0;
    };
    let mut system = System::new();
    if !system.refresh_process(pid) {
        return 0;
    }
    system.process(pid).map(|p| p.memory()).unwrap_or(0)
}
