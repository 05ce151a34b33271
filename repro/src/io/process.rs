//! Child process execution with a timeout and bounded output capture.

use std::io::{Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// Limits applied to one child process.
#[derive(Debug, Clone, Copy)]
pub struct ProcessLimits {
    pub timeout: Duration,
    /// Bytes of stdout/stderr kept in memory each; the rest is drained and counted.
    pub output_limit_bytes: usize,
}

/// Captured child process output.
#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub dropped_bytes: usize,
    pub timed_out: bool,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }

    /// One-line description of how the process ended.
    pub fn describe_exit(&self, limits: &ProcessLimits) -> String {
        if self.timed_out {
            return format!("timed out after {}s", limits.timeout.as_secs());
        }
        match self.status.code() {
            Some(code) => format!("exited with status {code}"),
            None => "terminated by signal".to_string(),
        }
    }
}

/// Run `cmd`, optionally feeding `stdin`, and wait at most `limits.timeout`.
///
/// Both pipes are drained on reader threads while the child runs so a chatty
/// child cannot deadlock on a full pipe.
#[instrument(skip_all, fields(timeout_secs = limits.timeout.as_secs()))]
pub fn run_bounded(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    limits: &ProcessLimits,
) -> Result<ProcessOutput> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!(program = ?cmd.get_program(), "spawning child process");
    let mut child = cmd.spawn().context("spawn command")?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let limit = limits.output_limit_bytes;
    let stdout_reader = thread::spawn(move || read_limited(stdout, limit));
    let stderr_reader = thread::spawn(move || read_limited(stderr, limit));

    if let Some(input) = stdin {
        let mut pipe = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        pipe.write_all(input).context("write stdin")?;
        // Dropping the handle closes the pipe so batch readers see EOF.
    }

    let mut timed_out = false;
    let status = match child.wait_timeout(limits.timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(timeout_secs = limits.timeout.as_secs(), "command timed out, killing");
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    let (stdout, stdout_dropped) = join_reader(stdout_reader).context("join stdout")?;
    let (stderr, stderr_dropped) = join_reader(stderr_reader).context("join stderr")?;
    let dropped_bytes = stdout_dropped + stderr_dropped;
    if dropped_bytes > 0 {
        warn!(dropped_bytes, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(ProcessOutput {
        status,
        stdout,
        stderr,
        dropped_bytes,
        timed_out,
    })
}

fn join_reader(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    handle
        .join()
        .map_err(|_| anyhow!("output reader thread panicked"))?
}

fn read_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut kept = Vec::new();
    let mut dropped = 0usize;
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let keep = n.min(limit.saturating_sub(kept.len()));
        kept.extend_from_slice(&chunk[..keep]);
        dropped += n - keep;
    }
    Ok((kept, dropped))
}
