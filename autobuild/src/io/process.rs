//! Bounded one-shot child processes: timeout, capped capture, optional tee.
//!
//! Used for the oracle subprocess and container runtime calls. The persistent
//! shell is managed separately by [`crate::io::session`].

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Limits for one child process run.
#[derive(Debug, Clone, Copy)]
pub struct ProcessLimits<'a> {
    pub stdin: Option<&'a [u8]>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    /// Mirror stdout line by line into this file while the child runs.
    pub tee_stdout: Option<&'a Path>,
}

impl ProcessLimits<'_> {
    pub fn new(timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            stdin: None,
            timeout,
            output_limit_bytes,
            tee_stdout: None,
        }
    }
}

#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Stdout followed by stderr, lossily decoded.
    pub fn combined_text(&self) -> String {
        let mut text = self.stdout_text();
        if !self.stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&String::from_utf8_lossy(&self.stderr));
        }
        text
    }
}

/// Run `cmd` to completion or until the timeout, then kill it.
///
/// Both pipes are drained on their own threads so a chatty child never blocks
/// on a full pipe; bytes past the limit are counted and discarded.
#[instrument(skip_all, fields(timeout_secs = limits.timeout.as_secs(), output_limit_bytes = limits.output_limit_bytes, tee = limits.tee_stdout.is_some()))]
pub fn run_bounded(mut cmd: Command, limits: &ProcessLimits<'_>) -> Result<ProcessOutput> {
    cmd.stdin(if limits.stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    let tee = match limits.tee_stdout {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create tee dir {}", parent.display()))?;
            }
            let file = File::create(path)
                .with_context(|| format!("create tee file {}", path.display()))?;
            Some(BufWriter::new(file))
        }
        None => None,
    };

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            error!(err = %err, "failed to spawn command");
            return Err(err).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let limit = limits.output_limit_bytes;
    let stdout_handle = thread::spawn(move || read_lines_limited(stdout, limit, tee));
    let stderr_handle = thread::spawn(move || read_lines_limited(stderr, limit, None));

    if let Some(input) = limits.stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        // A child that exits without reading its input is not an error here.
        if let Err(err) = child_stdin.write_all(input) {
            warn!(err = %err, "child closed stdin early");
        }
    }

    let mut timed_out = false;
    let status = match child
        .wait_timeout(limits.timeout)
        .context("wait for command")?
    {
        Some(status) => status,
        None => {
            warn!(timeout_secs = limits.timeout.as_secs(), "command timed out, killing");
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;
    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(ProcessOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_lines_limited<R: Read>(
    reader: R,
    limit: usize,
    mut tee: Option<BufWriter<File>>,
) -> Result<(Vec<u8>, usize)> {
    let mut reader = BufReader::new(reader);
    let mut collected = Vec::new();
    let mut truncated = 0usize;
    let mut line = Vec::new();

    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line).context("read output")?;
        if n == 0 {
            break;
        }
        if let Some(writer) = tee.as_mut()
            && let Err(err) = writer.write_all(&line).and_then(|()| writer.flush())
        {
            warn!(err = %err, "failed to write tee file");
            tee = None;
        }
        let room = limit.saturating_sub(collected.len());
        let keep = n.min(room);
        collected.extend_from_slice(&line[..keep]);
        truncated += n - keep;
    }

    Ok((collected, truncated))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_stdout_and_stderr() {
        let out = run_bounded(
            sh("echo out; echo err >&2"),
            &ProcessLimits::new(Duration::from_secs(10), 1024),
        )
        .expect("run");
        assert!(out.success());
        assert_eq!(out.stdout_text(), "out\n");
        assert_eq!(out.combined_text(), "out\nerr\n");
    }

    #[test]
    fn feeds_stdin() {
        let mut limits = ProcessLimits::new(Duration::from_secs(10), 1024);
        limits.stdin = Some(b"hello from stdin".as_slice());
        let out = run_bounded(Command::new("cat"), &limits).expect("run");
        assert_eq!(out.stdout_text(), "hello from stdin");
    }

    #[test]
    fn kills_on_timeout() {
        let out = run_bounded(
            sh("exec sleep 5"),
            &ProcessLimits::new(Duration::from_millis(200), 1024),
        )
        .expect("run");
        assert!(out.timed_out);
        assert!(!out.success());
    }

    #[test]
    fn truncates_and_tees() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tee = temp.path().join("nested/out.txt");
        let mut limits = ProcessLimits::new(Duration::from_secs(10), 4);
        limits.tee_stdout = Some(tee.as_path());
        let out = run_bounded(sh("printf 'abcdef\\n'"), &limits).expect("run");
        assert_eq!(out.stdout, b"abcd");
        assert_eq!(out.stdout_truncated, 3);
        assert_eq!(std::fs::read_to_string(&tee).expect("tee"), "abcdef\n");
    }
}
