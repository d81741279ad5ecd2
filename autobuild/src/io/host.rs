//! Where the persistent shell lives: the host checkout or a container.
//!
//! The session controller only talks to a [`ShellHost`]; it never knows
//! whether files and signals go through the local filesystem or through the
//! container runtime.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{debug, warn};

use crate::core::policy::Phase;
use crate::io::process::{ProcessLimits, ProcessOutput, run_bounded};

const RUNTIME_CALL_TIMEOUT: Duration = Duration::from_secs(60);
const RUNTIME_OUTPUT_LIMIT: usize = 4 * 1024 * 1024;
const FEED_TIMEOUT: Duration = Duration::from_secs(10);

/// Appends stdin to the FIFO at `$1`; exits 3 when it is gone. The session
/// unlinks the FIFO before releasing its reader, so an open never blocks.
const FEED_SCRIPT: &str = r#"[ -p "$1" ] || exit 3; exec cat >> "$1""#;
const FEED_GONE: i32 = 3;

/// Backing environment of one shell session.
pub trait ShellHost {
    fn phase(&self) -> Phase;

    /// Command that starts the persistent shell. The caller pipes stdin.
    fn shell_command(&self) -> Command;

    /// Directory, as seen from inside the shell, for log targets.
    fn log_dir(&self) -> &str;

    /// Create the log directory.
    fn prepare(&self) -> Result<()>;

    /// Read a file as seen from inside the shell. `None` when absent.
    fn read_file(&self, path: &str) -> Result<Option<String>>;

    fn write_file(&self, path: &str, contents: &str) -> Result<()>;

    /// Send `signal` (e.g. `TERM`) to the direct children of `parent_pid`.
    fn signal_children(&self, parent_pid: u32, signal: &str) -> Result<()>;

    /// Write `text` into the input FIFO of a running command. `false` when the
    /// FIFO no longer exists, i.e. the command has already finished.
    fn feed_input(&self, fifo: &str, text: &str) -> Result<bool>;

    fn describe(&self) -> String;
}

/// Shell running on the host, rooted in the project checkout.
#[derive(Debug, Clone)]
pub struct LocalHost {
    workdir: PathBuf,
    log_dir: String,
    shell: String,
    isolated: bool,
}

impl LocalHost {
    /// `log_dir` is made absolute; the shell may `cd` anywhere.
    pub fn new(workdir: &Path, log_dir: &Path, shell: &str) -> Self {
        let log_dir = std::path::absolute(log_dir).unwrap_or_else(|_| log_dir.to_path_buf());
        Self {
            workdir: workdir.to_path_buf(),
            log_dir: log_dir.to_string_lossy().into_owned(),
            shell: shell.to_string(),
            isolated: false,
        }
    }

    /// Treat the host shell as already isolated (sandboxed runners, tests).
    pub fn isolated(mut self, isolated: bool) -> Self {
        self.isolated = isolated;
        self
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workdir.join(path)
        }
    }
}

impl ShellHost for LocalHost {
    fn phase(&self) -> Phase {
        if self.isolated {
            Phase::Isolated
        } else {
            Phase::Local
        }
    }

    fn shell_command(&self) -> Command {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("--noprofile").arg("--norc").current_dir(&self.workdir);
        cmd
    }

    fn log_dir(&self) -> &str {
        &self.log_dir
    }

    fn prepare(&self) -> Result<()> {
        fs::create_dir_all(&self.log_dir)
            .with_context(|| format!("create session log dir {}", self.log_dir))
    }

    fn read_file(&self, path: &str) -> Result<Option<String>> {
        let path = self.resolve(path);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
        }
    }

    fn write_file(&self, path: &str, contents: &str) -> Result<()> {
        let path = self.resolve(path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    fn signal_children(&self, parent_pid: u32, signal: &str) -> Result<()> {
        let mut cmd = Command::new("pkill");
        cmd.arg(format!("-{signal}"))
            .arg("-P")
            .arg(parent_pid.to_string());
        let output = run_bounded(cmd, &ProcessLimits::new(RUNTIME_CALL_TIMEOUT, 4096))
            .context("run pkill")?;
        // pkill exits 1 when nothing matched.
        debug!(parent_pid, signal, code = ?output.status.code(), "signalled shell children");
        Ok(())
    }

    fn feed_input(&self, fifo: &str, text: &str) -> Result<bool> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(FEED_SCRIPT).arg("sh").arg(fifo);
        let mut limits = ProcessLimits::new(FEED_TIMEOUT, 4096);
        limits.stdin = Some(text.as_bytes());
        let output = run_bounded(cmd, &limits).context("feed command input")?;
        feed_delivered(&output, fifo)
    }

    fn describe(&self) -> String {
        format!("local shell in {}", self.workdir.display())
    }
}

/// Shell running inside a provisioned container.
#[derive(Debug, Clone)]
pub struct ContainerHost {
    runtime: String,
    container_id: String,
    log_dir: String,
}

impl ContainerHost {
    pub fn new(runtime: &str, container_id: &str, log_dir: &str) -> Self {
        Self {
            runtime: runtime.to_string(),
            container_id: container_id.to_string(),
            log_dir: log_dir.to_string(),
        }
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    fn exec(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<ProcessOutput> {
        let mut cmd = Command::new(&self.runtime);
        cmd.arg("exec");
        if stdin.is_some() {
            cmd.arg("-i");
        }
        cmd.arg(&self.container_id).args(args);
        let mut limits = ProcessLimits::new(RUNTIME_CALL_TIMEOUT, RUNTIME_OUTPUT_LIMIT);
        limits.stdin = stdin;
        run_bounded(cmd, &limits)
            .with_context(|| format!("{} exec in {}", self.runtime, self.container_id))
    }
}

impl ShellHost for ContainerHost {
    fn phase(&self) -> Phase {
        Phase::Isolated
    }

    fn shell_command(&self) -> Command {
        let mut cmd = Command::new(&self.runtime);
        cmd.arg("exec")
            .arg("-i")
            .arg(&self.container_id)
            .arg("bash")
            .arg("--noprofile")
            .arg("--norc");
        cmd
    }

    fn log_dir(&self) -> &str {
        &self.log_dir
    }

    fn prepare(&self) -> Result<()> {
        let output = self.exec(&["mkdir", "-p", &self.log_dir], None)?;
        if !output.success() {
            bail!(
                "create {} in container {}: {}",
                self.log_dir,
                self.container_id,
                output.combined_text().trim()
            );
        }
        Ok(())
    }

    fn read_file(&self, path: &str) -> Result<Option<String>> {
        let output = self.exec(&["cat", path], None)?;
        if !output.success() {
            return Ok(None);
        }
        Ok(Some(output.stdout_text()))
    }

    fn write_file(&self, path: &str, contents: &str) -> Result<()> {
        let script = r#"mkdir -p "$(dirname "$1")" && cat > "$1""#;
        let output = self.exec(&["sh", "-c", script, "sh", path], Some(contents.as_bytes()))?;
        if !output.success() {
            bail!("write {path} in container: {}", output.combined_text().trim());
        }
        Ok(())
    }

    fn signal_children(&self, parent_pid: u32, signal: &str) -> Result<()> {
        let pid = parent_pid.to_string();
        let flag = format!("-{signal}");
        let output = self.exec(&["pkill", &flag, "-P", &pid], None)?;
        if output.status.code() != Some(0) && output.status.code() != Some(1) {
            warn!(
                container = %self.container_id,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "pkill unavailable in container"
            );
        }
        Ok(())
    }

    fn feed_input(&self, fifo: &str, text: &str) -> Result<bool> {
        let output = self.exec(&["sh", "-c", FEED_SCRIPT, "sh", fifo], Some(text.as_bytes()))?;
        feed_delivered(&output, fifo)
    }

    fn describe(&self) -> String {
        format!("container {}", self.container_id)
    }
}

fn feed_delivered(output: &ProcessOutput, fifo: &str) -> Result<bool> {
    if output.timed_out {
        bail!("feeding {fifo} timed out");
    }
    match output.status.code() {
        Some(0) => Ok(true),
        Some(FEED_GONE) => Ok(false),
        _ => bail!("feed {fifo}: {}", output.combined_text().trim()),
    }
}

/// Single-quote `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
