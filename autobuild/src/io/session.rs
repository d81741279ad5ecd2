//! The persistent shell session and its stuck-command recovery protocol.
//!
//! One long-lived `bash` reads command scripts from a pipe. Each command's
//! output goes to its own log target and its stdin comes from its own FIFO,
//! so input sent to a stuck command can never reach the shell itself; after
//! the command the shell appends a completion marker carrying the exit code
//! and working directory. The
//! controller polls the log target until the marker shows up or the wait
//! bound elapses, at which point the command is reported stuck and only the
//! recovery actions (wait, terminate, write input) are accepted.

use std::fmt;
use std::io::Write;
use std::process::{Child, ChildStdin, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, info, instrument, warn};

use crate::core::budget::next_poll;
use crate::core::policy::Phase;
use crate::core::sanitize::{sanitize, summarize};
use crate::core::state::{SessionEvent, SessionState, transition};
use crate::core::types::{ExecOutcome, ExecutionResult, ExitStatus, StuckSignal};
use crate::io::host::{ShellHost, shell_quote};
use crate::io::process::{ProcessLimits, run_bounded};

/// The shell is gone and could not be re-established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLostError {
    pub detail: String,
}

impl fmt::Display for SessionLostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shell session lost: {}", self.detail)
    }
}

impl std::error::Error for SessionLostError {}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Wait bound `W` before a command is reported stuck.
    pub wait_bound: Duration,
    /// Poll interval `P` for the log target.
    pub poll_interval: Duration,
    /// Grace period between SIGTERM and the cleanliness check.
    pub terminate_grace: Duration,
    /// How long a fresh shell may take to report its pid.
    pub spawn_timeout: Duration,
    /// Display cap for command output, in characters.
    pub display_limit_chars: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            wait_bound: Duration::from_secs(300),
            poll_interval: Duration::from_millis(1000),
            terminate_grace: Duration::from_secs(5),
            spawn_timeout: Duration::from_secs(30),
            display_limit_chars: 12_000,
        }
    }
}

struct LiveShell {
    child: Child,
    stdin: ChildStdin,
    /// Pid of the shell as seen by its own host.
    pid: u32,
}

struct InFlight {
    log_target: String,
    input_fifo: String,
    marker: String,
    started: Instant,
}

/// Marker line appended by the shell once a command finished.
struct Completion {
    exit_code: Option<i32>,
    cwd: Option<String>,
    output: String,
}

/// Owner of the one live shell of an agent run.
pub struct SessionController {
    host: Box<dyn ShellHost>,
    settings: SessionSettings,
    state: SessionState,
    shell: Option<LiveShell>,
    generation: u32,
    seq: u32,
    in_flight: Option<InFlight>,
    cwd: Option<String>,
}

impl SessionController {
    pub fn new(host: Box<dyn ShellHost>, settings: SessionSettings) -> Self {
        Self {
            host,
            settings,
            state: SessionState::NoSession,
            shell: None,
            generation: 0,
            seq: 0,
            in_flight: None,
            cwd: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_stuck(&self) -> bool {
        self.state == SessionState::CommandStuck
    }

    pub fn phase(&self) -> Phase {
        self.host.phase()
    }

    pub fn host(&self) -> &dyn ShellHost {
        self.host.as_ref()
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Last working directory reported by the shell.
    pub fn cwd(&self) -> Option<&str> {
        self.cwd.as_deref()
    }

    /// Tear down the current shell and continue on `host`.
    pub fn replace_host(&mut self, host: Box<dyn ShellHost>) -> Result<()> {
        info!(from = %self.host.describe(), to = %host.describe(), "replacing session host");
        self.shutdown();
        self.host = host;
        self.cwd = None;
        self.start()
    }

    /// Start the shell if none is running.
    #[instrument(skip_all, fields(host = %self.host.describe()))]
    pub fn start(&mut self) -> Result<()> {
        if self.shell.is_some() {
            return Ok(());
        }
        self.host.prepare()?;
        self.generation += 1;
        let pid_file = format!("{}/shell-{}.pid", self.host.log_dir(), self.generation);

        let mut cmd = self.host.shell_command();
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let mut child = cmd.spawn().map_err(|err| {
            anyhow!(SessionLostError {
                detail: format!("spawn shell: {err}"),
            })
        })?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("shell stdin was not piped"))?;

        let mut bootstrap = format!("printf '%s\\n' \"$$\" > {}\n", shell_quote(&pid_file));
        if let Some(cwd) = &self.cwd {
            bootstrap.push_str(&format!("cd {} 2>/dev/null\n", shell_quote(cwd)));
        }
        if let Err(err) = stdin
            .write_all(bootstrap.as_bytes())
            .and_then(|()| stdin.flush())
        {
            let _ = child.kill();
            let _ = child.wait();
            return Err(anyhow!(SessionLostError {
                detail: format!("write to new shell: {err}"),
            }));
        }

        let pid = match self.await_pid(&mut child, &pid_file) {
            Ok(pid) => pid,
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(err);
            }
        };
        info!(pid, generation = self.generation, "shell started");
        self.shell = Some(LiveShell { child, stdin, pid });
        self.state = transition(self.state, SessionEvent::Started)?;
        Ok(())
    }

    fn await_pid(&self, child: &mut Child, pid_file: &str) -> Result<u32> {
        let deadline = Instant::now() + self.settings.spawn_timeout;
        let poll = self.settings.poll_interval.min(Duration::from_millis(50));
        loop {
            if let Some(status) = child.try_wait().context("poll new shell")? {
                return Err(anyhow!(SessionLostError {
                    detail: format!("shell exited during startup with {status}"),
                }));
            }
            if let Some(text) = self.host.read_file(pid_file)?
                && let Ok(pid) = text.trim().parse::<u32>()
            {
                return Ok(pid);
            }
            match next_poll(deadline, poll) {
                Some(step) => thread::sleep(step),
                None => {
                    return Err(anyhow!(SessionLostError {
                        detail: format!("shell did not start within {:?}", self.settings.spawn_timeout),
                    }));
                }
            }
        }
    }

    /// Run one command. Requires a session that is not stuck.
    #[instrument(skip_all, fields(seq = self.seq + 1))]
    pub fn execute(&mut self, command: &str) -> Result<ExecOutcome> {
        if self.state == SessionState::CommandStuck {
            bail!("a command is still running; use WAIT, TERMINATE or WRITE:<text>");
        }
        if self.shell.is_none() {
            self.start()?;
        }
        if let Some(result) = self.syntax_error(command)? {
            return Ok(ExecOutcome::Finished(result));
        }

        self.seq += 1;
        let log_target = format!(
            "{}/cmd-{}-{}.log",
            self.host.log_dir(),
            self.generation,
            self.seq
        );
        let input_fifo = format!(
            "{}/cmd-{}-{}.in",
            self.host.log_dir(),
            self.generation,
            self.seq
        );
        let marker = format!("__AUTOBUILD_DONE_{}_{}__", self.generation, self.seq);
        let quoted = shell_quote(&log_target);
        let fifo = shell_quote(&input_fifo);
        // fd 3 holds the FIFO open read-write so writers never block on open.
        // The FIFO is unlinked before fd 3 closes; input nobody read is dropped.
        let script = format!(
            "rm -f {fifo}; mkfifo {fifo} && exec 3<>{fifo}\n\
             {{ {command}\n}} <&3 3<&- > {quoted} 2>&1; __ab_rc=$?; rm -f {fifo}; exec 3<&-; printf '\\n{marker} %s %s\\n' \"$__ab_rc\" \"$PWD\" >> {quoted}\n"
        );

        self.state = transition(self.state, SessionEvent::Dispatched)?;
        debug!(log_target = %log_target, "dispatching command");
        self.send(&script)?;
        self.in_flight = Some(InFlight {
            log_target,
            input_fifo,
            marker,
            started: Instant::now(),
        });
        self.poll(false)
    }

    /// Keep waiting on the stuck command for up to another wait bound.
    pub fn wait(&mut self) -> Result<ExecOutcome> {
        self.require_stuck("WAIT")?;
        self.poll(true)
    }

    /// Forward `text` plus newline to the stuck command's own stdin.
    ///
    /// Returns `false` when the command has already finished; the input is
    /// discarded and never reaches the shell.
    pub fn write_input(&mut self, text: &str) -> Result<bool> {
        self.require_stuck("WRITE")?;
        let fifo = self
            .in_flight
            .as_ref()
            .map(|in_flight| in_flight.input_fifo.clone())
            .ok_or_else(|| anyhow!("stuck without an in-flight command"))?;
        let delivered = self.host.feed_input(&fifo, &format!("{text}\n"))?;
        if delivered {
            self.state = transition(self.state, SessionEvent::InputWritten)?;
        } else {
            info!(fifo = %fifo, "command finished before input was delivered");
        }
        Ok(delivered)
    }

    /// Stop the stuck command. Always leaves a ready session.
    ///
    /// Returns the command's result if it wrote its marker after SIGTERM;
    /// otherwise the shell is replaced by a fresh one in the last known cwd.
    #[instrument(skip_all)]
    pub fn terminate(&mut self) -> Result<Option<ExecutionResult>> {
        self.require_stuck("TERMINATE")?;
        let pid = self
            .shell
            .as_ref()
            .map(|shell| shell.pid)
            .ok_or_else(|| anyhow!("no shell while stuck"))?;

        if let Err(err) = self.host.signal_children(pid, "TERM") {
            warn!(err = %err, "failed to signal stuck command");
        }
        thread::sleep(self.settings.terminate_grace);

        if let Some(completion) = self.read_completion()? {
            info!("stuck command exited after SIGTERM");
            self.state = transition(self.state, SessionEvent::Terminated)?;
            let result = self.finish(completion, true);
            return Ok(Some(result));
        }

        warn!("stuck command ignored SIGTERM; restarting shell");
        self.in_flight = None;
        self.kill_shell();
        self.state = transition(self.state, SessionEvent::Lost)?;
        self.start()?;
        Ok(None)
    }

    /// Kill the shell and forget any in-flight command.
    pub fn shutdown(&mut self) {
        self.in_flight = None;
        self.kill_shell();
        self.state = SessionState::NoSession;
    }

    fn require_stuck(&self, action: &str) -> Result<()> {
        if self.state != SessionState::CommandStuck {
            bail!("{action} is only valid while a command is stuck");
        }
        Ok(())
    }

    fn send(&mut self, text: &str) -> Result<()> {
        let shell = self
            .shell
            .as_mut()
            .ok_or_else(|| anyhow!("no live shell"))?;
        let written = shell
            .stdin
            .write_all(text.as_bytes())
            .and_then(|()| shell.stdin.flush());
        if let Err(err) = written {
            warn!(err = %err, "shell stdin closed");
            self.in_flight = None;
            self.kill_shell();
            self.state = transition(self.state, SessionEvent::Lost)?;
            return Err(anyhow!(SessionLostError {
                detail: format!("write to shell: {err}"),
            }));
        }
        Ok(())
    }

    fn poll(&mut self, after_stuck: bool) -> Result<ExecOutcome> {
        let deadline = Instant::now() + self.settings.wait_bound;
        loop {
            if let Some(completion) = self.read_completion()? {
                self.state = transition(self.state, SessionEvent::Completed)?;
                return Ok(ExecOutcome::Finished(self.finish(completion, after_stuck)));
            }

            if let Some(status) = self.shell_exit()? {
                // The command took the shell down with it (e.g. `exit`).
                let output = self.read_log().unwrap_or_default();
                warn!(%status, "shell exited while running a command");
                self.in_flight = None;
                self.kill_shell();
                self.state = transition(self.state, SessionEvent::Lost)?;
                self.start()?;
                let (stdout_text, truncated) =
                    summarize(&sanitize(&output), self.settings.display_limit_chars);
                return Ok(ExecOutcome::Finished(ExecutionResult {
                    exit_status: ExitStatus::from_code(status.code()),
                    stdout_text,
                    truncated,
                    duration_exceeded_bound: after_stuck,
                }));
            }

            match next_poll(deadline, self.settings.poll_interval) {
                Some(step) => thread::sleep(step),
                None => break,
            }
        }

        self.state = transition(self.state, SessionEvent::BoundElapsed)?;
        let in_flight = self
            .in_flight
            .as_ref()
            .ok_or_else(|| anyhow!("stuck without an in-flight command"))?;
        let raw = self.host.read_file(&in_flight.log_target)?.unwrap_or_default();
        let (partial_output, _) = summarize(&sanitize(&raw), self.settings.display_limit_chars);
        let signal = StuckSignal {
            log_target: in_flight.log_target.clone(),
            partial_output,
            waited: in_flight.started.elapsed(),
        };
        info!(log_target = %signal.log_target, waited_ms = signal.waited.as_millis() as u64, "command stuck");
        Ok(ExecOutcome::Stuck(signal))
    }

    fn read_log(&self) -> Result<String> {
        let in_flight = self
            .in_flight
            .as_ref()
            .ok_or_else(|| anyhow!("no in-flight command"))?;
        Ok(self.host.read_file(&in_flight.log_target)?.unwrap_or_default())
    }

    fn read_completion(&self) -> Result<Option<Completion>> {
        let Some(in_flight) = self.in_flight.as_ref() else {
            return Ok(None);
        };
        let Some(log) = self.host.read_file(&in_flight.log_target)? else {
            return Ok(None);
        };
        Ok(parse_completion(&log, &in_flight.marker))
    }

    fn finish(&mut self, completion: Completion, after_stuck: bool) -> ExecutionResult {
        if let Some(in_flight) = self.in_flight.take() {
            debug!(elapsed_ms = in_flight.started.elapsed().as_millis() as u64, exit_code = ?completion.exit_code, "command finished");
        }
        if let Some(cwd) = completion.cwd {
            self.cwd = Some(cwd);
        }
        let (stdout_text, truncated) = summarize(
            &sanitize(&completion.output),
            self.settings.display_limit_chars,
        );
        ExecutionResult {
            exit_status: ExitStatus::from_code(completion.exit_code),
            stdout_text,
            truncated,
            duration_exceeded_bound: after_stuck,
        }
    }

    fn shell_exit(&mut self) -> Result<Option<std::process::ExitStatus>> {
        match self.shell.as_mut() {
            Some(shell) => shell.child.try_wait().context("poll shell"),
            None => Ok(None),
        }
    }

    /// Reject commands the shell cannot parse before they reach it.
    fn syntax_error(&self, command: &str) -> Result<Option<ExecutionResult>> {
        let mut check = std::process::Command::new("bash");
        check.arg("-n").arg("-c").arg(command);
        let output = run_bounded(check, &ProcessLimits::new(Duration::from_secs(10), 64 * 1024))
            .context("syntax check")?;
        if output.success() {
            return Ok(None);
        }
        let text = String::from_utf8_lossy(&output.stderr).replace("bash: -c: ", "");
        Ok(Some(ExecutionResult {
            exit_status: ExitStatus::from_code(output.status.code()),
            stdout_text: sanitize(&text),
            truncated: false,
            duration_exceeded_bound: false,
        }))
    }

    fn kill_shell(&mut self) {
        if let Some(mut shell) = self.shell.take() {
            if let Err(err) = self.host.signal_children(shell.pid, "KILL") {
                debug!(err = %err, "failed to kill shell children");
            }
            if let Err(err) = shell.child.kill() {
                debug!(err = %err, "shell already gone");
            }
            let _ = shell.child.wait();
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.kill_shell();
    }
}

fn parse_completion(log: &str, marker: &str) -> Option<Completion> {
    let needle = format!("\n{marker} ");
    let idx = log.rfind(&needle)?;
    let rest = &log[idx + needle.len()..];
    let line = rest.lines().next()?;
    let (code, cwd) = match line.split_once(' ') {
        Some((code, cwd)) => (code, Some(cwd.to_string())),
        None => (line, None),
    };
    Some(Completion {
        exit_code: code.trim().parse().ok(),
        cwd: cwd.filter(|c| !c.is_empty()),
        output: log[..idx].to_string(),
    })
}
