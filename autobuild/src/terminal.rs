//! The `linux_terminal` surface: raw command text in, display text out.
//!
//! Wraps the [`SessionController`] with preprocessing, the safety policy and
//! the stuck-command protocol. Everything the oracle sees from the shell is
//! produced here.

use anyhow::Result;
use tracing::{debug, info, instrument};

use crate::core::policy::{Phase, RecoveryAction, check, install_reminder, preprocess};
use crate::core::types::{ExecOutcome, ExecutionResult, ExitStatus, StuckSignal};
use crate::io::host::ShellHost;
use crate::io::session::SessionController;

pub const OUTPUT_PREFIX: &str = "Output in terminal after executing the command:\n";

/// Reply to any non-recovery input while a command is stuck.
pub const STUCK_REJECTION: &str = "The previous command is still running in the terminal. \
Until it ends, the only accepted inputs are:\n\
  WAIT: keep waiting for the command to finish\n\
  TERMINATE: stop the command and reset the terminal\n\
  WRITE:<text>: send <text> followed by a newline to the command's input";

const NOTHING_RUNNING: &str =
    "No command is currently running; WAIT, TERMINATE and WRITE:<text> only apply to a stuck command.";

pub struct Terminal {
    session: SessionController,
}

impl Terminal {
    pub fn new(session: SessionController) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &SessionController {
        &self.session
    }

    pub fn phase(&self) -> Phase {
        self.session.phase()
    }

    pub fn host(&self) -> &dyn ShellHost {
        self.session.host()
    }

    /// Move the terminal onto a new host, e.g. a freshly started container.
    pub fn attach_host(&mut self, host: Box<dyn ShellHost>) -> Result<()> {
        self.session.replace_host(host)
    }

    /// Resolve `path` against the shell's last known working directory.
    pub fn resolve_path(&self, path: &str) -> String {
        match self.session.cwd() {
            Some(cwd) if !path.starts_with('/') => {
                format!("{}/{}", cwd.trim_end_matches('/'), path)
            }
            _ => path.to_string(),
        }
    }

    /// Working directory of a freshly attached shell.
    pub fn probe_cwd(&mut self) -> Result<Option<String>> {
        match self.session.execute("pwd")? {
            ExecOutcome::Finished(_) => Ok(self.session.cwd().map(str::to_string)),
            ExecOutcome::Stuck(_) => {
                self.session.terminate()?;
                Ok(None)
            }
        }
    }

    /// Run one raw command line and render what the oracle should see.
    ///
    /// Policy rejections and stuck signals are text, not errors. Errors are
    /// reserved for a lost session or a failing host.
    #[instrument(skip_all, fields(phase = ?self.session.phase(), stuck = self.session.is_stuck()))]
    pub fn run_command(&mut self, raw: &str) -> Result<String> {
        let command = preprocess(raw, self.session.phase());
        let recovery = RecoveryAction::parse(&command);

        if self.session.is_stuck() {
            return match recovery {
                Some(action) => self.recover(action),
                None => {
                    debug!(command = %command, "rejected while stuck");
                    Ok(STUCK_REJECTION.to_string())
                }
            };
        }
        if recovery.is_some() {
            return Ok(NOTHING_RUNNING.to_string());
        }

        if let Err(rejection) = check(&command, self.session.phase()) {
            info!(command = %command, "command rejected by policy");
            return Ok(rejection.message);
        }

        match self.session.execute(&command)? {
            ExecOutcome::Finished(result) => {
                let mut text = render_result(&result);
                if self.session.phase() == Phase::Isolated
                    && result.exit_status == ExitStatus::Success
                    && let Some(reminder) = install_reminder(&command)
                {
                    text.push_str(reminder);
                }
                Ok(text)
            }
            ExecOutcome::Stuck(signal) => Ok(self.render_stuck(&signal)),
        }
    }

    fn recover(&mut self, action: RecoveryAction) -> Result<String> {
        info!(?action, "recovering stuck command");
        match action {
            RecoveryAction::Wait => match self.session.wait()? {
                ExecOutcome::Finished(result) => Ok(render_result(&result)),
                ExecOutcome::Stuck(signal) => Ok(self.render_stuck(&signal)),
            },
            RecoveryAction::Terminate => match self.session.terminate()? {
                Some(result) => Ok(format!(
                    "The command was terminated.\n{}",
                    render_result(&result)
                )),
                None => Ok(format!(
                    "The command did not stop after SIGTERM, so the terminal was restarted{}.",
                    self.session
                        .cwd()
                        .map(|cwd| format!(" in {cwd}"))
                        .unwrap_or_default()
                )),
            },
            RecoveryAction::Write(text) => {
                if !self.session.write_input(&text)? {
                    return Ok(format!(
                        "The command finished before \"{text}\" could be delivered, so the \
                         input was discarded. Use WAIT to collect its output."
                    ));
                }
                Ok(format!(
                    "Sent \"{text}\" to the running command. It is still running; use WAIT to \
                     collect its output, TERMINATE to stop it or WRITE:<text> to send more input."
                ))
            }
        }
    }

    fn render_stuck(&self, signal: &StuckSignal) -> String {
        let partial = if signal.partial_output.trim().is_empty() {
            "(no output yet)"
        } else {
            signal.partial_output.trim_end()
        };
        format!(
            "The command you executed seems to take some time to finish ({} seconds so far). \
             Output observed so far:\n{partial}\n\n\
             You can:\n\
             \x20 WAIT: keep waiting up to another {} seconds\n\
             \x20 TERMINATE: stop the command and reset the terminal\n\
             \x20 WRITE:<text>: send <text> to the command, e.g. to answer a prompt",
            signal.waited.as_secs(),
            self.session.settings().wait_bound.as_secs()
        )
    }
}

fn render_result(result: &ExecutionResult) -> String {
    let mut text = format!("{OUTPUT_PREFIX}{}", result.stdout_text.trim_end());
    if let ExitStatus::Failure(code) = result.exit_status {
        text.push_str(&format!("\n[exit code {code}]"));
    }
    text
}
