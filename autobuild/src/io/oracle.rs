//! Decision oracle abstraction.
//!
//! The [`DecisionOracle`] trait decouples the control loop from the model
//! backend. The shipped [`CommandOracle`] pipes a rendered prompt into an
//! external command; tests use scripted oracles that replay canned replies.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::types::Message;
use crate::io::process::{ProcessLimits, run_bounded};

/// One oracle query.
#[derive(Debug, Clone)]
pub struct OracleRequest {
    /// Ordered, role-tagged prompt.
    pub messages: Vec<Message>,
    /// Mirror the raw reply here while it streams in.
    pub transcript_path: Option<PathBuf>,
}

/// Backend that turns a prompt into free-form reply text.
pub trait DecisionOracle {
    fn query(&self, request: &OracleRequest) -> Result<String>;
}

/// Oracle that runs an external command with the prompt on stdin.
#[derive(Debug, Clone)]
pub struct CommandOracle {
    argv: Vec<String>,
    workdir: PathBuf,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandOracle {
    pub fn new(
        argv: Vec<String>,
        workdir: &Path,
        timeout: Duration,
        output_limit_bytes: usize,
    ) -> Result<Self> {
        if argv.first().is_none_or(|program| program.trim().is_empty()) {
            return Err(anyhow!("oracle command must be a non-empty array"));
        }
        Ok(Self {
            argv,
            workdir: workdir.to_path_buf(),
            timeout,
            output_limit_bytes,
        })
    }
}

impl DecisionOracle for CommandOracle {
    #[instrument(skip_all, fields(program = %self.argv[0], messages = request.messages.len()))]
    fn query(&self, request: &OracleRequest) -> Result<String> {
        let prompt = render_prompt(&request.messages);
        info!(prompt_chars = prompt.chars().count(), "querying oracle");

        let mut cmd = Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..]).current_dir(&self.workdir);
        let mut limits = ProcessLimits::new(self.timeout, self.output_limit_bytes);
        limits.stdin = Some(prompt.as_bytes());
        limits.tee_stdout = request.transcript_path.as_deref();

        let output = run_bounded(cmd, &limits).context("run oracle command")?;
        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "oracle timed out");
            return Err(anyhow!("oracle timed out after {:?}", self.timeout));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "oracle failed");
            return Err(anyhow!(
                "oracle exited with status {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        let reply = output.stdout_text();
        debug!(reply_chars = reply.chars().count(), "oracle replied");
        Ok(reply)
    }
}

/// Flatten role-tagged messages into one prompt document.
pub fn render_prompt(messages: &[Message]) -> String {
    let mut out = String::new();
    for message in messages {
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        out.push_str("### ");
        out.push_str(&message.role.as_str().to_uppercase());
        out.push('\n');
        out.push_str(message.content.trim_end());
    }
    out.push('\n');
    out
}
