//! Agent configuration stored in `agent.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::io::session::SessionSettings;

/// Agent configuration (TOML).
///
/// Meant to be edited by humans. Missing fields take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Stop after this many decision cycles.
    pub max_cycles: u32,

    /// Directory for cycle transcripts, session logs and the file log.
    pub log_dir: String,

    pub session: SessionConfig,
    pub context: ContextConfig,
    pub oracle: OracleConfig,
    pub repetition: RepetitionConfig,
    pub container: ContainerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell binary for the local session.
    pub shell: String,
    /// Seconds before a running command is reported stuck.
    pub wait_bound_secs: u64,
    pub poll_interval_ms: u64,
    /// Seconds between SIGTERM and the cleanliness check on TERMINATE.
    pub terminate_grace_secs: u64,
    /// Output longer than this many characters is summarized.
    pub display_limit_chars: usize,
    /// Treat the local shell as isolated: no read-only allowlist, no
    /// container provisioning.
    pub local_isolated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContextConfig {
    /// Token budget for replayed history.
    pub budget_tokens: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OracleConfig {
    /// Command that reads a prompt on stdin and prints a reply.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
    /// Consecutive unparseable replies before the run stops.
    pub max_parse_retries: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RepetitionStrategy {
    /// Ask the oracle once more for an alternative.
    Replan,
    /// Substitute the `repetition_detected` diagnostic directly.
    ShortCircuit,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RepetitionConfig {
    pub strategy: RepetitionStrategy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContainerConfig {
    /// Container runtime CLI.
    pub runtime: String,
    pub image_prefix: String,
    /// Log directory inside the container.
    pub log_dir: String,
    pub build_timeout_secs: u64,
    /// Leave the container running when the run ends.
    pub keep: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_cycles: 60,
            log_dir: ".autobuild".to_string(),
            session: SessionConfig::default(),
            context: ContextConfig::default(),
            oracle: OracleConfig::default(),
            repetition: RepetitionConfig::default(),
            container: ContainerConfig::default(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            shell: "bash".to_string(),
            wait_bound_secs: 300,
            poll_interval_ms: 1000,
            terminate_grace_secs: 5,
            display_limit_chars: 12_000,
            local_isolated: false,
        }
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            budget_tokens: 60_000,
        }
    }
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "llm".to_string(),
                "--no-stream".to_string(),
            ],
            timeout_secs: 300,
            output_limit_bytes: 1_000_000,
            max_parse_retries: 3,
        }
    }
}

impl Default for RepetitionConfig {
    fn default() -> Self {
        Self {
            strategy: RepetitionStrategy::Replan,
        }
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            runtime: "docker".to_string(),
            image_prefix: "autobuild".to_string(),
            log_dir: "/tmp/autobuild".to_string(),
            build_timeout_secs: 30 * 60,
            keep: true,
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_cycles == 0 {
            return Err(anyhow!("max_cycles must be > 0"));
        }
        if self.log_dir.trim().is_empty() {
            return Err(anyhow!("log_dir must not be empty"));
        }
        if self.session.shell.trim().is_empty() {
            return Err(anyhow!("session.shell must not be empty"));
        }
        if self.session.wait_bound_secs == 0 {
            return Err(anyhow!("session.wait_bound_secs must be > 0"));
        }
        if self.session.poll_interval_ms == 0 {
            return Err(anyhow!("session.poll_interval_ms must be > 0"));
        }
        if self.session.display_limit_chars == 0 {
            return Err(anyhow!("session.display_limit_chars must be > 0"));
        }
        if self.context.budget_tokens == 0 {
            return Err(anyhow!("context.budget_tokens must be > 0"));
        }
        if self.oracle.command.is_empty() || self.oracle.command[0].trim().is_empty() {
            return Err(anyhow!("oracle.command must be a non-empty array"));
        }
        if self.oracle.timeout_secs == 0 {
            return Err(anyhow!("oracle.timeout_secs must be > 0"));
        }
        if self.oracle.output_limit_bytes == 0 {
            return Err(anyhow!("oracle.output_limit_bytes must be > 0"));
        }
        if self.oracle.max_parse_retries == 0 {
            return Err(anyhow!("oracle.max_parse_retries must be > 0"));
        }
        if self.container.runtime.trim().is_empty() {
            return Err(anyhow!("container.runtime must not be empty"));
        }
        if !self.container.log_dir.starts_with('/') {
            return Err(anyhow!("container.log_dir must be an absolute path"));
        }
        Ok(())
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            wait_bound: Duration::from_secs(self.session.wait_bound_secs),
            poll_interval: Duration::from_millis(self.session.poll_interval_ms),
            terminate_grace: Duration::from_secs(self.session.terminate_grace_secs),
            display_limit_chars: self.session.display_limit_chars,
            ..SessionSettings::default()
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AgentConfig::default()`.
pub fn load_config(path: &Path) -> Result<AgentConfig> {
    if !path.exists() {
        let cfg = AgentConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AgentConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &AgentConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
