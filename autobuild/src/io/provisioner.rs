//! Image build and container start through the container runtime CLI.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{info, instrument, warn};

use crate::io::host::{ContainerHost, ShellHost};
use crate::io::process::{ProcessLimits, run_bounded};

const BUILD_LOG_TAIL_CHARS: usize = 4_000;

/// Builds images and starts the isolated environment.
pub trait Provisioner {
    /// Build `tag` from the directory holding the image definition.
    ///
    /// A failed build is an error whose message carries the build log tail.
    fn build_image(&self, context_dir: &Path, tag: &str) -> Result<()>;

    /// Start a long-lived container from `image`; returns its id.
    fn start_container(&self, image: &str) -> Result<String>;

    fn remove_container(&self, container_id: &str) -> Result<()>;

    /// Shell host for a started container.
    fn session_host(&self, container_id: &str) -> Box<dyn ShellHost>;
}

#[derive(Debug, Clone)]
pub struct RuntimeProvisioner {
    runtime: String,
    build_timeout: Duration,
    container_log_dir: String,
}

impl RuntimeProvisioner {
    pub fn new(runtime: &str, build_timeout: Duration, container_log_dir: &str) -> Self {
        Self {
            runtime: runtime.to_string(),
            build_timeout,
            container_log_dir: container_log_dir.to_string(),
        }
    }

    fn command(&self) -> Command {
        Command::new(&self.runtime)
    }

    fn image_exists(&self, tag: &str) -> Result<bool> {
        let mut cmd = self.command();
        cmd.args(["image", "inspect", tag]);
        let output = run_bounded(cmd, &ProcessLimits::new(Duration::from_secs(60), 64 * 1024))
            .with_context(|| format!("{} image inspect", self.runtime))?;
        Ok(output.success())
    }
}

impl Provisioner for RuntimeProvisioner {
    #[instrument(skip_all, fields(tag = tag, context = %context_dir.display()))]
    fn build_image(&self, context_dir: &Path, tag: &str) -> Result<()> {
        if self.image_exists(tag)? {
            info!("image already present, skipping build");
            return Ok(());
        }
        let mut cmd = self.command();
        cmd.args(["build", "-t", tag]).arg(context_dir);
        let output = run_bounded(
            cmd,
            &ProcessLimits::new(self.build_timeout, 8 * 1024 * 1024),
        )
        .with_context(|| format!("{} build", self.runtime))?;
        if !output.success() {
            let log = output.combined_text();
            let tail = tail_chars(&log, BUILD_LOG_TAIL_CHARS);
            warn!(code = ?output.status.code(), timed_out = output.timed_out, "image build failed");
            if output.timed_out {
                bail!("image build timed out after {:?}\n{tail}", self.build_timeout);
            }
            bail!("image build failed\n{tail}");
        }
        info!("image built");
        Ok(())
    }

    #[instrument(skip_all, fields(image = image))]
    fn start_container(&self, image: &str) -> Result<String> {
        let mut cmd = self.command();
        cmd.args(["run", "-d", "-t", "--entrypoint", "/bin/sh", image]);
        let output = run_bounded(cmd, &ProcessLimits::new(Duration::from_secs(120), 64 * 1024))
            .with_context(|| format!("{} run", self.runtime))?;
        if !output.success() {
            bail!(
                "failed to start container from {image}: {}",
                output.combined_text().trim()
            );
        }
        let id = output.stdout_text().trim().to_string();
        if id.is_empty() {
            bail!("{} run printed no container id", self.runtime);
        }
        info!(container = %id, "container started");
        Ok(id)
    }

    fn remove_container(&self, container_id: &str) -> Result<()> {
        let mut cmd = self.command();
        cmd.args(["rm", "-f", container_id]);
        let output = run_bounded(cmd, &ProcessLimits::new(Duration::from_secs(60), 64 * 1024))
            .with_context(|| format!("{} rm", self.runtime))?;
        if !output.success() {
            bail!(
                "failed to remove container {container_id}: {}",
                output.combined_text().trim()
            );
        }
        Ok(())
    }

    fn session_host(&self, container_id: &str) -> Box<dyn ShellHost> {
        Box::new(ContainerHost::new(
            &self.runtime,
            container_id,
            &self.container_log_dir,
        ))
    }
}

/// Image tag for a project: lowercase, runtime-safe characters only.
pub fn image_tag(prefix: &str, project: &str) -> String {
    let slug: String = project
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    let slug = slug.trim_matches(|c| c == '.' || c == '-');
    let slug = if slug.is_empty() { "project" } else { slug };
    format!("{prefix}_{slug}:autobuild")
}

fn tail_chars(text: &str, max: usize) -> String {
    let total = text.chars().count();
    if total <= max {
        return text.to_string();
    }
    let tail: String = text.chars().skip(total - max).collect();
    format!("[... {} characters omitted ...]\n{tail}", total - max)
}
