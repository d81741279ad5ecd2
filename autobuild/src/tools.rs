//! Tool dispatch: what each structured command actually does.

use std::path::{Component, Path, PathBuf};

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::core::policy::Phase;
use crate::core::response::ToolSpec;
use crate::core::sanitize::summarize;
use crate::core::types::{Command, TERMINAL_TOOL};
use crate::io::file_log::{FileOp, FileOpLog, text_checksum};
use crate::io::provisioner::{Provisioner, image_tag};
use crate::terminal::Terminal;

pub const READ_FILE_TOOL: &str = "read_file";
pub const WRITE_FILE_TOOL: &str = "write_to_file";
pub const REPETITION_TOOL: &str = "repetition_detected";
pub const FINISH_TOOL: &str = "goals_accomplished";

const DOCKERFILE: &str = "Dockerfile";
const MAX_DOCKERFILE_LINES: usize = 30;
const MAX_DOCKERFILE_RUN_LINES: usize = 20;

/// Every tool the oracle may call, with its exact argument set.
pub fn tool_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec::new(
            TERMINAL_TOOL,
            "Run one command in the persistent shell.",
            &[("command", "the shell command line, or WAIT / TERMINATE / WRITE:<text>")],
        ),
        ToolSpec::new(
            READ_FILE_TOOL,
            "Read a text file.",
            &[("file_path", "path relative to the current directory, or absolute inside the container")],
        ),
        ToolSpec::new(
            WRITE_FILE_TOOL,
            "Create or overwrite a text file. Writing a Dockerfile before a container exists builds it and moves the shell into the new container.",
            &[("filename", "path of the file to write"), ("text", "the complete file contents")],
        ),
        ToolSpec::new(
            REPETITION_TOOL,
            "Report that the recent commands form a loop.",
            &[("repetition_window", "the repeating commands")],
        ),
        ToolSpec::new(
            FINISH_TOOL,
            "Finish the run once the project builds and its tests have been run.",
            &[("reason", "what was achieved")],
        ),
    ]
}

/// Diagnostic returned by `repetition_detected`.
pub fn repetition_diagnostic(window: &str) -> String {
    format!(
        "Repetition detected: the last six commands form a cycle with no apparent progress.\n\n\
         Here is the concatenated string of the last 6 commands (in order):\n{window}\n\n\
         Please analyze everything you know about the task so far, break out of this loop, and \
         suggest exactly one new command (with its arguments) that will move the task forward.\n\n\
         Important:\n  \u{2022} The `thoughts` field should explain why these commands were looping \
         and how the new command breaks the pattern.\n"
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutcome {
    /// Text recorded as the command's result.
    pub text: String,
    /// The oracle declared the goal reached.
    pub finished: bool,
}

impl ToolOutcome {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            finished: false,
        }
    }
}

pub struct Toolbox {
    project: String,
    project_dir: PathBuf,
    image_prefix: String,
    file_log: FileOpLog,
    provisioner: Box<dyn Provisioner>,
    container_id: Option<String>,
}

impl Toolbox {
    pub fn new(
        project: &str,
        project_dir: &Path,
        image_prefix: &str,
        file_log: FileOpLog,
        provisioner: Box<dyn Provisioner>,
    ) -> Self {
        Self {
            project: project.to_string(),
            project_dir: project_dir.to_path_buf(),
            image_prefix: image_prefix.to_string(),
            file_log,
            provisioner,
            container_id: None,
        }
    }

    pub fn container_id(&self) -> Option<&str> {
        self.container_id.as_deref()
    }

    pub fn file_log(&self) -> &FileOpLog {
        &self.file_log
    }

    /// Execute `command`. Tool-level failures come back as text; errors mean
    /// the session or host failed.
    #[instrument(skip_all, fields(tool = command.name()))]
    pub fn dispatch(&mut self, command: &Command, terminal: &mut Terminal) -> Result<ToolOutcome> {
        match command.name() {
            TERMINAL_TOOL => match command.arg_text("command") {
                Some(line) => Ok(ToolOutcome::text(terminal.run_command(&line)?)),
                None => Ok(ToolOutcome::text(missing_arg(TERMINAL_TOOL, "command"))),
            },
            READ_FILE_TOOL => match command.arg_text("file_path") {
                Some(path) => self.read_file(&path, terminal).map(ToolOutcome::text),
                None => Ok(ToolOutcome::text(missing_arg(READ_FILE_TOOL, "file_path"))),
            },
            WRITE_FILE_TOOL => {
                match (command.arg_text("filename"), command.arg_text("text")) {
                    (Some(path), Some(text)) => {
                        self.write_file(&path, &text, terminal).map(ToolOutcome::text)
                    }
                    (None, _) => Ok(ToolOutcome::text(missing_arg(WRITE_FILE_TOOL, "filename"))),
                    (_, None) => Ok(ToolOutcome::text(missing_arg(WRITE_FILE_TOOL, "text"))),
                }
            }
            REPETITION_TOOL => Ok(ToolOutcome::text(repetition_diagnostic(
                &command.arg_text("repetition_window").unwrap_or_default(),
            ))),
            FINISH_TOOL => {
                let reason = command.arg_text("reason").unwrap_or_default();
                info!(reason = %reason, "goals accomplished");
                Ok(ToolOutcome {
                    text: format!("Goals accomplished: {reason}"),
                    finished: true,
                })
            }
            other => {
                let names: Vec<String> = tool_specs().into_iter().map(|t| t.name).collect();
                Ok(ToolOutcome::text(format!(
                    "Unknown command '{other}'. Available tools: {}.",
                    names.join(", ")
                )))
            }
        }
    }

    /// Remove the container unless it should outlive the run.
    pub fn teardown(&mut self, keep: bool) -> Result<()> {
        if let Some(id) = self.container_id.take() {
            if keep {
                info!(container = %id, "leaving container running");
            } else {
                self.provisioner.remove_container(&id)?;
            }
        }
        Ok(())
    }

    fn read_file(&self, path: &str, terminal: &Terminal) -> Result<String> {
        let target = match self.target_path(path, terminal) {
            Ok(target) => target,
            Err(message) => return Ok(message),
        };
        match terminal.host().read_file(&target)? {
            Some(contents) => {
                let cap = terminal.session().settings().display_limit_chars;
                let (text, _) = summarize(&contents, cap);
                Ok(text)
            }
            None => Ok(format!("The file {path} does not exist or cannot be read.")),
        }
    }

    fn write_file(&mut self, path: &str, text: &str, terminal: &mut Terminal) -> Result<String> {
        let target = match self.target_path(path, terminal) {
            Ok(target) => target,
            Err(message) => return Ok(message),
        };
        let is_dockerfile = Path::new(&target)
            .file_name()
            .is_some_and(|name| name == DOCKERFILE);

        if is_dockerfile {
            if self.container_id.is_some() {
                return Ok("Cannot write another Dockerfile after container is running. Debug \
                           inside with linux_terminal tool."
                    .to_string());
            }
            if let Some(problem) = dockerfile_problem(text) {
                return Ok(problem);
            }
        }

        let checksum = text_checksum(text);
        if self.file_log.is_duplicate_write(&target, &checksum)? {
            return Ok(format!(
                "The file {path} already has exactly this content; writing it again changes nothing."
            ));
        }

        terminal.host().write_file(&target, text)?;
        self.file_log.record(FileOp::Write, &target, Some(&checksum))?;
        info!(path = %target, bytes = text.len(), "file written");

        if is_dockerfile && terminal.phase() == Phase::Local {
            return self.provision(&target, terminal);
        }
        Ok(format!("The file {path} was written successfully."))
    }

    fn provision(&mut self, dockerfile: &str, terminal: &mut Terminal) -> Result<String> {
        let context_dir = self
            .project_dir
            .join(dockerfile)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.project_dir.clone());
        let tag = image_tag(&self.image_prefix, &self.project);

        if let Err(err) = self.provisioner.build_image(&context_dir, &tag) {
            warn!(err = %err, "image build failed");
            return Ok(format!(
                "The Dockerfile was written but the image failed to build. Fix the Dockerfile \
                 and write it again.\n{err:#}"
            ));
        }
        let container_id = match self.provisioner.start_container(&tag) {
            Ok(id) => id,
            Err(err) => {
                warn!(err = %err, "container start failed");
                return Ok(format!("The image was built but the container failed to start.\n{err:#}"));
            }
        };

        terminal.attach_host(self.provisioner.session_host(&container_id))?;
        self.container_id = Some(container_id);
        let cwd = terminal.probe_cwd()?.unwrap_or_else(|| "unknown".to_string());
        Ok(format!("Image built and container started. Working directory: {cwd}"))
    }

    /// Path as the host should see it, or a message explaining the refusal.
    fn target_path(&self, path: &str, terminal: &Terminal) -> Result<String, String> {
        let trimmed = path.trim();
        if trimmed.is_empty() {
            return Err("A file path is required.".to_string());
        }
        match terminal.phase() {
            Phase::Local => {
                let escapes = Path::new(trimmed).components().any(|c| {
                    matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_))
                });
                if escapes {
                    return Err(format!(
                        "'{trimmed}' points outside the project checkout. Use a path relative to \
                         the repository root."
                    ));
                }
                Ok(trimmed.to_string())
            }
            Phase::Isolated => Ok(terminal.resolve_path(trimmed)),
        }
    }
}

fn missing_arg(tool: &str, arg: &str) -> String {
    format!("The {tool} tool requires the '{arg}' argument.")
}

fn dockerfile_problem(text: &str) -> Option<String> {
    if text.contains("COPY ") {
        return Some(
            "Usage of 'COPY' in Dockerfile is prohibited. Clone the repository inside the image \
             instead."
                .to_string(),
        );
    }
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let run_lines = lines
        .iter()
        .filter(|l| l.trim_start().starts_with("RUN "))
        .count();
    if lines.len() > MAX_DOCKERFILE_LINES || run_lines > MAX_DOCKERFILE_RUN_LINES {
        return Some(format!(
            "The Dockerfile is too long ({} lines, {run_lines} RUN instructions). Keep it to the \
             base image, essential system packages and a clone of the project; install the rest \
             from inside the container.",
            lines.len()
        ));
    }
    None
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::json;

    use super::*;
    use crate::test_support::{ScriptedProvisioner, TestProject, command, local_terminal};

    fn toolbox(project: &TestProject, provisioner: ScriptedProvisioner) -> Toolbox {
        Toolbox::new(
            "demo",
            project.root(),
            "autobuild",
            FileOpLog::new(project.log_dir().join("file_ops.log")),
            Box::new(provisioner),
        )
    }

    /// Verifies `goals_accomplished` ends the run with its reason.
    #[test]
    fn finish_tool_marks_outcome_finished() {
        let project = TestProject::new().expect("project");
        let mut terminal = local_terminal(&project);
        let mut tools = toolbox(&project, ScriptedProvisioner::new(&project));
        let outcome = tools
            .dispatch(&command(FINISH_TOOL, json!({"reason": "tests pass"})), &mut terminal)
            .expect("dispatch");
        assert!(outcome.finished);
        assert_eq!(outcome.text, "Goals accomplished: tests pass");
    }

    /// Verifies the loop diagnostic embeds the window and asks for one command.
    #[test]
    fn repetition_tool_returns_diagnostic() {
        let project = TestProject::new().expect("project");
        let mut terminal = local_terminal(&project);
        let mut tools = toolbox(&project, ScriptedProvisioner::new(&project));
        let outcome = tools
            .dispatch(
                &command(REPETITION_TOOL, json!({"repetition_window": "ls\nls"})),
                &mut terminal,
            )
            .expect("dispatch");
        assert!(!outcome.finished);
        assert!(outcome.text.starts_with("Repetition detected"));
        assert!(outcome.text.contains("(in order):\nls\nls\n"));
        assert!(outcome.text.contains("exactly one new command"));
    }

    /// Verifies an identical re-write is reported instead of performed.
    #[test]
    fn duplicate_write_is_detected() {
        let project = TestProject::new().expect("project");
        let mut terminal = local_terminal(&project);
        let mut tools = toolbox(&project, ScriptedProvisioner::new(&project));
        let write = command(WRITE_FILE_TOOL, json!({"filename": "notes.txt", "text": "hi\n"}));

        let first = tools.dispatch(&write, &mut terminal).expect("first");
        assert!(first.text.contains("written successfully"));
        assert_eq!(
            fs::read_to_string(project.root().join("notes.txt")).expect("read"),
            "hi\n"
        );
        let second = tools.dispatch(&write, &mut terminal).expect("second");
        assert!(second.text.contains("already has exactly this content"));
    }

    /// Verifies local writes cannot escape the checkout.
    #[test]
    fn local_write_rejects_traversal() {
        let project = TestProject::new().expect("project");
        let mut terminal = local_terminal(&project);
        let mut tools = toolbox(&project, ScriptedProvisioner::new(&project));
        for path in ["../escape.txt", "/tmp/escape.txt"] {
            let outcome = tools
                .dispatch(
                    &command(WRITE_FILE_TOOL, json!({"filename": path, "text": "x"})),
                    &mut terminal,
                )
                .expect("dispatch");
            assert!(outcome.text.contains("outside the project checkout"), "{path}");
        }
    }

    /// Verifies Dockerfile content rules run before any build.
    #[test]
    fn dockerfile_rules_reject_copy_and_length() {
        assert!(
            dockerfile_problem("FROM ubuntu\nCOPY . /app\n")
                .expect("copy")
                .contains("'COPY'")
        );
        let long = format!("FROM ubuntu\n{}", "RUN true\n".repeat(21));
        assert!(dockerfile_problem(&long).expect("long").contains("too long"));
        assert!(dockerfile_problem("FROM ubuntu\nRUN apt-get update\n").is_none());
    }

    /// Verifies writing a Dockerfile builds, starts and attaches the container.
    #[test]
    fn dockerfile_write_provisions_container() {
        let project = TestProject::new().expect("project");
        let provisioner = ScriptedProvisioner::new(&project);
        let builds = provisioner.builds();
        let mut terminal = local_terminal(&project);
        let mut tools = toolbox(&project, provisioner);

        let outcome = tools
            .dispatch(
                &command(
                    WRITE_FILE_TOOL,
                    json!({"filename": "Dockerfile", "text": "FROM ubuntu:22.04\n"}),
                ),
                &mut terminal,
            )
            .expect("dispatch");

        assert!(
            outcome
                .text
                .starts_with("Image built and container started. Working directory: "),
            "{}",
            outcome.text
        );
        assert_eq!(terminal.phase(), Phase::Isolated);
        assert!(tools.container_id().is_some());
        assert_eq!(builds.borrow().len(), 1);
        assert_eq!(builds.borrow()[0].1, "autobuild_demo:autobuild");

        let again = tools
            .dispatch(
                &command(
                    WRITE_FILE_TOOL,
                    json!({"filename": "Dockerfile", "text": "FROM debian\n"}),
                ),
                &mut terminal,
            )
            .expect("dispatch");
        assert!(again.text.starts_with("Cannot write another Dockerfile"));
    }

    /// Verifies a failed build is reported as text and keeps the local phase.
    #[test]
    fn failed_build_is_reported() {
        let project = TestProject::new().expect("project");
        let provisioner = ScriptedProvisioner::new(&project).fail_build("E: package not found");
        let mut terminal = local_terminal(&project);
        let mut tools = toolbox(&project, provisioner);

        let outcome = tools
            .dispatch(
                &command(
                    WRITE_FILE_TOOL,
                    json!({"filename": "Dockerfile", "text": "FROM nowhere\n"}),
                ),
                &mut terminal,
            )
            .expect("dispatch");
        assert!(outcome.text.contains("failed to build"));
        assert!(outcome.text.contains("E: package not found"));
        assert_eq!(terminal.phase(), Phase::Local);
    }

    /// Verifies `read_file` returns contents and reports missing files.
    #[test]
    fn read_file_reports_contents_and_missing() {
        let project = TestProject::new().expect("project");
        let mut terminal = local_terminal(&project);
        let mut tools = toolbox(&project, ScriptedProvisioner::new(&project));
        let found = tools
            .dispatch(&command(READ_FILE_TOOL, json!({"file_path": "README.md"})), &mut terminal)
            .expect("dispatch");
        assert!(found.text.contains("# demo"));
        let missing = tools
            .dispatch(&command(READ_FILE_TOOL, json!({"file_path": "nope.txt"})), &mut terminal)
            .expect("dispatch");
        assert!(missing.text.contains("does not exist"));
    }

    /// Verifies unknown tools are answered with the tool list.
    #[test]
    fn unknown_tool_lists_available_tools() {
        let project = TestProject::new().expect("project");
        let mut terminal = local_terminal(&project);
        let mut tools = toolbox(&project, ScriptedProvisioner::new(&project));
        let outcome = tools
            .dispatch(&command("list_dir", json!({})), &mut terminal)
            .expect("dispatch");
        assert!(outcome.text.starts_with("Unknown command 'list_dir'"));
        assert!(outcome.text.contains(TERMINAL_TOOL));
    }
}
