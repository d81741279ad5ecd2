//! Test helpers: scratch projects, scripted oracle and provisioner, and fast
//! session settings.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use serde_json::Value;
use tempfile::TempDir;

use crate::core::types::Command;
use crate::io::host::{LocalHost, ShellHost};
use crate::io::oracle::{DecisionOracle, OracleRequest};
use crate::io::provisioner::Provisioner;
use crate::io::session::{SessionController, SessionSettings};
use crate::terminal::Terminal;

/// A throwaway checkout plus a directory standing in for a container root.
pub struct TestProject {
    _dir: TempDir,
    root: PathBuf,
    container_root: PathBuf,
    log_dir: PathBuf,
}

impl TestProject {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().join("demo");
        let container_root = dir.path().join("container");
        let log_dir = dir.path().join("logs");
        fs::create_dir_all(root.join("src"))?;
        fs::create_dir_all(&container_root)?;
        fs::write(root.join("README.md"), "# demo\n\nRun `make test`.\n")?;
        fs::write(root.join("Makefile"), "test:\n\techo ok\n")?;
        fs::write(root.join("src/main.c"), "int main(void) { return 0; }\n")?;
        Ok(Self {
            _dir: dir,
            root,
            container_root,
            log_dir,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn container_root(&self) -> &Path {
        &self.container_root
    }

    /// Run artifacts, outside the checkout.
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }
}

/// Short bounds so stuck handling is observable in tests.
pub fn fast_settings(wait_bound: Duration) -> SessionSettings {
    SessionSettings {
        wait_bound,
        poll_interval: Duration::from_millis(20),
        terminate_grace: Duration::from_millis(300),
        spawn_timeout: Duration::from_secs(10),
        display_limit_chars: 12_000,
    }
}

/// Terminal on a local, restricted shell in the project checkout.
pub fn local_terminal(project: &TestProject) -> Terminal {
    let host = LocalHost::new(project.root(), &project.log_dir().join("session"), "bash");
    Terminal::new(SessionController::new(
        Box::new(host),
        fast_settings(Duration::from_secs(5)),
    ))
}

/// Terminal on an isolated shell rooted in the stand-in container.
pub fn isolated_terminal(project: &TestProject, wait_bound: Duration) -> Terminal {
    let host = LocalHost::new(
        project.container_root(),
        &project.log_dir().join("container-session"),
        "bash",
    )
    .isolated(true);
    Terminal::new(SessionController::new(
        Box::new(host),
        fast_settings(wait_bound),
    ))
}

/// Build a command from a tool name and a JSON object of arguments.
pub fn command(name: &str, args: Value) -> Command {
    match args {
        Value::Object(map) => Command::new(name, map),
        other => panic!("command args must be an object, got {other}"),
    }
}

/// JSON reply text for a tool call.
pub fn reply(thoughts: &str, name: &str, args: Value) -> String {
    serde_json::json!({
        "thoughts": thoughts,
        "command": { "name": name, "args": args },
    })
    .to_string()
}

/// Oracle that replays canned replies in order and records every request.
pub struct ScriptedOracle {
    replies: RefCell<VecDeque<String>>,
    requests: RefCell<Vec<OracleRequest>>,
}

impl ScriptedOracle {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: RefCell::new(replies.into_iter().map(Into::into).collect()),
            requests: RefCell::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<OracleRequest> {
        self.requests.borrow().clone()
    }

    pub fn remaining(&self) -> usize {
        self.replies.borrow().len()
    }
}

impl DecisionOracle for ScriptedOracle {
    fn query(&self, request: &OracleRequest) -> Result<String> {
        self.requests.borrow_mut().push(request.clone());
        let reply = self
            .replies
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted oracle ran out of replies"))?;
        if let Some(path) = &request.transcript_path {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, &reply)?;
        }
        Ok(reply)
    }
}

pub type BuildLog = Rc<RefCell<Vec<(PathBuf, String)>>>;

/// Provisioner whose "container" is an isolated local shell.
pub struct ScriptedProvisioner {
    container_root: PathBuf,
    log_dir: PathBuf,
    fail_build: Option<String>,
    builds: BuildLog,
    started: RefCell<u32>,
    removed: Rc<RefCell<Vec<String>>>,
}

impl ScriptedProvisioner {
    pub fn new(project: &TestProject) -> Self {
        Self {
            container_root: project.container_root().to_path_buf(),
            log_dir: project.log_dir().join("container-session"),
            fail_build: None,
            builds: Rc::new(RefCell::new(Vec::new())),
            started: RefCell::new(0),
            removed: Rc::new(RefCell::new(Vec::new())),
        }
    }

    /// Make every build fail with `log`.
    pub fn fail_build(mut self, log: &str) -> Self {
        self.fail_build = Some(log.to_string());
        self
    }

    /// Shared view of `(context_dir, tag)` per build.
    pub fn builds(&self) -> BuildLog {
        Rc::clone(&self.builds)
    }

    pub fn removed(&self) -> Rc<RefCell<Vec<String>>> {
        Rc::clone(&self.removed)
    }
}

impl Provisioner for ScriptedProvisioner {
    fn build_image(&self, context_dir: &Path, tag: &str) -> Result<()> {
        self.builds
            .borrow_mut()
            .push((context_dir.to_path_buf(), tag.to_string()));
        if let Some(log) = &self.fail_build {
            bail!("image build failed\n{log}");
        }
        Ok(())
    }

    fn start_container(&self, _image: &str) -> Result<String> {
        let mut started = self.started.borrow_mut();
        *started += 1;
        Ok(format!("scripted-{}", *started))
    }

    fn remove_container(&self, container_id: &str) -> Result<()> {
        self.removed.borrow_mut().push(container_id.to_string());
        Ok(())
    }

    fn session_host(&self, _container_id: &str) -> Box<dyn ShellHost> {
        Box::new(LocalHost::new(&self.container_root, &self.log_dir, "bash").isolated(true))
    }
}
