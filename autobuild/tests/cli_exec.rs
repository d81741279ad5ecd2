//! CLI tests for `autobuild init` and `autobuild exec`.
//!
//! Spawns the autobuild binary inside a scratch project.

use std::fs;
use std::process::Command;

use autobuild::exit_codes;
use autobuild::io::config::{AgentConfig, load_config};
use autobuild::test_support::TestProject;

#[test]
fn init_writes_default_config() {
    let project = TestProject::new().expect("project");
    let status = Command::new(env!("CARGO_BIN_EXE_autobuild"))
        .current_dir(project.root())
        .arg("init")
        .status()
        .expect("autobuild init");

    assert_eq!(status.code(), Some(exit_codes::OK));
    let cfg = load_config(&project.root().join("agent.toml")).expect("load");
    assert_eq!(cfg, AgentConfig::default());
    assert!(project.root().join(".autobuild").is_dir());
}

#[test]
fn init_keeps_existing_config_without_force() {
    let project = TestProject::new().expect("project");
    let path = project.root().join("agent.toml");
    fs::write(&path, "max_cycles = 7\n").expect("write");

    let status = Command::new(env!("CARGO_BIN_EXE_autobuild"))
        .current_dir(project.root())
        .arg("init")
        .status()
        .expect("autobuild init");

    assert_eq!(status.code(), Some(exit_codes::OK));
    assert_eq!(load_config(&path).expect("load").max_cycles, 7);
}

#[test]
fn exec_prints_terminal_output() {
    let project = TestProject::new().expect("project");
    let output = Command::new(env!("CARGO_BIN_EXE_autobuild"))
        .current_dir(project.root())
        .args(["exec", "cat", "README.md"])
        .output()
        .expect("autobuild exec");

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.starts_with("Output in terminal after executing the command:\n# demo"),
        "{stdout}"
    );
}

#[test]
fn exec_prints_policy_rejection() {
    let project = TestProject::new().expect("project");
    let output = Command::new(env!("CARGO_BIN_EXE_autobuild"))
        .current_dir(project.root())
        .args(["exec", "rm", "-rf", "src"])
        .output()
        .expect("autobuild exec");

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Removing files is not permitted"), "{stdout}");
    assert!(project.root().join("src/main.c").exists());
}

#[test]
fn run_rejects_invalid_config() {
    let project = TestProject::new().expect("project");
    fs::write(project.root().join("agent.toml"), "max_cycles = 0\n").expect("write");
    let status = Command::new(env!("CARGO_BIN_EXE_autobuild"))
        .current_dir(project.root())
        .args(["run", "--project", "."])
        .status()
        .expect("autobuild run");
    assert_eq!(status.code(), Some(exit_codes::INVALID));
}
