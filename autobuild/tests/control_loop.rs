//! End-to-end control loop tests with a scripted oracle.
//!
//! The oracle replays canned replies; commands run in real `bash` sessions
//! and the provisioner hands out an isolated local shell as the container.

use std::fs;
use std::time::Duration;

use serde_json::json;

use autobuild::control::{ControlLoop, LoopSettings, RunStop};
use autobuild::core::policy::Phase;
use autobuild::core::repetition::RepetitionPattern;
use autobuild::io::config::RepetitionStrategy;
use autobuild::io::file_log::FileOpLog;
use autobuild::io::host::LocalHost;
use autobuild::io::session::SessionController;
use autobuild::terminal::{OUTPUT_PREFIX, Terminal};
use autobuild::test_support::{
    ScriptedOracle, ScriptedProvisioner, TestProject, fast_settings, local_terminal, reply,
};
use autobuild::tools::Toolbox;

fn settings(project: &TestProject, strategy: RepetitionStrategy) -> LoopSettings {
    LoopSettings {
        max_cycles: 20,
        max_parse_retries: 3,
        strategy,
        budget_tokens: 50_000,
        log_dir: project.log_dir().to_path_buf(),
    }
}

fn control_loop(
    project: &TestProject,
    oracle: ScriptedOracle,
    terminal: Terminal,
    settings: LoopSettings,
) -> ControlLoop<ScriptedOracle> {
    let toolbox = Toolbox::new(
        "demo",
        project.root(),
        "autobuild",
        FileOpLog::new(project.log_dir().join("file_ops.log")),
        Box::new(ScriptedProvisioner::new(project)),
    );
    ControlLoop::new(oracle, toolbox, terminal, "demo", "build and test", settings)
        .expect("control loop")
}

fn list_dir() -> String {
    reply("look around", "list_dir", json!({}))
}

fn finish() -> String {
    reply("done", "goals_accomplished", json!({"reason": "tests ran"}))
}

/// Verifies five `list_dir` calls plus a sixth are detected as period-1 and
/// the re-planned alternative is dispatched instead.
#[test]
fn period1_loop_is_replanned() {
    let project = TestProject::new().expect("project");
    let mut replies: Vec<String> = (0..6).map(|_| list_dir()).collect();
    replies.push(reply("try the shell", "linux_terminal", json!({"command": "ls"})));
    replies.push(finish());
    let oracle = ScriptedOracle::new(replies);

    let mut control = control_loop(
        &project,
        oracle,
        local_terminal(&project),
        settings(&project, RepetitionStrategy::Replan),
    );
    let mut patterns = Vec::new();
    let outcome = control
        .run(|cycle| {
            if let autobuild::control::CycleOutcome::Executed { repetition, .. } = cycle {
                patterns.push(*repetition);
            }
        })
        .expect("run");

    assert_eq!(outcome.stop, RunStop::GoalsAccomplished);
    assert_eq!(outcome.cycles_executed, 7);
    assert_eq!(patterns[5], Some(RepetitionPattern::Period1));
    assert!(patterns[..5].iter().all(Option::is_none));

    let history = control.history();
    assert_eq!(history[5].command.raw_text(), Some("ls"));
    assert!(history[5].result.starts_with(OUTPUT_PREFIX));
    assert!(history[5].result.contains("README.md"));
    assert!(history[0].result.starts_with("Unknown command 'list_dir'"));

    let requests = control.oracle().requests();
    assert_eq!(requests.len(), 8);
    assert!(requests[6].messages[0].content.contains("period-1"));
    assert_eq!(control.oracle().remaining(), 0);
}

/// Verifies a re-plan that repeats the candidate falls back to the stub.
#[test]
fn replan_repeating_candidate_uses_stub() {
    let project = TestProject::new().expect("project");
    let mut replies: Vec<String> = (0..7).map(|_| list_dir()).collect();
    replies.push(finish());

    let mut control = control_loop(
        &project,
        ScriptedOracle::new(replies),
        local_terminal(&project),
        settings(&project, RepetitionStrategy::Replan),
    );
    let outcome = control.run(|_| {}).expect("run");

    assert_eq!(outcome.stop, RunStop::GoalsAccomplished);
    let entry = &control.history()[5];
    assert_eq!(entry.command.name(), "repetition_detected");
    assert!(entry.result.starts_with("Repetition detected"));
    assert!(entry.result.contains("\"name\":\"list_dir\""));
    assert!(entry.thoughts.contains("re-planner"));
}

/// Verifies an unparseable re-plan reply also falls back to the stub.
#[test]
fn unparseable_replan_uses_stub() {
    let project = TestProject::new().expect("project");
    let mut replies: Vec<String> = (0..6).map(|_| list_dir()).collect();
    replies.push("I am not sure what to do.".to_string());
    replies.push(finish());

    let mut control = control_loop(
        &project,
        ScriptedOracle::new(replies),
        local_terminal(&project),
        settings(&project, RepetitionStrategy::Replan),
    );
    control.run(|_| {}).expect("run");
    assert_eq!(control.history()[5].command.name(), "repetition_detected");
}

/// Verifies short-circuiting substitutes the stub without a re-query.
#[test]
fn short_circuit_skips_replan_query() {
    let project = TestProject::new().expect("project");
    let mut replies: Vec<String> = (0..6).map(|_| list_dir()).collect();
    replies.push(finish());

    let mut control = control_loop(
        &project,
        ScriptedOracle::new(replies),
        local_terminal(&project),
        settings(&project, RepetitionStrategy::ShortCircuit),
    );
    let outcome = control.run(|_| {}).expect("run");

    assert_eq!(outcome.stop, RunStop::GoalsAccomplished);
    assert_eq!(control.oracle().requests().len(), 7);
    let entry = &control.history()[5];
    assert_eq!(entry.command.name(), "repetition_detected");
    assert_eq!(
        entry.command.arg_text("repetition_window").map(|w| w.lines().count()),
        Some(6)
    );

    let meta: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(project.log_dir().join("cycles/6/meta.json")).expect("meta"),
    )
    .expect("json");
    assert_eq!(meta["substituted"], true);
    assert_eq!(meta["repetition"], "period1");
}

/// Verifies repeated unparseable replies stop the run and carry a format
/// reminder into the next prompt.
#[test]
fn unparseable_replies_stop_the_run() {
    let project = TestProject::new().expect("project");
    let oracle = ScriptedOracle::new(["hello", "{\"thoughts\": \"x\"}", "still prose"]);

    let mut control = control_loop(
        &project,
        oracle,
        local_terminal(&project),
        settings(&project, RepetitionStrategy::Replan),
    );
    let outcome = control.run(|_| {}).expect("run");

    assert_eq!(outcome.stop, RunStop::OracleUnparseable { failures: 3 });
    assert_eq!(outcome.cycles_executed, 0);
    assert!(control.history().is_empty());

    let requests = control.oracle().requests();
    let second = &requests[1].messages;
    assert!(
        second
            .iter()
            .any(|m| m.content.starts_with("Your previous reply could not be used"))
    );
    assert!(
        !requests[0]
            .messages
            .iter()
            .any(|m| m.content.starts_with("Your previous reply could not be used"))
    );
}

/// Verifies a refused reply stays in the history trace after the oracle
/// recovers.
#[test]
fn parse_failure_is_kept_in_history() {
    let project = TestProject::new().expect("project");
    let oracle = ScriptedOracle::new([
        "Let me look at the files first.".to_string(),
        reply("a", "linux_terminal", json!({"command": "ls"})),
        finish(),
    ]);
    let mut control = control_loop(
        &project,
        oracle,
        local_terminal(&project),
        settings(&project, RepetitionStrategy::Replan),
    );
    let outcome = control.run(|_| {}).expect("run");

    assert_eq!(outcome.stop, RunStop::GoalsAccomplished);
    let history = control.history();
    assert_eq!(history[0].cycle, 2);
    assert_eq!(history[0].rejected_replies.len(), 1);
    assert!(history[0].rejected_replies[0].starts_with("cycle 1: "));
    assert!(history[1].rejected_replies.is_empty());

    let requests = control.oracle().requests();
    let replayed = |index: usize| {
        requests[index]
            .messages
            .iter()
            .any(|m| m.content.starts_with("Your earlier replies could not be parsed"))
    };
    assert!(!replayed(1));
    assert!(replayed(2));
}

/// Verifies the cycle budget stops the run.
#[test]
fn max_cycles_stops_the_run() {
    let project = TestProject::new().expect("project");
    let oracle = ScriptedOracle::new([
        reply("a", "linux_terminal", json!({"command": "ls"})),
        reply("b", "linux_terminal", json!({"command": "cat README.md"})),
    ]);
    let mut settings = settings(&project, RepetitionStrategy::Replan);
    settings.max_cycles = 2;

    let mut control = control_loop(&project, oracle, local_terminal(&project), settings);
    let outcome = control.run(|_| {}).expect("run");

    assert_eq!(outcome.stop, RunStop::MaxCycles { max_cycles: 2 });
    assert_eq!(outcome.cycles_executed, 2);
    assert!(control.history()[1].result.contains("make test"));
    assert!(project.log_dir().join("cycles/2/result.txt").exists());
    assert!(project.log_dir().join("cycles/2/response.txt").exists());
}

/// Verifies the local policy rejects pipes and the rejection is recorded.
#[test]
fn policy_rejection_becomes_history() {
    let project = TestProject::new().expect("project");
    let oracle = ScriptedOracle::new([
        reply("a", "linux_terminal", json!({"command": "cat README.md | grep make"})),
        finish(),
    ]);
    let mut control = control_loop(
        &project,
        oracle,
        local_terminal(&project),
        settings(&project, RepetitionStrategy::Replan),
    );
    control.run(|_| {}).expect("run");
    assert!(control.history()[0].result.starts_with("Piping, redirection"));
}

/// Verifies writing a Dockerfile moves the shell into the container.
#[test]
fn dockerfile_moves_session_into_container() {
    let project = TestProject::new().expect("project");
    let oracle = ScriptedOracle::new([
        reply(
            "provision",
            "write_to_file",
            json!({"filename": "Dockerfile", "text": "FROM ubuntu:22.04\nRUN apt-get update\n"}),
        ),
        reply("where", "linux_terminal", json!({"command": "echo built > marker.txt && pwd"})),
        finish(),
    ]);
    let mut control = control_loop(
        &project,
        oracle,
        local_terminal(&project),
        settings(&project, RepetitionStrategy::Replan),
    );
    let outcome = control.run(|_| {}).expect("run");

    assert_eq!(outcome.stop, RunStop::GoalsAccomplished);
    assert_eq!(control.terminal().phase(), Phase::Isolated);
    assert!(
        control.history()[0]
            .result
            .starts_with("Image built and container started. Working directory: ")
    );
    assert!(project.container_root().join("marker.txt").exists());
    assert!(
        fs::read_to_string(project.log_dir().join("file_ops.log"))
            .expect("file log")
            .starts_with("write: Dockerfile #")
    );
}

/// Verifies a shell that cannot be started ends the run as session-lost.
#[test]
fn unstartable_shell_stops_with_session_lost() {
    let project = TestProject::new().expect("project");
    let host = LocalHost::new(
        project.root(),
        &project.log_dir().join("session"),
        "/nonexistent/autobuild-shell",
    );
    let terminal = Terminal::new(SessionController::new(
        Box::new(host),
        fast_settings(Duration::from_secs(1)),
    ));
    let oracle = ScriptedOracle::new([
        reply("a", "linux_terminal", json!({"command": "ls"})),
        finish(),
    ]);

    let mut control = control_loop(
        &project,
        oracle,
        terminal,
        settings(&project, RepetitionStrategy::Replan),
    );
    let outcome = control.run(|_| {}).expect("run");

    assert!(matches!(outcome.stop, RunStop::SessionLost { .. }));
    assert_eq!(outcome.cycles_executed, 0);
    assert_eq!(control.oracle().remaining(), 1);
}
