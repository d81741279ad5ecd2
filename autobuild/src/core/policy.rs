//! Pre-dispatch safety rules for terminal commands.
//!
//! Before an isolated environment exists the agent may only look around the
//! checkout with a handful of read-only tools. Once a container is attached
//! the rules relax to a short deny list.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

/// Commands allowed before an isolated environment exists.
pub const LOCAL_ALLOWLIST: &[&str] = &[
    "cat", "find", "grep", "head", "less", "ls", "more", "tail", "tree",
];

const INTERACTIVE_EDITORS: &[&str] = &["nano", "vi", "vim"];

const SETUP_SCRIPT: &str = "SETUP_AND_INSTALL.sh";

static METACHAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[|&;`$><\r\n]").unwrap());

/// Separators between the simple commands of one command line.
static STATEMENT_SPLIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\r\n;&|(){}]+").unwrap());

static INSTALL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(apt|apt-get)\s+install\b").unwrap());

const INSTALL_REMINDER: &str = "\nNOTE: It looks like you just installed a new package. If it \
provides an executable that should be the default, select it non-interactively with \
update-alternatives and verify the change, for example:\n\
  update-alternatives --set java /usr/lib/jvm/java-17-openjdk-amd64/bin/java && java -version\n\
  update-alternatives --install /usr/bin/python3 python3 /usr/bin/python3.9 1 && python3 --version\n\
Make sure the new version is active before proceeding.";

/// Where commands currently run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Host shell in the project checkout, before provisioning.
    Local,
    /// Shell inside the provisioned container.
    Isolated,
}

/// A command refused before dispatch. The message is shown to the oracle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyRejection {
    pub message: String,
}

impl PolicyRejection {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for PolicyRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for PolicyRejection {}

/// Strip harmless wrappers the oracle tends to add.
///
/// A leading `bash ` is only unwrapped inside the container; locally it stays
/// so [`check`] can refuse script execution.
pub fn preprocess(raw: &str, phase: Phase) -> String {
    let command = raw.trim().replace(" || exit 0", "");
    match (phase, command.strip_prefix("bash ")) {
        (Phase::Isolated, Some(rest)) => rest.trim_start().to_string(),
        _ => command,
    }
}

/// Programs that start the simple commands of `command`, in order.
fn leading_programs(command: &str) -> impl Iterator<Item = &str> {
    STATEMENT_SPLIT_RE
        .split(command)
        .filter_map(|statement| statement.split_whitespace().next())
}

pub fn check(command: &str, phase: Phase) -> Result<(), PolicyRejection> {
    for program in leading_programs(command) {
        check_program(program, phase)?;
    }
    if command == "ls -R" {
        return Err(PolicyRejection::new(
            "Error: ls -R is too verbose and is disallowed.",
        ));
    }
    if command.contains(SETUP_SCRIPT) {
        return Err(PolicyRejection::new(format!(
            "Running {SETUP_SCRIPT} is not allowed now. Execute each step manually in the \
             terminal until the project builds and its tests pass."
        )));
    }

    let first = command.split_whitespace().next().unwrap_or("");
    match phase {
        Phase::Local => check_local(command, first),
        Phase::Isolated => Ok(()),
    }
}

/// Rules that hold for every simple command in both phases.
fn check_program(first: &str, phase: Phase) -> Result<(), PolicyRejection> {
    if INTERACTIVE_EDITORS.contains(&first) {
        return Err(PolicyRejection::new(
            "Error: interactive editors are not allowed. Use write_to_file to change files.",
        ));
    }
    if first == "docker" {
        return Err(PolicyRejection::new(match phase {
            Phase::Local => {
                "Docker commands are not allowed directly. Write a Dockerfile with \
                 write_to_file instead; it builds the image, starts a container and \
                 gives you a shell inside it."
            }
            Phase::Isolated => "Docker commands are not allowed inside the container.",
        }));
    }
    if first == "sudo" {
        return Err(PolicyRejection::new(
            "'sudo' is not needed. You already have the required permissions; omit 'sudo'.",
        ));
    }
    Ok(())
}

fn check_local(command: &str, first: &str) -> Result<(), PolicyRejection> {
    if first == "bash" {
        return Err(PolicyRejection::new(
            "Running a bash script is disallowed at this stage. Write a Dockerfile first; \
             once the container is running you can issue commands one at a time.",
        ));
    }
    if first == "rm" {
        return Err(PolicyRejection::new(
            "Removing files is not permitted before a Dockerfile has been written.",
        ));
    }
    if METACHAR_RE.is_match(command) {
        return Err(PolicyRejection::new(
            "Piping, redirection, or chaining multiple commands is not allowed. Submit one \
             simple command at a time (e.g. 'ls', 'cat file.txt', 'grep pattern file').",
        ));
    }
    let words = split_words(command).ok_or_else(|| {
        PolicyRejection::new("Invalid shell syntax; check your quotes and try again.")
    })?;
    let Some(program) = words.first() else {
        return Err(PolicyRejection::new(
            "No command provided. Please enter a valid command.",
        ));
    };
    if !LOCAL_ALLOWLIST.contains(&program.as_str()) {
        return Err(PolicyRejection::new(format!(
            "'{program}' is not permitted. Allowed commands at this point are: {}. More \
             commands become available once a Dockerfile has been written and its container \
             is running.",
            LOCAL_ALLOWLIST.join(", ")
        )));
    }
    if program == "find" && words.iter().any(|w| w == "-exec" || w == "-ok") {
        return Err(PolicyRejection::new(
            "Using '-exec' or '-ok' with 'find' is disallowed. Stick to simple file searches.",
        ));
    }
    Ok(())
}

/// POSIX-style word splitting. `None` on unbalanced quotes or a trailing
/// escape.
pub fn split_words(line: &str) -> Option<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(ch) = chars.next() {
        match ch {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next()? {
                        '\'' => break,
                        c => current.push(c),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next()? {
                        '"' => break,
                        '\\' => {
                            let next = chars.next()?;
                            if !matches!(next, '"' | '\\' | '$' | '`') {
                                current.push('\\');
                            }
                            current.push(next);
                        }
                        c => current.push(c),
                    }
                }
            }
            '\\' => {
                in_word = true;
                current.push(chars.next()?);
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    Some(words)
}

/// Reminder appended after a package install inside the container.
pub fn install_reminder(command: &str) -> Option<&'static str> {
    INSTALL_RE.is_match(command).then_some(INSTALL_REMINDER)
}

/// Input accepted while a command is stuck.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    Wait,
    Terminate,
    Write(String),
}

impl RecoveryAction {
    pub fn parse(command: &str) -> Option<Self> {
        let trimmed = command.trim();
        match trimmed {
            "WAIT" => Some(RecoveryAction::Wait),
            "TERMINATE" => Some(RecoveryAction::Terminate),
            _ => trimmed
                .strip_prefix("WRITE:")
                .map(|text| RecoveryAction::Write(text.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected(command: &str, phase: Phase) -> String {
        check(command, phase).expect_err("rejected").message
    }

    #[test]
    fn preprocess_strips_exit_suffix() {
        assert_eq!(
            preprocess("make test || exit 0", Phase::Isolated),
            "make test"
        );
    }

    #[test]
    fn preprocess_unwraps_bash_only_in_container() {
        assert_eq!(preprocess("bash run.sh", Phase::Isolated), "run.sh");
        assert_eq!(preprocess("bash run.sh", Phase::Local), "bash run.sh");
    }

    #[test]
    fn local_allows_read_only_tools() {
        for command in ["ls -la", "cat README.md", "grep -rn 'fn main' src", "find . -name '*.rs'", "tree"] {
            assert_eq!(check(command, Phase::Local), Ok(()), "{command}");
        }
    }

    #[test]
    fn local_rejects_metacharacters() {
        for command in [
            "ls | wc -l",
            "cat a > b",
            "ls; pwd",
            "echo $HOME",
            "ls && pwd",
            "ls\nrm -rf src",
            "ls\ntouch pwned",
            "cat README.md\r\ntouch pwned",
        ] {
            assert!(rejected(command, Phase::Local).contains("Piping"), "{command}");
        }
    }

    #[test]
    fn local_rejects_unlisted_programs() {
        let message = rejected("python3 setup.py", Phase::Local);
        assert!(message.starts_with("'python3' is not permitted"));
        assert!(message.contains("cat, find, grep"));
    }

    #[test]
    fn local_rejects_find_exec() {
        assert!(rejected("find . -exec cat {} +", Phase::Local).contains("-exec"));
    }

    #[test]
    fn local_rejects_unbalanced_quotes() {
        assert!(rejected("grep 'oops README.md", Phase::Local).contains("quotes"));
    }

    #[test]
    fn local_rejects_scripts_and_rm() {
        assert!(rejected("bash build.sh", Phase::Local).contains("bash script"));
        assert!(rejected("rm -rf target", Phase::Local).contains("Removing files"));
    }

    #[test]
    fn always_rejected_in_both_phases() {
        for phase in [Phase::Local, Phase::Isolated] {
            assert!(rejected("docker ps", phase).contains("Docker"));
            assert!(rejected("sudo apt-get update", phase).contains("sudo"));
            assert!(rejected("nano main.c", phase).contains("interactive"));
            assert!(rejected("ls -R", phase).contains("too verbose"));
            assert!(rejected("./SETUP_AND_INSTALL.sh", phase).contains("SETUP_AND_INSTALL.sh"));
        }
    }

    #[test]
    fn deny_rules_apply_to_every_statement() {
        for phase in [Phase::Local, Phase::Isolated] {
            assert!(rejected("true\ndocker ps", phase).contains("Docker"));
            assert!(rejected("make && sudo make install", phase).contains("sudo"));
            assert!(rejected("cd src; vim main.c", phase).contains("interactive"));
            assert!(rejected("ls\r\nsudo ls", phase).contains("sudo"));
        }
    }

    #[test]
    fn container_allows_general_commands() {
        assert_eq!(check("make -j4 && make test | tail", Phase::Isolated), Ok(()));
        assert_eq!(check("rm -rf build", Phase::Isolated), Ok(()));
        assert_eq!(check("cd build\nmake test", Phase::Isolated), Ok(()));
    }

    #[test]
    fn split_words_handles_quotes_and_escapes() {
        assert_eq!(
            split_words(r#"grep "a b" 'c d' e\ f"#),
            Some(vec!["grep".into(), "a b".into(), "c d".into(), "e f".into()])
        );
        assert_eq!(split_words("  "), Some(Vec::new()));
        assert_eq!(split_words("\"open"), None);
        assert_eq!(split_words("trailing\\"), None);
    }

    #[test]
    fn install_reminder_matches_apt_installs() {
        assert!(install_reminder("apt-get install -y cmake").is_some());
        assert!(install_reminder("apt install openjdk-17-jdk").is_some());
        assert!(install_reminder("apt-get update").is_none());
        assert!(install_reminder("pip install numpy").is_none());
    }

    #[test]
    fn recovery_actions_parse() {
        assert_eq!(RecoveryAction::parse("WAIT"), Some(RecoveryAction::Wait));
        assert_eq!(RecoveryAction::parse(" TERMINATE "), Some(RecoveryAction::Terminate));
        assert_eq!(
            RecoveryAction::parse("WRITE:yes"),
            Some(RecoveryAction::Write("yes".to_string()))
        );
        assert_eq!(RecoveryAction::parse("wait"), None);
        assert_eq!(RecoveryAction::parse("ls"), None);
    }
}
