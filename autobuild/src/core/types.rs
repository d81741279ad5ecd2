//! Shared deterministic types for the agent core.
//!
//! These types define the contracts between the control loop, the repetition
//! detector, the context window builder and the session controller. They carry
//! no I/O and serialize deterministically.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Tool name whose `command` argument is a literal shell line.
pub const TERMINAL_TOOL: &str = "linux_terminal";

/// Structured command proposed by the decision oracle.
///
/// Immutable once built. Two commands are the same command iff their
/// [`Command::canonical`] serializations match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    name: String,
    #[serde(default)]
    args: Map<String, Value>,
}

impl Command {
    pub fn new(name: impl Into<String>, args: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// Build a `linux_terminal` command for a literal shell line.
    pub fn terminal(line: impl Into<String>) -> Self {
        let mut args = Map::new();
        args.insert("command".to_string(), Value::String(line.into()));
        Self::new(TERMINAL_TOOL, args)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &Map<String, Value> {
        &self.args
    }

    /// String argument lookup; non-string values are rendered as JSON.
    pub fn arg_text(&self, key: &str) -> Option<String> {
        self.args.get(key).map(|value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    /// Literal shell line, when this is a terminal command.
    pub fn raw_text(&self) -> Option<&str> {
        if self.name != TERMINAL_TOOL {
            return None;
        }
        self.args.get("command").and_then(Value::as_str)
    }

    /// Key-order-independent JSON encoding of `{"args": .., "name": ..}`.
    pub fn canonical(&self) -> String {
        let mut out = String::new();
        out.push_str("{\"args\":");
        write_canonical_map(&self.args, &mut out);
        out.push_str(",\"name\":");
        out.push_str(&Value::from(self.name.as_str()).to_string());
        out.push('}');
        out
    }
}

fn write_canonical_map(map: &Map<String, Value>, out: &mut String) {
    let mut entries: Vec<(&String, &Value)> = map.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    out.push('{');
    for (i, (key, value)) in entries.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&Value::from(key.as_str()).to_string());
        out.push(':');
        write_canonical(value, out);
    }
    out.push('}');
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => write_canonical_map(map, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// Parsed decision oracle reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleResponse {
    #[serde(default)]
    pub thoughts: String,
    pub command: Command,
}

/// Exit classification of an executed shell command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "code")]
pub enum ExitStatus {
    Success,
    Failure(i32),
    Unknown,
}

impl ExitStatus {
    pub fn from_code(code: Option<i32>) -> Self {
        match code {
            Some(0) => ExitStatus::Success,
            Some(code) => ExitStatus::Failure(code),
            None => ExitStatus::Unknown,
        }
    }
}

/// Terminal outcome of one shell command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub exit_status: ExitStatus,
    /// Sanitized, possibly summarized, output.
    pub stdout_text: String,
    /// Output exceeded the display cap and was summarized.
    pub truncated: bool,
    /// The result only arrived after the command had been reported stuck.
    pub duration_exceeded_bound: bool,
}

/// A command is still running after the wait bound elapsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StuckSignal {
    pub log_target: String,
    pub partial_output: String,
    pub waited: Duration,
}

/// What the session controller observed for a dispatched command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutcome {
    Finished(ExecutionResult),
    Stuck(StuckSignal),
}

/// Chat role of a prompt message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// One executed cycle: what was issued and what came back.
///
/// Appended by the control loop only; never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub cycle: u32,
    pub thoughts: String,
    pub command: Command,
    pub result: String,
    /// Unparseable replies received since the previous executed cycle, as
    /// `cycle N: <reason>`.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rejected_replies: Vec<String>,
}

impl HistoryEntry {
    /// Replays the replies that were refused before this command, if any.
    pub fn rejection_message(&self) -> Option<Message> {
        if self.rejected_replies.is_empty() {
            return None;
        }
        Some(Message::new(
            Role::User,
            format!(
                "Your earlier replies could not be parsed and were not executed:\n{}",
                self.rejected_replies.join("\n")
            ),
        ))
    }

    /// The oracle turn as it is replayed into later prompts.
    pub fn assistant_message(&self) -> Message {
        let body = serde_json::json!({
            "thoughts": self.thoughts,
            "command": {
                "name": self.command.name(),
                "args": self.command.args(),
            },
        });
        Message::new(Role::Assistant, body.to_string())
    }

    pub fn result_message(&self) -> Message {
        Message::new(
            Role::User,
            format!(
                "The result of executing that last command is:\n{}",
                self.result
            ),
        )
    }
}
