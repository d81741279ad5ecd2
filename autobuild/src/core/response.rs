//! Structured response extraction from free-form oracle text.
//!
//! The oracle is asked for a single JSON object `{thoughts, command}` but may
//! wrap it in prose or code fences. Extraction tries the whole reply, then
//! fenced blocks, then the first balanced object that parses.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::LazyLock;

use anyhow::{Result, anyhow};
use jsonschema::{Draft, Validator};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::core::types::OracleResponse;

const RESPONSE_SCHEMA: &str = include_str!("../../schemas/oracle_response.schema.json");

static FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[A-Za-z0-9_-]*[ \t]*\n?(.*?)```").unwrap());

/// One argument of a tool offered to the oracle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolArg {
    pub name: String,
    pub description: String,
}

/// One tool offered to the oracle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub args: Vec<ToolArg>,
}

impl ToolSpec {
    pub fn new(name: &str, description: &str, args: &[(&str, &str)]) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            args: args
                .iter()
                .map(|(name, description)| ToolArg {
                    name: name.to_string(),
                    description: description.to_string(),
                })
                .collect(),
        }
    }
}

/// Reply text that could not be turned into a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseFailure {
    pub reason: String,
}

impl ParseFailure {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ParseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unparseable oracle response: {}", self.reason)
    }
}

impl std::error::Error for ParseFailure {}

/// Envelope schema plus the argument sets of known tools.
pub struct ResponseParser {
    validator: Validator,
    tools: BTreeMap<String, BTreeSet<String>>,
}

impl ResponseParser {
    pub fn new(tools: &[ToolSpec]) -> Result<Self> {
        let schema: Value = serde_json::from_str(RESPONSE_SCHEMA)
            .map_err(|err| anyhow!("parse response schema: {err}"))?;
        let validator = jsonschema::options()
            .with_draft(Draft::Draft202012)
            .build(&schema)
            .map_err(|err| anyhow!("compile response schema: {err}"))?;
        let tools = tools
            .iter()
            .map(|tool| {
                let args = tool.args.iter().map(|arg| arg.name.clone()).collect();
                (tool.name.clone(), args)
            })
            .collect();
        Ok(Self { validator, tools })
    }

    /// Parse a reply into a response.
    ///
    /// Known tools must carry exactly their declared arguments. Unknown tool
    /// names pass; dispatch answers them.
    pub fn parse(&self, text: &str) -> Result<OracleResponse, ParseFailure> {
        let value = extract_json_object(text)
            .ok_or_else(|| ParseFailure::new("no JSON object found in the response"))?;

        let messages: Vec<String> = self
            .validator
            .iter_errors(&value)
            .map(|err| err.to_string())
            .collect();
        if !messages.is_empty() {
            return Err(ParseFailure::new(format!(
                "response does not match the expected format: {}",
                messages.join("; ")
            )));
        }

        let response: OracleResponse = serde_json::from_value(value)
            .map_err(|err| ParseFailure::new(format!("malformed response: {err}")))?;

        let command = &response.command;
        if let Some(expected) = self.tools.get(command.name()) {
            let given: BTreeSet<String> = command.args().keys().cloned().collect();
            if &given != expected {
                let expected: Vec<&str> = expected.iter().map(String::as_str).collect();
                let given: Vec<&str> = given.iter().map(String::as_str).collect();
                return Err(ParseFailure::new(format!(
                    "tool '{}' takes arguments [{}] but got [{}]",
                    command.name(),
                    expected.join(", "),
                    given.join(", ")
                )));
            }
        }
        Ok(response)
    }
}

/// Locate the first JSON object in `text`.
pub fn extract_json_object(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Some(value) = parse_object(trimmed) {
        return Some(value);
    }
    for captures in FENCE_RE.captures_iter(trimmed) {
        if let Some(value) = captures.get(1).and_then(|m| parse_object(m.as_str().trim())) {
            return Some(value);
        }
    }
    trimmed
        .match_indices('{')
        .filter_map(|(start, _)| balanced_object(&trimmed[start..]))
        .find_map(parse_object)
}

fn parse_object(candidate: &str) -> Option<Value> {
    serde_json::from_str::<Value>(candidate)
        .ok()
        .filter(Value::is_object)
}

/// Prefix of `text` (which starts with `{`) up to its matching `}`.
fn balanced_object(text: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (idx, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(&text[..=idx]);
                }
            }
            _ => {}
        }
    }
    None
}
