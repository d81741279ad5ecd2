//! The decision cycle: context, oracle, loop check, dispatch, record.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use tracing::{info, instrument, warn};

use crate::core::context_window::build;
use crate::core::repetition::{Repetition, RepetitionPattern, detect};
use crate::core::response::{ResponseParser, ToolSpec};
use crate::core::types::{Command, HistoryEntry, Message, OracleResponse};
use crate::io::config::RepetitionStrategy;
use crate::io::oracle::{DecisionOracle, OracleRequest};
use crate::io::prompt::{PromptContext, PromptEngine};
use crate::io::session::SessionLostError;
use crate::io::transcript::{CycleKind, CycleMeta, CyclePaths, CycleRecord, write_cycle};
use crate::terminal::Terminal;
use crate::tools::{REPETITION_TOOL, Toolbox, tool_specs};

const REPLAN_STUB_THOUGHTS: &str =
    "Failed to parse the re-planner response; issuing a repetition_detected stub.";
const SHORT_CIRCUIT_THOUGHTS: &str =
    "The proposed command repeats a loop; issuing a repetition_detected stub instead.";

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub max_cycles: u32,
    /// Consecutive unparseable replies tolerated before stopping.
    pub max_parse_retries: u32,
    pub strategy: RepetitionStrategy,
    pub budget_tokens: usize,
    /// Root of the cycle transcripts.
    pub log_dir: PathBuf,
}

/// What one cycle did.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Executed {
        cycle: u32,
        /// The command actually dispatched.
        command: Command,
        repetition: Option<RepetitionPattern>,
        /// The oracle's command was replaced because it closed a loop.
        substituted: bool,
        finished: bool,
    },
    ParseFailed {
        cycle: u32,
        reason: String,
    },
}

/// Why `run` stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStop {
    GoalsAccomplished,
    MaxCycles { max_cycles: u32 },
    OracleUnparseable { failures: u32 },
    SessionLost { detail: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub cycles_executed: u32,
    pub stop: RunStop,
}

pub struct ControlLoop<O: DecisionOracle> {
    oracle: O,
    parser: ResponseParser,
    prompts: PromptEngine,
    tools: Vec<ToolSpec>,
    toolbox: Toolbox,
    terminal: Terminal,
    settings: LoopSettings,
    project: String,
    goal: String,
    history: Vec<HistoryEntry>,
    /// System notes for the next prompt only.
    notes: Vec<String>,
    /// Parse failures waiting to be attached to the next history entry.
    rejected_replies: Vec<String>,
    cycle: u32,
    parse_failures: u32,
}

impl<O: DecisionOracle> ControlLoop<O> {
    pub fn new(
        oracle: O,
        toolbox: Toolbox,
        terminal: Terminal,
        project: &str,
        goal: &str,
        settings: LoopSettings,
    ) -> Result<Self> {
        let tools = tool_specs();
        Ok(Self {
            oracle,
            parser: ResponseParser::new(&tools)?,
            prompts: PromptEngine::new()?,
            tools,
            toolbox,
            terminal,
            settings,
            project: project.to_string(),
            goal: goal.to_string(),
            history: Vec::new(),
            notes: Vec::new(),
            rejected_replies: Vec::new(),
            cycle: 0,
            parse_failures: 0,
        })
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn terminal(&self) -> &Terminal {
        &self.terminal
    }

    pub fn toolbox(&self) -> &Toolbox {
        &self.toolbox
    }

    pub fn oracle(&self) -> &O {
        &self.oracle
    }

    /// Run cycles until the goal is reached, the cycle budget runs out, the
    /// oracle keeps replying garbage or the session is lost.
    ///
    /// Any other error stops the run immediately.
    pub fn run<F: FnMut(&CycleOutcome)>(&mut self, mut on_cycle: F) -> Result<RunOutcome> {
        let mut cycles_executed = 0u32;
        loop {
            if self.cycle >= self.settings.max_cycles {
                return Ok(RunOutcome {
                    cycles_executed,
                    stop: RunStop::MaxCycles {
                        max_cycles: self.settings.max_cycles,
                    },
                });
            }

            match self.run_cycle() {
                Ok(outcome) => {
                    on_cycle(&outcome);
                    match outcome {
                        CycleOutcome::Executed { finished, .. } => {
                            cycles_executed += 1;
                            if finished {
                                return Ok(RunOutcome {
                                    cycles_executed,
                                    stop: RunStop::GoalsAccomplished,
                                });
                            }
                        }
                        CycleOutcome::ParseFailed { .. } => {
                            if self.parse_failures >= self.settings.max_parse_retries {
                                return Ok(RunOutcome {
                                    cycles_executed,
                                    stop: RunStop::OracleUnparseable {
                                        failures: self.parse_failures,
                                    },
                                });
                            }
                        }
                    }
                }
                Err(err) => {
                    if let Some(lost) = err.downcast_ref::<SessionLostError>() {
                        return Ok(RunOutcome {
                            cycles_executed,
                            stop: RunStop::SessionLost {
                                detail: lost.detail.clone(),
                            },
                        });
                    }
                    return Err(err);
                }
            }
        }
    }

    /// One decision cycle.
    #[instrument(skip_all, fields(cycle = self.cycle + 1))]
    pub fn run_cycle(&mut self) -> Result<CycleOutcome> {
        let started = Instant::now();
        self.cycle += 1;
        let cycle = self.cycle;
        let paths = CyclePaths::new(&self.settings.log_dir, cycle);

        let window = build(&self.history, self.settings.budget_tokens);
        let messages = self.prompts.cycle_messages(
            &self.prompt_context(),
            &window,
            &self.notes,
            cycle,
        )?;
        let reply = self
            .oracle
            .query(&OracleRequest {
                messages: messages.clone(),
                transcript_path: Some(paths.response_path.clone()),
            })
            .context("query decision oracle")?;

        let response = match self.parser.parse(&reply) {
            Ok(response) => response,
            Err(failure) => {
                self.parse_failures += 1;
                warn!(failures = self.parse_failures, reason = %failure.reason, "unparseable oracle reply");
                self.notes = vec![format_reminder(&failure.reason)];
                self.rejected_replies
                    .push(format!("cycle {cycle}: {}", failure.reason));
                let meta = CycleMeta {
                    cycle,
                    kind: CycleKind::ParseFailed,
                    command: None,
                    repetition: None,
                    substituted: false,
                    finished: false,
                    parse_error: Some(failure.reason.clone()),
                    duration_ms: elapsed_ms(started),
                };
                self.record(&meta, &messages, None)?;
                return Ok(CycleOutcome::ParseFailed {
                    cycle,
                    reason: failure.reason,
                });
            }
        };
        self.parse_failures = 0;
        self.notes.clear();

        let repetition = detect(
            self.history.iter().map(|entry| &entry.command),
            &response.command,
        );
        let (decision, substituted) = match &repetition {
            Some(repetition) => {
                warn!(pattern = repetition.pattern.as_str(), "repetition detected");
                (self.break_loop(&response, repetition, &paths), true)
            }
            None => (response, false),
        };

        let outcome = self.toolbox.dispatch(&decision.command, &mut self.terminal)?;
        info!(
            tool = decision.command.name(),
            substituted,
            finished = outcome.finished,
            "cycle executed"
        );
        self.history.push(HistoryEntry {
            cycle,
            thoughts: decision.thoughts,
            command: decision.command.clone(),
            result: outcome.text.clone(),
            rejected_replies: std::mem::take(&mut self.rejected_replies),
        });

        let meta = CycleMeta {
            cycle,
            kind: CycleKind::Executed,
            command: Some(decision.command.clone()),
            repetition: repetition.as_ref().map(|r| r.pattern),
            substituted,
            finished: outcome.finished,
            parse_error: None,
            duration_ms: elapsed_ms(started),
        };
        self.record(&meta, &messages, Some(&outcome.text))?;

        Ok(CycleOutcome::Executed {
            cycle,
            command: decision.command,
            repetition: repetition.map(|r| r.pattern),
            substituted,
            finished: outcome.finished,
        })
    }

    /// Remove the container (unless kept) and stop the shell.
    pub fn shutdown(&mut self, keep_container: bool) -> Result<()> {
        self.toolbox.teardown(keep_container)
    }

    /// Replacement for a candidate that closes a loop. Never the candidate.
    fn break_loop(
        &self,
        candidate: &OracleResponse,
        repetition: &Repetition,
        paths: &CyclePaths,
    ) -> OracleResponse {
        match self.settings.strategy {
            RepetitionStrategy::ShortCircuit => stub(repetition, SHORT_CIRCUIT_THOUGHTS),
            RepetitionStrategy::Replan => match self.replan(repetition, paths) {
                Ok(Some(alternative))
                    if alternative.command.canonical() != candidate.command.canonical() =>
                {
                    info!(tool = alternative.command.name(), "re-plan produced an alternative");
                    alternative
                }
                Ok(_) => stub(repetition, REPLAN_STUB_THOUGHTS),
                Err(err) => {
                    warn!(err = %err, "re-plan query failed");
                    stub(repetition, REPLAN_STUB_THOUGHTS)
                }
            },
        }
    }

    /// Ask once for an alternative. `None` when the reply does not parse.
    fn replan(&self, repetition: &Repetition, paths: &CyclePaths) -> Result<Option<OracleResponse>> {
        let messages =
            self.prompts
                .replan_messages(&self.prompt_context(), &self.history, repetition)?;
        let reply = self.oracle.query(&OracleRequest {
            messages,
            transcript_path: Some(paths.replan_response_path.clone()),
        })?;
        match self.parser.parse(&reply) {
            Ok(response) => Ok(Some(response)),
            Err(failure) => {
                warn!(reason = %failure.reason, "unparseable re-plan reply");
                Ok(None)
            }
        }
    }

    fn prompt_context(&self) -> PromptContext<'_> {
        PromptContext {
            project: &self.project,
            goal: &self.goal,
            phase: self.terminal.phase(),
            tools: &self.tools,
            wait_bound_secs: self.terminal.session().settings().wait_bound.as_secs(),
        }
    }

    fn record(&self, meta: &CycleMeta, prompt: &[Message], result: Option<&str>) -> Result<()> {
        write_cycle(
            &self.settings.log_dir,
            &CycleRecord {
                meta,
                prompt,
                result,
            },
        )?;
        Ok(())
    }
}

fn stub(repetition: &Repetition, thoughts: &str) -> OracleResponse {
    let mut args = Map::new();
    args.insert(
        "repetition_window".to_string(),
        Value::String(repetition.window_text()),
    );
    OracleResponse {
        thoughts: thoughts.to_string(),
        command: Command::new(REPETITION_TOOL, args),
    }
}

fn format_reminder(reason: &str) -> String {
    format!(
        "Your previous reply could not be used ({reason}). Reply with exactly one JSON object of \
         the form {{\"thoughts\": \"...\", \"command\": {{\"name\": \"<tool name>\", \"args\": \
         {{...}}}}}} and nothing else."
    )
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::repetition::classify;

    #[test]
    fn stub_carries_window_text() {
        let window: Vec<String> = vec!["a".into(), "b".into(), "a".into(), "b".into(), "a".into(), "b".into()];
        let repetition = Repetition {
            pattern: classify(&window).expect("period-2"),
            window,
        };
        let response = stub(&repetition, REPLAN_STUB_THOUGHTS);
        assert_eq!(response.command.name(), REPETITION_TOOL);
        assert_eq!(
            response.command.arg_text("repetition_window").as_deref(),
            Some("a\nb\na\nb\na\nb")
        );
        assert_eq!(response.thoughts, REPLAN_STUB_THOUGHTS);
    }

    #[test]
    fn format_reminder_names_reason_and_shape() {
        let note = format_reminder("no JSON object found in the response");
        assert!(note.contains("(no JSON object found in the response)"));
        assert!(note.contains("{\"thoughts\": \"...\", \"command\": {\"name\": \"<tool name>\", \"args\": {...}}}"));
    }
}
