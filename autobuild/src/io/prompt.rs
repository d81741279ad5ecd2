//! Prompt rendering for decision cycles and loop re-planning.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use tracing::debug;

use crate::core::context_window::ContextWindow;
use crate::core::policy::{LOCAL_ALLOWLIST, Phase};
use crate::core::repetition::Repetition;
use crate::core::response::ToolSpec;
use crate::core::types::{HistoryEntry, Message, Role};

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");
const CYCLE_TEMPLATE: &str = include_str!("prompts/cycle.md");
const REPLAN_SYSTEM_TEMPLATE: &str = include_str!("prompts/replan_system.md");
const REPLAN_TEMPLATE: &str = include_str!("prompts/replan.md");

/// Run-wide facts every prompt carries.
#[derive(Debug, Clone)]
pub struct PromptContext<'a> {
    pub project: &'a str,
    pub goal: &'a str,
    pub phase: Phase,
    pub tools: &'a [ToolSpec],
    pub wait_bound_secs: u64,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("system", SYSTEM_TEMPLATE)
            .context("system template")?;
        env.add_template("cycle", CYCLE_TEMPLATE)
            .context("cycle template")?;
        env.add_template("replan_system", REPLAN_SYSTEM_TEMPLATE)
            .context("replan system template")?;
        env.add_template("replan", REPLAN_TEMPLATE)
            .context("replan template")?;
        Ok(Self { env })
    }

    /// Messages for one decision cycle.
    ///
    /// Layout: system prompt, a trim note when older cycles were dropped, the
    /// windowed history as assistant/result pairs, pending notes as system
    /// messages, then the instruction for this cycle.
    pub fn cycle_messages(
        &self,
        ctx: &PromptContext<'_>,
        window: &ContextWindow<'_, HistoryEntry>,
        notes: &[String],
        cycle: u32,
    ) -> Result<Vec<Message>> {
        let mut messages = vec![Message::new(Role::System, self.render_system(ctx)?)];

        if window.trimmed > 0 {
            messages.push(Message::new(
                Role::System,
                format!(
                    "[{} earlier cycle(s) omitted to fit the context budget]",
                    window.trimmed
                ),
            ));
        }
        for entry in &window.entries {
            messages.extend(entry.rejection_message());
            messages.push(entry.assistant_message());
            messages.push(entry.result_message());
        }
        if window.over_budget {
            messages.push(Message::new(
                Role::System,
                "[the most recent exchange alone exceeds the context budget]",
            ));
        }
        for note in notes {
            messages.push(Message::new(Role::System, note.clone()));
        }

        let instruction = self
            .env
            .get_template("cycle")?
            .render(context! { cycle => cycle })?;
        messages.push(Message::new(Role::User, instruction.trim()));

        debug!(
            messages = messages.len(),
            trimmed = window.trimmed,
            over_budget = window.over_budget,
            "rendered cycle prompt"
        );
        Ok(messages)
    }

    /// Messages asking for one alternative to a looping command.
    pub fn replan_messages(
        &self,
        ctx: &PromptContext<'_>,
        history: &[HistoryEntry],
        repetition: &Repetition,
    ) -> Result<Vec<Message>> {
        let system = self.env.get_template("replan_system")?.render(context! {
            project => ctx.project,
            pattern => repetition.pattern.as_str(),
            tools => ctx.tools,
        })?;
        let history_lines: Vec<String> = history
            .iter()
            .map(|entry| entry.command.canonical())
            .collect();
        let last_result = history.last().map(|entry| entry.result.trim());
        let user = self.env.get_template("replan")?.render(context! {
            goal => ctx.goal.trim(),
            history => history_lines,
            window => repetition.window_text(),
            last_result => last_result.filter(|r| !r.is_empty()),
        })?;
        Ok(vec![
            Message::new(Role::System, system.trim()),
            Message::new(Role::User, user.trim()),
        ])
    }

    fn render_system(&self, ctx: &PromptContext<'_>) -> Result<String> {
        let rendered = self.env.get_template("system")?.render(context! {
            project => ctx.project,
            goal => ctx.goal.trim(),
            phase => ctx.phase,
            allowlist => LOCAL_ALLOWLIST.join(", "),
            tools => ctx.tools,
            wait_bound_secs => ctx.wait_bound_secs,
        })?;
        Ok(rendered.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context_window::{TokenCost, build};
    use crate::core::repetition::detect;
    use crate::core::types::Command;

    fn tools() -> Vec<ToolSpec> {
        vec![
            ToolSpec::new("linux_terminal", "Run one shell command.", &[("command", "the command line")]),
            ToolSpec::new("goals_accomplished", "Finish the run.", &[("reason", "why")]),
        ]
    }

    fn entry(cycle: u32, line: &str) -> HistoryEntry {
        HistoryEntry {
            cycle,
            thoughts: format!("step {cycle}"),
            command: Command::terminal(line),
            result: format!("result of {line}"),
            rejected_replies: Vec::new(),
        }
    }

    /// Verifies the local-phase system prompt lists tools and the allowlist.
    #[test]
    fn system_prompt_describes_phase_and_tools() {
        let tools = tools();
        let ctx = PromptContext {
            project: "demo",
            goal: "build and test",
            phase: Phase::Local,
            tools: &tools,
            wait_bound_secs: 300,
        };
        let engine = PromptEngine::new().expect("engine");
        let history: Vec<HistoryEntry> = Vec::new();
        let messages = engine
            .cycle_messages(&ctx, &build(&history, usize::MAX), &[], 1)
            .expect("render");

        assert_eq!(messages.len(), 2);
        let system = &messages[0].content;
        assert!(system.contains("<goal>\nbuild and test\n</goal>"));
        assert!(system.contains("cat, find, grep"));
        assert!(system.contains("`linux_terminal`: Run one shell command. Arguments: `command` (the command line)."));
        assert!(system.contains("300 seconds"));
        assert!(messages[1].content.starts_with("Start by exploring"));
    }

    /// Verifies history pairs, trim note and pending notes appear in order.
    #[test]
    fn cycle_messages_replay_window_in_order() {
        let tools = tools();
        let ctx = PromptContext {
            project: "demo",
            goal: "g",
            phase: Phase::Isolated,
            tools: &tools,
            wait_bound_secs: 5,
        };
        let history = vec![entry(1, "ls"), entry(2, "cat README.md"), entry(3, "make")];
        let budget = history[1].token_cost() + history[2].token_cost();
        let window = build(&history, budget);
        assert_eq!(window.trimmed, 1);

        let engine = PromptEngine::new().expect("engine");
        let notes = vec!["Your last reply was not valid JSON.".to_string()];
        let messages = engine
            .cycle_messages(&ctx, &window, &notes, 4)
            .expect("render");

        assert!(messages[0].content.contains("persistent shell inside the project container"));
        assert!(messages[1].content.contains("omitted to fit the context budget"));
        let last_pair = &messages[messages.len() - 4..messages.len() - 2];
        assert_eq!(last_pair[0].role, Role::Assistant);
        assert!(last_pair[0].content.contains("make"));
        assert!(last_pair[1].content.ends_with("result of make"));
        assert_eq!(messages[messages.len() - 2].content, notes[0]);
        assert!(messages.last().expect("instruction").content.starts_with("Cycle 4."));
    }

    /// Verifies the re-plan prompt carries the loop window and history.
    #[test]
    fn replan_messages_include_window() {
        let tools = tools();
        let ctx = PromptContext {
            project: "demo",
            goal: "g",
            phase: Phase::Isolated,
            tools: &tools,
            wait_bound_secs: 5,
        };
        let history: Vec<HistoryEntry> = (1..=5).map(|i| entry(i, "ls")).collect();
        let commands: Vec<Command> = history.iter().map(|e| e.command.clone()).collect();
        let repetition = detect(&commands, &Command::terminal("ls")).expect("loop");

        let engine = PromptEngine::new().expect("engine");
        let messages = engine
            .replan_messages(&ctx, &history, &repetition)
            .expect("render");
        assert_eq!(messages.len(), 2);
        assert!(messages[0].content.contains("period-1"));
        assert!(messages[0].content.contains("`linux_terminal`(command)"));
        assert!(messages[1].content.contains("### Loop window"));
        assert!(messages[1].content.contains("5. {\"args\":{\"command\":\"ls\"},\"name\":\"linux_terminal\"}"));
        assert!(messages[1].content.contains("result of ls"));
    }
}
