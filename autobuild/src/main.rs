//! Autonomous build agent.
//!
//! Drives a decision oracle through a persistent shell until the target
//! project builds and its tests run. Configuration lives in `agent.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use autobuild::control::{ControlLoop, CycleOutcome, LoopSettings, RunStop};
use autobuild::exit_codes;
use autobuild::io::config::{AgentConfig, load_config, write_config};
use autobuild::io::file_log::FileOpLog;
use autobuild::io::host::LocalHost;
use autobuild::io::oracle::CommandOracle;
use autobuild::io::provisioner::RuntimeProvisioner;
use autobuild::io::session::SessionController;
use autobuild::logging;
use autobuild::terminal::Terminal;
use autobuild::tools::Toolbox;

const DEFAULT_GOAL: &str = "Install the project's dependencies, build it from source and run \
its test suite. Finish once the tests have run, even if some of them fail.";

#[derive(Parser)]
#[command(
    name = "autobuild",
    version,
    about = "Autonomous setup-and-test agent for code checkouts"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default `agent.toml` and create the log directory.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Run the agent against a project checkout.
    Run {
        /// Project checkout to set up.
        #[arg(long)]
        project: PathBuf,
        #[arg(long, default_value = "agent.toml")]
        config: PathBuf,
        /// Goal text; defaults to building the project and running its tests.
        #[arg(long)]
        goal: Option<String>,
    },
    /// Run one command through the terminal surface and print what the
    /// oracle would see.
    Exec {
        #[arg(long, default_value = ".")]
        project: PathBuf,
        #[arg(long, default_value = "agent.toml")]
        config: PathBuf,
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => cmd_init(force),
        Command::Run {
            project,
            config,
            goal,
        } => cmd_run(&project, &config, goal.as_deref()),
        Command::Exec {
            project,
            config,
            command,
        } => cmd_exec(&project, &config, &command.join(" ")),
    }
}

fn cmd_init(force: bool) -> Result<i32> {
    let config_path = Path::new("agent.toml");
    let cfg = if force || !config_path.exists() {
        let cfg = AgentConfig::default();
        write_config(config_path, &cfg)?;
        cfg
    } else {
        load_config(config_path)?
    };
    fs::create_dir_all(&cfg.log_dir).with_context(|| format!("create {}", cfg.log_dir))?;
    Ok(exit_codes::OK)
}

fn cmd_run(project: &Path, config_path: &Path, goal: Option<&str>) -> Result<i32> {
    let cfg = load_config(config_path)?;
    let project_dir = project_dir(project)?;
    let project_name = project_dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "project".to_string());
    let log_dir = PathBuf::from(&cfg.log_dir);
    fs::create_dir_all(&log_dir).with_context(|| format!("create {}", log_dir.display()))?;

    let terminal = local_terminal(&cfg, &project_dir, &log_dir);
    let provisioner = RuntimeProvisioner::new(
        &cfg.container.runtime,
        Duration::from_secs(cfg.container.build_timeout_secs),
        &cfg.container.log_dir,
    );
    let toolbox = Toolbox::new(
        &project_name,
        &project_dir,
        &cfg.container.image_prefix,
        FileOpLog::new(log_dir.join("file_ops.log")),
        Box::new(provisioner),
    );
    let oracle = CommandOracle::new(
        cfg.oracle.command.clone(),
        &project_dir,
        Duration::from_secs(cfg.oracle.timeout_secs),
        cfg.oracle.output_limit_bytes,
    )?;

    let mut control = ControlLoop::new(
        oracle,
        toolbox,
        terminal,
        &project_name,
        goal.unwrap_or(DEFAULT_GOAL),
        LoopSettings {
            max_cycles: cfg.max_cycles,
            max_parse_retries: cfg.oracle.max_parse_retries,
            strategy: cfg.repetition.strategy,
            budget_tokens: cfg.context.budget_tokens,
            log_dir: log_dir.clone(),
        },
    )?;

    let result = control.run(print_cycle);
    if let Err(err) = control.shutdown(cfg.container.keep) {
        eprintln!("warning: container cleanup failed: {err:#}");
    }
    let outcome = result?;

    println!(
        "{} cycle(s) executed; transcripts in {}",
        outcome.cycles_executed,
        log_dir.join("cycles").display()
    );
    let code = match outcome.stop {
        RunStop::GoalsAccomplished => {
            println!("goals accomplished");
            exit_codes::OK
        }
        RunStop::MaxCycles { max_cycles } => {
            println!("stopped: cycle budget of {max_cycles} exhausted");
            exit_codes::CYCLES_EXHAUSTED
        }
        RunStop::OracleUnparseable { failures } => {
            println!("stopped: {failures} consecutive unparseable oracle replies");
            exit_codes::ORACLE_UNPARSEABLE
        }
        RunStop::SessionLost { detail } => {
            println!("stopped: shell session lost ({detail})");
            exit_codes::SESSION_LOST
        }
    };
    Ok(code)
}

fn cmd_exec(project: &Path, config_path: &Path, command: &str) -> Result<i32> {
    let cfg = load_config(config_path)?;
    let project_dir = project_dir(project)?;
    let log_dir = PathBuf::from(&cfg.log_dir);
    let mut terminal = local_terminal(&cfg, &project_dir, &log_dir);
    println!("{}", terminal.run_command(command)?);
    Ok(exit_codes::OK)
}

fn project_dir(project: &Path) -> Result<PathBuf> {
    let dir = project
        .canonicalize()
        .with_context(|| format!("resolve project {}", project.display()))?;
    if !dir.is_dir() {
        bail!("project {} is not a directory", dir.display());
    }
    Ok(dir)
}

fn local_terminal(cfg: &AgentConfig, project_dir: &Path, log_dir: &Path) -> Terminal {
    let host = LocalHost::new(project_dir, &log_dir.join("session"), &cfg.session.shell)
        .isolated(cfg.session.local_isolated);
    Terminal::new(SessionController::new(
        Box::new(host),
        cfg.session_settings(),
    ))
}

fn print_cycle(outcome: &CycleOutcome) {
    match outcome {
        CycleOutcome::Executed {
            cycle,
            command,
            repetition,
            substituted,
            ..
        } => {
            let mut line = format!("cycle {cycle}: {}", command.name());
            if let Some(text) = command.raw_text() {
                line.push_str(&format!(" `{text}`"));
            }
            if let Some(pattern) = repetition {
                line.push_str(&format!(" [loop {}]", pattern.as_str()));
            }
            if *substituted {
                line.push_str(" [substituted]");
            }
            println!("{line}");
        }
        CycleOutcome::ParseFailed { cycle, reason } => {
            println!("cycle {cycle}: unparseable reply ({reason})");
        }
    }
}
