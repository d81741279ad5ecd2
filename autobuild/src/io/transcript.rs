//! Per-cycle artifacts under `<log_dir>/cycles/<n>/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::repetition::RepetitionPattern;
use crate::core::types::{Command, Message};
use crate::io::oracle::render_prompt;

/// How a cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleKind {
    Executed,
    ParseFailed,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleMeta {
    pub cycle: u32,
    pub kind: CycleKind,
    /// Command actually dispatched, after any loop substitution.
    pub command: Option<Command>,
    pub repetition: Option<RepetitionPattern>,
    pub substituted: bool,
    pub finished: bool,
    pub parse_error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct CyclePaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub prompt_path: PathBuf,
    pub response_path: PathBuf,
    pub replan_response_path: PathBuf,
    pub result_path: PathBuf,
}

impl CyclePaths {
    pub fn new(log_dir: &Path, cycle: u32) -> Self {
        let dir = log_dir.join("cycles").join(cycle.to_string());
        Self {
            meta_path: dir.join("meta.json"),
            prompt_path: dir.join("prompt.md"),
            response_path: dir.join("response.txt"),
            replan_response_path: dir.join("replan_response.txt"),
            result_path: dir.join("result.txt"),
            dir,
        }
    }
}

pub struct CycleRecord<'a> {
    pub meta: &'a CycleMeta,
    pub prompt: &'a [Message],
    pub result: Option<&'a str>,
}

/// Write meta, prompt and result for one cycle. Responses are streamed in
/// by the oracle separately.
pub fn write_cycle(log_dir: &Path, record: &CycleRecord<'_>) -> Result<CyclePaths> {
    let paths = CyclePaths::new(log_dir, record.meta.cycle);
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create cycle dir {}", paths.dir.display()))?;

    write_json(&paths.meta_path, record.meta)?;
    write_text(&paths.prompt_path, &render_prompt(record.prompt))?;
    if let Some(result) = record.result {
        write_text(&paths.result_path, result)?;
    }
    Ok(paths)
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_text(path, &buf)
}
