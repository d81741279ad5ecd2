//! Append-only log of file writes with content checksums.
//!
//! Lines look like `write: path/to/file #<sha256>` or `delete: path`. Replaying
//! the log yields the expected checksum of every written file, which is how
//! an identical re-write is recognized.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOp {
    Write,
    Append,
    Delete,
}

impl FileOp {
    fn as_str(&self) -> &'static str {
        match self {
            FileOp::Write => "write",
            FileOp::Append => "append",
            FileOp::Delete => "delete",
        }
    }
}

/// Hex sha256 of `text`.
pub fn text_checksum(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

#[derive(Debug, Clone)]
pub struct FileOpLog {
    path: PathBuf,
}

impl FileOpLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Expected checksum per path after replaying the log.
    pub fn state(&self) -> Result<BTreeMap<String, Option<String>>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("read {}", self.path.display()));
            }
        };

        let mut state = BTreeMap::new();
        for line in contents.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let Some((op, tail)) = line.split_once(": ") else {
                warn!(line, "skipping malformed file log entry");
                continue;
            };
            match op.trim() {
                "write" | "append" => match tail.rsplit_once(" #") {
                    Some((path, checksum)) => {
                        state.insert(path.trim().to_string(), Some(checksum.trim().to_string()));
                    }
                    None => {
                        state.insert(tail.trim().to_string(), None);
                    }
                },
                "delete" => {
                    state.remove(tail.trim());
                }
                other => warn!(op = other, "unknown file log operation"),
            }
        }
        Ok(state)
    }

    /// True when `path` was last written with exactly `checksum`.
    pub fn is_duplicate_write(&self, path: &str, checksum: &str) -> Result<bool> {
        let state = self.state()?;
        Ok(matches!(state.get(path), Some(Some(existing)) if existing == checksum))
    }

    pub fn record(&self, op: FileOp, path: &str, checksum: Option<&str>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let mut entry = format!("{}: {path}", op.as_str());
        if let Some(checksum) = checksum {
            entry.push_str(&format!(" #{checksum}"));
        }
        debug!(entry = %entry, "logging file operation");
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open {}", self.path.display()))?;
        writeln!(file, "{entry}").with_context(|| format!("append {}", self.path.display()))
    }
}
