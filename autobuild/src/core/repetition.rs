//! Short-cycle detection over the issued command sequence.
//!
//! The window is the canonical serializations of the last five issued
//! commands plus the candidate. Four shapes count as "not converging":
//! `AAAAAA`, `ABABAB`, `ABCABC` and `AAABBB`. Up to five identical
//! troubleshooting commands in a row are tolerated before a period-1 flag.

use serde::Serialize;

use crate::core::types::Command;

/// Commands examined per detection, candidate included.
pub const WINDOW_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepetitionPattern {
    Period1,
    Period2,
    Period3,
    DoubleTriple,
}

impl RepetitionPattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepetitionPattern::Period1 => "period-1 (A A A A A A)",
            RepetitionPattern::Period2 => "period-2 (A B A B A B)",
            RepetitionPattern::Period3 => "period-3 (A B C A B C)",
            RepetitionPattern::DoubleTriple => "double-triple (A A A B B B)",
        }
    }
}

/// A detected cycle and the window that exhibited it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repetition {
    pub pattern: RepetitionPattern,
    /// Canonical serializations, oldest first, candidate last.
    pub window: Vec<String>,
}

impl Repetition {
    /// Window rendered one command per line, as handed to the oracle.
    pub fn window_text(&self) -> String {
        self.window.join("\n")
    }
}

/// Check whether issuing `candidate` after `previous` closes a short cycle.
///
/// `previous` is the issued command sequence, oldest first. Fewer than five
/// previous commands never count as repetition.
pub fn detect<'a, I>(previous: I, candidate: &Command) -> Option<Repetition>
where
    I: IntoIterator<Item = &'a Command>,
    I::IntoIter: DoubleEndedIterator,
{
    let mut window: Vec<String> = previous
        .into_iter()
        .rev()
        .take(WINDOW_LEN - 1)
        .map(Command::canonical)
        .collect();
    if window.len() < WINDOW_LEN - 1 {
        return None;
    }
    window.reverse();
    window.push(candidate.canonical());

    let pattern = classify(&window)?;
    Some(Repetition { pattern, window })
}

/// Classify a full six-element window.
pub fn classify<S: AsRef<str>>(window: &[S]) -> Option<RepetitionPattern> {
    if window.len() != WINDOW_LEN {
        return None;
    }
    let w: Vec<&str> = window.iter().map(AsRef::as_ref).collect();

    for (period, pattern) in [
        (1, RepetitionPattern::Period1),
        (2, RepetitionPattern::Period2),
        (3, RepetitionPattern::Period3),
    ] {
        if (0..WINDOW_LEN).all(|i| w[i] == w[i % period]) {
            return Some(pattern);
        }
    }

    if w[0] == w[1] && w[1] == w[2] && w[3] == w[4] && w[4] == w[5] && w[0] != w[3] {
        return Some(RepetitionPattern::DoubleTriple);
    }
    None
}
