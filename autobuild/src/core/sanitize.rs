//! Terminal output cleanup before anything is shown to decision logic.
//!
//! Raw logs contain escape sequences, carriage-return redraws and progress
//! bars. [`sanitize`] reduces them to the text a human would read on a
//! finished terminal; [`summarize`] bounds the result for display.

use std::sync::LazyLock;

use regex::Regex;

static ESCAPE_RE: LazyLock<Regex> = LazyLock::new(|| {
    // CSI, OSC (BEL or ST terminated), then any remaining two-byte escape.
    Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]").unwrap()
});

static PERCENT_BAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    // tqdm / pip / npm style: "45%|####      | 12/30" or "[=====>    ] 45%"
    Regex::new(r"^\s*\d{1,3}(?:\.\d+)?%\s*\||\[[=#>\-\s\.]{8,}\]\s*\d{1,3}(?:\.\d+)?%").unwrap()
});

const BAR_GLYPHS: &[char] = &[
    '#', '=', '>', '-', '.', '|', '█', '▉', '▊', '▋', '▌', '▍', '▎', '▏', '░', '▒', '▓', '━', '─',
    '╸', '╺',
];

/// Full cleanup: escape removal, redraw resolution, progress-bar and
/// blank-line collapsing.
pub fn sanitize(raw: &str) -> String {
    let plain = strip_control_sequences(raw);
    let mut lines: Vec<&str> = Vec::new();
    let mut blank_run = 0usize;
    for line in plain.lines() {
        if is_progress_line(line) {
            continue;
        }
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        lines.push(line);
    }
    let joined = lines.join("\n");
    joined.trim_matches('\n').trim_end().to_string()
}

/// Remove escape sequences and resolve `\r` / backspace redraws.
pub fn strip_control_sequences(raw: &str) -> String {
    let without_escapes = ESCAPE_RE.replace_all(raw, "");
    let mut out = String::with_capacity(without_escapes.len());
    for (i, line) in without_escapes.split('\n').enumerate() {
        if i > 0 {
            out.push('\n');
        }
        let line = line.strip_suffix('\r').unwrap_or(line);
        // A carriage return redraws the line; the terminal shows the last frame.
        let visible = match line.rfind('\r') {
            Some(idx) => &line[idx + 1..],
            None => line,
        };
        push_visible(visible, &mut out);
    }
    out
}

fn push_visible(segment: &str, out: &mut String) {
    let line_start = out.len();
    for ch in segment.chars() {
        match ch {
            '\u{8}' => {
                if out.len() > line_start {
                    out.pop();
                }
            }
            '\t' => out.push('\t'),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }
}

/// True for lines that only carry progress-bar decoration.
pub fn is_progress_line(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return false;
    }
    if PERCENT_BAR_RE.is_match(trimmed) {
        return true;
    }
    let total = trimmed.chars().count();
    if total < 10 {
        return false;
    }
    let glyphs = trimmed.chars().filter(|c| BAR_GLYPHS.contains(c)).count();
    glyphs * 10 >= total * 8
}

/// Bound `text` to `cap` characters by keeping its head and tail.
///
/// Returns the (possibly) shortened text and whether anything was elided.
pub fn summarize(text: &str, cap: usize) -> (String, bool) {
    let total = text.chars().count();
    if total <= cap {
        return (text.to_string(), false);
    }
    let head_len = cap / 2;
    let tail_len = cap - head_len;
    let head: String = text.chars().take(head_len).collect();
    let tail: String = text.chars().skip(total - tail_len).collect();
    let elided = total - head_len - tail_len;
    (
        format!("{head}\n[... {elided} characters elided ...]\n{tail}"),
        true,
    )
}
