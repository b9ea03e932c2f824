//! Classification of supervised process output.
//!
//! Two line shapes carry meaning:
//! - `current/total` (separators such as spaces ignored) → fractional progress of the
//!   current sub-task. Reaching 1.0 retires that sub-task and opens a fresh one.
//! - purely alphabetic text (spaces allowed) → status text for the current sub-task.
//!
//! Everything else is kept in the outcome but otherwise ignored.

use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

use crate::task::{Reporter, TaskId};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OutputLine {
    Progress { current: f64, total: f64 },
    Status { text: String },
    Unclassified,
}

impl OutputLine {
    pub fn fraction(&self) -> Option<f32> {
        match self {
            OutputLine::Progress { current, total } => Some((current / total).min(1.0) as f32),
            _ => None,
        }
    }
}

fn is_separator(c: char) -> bool {
    c.is_whitespace() || c == ',' || c == '_'
}

fn ratio_pattern() -> &'static Regex {
    static RATIO_RE: OnceLock<Regex> = OnceLock::new();
    RATIO_RE.get_or_init(|| {
        Regex::new(r"^(\d+(?:\.\d+)?)/(\d+(?:\.\d+)?)$").expect("ratio pattern is valid")
    })
}

fn status_pattern() -> &'static Regex {
    static STATUS_RE: OnceLock<Regex> = OnceLock::new();
    STATUS_RE.get_or_init(|| {
        Regex::new(r"^[\p{Alphabetic} ]*\p{Alphabetic}[\p{Alphabetic} ]*$")
            .expect("status pattern is valid")
    })
}

/// Classify one line of process output.
pub fn classify_line(line: &str) -> OutputLine {
    let compact: String = line.chars().filter(|c| !is_separator(*c)).collect();
    if let Some(caps) = ratio_pattern().captures(&compact) {
        let current = caps[1].parse::<f64>().ok();
        let total = caps[2].parse::<f64>().ok();
        if let (Some(current), Some(total)) = (current, total) {
            if total > 0.0 {
                return OutputLine::Progress { current, total };
            }
        }
        return OutputLine::Unclassified;
    }

    let text = line.trim();
    if status_pattern().is_match(text) {
        return OutputLine::Status {
            text: text.to_string(),
        };
    }
    OutputLine::Unclassified
}

/// Turns classified lines into sub-task updates.
pub struct OutputInterpreter {
    reporter: Reporter,
    title: String,
    current: TaskId,
    progress: f32,
}

impl OutputInterpreter {
    /// Opens the first sub-task immediately.
    pub fn new(reporter: Reporter, title: &str) -> Self {
        let current = reporter.create(title, "");
        Self {
            reporter,
            title: title.to_string(),
            current,
            progress: 0.0,
        }
    }

    pub fn feed(&mut self, line: &str) -> OutputLine {
        let parsed = classify_line(line);
        match &parsed {
            OutputLine::Progress { .. } => {
                let fraction = parsed.fraction().unwrap_or(0.0);
                self.progress = fraction;
                self.reporter.update(self.current, fraction);
                if fraction >= 1.0 {
                    self.current = self.reporter.create(&self.title, "");
                    self.progress = 0.0;
                }
            }
            OutputLine::Status { text } => {
                self.reporter
                    .update_detail(self.current, self.progress, text);
            }
            OutputLine::Unclassified => {}
        }
        parsed
    }

    /// End of stream: complete whatever sub-task is open.
    pub fn finish(self) {
        self.reporter.finish(self.current);
    }
}
