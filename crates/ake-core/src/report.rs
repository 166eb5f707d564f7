//! Worker report parsing.
//!
//! Reports are free text with a few line-oriented keys (case-insensitive):
//!
//! ```text
//! PATTERN: Debug memory leak
//! CONTEXT: RSS grows steadily under load
//! STEPS:
//! - take a heap snapshot
//! - diff retained sizes
//! OUTCOME: success
//! NOTE: leak was in the LRU
//!
//! LEARNING: the staging cluster has half the memory of prod
//! @kai: check the new endpoint
//! ```
//!
//! A block starts at `PATTERN:` and ends at the next `PATTERN:`, a blank
//! line, or the end of the text. Everything else is prose; prose sentences
//! with a learning cue phrase are collected as learnings. Message lines are
//! left to [`crate::relay::extract_messages`].

use crate::pattern::Outcome;
use crate::relay::learning::{detect_category, extract_learnings, truncate_snippet, Learning};
use crate::relay::message::parse_message_line;
use ake_common::Fingerprint;
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::LazyLock;
use thiserror::Error;

static KEY_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(pattern|outcome|context|steps|step|note|learning)\s*:\s*(.*?)\s*$")
        .expect("regex")
});
static BULLET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:[-*]|\d+[.)])\s+(.+?)\s*$").expect("regex"));

#[derive(Debug, Error, PartialEq)]
pub enum ReportError {
    #[error("line {line}: pattern {name:?} has no OUTCOME")]
    MissingOutcome { name: String, line: usize },

    #[error("line {line}: invalid OUTCOME {value:?} for pattern {name:?}")]
    InvalidOutcome {
        name: String,
        value: String,
        line: usize,
    },

    #[error("line {line}: PATTERN name {name:?} has no usable characters")]
    UnusableName { name: String, line: usize },
}

impl From<ReportError> for ake_common::Error {
    fn from(err: ReportError) -> Self {
        ake_common::Error::MalformedInput(err.to_string())
    }
}

/// One pattern block from a report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatternReport {
    /// Position among the report's pattern blocks; part of the occurrence key.
    pub index: usize,
    pub name: String,
    pub fingerprint: Fingerprint,
    pub outcome: Outcome,
    pub context: Option<String>,
    pub steps: Vec<String>,
    pub note: Option<String>,
}

/// Structured content of one worker report.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkerReport {
    pub patterns: Vec<PatternReport>,
    pub learnings: Vec<Learning>,
}

#[derive(Debug)]
struct OpenBlock {
    name: String,
    fingerprint: Fingerprint,
    line: usize,
    outcome: Option<Outcome>,
    context: Vec<String>,
    steps: Vec<String>,
    note: Option<String>,
    in_steps_list: bool,
}

impl OpenBlock {
    fn close(self, index: usize) -> Result<PatternReport, ReportError> {
        let outcome = self.outcome.ok_or_else(|| ReportError::MissingOutcome {
            name: self.name.clone(),
            line: self.line,
        })?;
        Ok(PatternReport {
            index,
            name: self.name,
            fingerprint: self.fingerprint,
            outcome,
            context: (!self.context.is_empty()).then(|| self.context.join(" ")),
            steps: self.steps,
            note: self.note,
        })
    }
}

#[derive(Default)]
struct Parser {
    patterns: Vec<PatternReport>,
    learnings: Vec<Learning>,
    seen_learnings: HashSet<String>,
    block: Option<OpenBlock>,
    snippet_max_chars: usize,
}

impl Parser {
    fn close_block(&mut self) -> Result<(), ReportError> {
        if let Some(block) = self.block.take() {
            let index = self.patterns.len();
            self.patterns.push(block.close(index)?);
        }
        Ok(())
    }

    fn add_learning(&mut self, learning: Learning) {
        if self.seen_learnings.insert(learning.source_id()) {
            self.learnings.push(learning);
        }
    }

    fn prose(&mut self, line: &str) {
        for learning in extract_learnings(line, self.snippet_max_chars) {
            self.add_learning(learning);
        }
    }

    fn line(&mut self, number: usize, line: &str) -> Result<(), ReportError> {
        if line.trim().is_empty() {
            return self.close_block();
        }
        if parse_message_line(line).is_some() {
            return Ok(());
        }

        if let Some(caps) = KEY_LINE_RE.captures(line) {
            let key = caps[1].to_lowercase();
            let value = caps[2].to_string();
            match key.as_str() {
                "pattern" => return self.open_block(number, value),
                "learning" => {
                    if !value.is_empty() {
                        self.add_learning(Learning {
                            category: detect_category(&value),
                            text: truncate_snippet(&value, self.snippet_max_chars),
                        });
                    }
                    return Ok(());
                }
                _ => {}
            }
            if let Some(block) = self.block.as_mut() {
                block.in_steps_list = false;
                match key.as_str() {
                    "outcome" => {
                        let outcome =
                            value
                                .parse::<Outcome>()
                                .map_err(|_| ReportError::InvalidOutcome {
                                    name: block.name.clone(),
                                    value: value.clone(),
                                    line: number,
                                })?;
                        block.outcome = Some(outcome);
                    }
                    "context" if !value.is_empty() => block.context.push(value),
                    "step" if !value.is_empty() => block.steps.push(value),
                    "steps" => {
                        block.in_steps_list = true;
                        if !value.is_empty() {
                            block.steps.push(value);
                        }
                    }
                    "note" if !value.is_empty() => block.note = Some(value),
                    _ => {}
                }
                return Ok(());
            }
            // Keys outside a block are ordinary text.
            self.prose(line);
            return Ok(());
        }

        if let Some(block) = self.block.as_mut() {
            if block.in_steps_list {
                if let Some(caps) = BULLET_RE.captures(line) {
                    block.steps.push(caps[1].to_string());
                    return Ok(());
                }
                block.in_steps_list = false;
            }
        }
        self.prose(line);
        Ok(())
    }

    fn open_block(&mut self, number: usize, name: String) -> Result<(), ReportError> {
        self.close_block()?;
        let fingerprint = Fingerprint::from_name(&name).ok_or_else(|| ReportError::UnusableName {
            name: name.clone(),
            line: number,
        })?;
        self.block = Some(OpenBlock {
            name,
            fingerprint,
            line: number,
            outcome: None,
            context: Vec::new(),
            steps: Vec::new(),
            note: None,
            in_steps_list: false,
        });
        Ok(())
    }
}

/// Parse a worker report. Learning snippets are cut to `snippet_max_chars`.
pub fn parse_report(text: &str, snippet_max_chars: usize) -> Result<WorkerReport, ReportError> {
    let mut parser = Parser {
        snippet_max_chars,
        ..Default::default()
    };
    for (i, line) in text.lines().enumerate() {
        parser.line(i + 1, line)?;
    }
    parser.close_block()?;
    Ok(WorkerReport {
        patterns: parser.patterns,
        learnings: parser.learnings,
    })
}
