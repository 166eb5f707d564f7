//! Learning detection in free-text worker reports.
//!
//! A learning is a prose sentence that carries a cue phrase for one of the
//! [`LearningCategory`] kinds ("decided to use", "be careful", ...). Only the
//! first matching category counts for a sentence.

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::LazyLock;

/// Sentences shorter than this are never learnings.
pub const MIN_SENTENCE_CHARS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningCategory {
    Decision,
    Constraint,
    Pattern,
    Warning,
    Insight,
}

impl LearningCategory {
    /// Detection order; the first category with a matching cue wins.
    pub const ALL: [LearningCategory; 5] = [
        LearningCategory::Decision,
        LearningCategory::Constraint,
        LearningCategory::Pattern,
        LearningCategory::Warning,
        LearningCategory::Insight,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Decision => "decision",
            Self::Constraint => "constraint",
            Self::Pattern => "pattern",
            Self::Warning => "warning",
            Self::Insight => "insight",
        }
    }

    fn cues(&self) -> &'static Regex {
        match self {
            Self::Decision => &DECISION_RE,
            Self::Constraint => &CONSTRAINT_RE,
            Self::Pattern => &PATTERN_RE,
            Self::Warning => &WARNING_RE,
            Self::Insight => &INSIGHT_RE,
        }
    }
}

impl fmt::Display for LearningCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static DECISION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"decided to use|we('ll| will) go with|the approach is|architecture decision|design choice")
        .expect("regex")
});
static CONSTRAINT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"must (not |never )?|cannot|limitation|constraint|required to|performance requirement")
        .expect("regex")
});
static PATTERN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"pattern (is|we use)|convention is|standard approach|best practice|always use")
        .expect("regex")
});
static WARNING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"gotcha|be careful|watch out|don't forget|common mistake|bug (in|with)")
        .expect("regex")
});
static INSIGHT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"learned that|discovered that|found out|realized|key insight").expect("regex")
});
static SENTENCE_SPLIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.!?]\s+").expect("regex"));

/// One learning found in a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Learning {
    /// `None` for explicit `LEARNING:` lines without a cue phrase.
    pub category: Option<LearningCategory>,
    pub text: String,
}

impl Learning {
    /// Stable feed source id: `learn-<16 hex>` over the snippet text.
    pub fn source_id(&self) -> String {
        let digest = hex::encode(Sha256::digest(self.text.trim().to_lowercase().as_bytes()));
        format!("learn-{}", &digest[..16])
    }
}

/// Category of the first cue phrase found in `text`, if any.
pub fn detect_category(text: &str) -> Option<LearningCategory> {
    let lowered = text.to_lowercase();
    LearningCategory::ALL
        .into_iter()
        .find(|category| category.cues().is_match(&lowered))
}

/// Collect cue-bearing sentences from prose, truncated to `max_chars`.
pub fn extract_learnings(prose: &str, max_chars: usize) -> Vec<Learning> {
    let mut learnings = Vec::new();
    for sentence in SENTENCE_SPLIT_RE.split(prose) {
        let sentence = sentence.trim();
        if sentence.chars().count() < MIN_SENTENCE_CHARS {
            continue;
        }
        if let Some(category) = detect_category(sentence) {
            learnings.push(Learning {
                category: Some(category),
                text: truncate_snippet(sentence, max_chars),
            });
        }
    }
    learnings
}

/// Cut `text` to at most `max_chars` characters, marking the cut with `...`.
///
/// Counts characters, not bytes, so multi-byte text is never split mid-char.
pub fn truncate_snippet(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    if max_chars <= 3 {
        return text.chars().take(max_chars).collect();
    }
    let mut out: String = text.chars().take(max_chars - 3).collect();
    out.truncate(out.trim_end().len());
    out.push_str("...");
    out
}
