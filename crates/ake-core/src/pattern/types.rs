//! Pattern records: state, occurrences, and audit trail.
//!
//! # Pattern Lifecycle
//!
//! ```text
//! [Candidate] → [Emerging] → [Established] → [Promoted]
//!      │             │              │
//!      └─────────────┴──────────────┴──────→ [Deprecated]
//!
//! Candidate:   first occurrence recorded
//! Emerging:    seen at least twice
//! Established: enough successes at a high success rate
//! Promoted:    turned into a capability artifact (terminal)
//! Deprecated:  unreliable or merged away (terminal)
//! ```
//!
//! Occurrences are append-only. Terminal patterns still accept occurrences
//! for audit purposes; those never change the state.

use ake_common::schema::default_schema_version;
use ake_common::{AgentId, Fingerprint};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Pattern lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PatternState {
    #[default]
    Candidate,
    Emerging,
    Established,
    Promoted,
    Deprecated,
}

impl PatternState {
    pub const ALL: [PatternState; 5] = [
        PatternState::Candidate,
        PatternState::Emerging,
        PatternState::Established,
        PatternState::Promoted,
        PatternState::Deprecated,
    ];

    /// No transition ever leaves a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Promoted | Self::Deprecated)
    }

    /// Position on the forward (promotion) track.
    fn rank(&self) -> u8 {
        match self {
            Self::Candidate => 0,
            Self::Emerging => 1,
            Self::Established => 2,
            Self::Promoted => 3,
            Self::Deprecated => u8::MAX,
        }
    }

    /// Check if transition to target state is valid.
    pub fn can_transition_to(&self, target: Self) -> bool {
        use PatternState::*;
        match (self, target) {
            // Same state is fine
            (a, b) if *a == b => true,
            // Terminal states are final
            (Promoted | Deprecated, _) => false,
            // Only an established pattern can be promoted
            (Established, Promoted) => true,
            (_, Promoted) => false,
            // Deprecation from any pre-promotion state
            (_, Deprecated) => true,
            // Forward progression only
            (a, b) => b.rank() > a.rank(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Candidate => "candidate",
            Self::Emerging => "emerging",
            Self::Established => "established",
            Self::Promoted => "promoted",
            Self::Deprecated => "deprecated",
        }
    }
}

impl fmt::Display for PatternState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PatternState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "candidate" => Ok(Self::Candidate),
            "emerging" => Ok(Self::Emerging),
            "established" => Ok(Self::Established),
            "promoted" => Ok(Self::Promoted),
            "deprecated" => Ok(Self::Deprecated),
            other => Err(format!("unknown pattern state: {other}")),
        }
    }
}

/// Outcome of one use of a pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "success" | "succeeded" | "ok" | "pass" | "passed" => Ok(Self::Success),
            "failure" | "failed" | "fail" | "error" => Ok(Self::Failure),
            other => Err(format!("unknown outcome: {other}")),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::Failure => f.write_str("failure"),
        }
    }
}

/// One reported use of a pattern. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Occurrence {
    pub pattern_id: Fingerprint,
    /// Deduplication key: `<eventId>#<blockIndex>`.
    pub key: String,
    pub timestamp: DateTime<Utc>,
    pub reporting_agent: AgentId,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Kind of an audit-trail entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Promoted,
    Deprecated,
    /// Another pattern's occurrences were merged into this one.
    Absorbed,
    /// This pattern was merged into another one.
    MergedInto,
}

/// Audit note attached to a pattern; does not count toward the success rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditNote {
    pub timestamp: DateTime<Utc>,
    pub kind: AuditKind,
    pub detail: String,
}

/// Aggregate view over an occurrence history.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct OccurrenceStats {
    pub total: usize,
    pub successes: usize,
}

impl OccurrenceStats {
    pub fn of(occurrences: &[Occurrence]) -> Self {
        Self {
            total: occurrences.len(),
            successes: occurrences.iter().filter(|o| o.outcome.is_success()).count(),
        }
    }

    pub fn failures(&self) -> usize {
        self.total - self.successes
    }

    /// `successes / total`, or 0.0 with no occurrences.
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.successes as f64 / self.total as f64
        }
    }
}

#[derive(Debug, Error, PartialEq)]
#[error("invalid pattern state transition for {fingerprint}: {from} -> {to}")]
pub struct TransitionError {
    pub fingerprint: Fingerprint,
    pub from: PatternState,
    pub to: PatternState,
}

impl From<TransitionError> for ake_common::Error {
    fn from(err: TransitionError) -> Self {
        ake_common::Error::InvalidTransition {
            fingerprint: err.fingerprint.to_string(),
            from: err.from.to_string(),
            to: err.to.to_string(),
        }
    }
}

/// A tracked behavioral pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    pub id: Fingerprint,
    pub name: String,
    state: PatternState,
    #[serde(default)]
    pub context_description: String,
    #[serde(default)]
    pub steps_summary: Vec<String>,
    #[serde(default)]
    occurrences: Vec<Occurrence>,
    /// Cache of the success rate, rewritten on every append.
    #[serde(default)]
    success_rate: f64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    promoted_artifact_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    merged_into: Option<Fingerprint>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    audit: Vec<AuditNote>,
}

impl Pattern {
    /// Create an empty `Candidate` pattern.
    pub fn new(id: Fingerprint, name: impl Into<String>, seen_at: DateTime<Utc>) -> Self {
        Self {
            schema_version: default_schema_version(),
            id,
            name: name.into(),
            state: PatternState::Candidate,
            context_description: String::new(),
            steps_summary: Vec::new(),
            occurrences: Vec::new(),
            success_rate: 0.0,
            first_seen: seen_at,
            last_seen: seen_at,
            promoted_artifact_ref: None,
            merged_into: None,
            audit: Vec::new(),
        }
    }

    pub fn state(&self) -> PatternState {
        self.state
    }

    pub fn occurrences(&self) -> &[Occurrence] {
        &self.occurrences
    }

    /// Cached success rate as stored with the record.
    pub fn success_rate(&self) -> f64 {
        self.success_rate
    }

    pub fn stats(&self) -> OccurrenceStats {
        OccurrenceStats::of(&self.occurrences)
    }

    pub fn promoted_artifact_ref(&self) -> Option<&str> {
        self.promoted_artifact_ref.as_deref()
    }

    pub fn merged_into(&self) -> Option<&Fingerprint> {
        self.merged_into.as_ref()
    }

    pub fn audit(&self) -> &[AuditNote] {
        &self.audit
    }

    pub fn has_occurrence(&self, key: &str) -> bool {
        self.occurrences.iter().any(|o| o.key == key)
    }

    /// Append an occurrence unless one with the same key exists.
    ///
    /// Returns whether the occurrence was appended. The cached success rate
    /// is recomputed from the full history on every append.
    pub fn record_occurrence(&mut self, occurrence: Occurrence) -> bool {
        if self.has_occurrence(&occurrence.key) {
            return false;
        }
        if occurrence.timestamp < self.first_seen {
            self.first_seen = occurrence.timestamp;
        }
        if occurrence.timestamp > self.last_seen {
            self.last_seen = occurrence.timestamp;
        }
        self.occurrences.push(occurrence);
        self.success_rate = self.stats().success_rate();
        true
    }

    /// Fill in descriptive fields that are still empty.
    pub fn absorb_description(&mut self, context: Option<&str>, steps: &[String]) {
        if self.context_description.trim().is_empty() {
            if let Some(ctx) = context.filter(|c| !c.trim().is_empty()) {
                self.context_description = ctx.trim().to_string();
            }
        }
        if self.steps_summary.is_empty() && !steps.is_empty() {
            self.steps_summary = steps.to_vec();
        }
    }

    /// Move to `target`, enforcing the state machine.
    pub fn transition_to(&mut self, target: PatternState) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(target) {
            return Err(TransitionError {
                fingerprint: self.id.clone(),
                from: self.state,
                to: target,
            });
        }
        self.state = target;
        Ok(())
    }

    /// Mark as promoted, recording where the capability artifact lives.
    pub fn mark_promoted(
        &mut self,
        artifact_ref: String,
        at: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.transition_to(PatternState::Promoted)?;
        self.audit.push(AuditNote {
            timestamp: at,
            kind: AuditKind::Promoted,
            detail: artifact_ref.clone(),
        });
        self.promoted_artifact_ref = Some(artifact_ref);
        Ok(())
    }

    /// Mark as deprecated with a reason.
    pub fn mark_deprecated(&mut self, reason: &str, at: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition_to(PatternState::Deprecated)?;
        self.audit.push(AuditNote {
            timestamp: at,
            kind: AuditKind::Deprecated,
            detail: reason.to_string(),
        });
        Ok(())
    }

    /// Deprecate because this pattern was merged into `target`.
    pub fn mark_merged_into(
        &mut self,
        target: &Fingerprint,
        at: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.mark_deprecated(&format!("merged into {target}"), at)?;
        self.audit.push(AuditNote {
            timestamp: at,
            kind: AuditKind::MergedInto,
            detail: target.to_string(),
        });
        self.merged_into = Some(target.clone());
        Ok(())
    }

    pub(crate) fn note_absorbed(&mut self, source: &Fingerprint, moved: usize, at: DateTime<Utc>) {
        self.audit.push(AuditNote {
            timestamp: at,
            kind: AuditKind::Absorbed,
            detail: format!("{moved} occurrence(s) from {source}"),
        });
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn fp(name: &str) -> Fingerprint {
        Fingerprint::from_name(name).unwrap()
    }

    pub fn occurrence(pattern: &str, key: &str, outcome: Outcome) -> Occurrence {
        Occurrence {
            pattern_id: fp(pattern),
            key: key.to_string(),
            timestamp: Utc::now(),
            reporting_agent: AgentId::parse("scout").unwrap(),
            outcome,
            note: None,
        }
    }

    /// Pattern with one occurrence per outcome, keyed `k0`, `k1`, ...
    pub fn pattern_with(name: &str, outcomes: &[Outcome]) -> Pattern {
        let mut p = Pattern::new(fp(name), name, Utc::now());
        for (i, outcome) in outcomes.iter().enumerate() {
            p.record_occurrence(occurrence(name, &format!("k{i}"), *outcome));
        }
        p
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use proptest::prelude::*;
    use Outcome::{Failure, Success};

    #[test]
    fn test_state_transitions() {
        use PatternState::*;

        assert!(Candidate.can_transition_to(Emerging));
        assert!(Emerging.can_transition_to(Established));
        assert!(Established.can_transition_to(Promoted));
        assert!(Candidate.can_transition_to(Deprecated));
        assert!(Emerging.can_transition_to(Deprecated));
        assert!(Established.can_transition_to(Deprecated));

        // Invalid transitions
        assert!(!Emerging.can_transition_to(Candidate));
        assert!(!Emerging.can_transition_to(Promoted));
        assert!(!Established.can_transition_to(Emerging));
    }

    #[test]
    fn test_terminal_states_are_final() {
        for from in [PatternState::Promoted, PatternState::Deprecated] {
            for to in PatternState::ALL {
                assert_eq!(from.can_transition_to(to), from == to, "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_state_parse_roundtrip() {
        for state in PatternState::ALL {
            assert_eq!(state.as_str().parse::<PatternState>().unwrap(), state);
        }
        assert!("stable".parse::<PatternState>().is_err());
    }

    #[test]
    fn test_outcome_parse_aliases() {
        assert_eq!("Success".parse::<Outcome>().unwrap(), Success);
        assert_eq!(" failed ".parse::<Outcome>().unwrap(), Failure);
        assert!("maybe".parse::<Outcome>().is_err());
    }

    #[test]
    fn test_record_occurrence_dedupes_by_key() {
        let mut p = pattern_with("dedupe", &[Success]);
        assert!(!p.record_occurrence(occurrence("dedupe", "k0", Failure)));
        assert_eq!(p.occurrences().len(), 1);
        assert!((p.success_rate() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_success_rate_cache_tracks_appends() {
        let p = pattern_with("rate", &[Success, Success, Failure, Success]);
        assert!((p.success_rate() - 0.75).abs() < 1e-9);
        assert_eq!(p.stats().failures(), 1);
    }

    #[test]
    fn test_promotion_requires_established() {
        let mut p = pattern_with("promote", &[Success]);
        let err = p
            .mark_promoted("capabilities/promote/artifact".to_string(), Utc::now())
            .unwrap_err();
        assert_eq!(err.from, PatternState::Candidate);
        assert!(p.promoted_artifact_ref().is_none());
    }

    #[test]
    fn test_terminal_pattern_still_accepts_audit_occurrences() {
        let mut p = pattern_with("old", &[Failure]);
        p.mark_deprecated("unreliable", Utc::now()).unwrap();
        assert!(p.record_occurrence(occurrence("old", "late", Success)));
        assert_eq!(p.state(), PatternState::Deprecated);
        assert_eq!(p.audit().len(), 1);
    }

    #[test]
    fn test_merged_into_records_target() {
        let mut p = pattern_with("dup", &[Success]);
        let target = fp("original");
        p.mark_merged_into(&target, Utc::now()).unwrap();
        assert_eq!(p.state(), PatternState::Deprecated);
        assert_eq!(p.merged_into(), Some(&target));
        assert_eq!(p.audit().last().unwrap().kind, AuditKind::MergedInto);
    }

    #[test]
    fn test_absorb_description_keeps_first_writer() {
        let mut p = pattern_with("desc", &[]);
        p.absorb_description(Some("when memory grows"), &["profile".to_string()]);
        p.absorb_description(Some("something else"), &["other".to_string()]);
        assert_eq!(p.context_description, "when memory grows");
        assert_eq!(p.steps_summary, vec!["profile".to_string()]);
    }

    #[test]
    fn test_pattern_json_roundtrip() {
        let p = pattern_with("roundtrip", &[Success, Failure]);
        let json = serde_json::to_string(&p).unwrap();
        let back: Pattern = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
        assert!(json.contains("\"state\":\"candidate\""));
    }

    proptest! {
        #[test]
        fn occurrences_only_grow_and_cache_matches(outcomes in prop::collection::vec(any::<bool>(), 0..40)) {
            let mut p = pattern_with("prop", &[]);
            let mut last_len = 0;
            for (i, ok) in outcomes.iter().enumerate() {
                let outcome = if *ok { Success } else { Failure };
                // Every other append repeats the previous key and must be ignored.
                let key = format!("k{}", i / 2);
                p.record_occurrence(occurrence("prop", &key, outcome));
                prop_assert!(p.occurrences().len() >= last_len);
                last_len = p.occurrences().len();
                prop_assert!((p.success_rate() - p.stats().success_rate()).abs() < 1e-12);
            }
            prop_assert_eq!(p.occurrences().len(), outcomes.len().div_ceil(2));
        }
    }
}
