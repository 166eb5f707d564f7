//! Pure lifecycle evaluation.
//!
//! [`evaluate`] looks only at a pattern's state and occurrence history and
//! reports where the pattern should be now. It never mutates anything; the
//! caller commits the result together with the occurrence that triggered it.
//!
//! Thresholds (defaults):
//!
//! ```text
//! Candidate   → Emerging     occurrences ≥ 2
//! Emerging    → Established  successes ≥ 4 and success rate > 0.80
//! pre-promo   → Deprecated   occurrences ≥ 4 and success rate < 0.40
//! Established → Promoted     explicit request, or the auto-promote policy
//! ```
//!
//! When a history satisfies both the promotion path and the deprecation rule,
//! deprecation wins.

use super::types::{OccurrenceStats, Pattern, PatternState, TransitionError};
use ake_config::{AutoPromotePolicy, Config, LifecycleThresholds};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Thresholds plus the optional auto-promotion policy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LifecyclePolicy {
    pub thresholds: LifecycleThresholds,
    pub auto_promote: Option<AutoPromotePolicy>,
}

impl LifecyclePolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            thresholds: config.lifecycle.clone(),
            auto_promote: config.promotion.auto_promote.clone(),
        }
    }
}

/// Whether a human (or other caller) has asked for promotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PromotionRequest {
    #[default]
    None,
    Explicit,
}

/// Result of evaluating one pattern.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evaluation {
    pub previous: PatternState,
    pub state: PatternState,
    pub should_promote: bool,
    pub should_deprecate: bool,
    pub occurrences: usize,
    pub successes: usize,
    pub success_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Evaluation {
    pub fn changed(&self) -> bool {
        self.previous != self.state
    }
}

/// Compute the state a pattern should be in, and whether a terminal
/// transition should fire now.
pub fn evaluate(pattern: &Pattern, policy: &LifecyclePolicy, request: PromotionRequest) -> Evaluation {
    let stats = pattern.stats();
    let rate = stats.success_rate();
    let previous = pattern.state();
    let mut evaluation = Evaluation {
        previous,
        state: previous,
        should_promote: false,
        should_deprecate: false,
        occurrences: stats.total,
        successes: stats.successes,
        success_rate: rate,
        reason: None,
    };

    if previous.is_terminal() {
        return evaluation;
    }

    let t = &policy.thresholds;
    let mut next = previous;
    if next == PatternState::Candidate && stats.total >= t.emerging_min_occurrences as usize {
        next = PatternState::Emerging;
    }
    if next == PatternState::Emerging && meets_establishment(&stats, t) {
        next = PatternState::Established;
    }

    // Deprecation takes precedence over any forward progress.
    if meets_deprecation(&stats, t) {
        evaluation.state = PatternState::Deprecated;
        evaluation.should_deprecate = true;
        evaluation.reason = Some(format!(
            "success rate {:.2} below {:.2} after {} occurrences",
            rate, t.deprecation_max_success_rate, stats.total
        ));
        return evaluation;
    }

    evaluation.state = next;
    if next == PatternState::Established {
        let policy_says_promote = policy
            .auto_promote
            .as_ref()
            .is_some_and(|p| stats.total >= p.min_occurrences as usize && rate >= p.min_success_rate);
        evaluation.should_promote = request == PromotionRequest::Explicit || policy_says_promote;
        if evaluation.should_promote {
            evaluation.reason = Some(match request {
                PromotionRequest::Explicit => "explicit promotion request".to_string(),
                PromotionRequest::None => "auto-promote policy satisfied".to_string(),
            });
        }
    }
    evaluation
}

fn meets_establishment(stats: &OccurrenceStats, t: &LifecycleThresholds) -> bool {
    stats.successes >= t.established_min_successes as usize
        && stats.success_rate() > t.established_min_success_rate
}

fn meets_deprecation(stats: &OccurrenceStats, t: &LifecycleThresholds) -> bool {
    stats.total >= t.deprecation_min_occurrences as usize
        && stats.success_rate() < t.deprecation_max_success_rate
}

/// Apply the non-promotion part of an evaluation to a pattern in place.
///
/// Forward moves and deprecation are committed here; promotion needs an
/// artifact first and is left to the promotion engine.
pub fn apply_evaluation(
    pattern: &mut Pattern,
    evaluation: &Evaluation,
    at: DateTime<Utc>,
) -> Result<(), TransitionError> {
    if evaluation.should_deprecate {
        let reason = evaluation
            .reason
            .as_deref()
            .unwrap_or("success rate below deprecation threshold");
        return pattern.mark_deprecated(reason, at);
    }
    if evaluation.state != pattern.state() && evaluation.state != PatternState::Promoted {
        pattern.transition_to(evaluation.state)?;
    }
    Ok(())
}
