//! Promotion and deprecation of patterns.
//!
//! Promotion spans two store keys (the capability artifact and the pattern
//! record), so it cannot be one atomic commit. The artifact is always written
//! first; the pattern only claims `Promoted` once the artifact exists. A
//! failure between the two steps leaves an orphaned artifact, which the next
//! promotion attempt simply overwrites with identical content.
//!
//! The decision to promote is made on a snapshot, so it is re-checked under
//! the pattern lock. A pattern that was deprecated meanwhile, or whose newer
//! history now meets the deprecation rule, is not promoted and its freshly
//! written artifact is removed again.

use super::lifecycle::{apply_evaluation, evaluate, Evaluation, LifecyclePolicy, PromotionRequest};
use super::registry::{PatternRegistry, RegistryError};
use super::types::{Pattern, PatternState};
use crate::storage::{StorageError, StoreKey};
use ake_common::Fingerprint;
use chrono::Utc;
use std::fmt::Write as _;
use std::thread;
use thiserror::Error;
use tracing::{info, warn};

/// Result of the locked pattern-state step of a promotion.
#[derive(Debug)]
enum PromotionCommit {
    Promoted,
    AlreadyPromoted(Option<String>),
    Declined { state: PatternState, reason: String },
}

/// Default number of attempts for the pattern-state commit of a promotion.
pub const DEFAULT_COMMIT_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum PromotionError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("failed to write capability artifact for {fingerprint}: {source}")]
    Artifact {
        fingerprint: Fingerprint,
        #[source]
        source: StorageError,
    },

    #[error("pattern {fingerprint} is {state} and cannot be promoted: {reason}")]
    NotEligible {
        fingerprint: Fingerprint,
        state: PatternState,
        reason: String,
    },
}

impl From<PromotionError> for ake_common::Error {
    fn from(err: PromotionError) -> Self {
        match err {
            PromotionError::Registry(e) => e.into(),
            PromotionError::Artifact { source, .. } => source.into(),
            PromotionError::NotEligible {
                fingerprint, state, ..
            } => ake_common::Error::InvalidTransition {
                fingerprint: fingerprint.to_string(),
                from: state.to_string(),
                to: PatternState::Promoted.to_string(),
            },
        }
    }
}

/// Capability artifact synthesized from a pattern's own fields.
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityArtifact {
    pub slug: Fingerprint,
    pub title: String,
    pub trigger: String,
    pub steps: Vec<String>,
}

impl CapabilityArtifact {
    pub fn from_pattern(pattern: &Pattern) -> Self {
        Self {
            slug: pattern.id.clone(),
            title: pattern.name.clone(),
            trigger: pattern.context_description.clone(),
            steps: pattern.steps_summary.clone(),
        }
    }

    /// Deterministic markdown rendering; identical inputs give identical bytes.
    pub fn render(&self) -> String {
        let description = if self.trigger.trim().is_empty() {
            self.title.as_str()
        } else {
            self.trigger.as_str()
        };
        let mut out = String::new();
        let _ = writeln!(out, "---");
        let _ = writeln!(out, "name: {}", self.slug);
        let _ = writeln!(out, "description: {}", single_line(description));
        let _ = writeln!(out, "source_pattern: {}", self.slug);
        let _ = writeln!(out, "---");
        let _ = writeln!(out);
        let _ = writeln!(out, "# {}", single_line(&self.title));
        if !self.trigger.trim().is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "## When to use");
            let _ = writeln!(out);
            let _ = writeln!(out, "{}", self.trigger.trim());
        }
        if !self.steps.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "## Steps");
            let _ = writeln!(out);
            for (i, step) in self.steps.iter().enumerate() {
                let _ = writeln!(out, "{}. {}", i + 1, single_line(step));
            }
        }
        out
    }
}

fn single_line(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Applies promotion and deprecation decisions.
#[derive(Debug, Clone)]
pub struct PromotionEngine {
    registry: PatternRegistry,
    policy: LifecyclePolicy,
    commit_attempts: u32,
}

impl PromotionEngine {
    pub fn new(registry: PatternRegistry, policy: LifecyclePolicy) -> Self {
        Self {
            registry,
            policy,
            commit_attempts: DEFAULT_COMMIT_ATTEMPTS,
        }
    }

    pub fn with_commit_attempts(mut self, attempts: u32) -> Self {
        self.commit_attempts = attempts.max(1);
        self
    }

    pub fn registry(&self) -> &PatternRegistry {
        &self.registry
    }

    /// Promote `pattern` per `evaluation`. Returns the artifact reference.
    ///
    /// Already-promoted patterns return their existing reference. `Ok(None)`
    /// means the stored pattern no longer qualifies (it was deprecated since
    /// `pattern` was read); that pattern keeps its current state.
    pub fn promote(
        &self,
        pattern: &Pattern,
        evaluation: &Evaluation,
    ) -> Result<Option<String>, PromotionError> {
        if let Some(existing) = pattern.promoted_artifact_ref() {
            return Ok(Some(existing.to_string()));
        }
        if !evaluation.should_promote || evaluation.state != PatternState::Established {
            return Err(PromotionError::NotEligible {
                fingerprint: pattern.id.clone(),
                state: pattern.state(),
                reason: evaluation
                    .reason
                    .clone()
                    .unwrap_or_else(|| "promotion criteria not met".to_string()),
            });
        }

        // Step 1: the artifact.
        let key = StoreKey::capability(&pattern.id);
        let artifact = CapabilityArtifact::from_pattern(pattern);
        self.registry
            .store()
            .write_atomic(&key, artifact.render().as_bytes())
            .map_err(|source| PromotionError::Artifact {
                fingerprint: pattern.id.clone(),
                source,
            })?;
        let artifact_ref = key.as_str().to_string();

        // Step 2: the pattern state, retried on its own.
        let mut attempt = 0;
        let committed = loop {
            match self.commit_promoted(&pattern.id, &artifact_ref) {
                Ok(committed) => break committed,
                Err(e) if is_retryable(&e) && attempt + 1 < self.commit_attempts => {
                    let inconsistent = ake_common::Error::InconsistentPromotion {
                        fingerprint: pattern.id.to_string(),
                        message: e.to_string(),
                    };
                    warn!(fingerprint = %pattern.id, attempt, error = %inconsistent, "retrying promotion commit");
                    thread::sleep(self.registry.store().lock_settings().backoff(attempt));
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        };

        match committed {
            PromotionCommit::Promoted => {
                info!(fingerprint = %pattern.id, artifact = %artifact_ref, "pattern promoted");
                Ok(Some(artifact_ref))
            }
            PromotionCommit::AlreadyPromoted(existing) => Ok(Some(existing.unwrap_or(artifact_ref))),
            PromotionCommit::Declined { state, reason } => {
                // The stored pattern can no longer be promoted; nothing will claim the artifact.
                if let Err(e) = self.registry.store().remove(&key) {
                    warn!(fingerprint = %pattern.id, error = %e, "could not remove unused artifact");
                }
                info!(fingerprint = %pattern.id, %state, reason = %reason, "promotion declined");
                Ok(None)
            }
        }
    }

    fn commit_promoted(
        &self,
        fingerprint: &Fingerprint,
        artifact_ref: &str,
    ) -> Result<PromotionCommit, RegistryError> {
        let policy = &self.policy;
        self.registry.commit(fingerprint, |p| {
            if p.state() == PatternState::Promoted {
                return Ok(PromotionCommit::AlreadyPromoted(
                    p.promoted_artifact_ref().map(str::to_string),
                ));
            }
            // Judge the history as stored now, not the caller's snapshot.
            let current = evaluate(p, policy, PromotionRequest::None);
            apply_evaluation(p, &current, Utc::now())?;
            if p.state() != PatternState::Established {
                let reason = current
                    .reason
                    .unwrap_or_else(|| format!("pattern is {}", p.state()));
                return Ok(PromotionCommit::Declined {
                    state: p.state(),
                    reason,
                });
            }
            p.mark_promoted(artifact_ref.to_string(), Utc::now())?;
            Ok(PromotionCommit::Promoted)
        })
    }

    /// Promote on an explicit reviewer decision.
    pub fn promote_explicit(&self, fingerprint: &Fingerprint) -> Result<Pattern, PromotionError> {
        let pattern = self
            .registry
            .get(fingerprint)?
            .ok_or_else(|| RegistryError::NotFound(fingerprint.clone()))?;
        let evaluation = evaluate(&pattern, &self.policy, PromotionRequest::Explicit);
        let promoted = self.promote(&pattern, &evaluation)?;
        let current = self
            .registry
            .get(fingerprint)?
            .ok_or_else(|| RegistryError::NotFound(fingerprint.clone()))?;
        if promoted.is_none() {
            return Err(PromotionError::NotEligible {
                fingerprint: fingerprint.clone(),
                state: current.state(),
                reason: "deprecated before the promotion was committed".to_string(),
            });
        }
        Ok(current)
    }

    /// Move a pattern to `Deprecated`, recording `reason` in its audit trail.
    ///
    /// Deprecating an already deprecated pattern is a no-op.
    pub fn deprecate(&self, fingerprint: &Fingerprint, reason: &str) -> Result<Pattern, PromotionError> {
        let pattern = self.registry.commit(fingerprint, |p| {
            if p.state() != PatternState::Deprecated {
                p.mark_deprecated(reason, Utc::now())?;
            }
            Ok(p.clone())
        })?;
        info!(fingerprint = %fingerprint, reason, "pattern deprecated");
        Ok(pattern)
    }
}

fn is_retryable(err: &RegistryError) -> bool {
    matches!(err, RegistryError::Storage(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::registry::{OccurrenceDraft, PatternDraft};
    use crate::pattern::types::Outcome;
    use crate::storage::Store;
    use ake_common::AgentId;
    use ake_config::LockSettings;
    use tempfile::{tempdir, TempDir};

    fn setup() -> (PromotionEngine, TempDir) {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path(), LockSettings::default());
        let engine = PromotionEngine::new(PatternRegistry::new(store), LifecyclePolicy::default());
        (engine, dir)
    }

    fn report(engine: &PromotionEngine, name: &str, outcomes: &[Outcome]) -> Pattern {
        let draft = PatternDraft {
            name: name.to_string(),
            context_description: Some("When RSS grows without bound".to_string()),
            steps: vec!["Take a heap snapshot".to_string(), "Diff retained sizes".to_string()],
        };
        let policy = LifecyclePolicy::default();
        let mut last = None;
        for (i, outcome) in outcomes.iter().enumerate() {
            let occ = OccurrenceDraft {
                key: format!("evt-{i}#0"),
                timestamp: Utc::now(),
                reporting_agent: AgentId::parse("scout").unwrap(),
                outcome: *outcome,
                note: None,
            };
            let out = engine
                .registry()
                .upsert_with(&draft, occ, |p| {
                    let e = evaluate(p, &policy, PromotionRequest::None);
                    apply_evaluation(p, &e, Utc::now())?;
                    Ok(())
                })
                .unwrap();
            last = Some(out.pattern);
        }
        last.unwrap()
    }

    #[test]
    fn test_artifact_render_uses_only_pattern_fields() {
        let artifact = CapabilityArtifact {
            slug: Fingerprint::from_name("debug memory leak").unwrap(),
            title: "Debug Memory Leak".to_string(),
            trigger: "When RSS grows".to_string(),
            steps: vec!["Snapshot".to_string(), "Diff".to_string()],
        };
        let text = artifact.render();
        assert!(text.starts_with("---\nname: debug-memory-leak\n"));
        assert!(text.contains("description: When RSS grows\n"));
        assert!(text.contains("# Debug Memory Leak\n"));
        assert!(text.contains("## When to use\n\nWhen RSS grows\n"));
        assert!(text.contains("1. Snapshot\n2. Diff\n"));
        assert_eq!(text, artifact.render());
    }

    #[test]
    fn test_artifact_without_context_or_steps() {
        let artifact = CapabilityArtifact {
            slug: Fingerprint::from_name("bare").unwrap(),
            title: "Bare".to_string(),
            trigger: String::new(),
            steps: Vec::new(),
        };
        let text = artifact.render();
        assert!(text.contains("description: Bare\n"));
        assert!(!text.contains("## When to use"));
        assert!(!text.contains("## Steps"));
    }

    #[test]
    fn test_promote_explicit_writes_artifact_then_state() {
        let (engine, _dir) = setup();
        report(&engine, "debug memory leak", &[Outcome::Success; 4]);
        let fp = Fingerprint::from_name("debug memory leak").unwrap();

        let promoted = engine.promote_explicit(&fp).unwrap();
        assert_eq!(promoted.state(), PatternState::Promoted);
        let artifact_ref = promoted.promoted_artifact_ref().unwrap();
        assert_eq!(artifact_ref, "capabilities/debug-memory-leak/artifact");

        let bytes = engine
            .registry()
            .store()
            .read_bytes(&StoreKey::capability(&fp))
            .unwrap()
            .unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("1. Take a heap snapshot"));
    }

    #[test]
    fn test_promote_explicit_is_idempotent() {
        let (engine, _dir) = setup();
        report(&engine, "twice", &[Outcome::Success; 4]);
        let fp = Fingerprint::from_name("twice").unwrap();
        let first = engine.promote_explicit(&fp).unwrap();
        let second = engine.promote_explicit(&fp).unwrap();
        assert_eq!(first.promoted_artifact_ref(), second.promoted_artifact_ref());
        assert_eq!(second.audit().len(), 1);
    }

    #[test]
    fn test_promote_refuses_emerging_pattern() {
        let (engine, dir) = setup();
        report(&engine, "young", &[Outcome::Success, Outcome::Success]);
        let fp = Fingerprint::from_name("young").unwrap();
        let err = engine.promote_explicit(&fp).unwrap_err();
        assert!(matches!(err, PromotionError::NotEligible { .. }));
        assert!(!dir.path().join("capabilities/young/artifact").exists());
    }

    #[test]
    fn test_promote_missing_pattern() {
        let (engine, _dir) = setup();
        let fp = Fingerprint::from_name("ghost").unwrap();
        let err: ake_common::Error = engine.promote_explicit(&fp).unwrap_err().into();
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn test_deprecate_records_reason_and_is_idempotent() {
        let (engine, _dir) = setup();
        report(&engine, "old habit", &[Outcome::Success, Outcome::Success]);
        let fp = Fingerprint::from_name("old habit").unwrap();
        let p = engine.deprecate(&fp, "superseded by new tooling").unwrap();
        assert_eq!(p.state(), PatternState::Deprecated);
        assert_eq!(p.audit()[0].detail, "superseded by new tooling");
        let again = engine.deprecate(&fp, "another reason").unwrap();
        assert_eq!(again.audit().len(), 1);
    }

    #[test]
    fn test_cannot_deprecate_promoted_pattern() {
        let (engine, _dir) = setup();
        report(&engine, "keeper", &[Outcome::Success; 4]);
        let fp = Fingerprint::from_name("keeper").unwrap();
        engine.promote_explicit(&fp).unwrap();
        let err = engine.deprecate(&fp, "nope").unwrap_err();
        assert!(matches!(
            err,
            PromotionError::Registry(RegistryError::Transition(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_state_commit_never_claims_promoted() {
        use crate::storage::lock::{lock_path_for, KeyLock};

        let dir = tempdir().unwrap();
        let strict = LockSettings {
            lock_attempts: 1,
            attempt_timeout_ms: 5,
            backoff_base_ms: 1,
            backoff_max_ms: 1,
        };
        let store = Store::new(dir.path(), strict);
        let engine = PromotionEngine::new(
            PatternRegistry::new(store.clone()),
            LifecyclePolicy::default(),
        )
        .with_commit_attempts(2);
        let pattern = report(&engine, "contended", &[Outcome::Success; 4]);
        let fp = pattern.id.clone();
        let evaluation = evaluate(&pattern, &LifecyclePolicy::default(), PromotionRequest::Explicit);

        let pattern_key = StoreKey::pattern(&fp);
        let held = KeyLock::acquire(
            &lock_path_for(&store.path_of(&pattern_key)),
            pattern_key.as_str(),
            store.lock_settings(),
        )
        .unwrap();
        assert!(engine.promote(&pattern, &evaluation).is_err());
        drop(held);

        // Artifact written, pattern still Established.
        assert!(store.exists(&StoreKey::capability(&fp)));
        let current = engine.registry().get(&fp).unwrap().unwrap();
        assert_eq!(current.state(), PatternState::Established);

        // A retry completes the promotion.
        let artifact_ref = engine.promote(&current, &evaluation).unwrap().unwrap();
        let current = engine.registry().get(&fp).unwrap().unwrap();
        assert_eq!(current.state(), PatternState::Promoted);
        assert_eq!(current.promoted_artifact_ref(), Some(artifact_ref.as_str()));
    }

    #[test]
    fn test_promote_stale_snapshot_of_deprecated_pattern() {
        let (engine, dir) = setup();
        let snapshot = report(&engine, "debug memory leak", &[Outcome::Success; 4]);
        let evaluation = evaluate(&snapshot, &LifecyclePolicy::default(), PromotionRequest::Explicit);
        assert!(evaluation.should_promote);

        engine.deprecate(&snapshot.id, "superseded").unwrap();

        assert_eq!(engine.promote(&snapshot, &evaluation).unwrap(), None);
        let current = engine.registry().get(&snapshot.id).unwrap().unwrap();
        assert_eq!(current.state(), PatternState::Deprecated);
        assert!(current.promoted_artifact_ref().is_none());
        assert!(!dir.path().join("capabilities/debug-memory-leak/artifact").exists());
    }

    #[test]
    fn test_promote_rechecks_deprecation_rule_under_lock() {
        let (engine, dir) = setup();
        let snapshot = report(&engine, "flaky fix", &[Outcome::Success; 4]);
        let evaluation = evaluate(&snapshot, &LifecyclePolicy::default(), PromotionRequest::Explicit);

        // Failures land after the snapshot without being evaluated yet.
        let draft = PatternDraft::named("flaky fix");
        for i in 0..7 {
            let occ = OccurrenceDraft {
                key: format!("evt-late-{i}#0"),
                timestamp: Utc::now(),
                reporting_agent: AgentId::parse("vera").unwrap(),
                outcome: Outcome::Failure,
                note: None,
            };
            engine
                .registry()
                .upsert_with(&draft, occ, |_| Ok(()))
                .unwrap();
        }

        assert_eq!(engine.promote(&snapshot, &evaluation).unwrap(), None);
        let current = engine.registry().get(&snapshot.id).unwrap().unwrap();
        assert_eq!(current.state(), PatternState::Deprecated);
        assert!(!dir.path().join("capabilities/flaky-fix/artifact").exists());

        let err: ake_common::Error = engine.promote_explicit(&snapshot.id).unwrap_err().into();
        assert_eq!(err.kind(), "invalid_transition");
    }
}
