//! Pattern registry: storage-shaped access to pattern records.
//!
//! The registry owns no policy. Callers that need a state transition to land
//! in the same commit as an occurrence pass a hook to [`PatternRegistry::upsert_with`].

use super::types::{Occurrence, Outcome, Pattern, PatternState, TransitionError};
use crate::storage::key::{PATTERNS_DIR, RECORD_EXT};
use crate::storage::{StorageError, Store, StoreKey};
use ake_common::{AgentId, Fingerprint};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info};

/// Errors from registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("pattern name {0:?} has no usable characters")]
    InvalidName(String),

    #[error("pattern not found: {0}")]
    NotFound(Fingerprint),

    #[error("cannot merge {source_id} into {target}: {reason}")]
    MergeRejected {
        source_id: Fingerprint,
        target: Fingerprint,
        reason: String,
    },
}

impl From<RegistryError> for ake_common::Error {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Storage(e) => e.into(),
            RegistryError::Transition(e) => e.into(),
            RegistryError::InvalidName(name) => {
                ake_common::Error::MalformedInput(format!("unusable pattern name {name:?}"))
            }
            RegistryError::NotFound(fp) => ake_common::Error::NotFound(format!("pattern {fp}")),
            RegistryError::MergeRejected {
                source_id,
                target,
                reason,
            } => ake_common::Error::InvalidTransition {
                fingerprint: source_id.to_string(),
                from: reason,
                to: format!("merged into {target}"),
            },
        }
    }
}

/// Descriptive fields reported alongside an occurrence.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatternDraft {
    pub name: String,
    pub context_description: Option<String>,
    pub steps: Vec<String>,
}

impl PatternDraft {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Occurrence data before it is bound to a fingerprint.
#[derive(Debug, Clone, PartialEq)]
pub struct OccurrenceDraft {
    pub key: String,
    pub timestamp: DateTime<Utc>,
    pub reporting_agent: AgentId,
    pub outcome: Outcome,
    pub note: Option<String>,
}

impl OccurrenceDraft {
    fn bind(self, pattern_id: &Fingerprint) -> Occurrence {
        Occurrence {
            pattern_id: pattern_id.clone(),
            key: self.key,
            timestamp: self.timestamp,
            reporting_agent: self.reporting_agent,
            outcome: self.outcome,
            note: self.note,
        }
    }
}

/// Result of an upsert.
#[derive(Debug, Clone)]
pub struct UpsertOutcome<R> {
    /// The pattern as committed.
    pub pattern: Pattern,
    pub created: bool,
    /// False when the occurrence key was already recorded.
    pub appended: bool,
    /// Whatever the commit hook returned.
    pub hook: R,
}

/// Result of a merge.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub target: Pattern,
    pub source: Pattern,
    pub moved: usize,
}

/// CRUD and fingerprint lookup over pattern records.
#[derive(Debug, Clone)]
pub struct PatternRegistry {
    store: Store,
}

impl PatternRegistry {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Record an occurrence of the pattern called `draft.name`, creating the
    /// pattern as a `Candidate` if needed. Returns the post-commit pattern.
    pub fn upsert(
        &self,
        draft: &PatternDraft,
        occurrence: OccurrenceDraft,
    ) -> Result<Pattern, RegistryError> {
        self.upsert_with(draft, occurrence, |_| Ok(()))
            .map(|outcome| outcome.pattern)
    }

    /// Like [`upsert`](Self::upsert), running `on_commit` on the pattern
    /// inside the same locked commit, after the occurrence is appended.
    ///
    /// The hook also runs when the occurrence was already present, so a
    /// retried caller re-applies its (idempotent) decision.
    pub fn upsert_with<R, F>(
        &self,
        draft: &PatternDraft,
        occurrence: OccurrenceDraft,
        on_commit: F,
    ) -> Result<UpsertOutcome<R>, RegistryError>
    where
        F: FnOnce(&mut Pattern) -> Result<R, RegistryError>,
    {
        let fingerprint = Fingerprint::from_name(&draft.name)
            .ok_or_else(|| RegistryError::InvalidName(draft.name.clone()))?;
        let key = StoreKey::pattern(&fingerprint);

        self.store.commit_atomic(&key, |slot: &mut Option<Pattern>| {
            let created = slot.is_none();
            let pattern = slot.get_or_insert_with(|| {
                Pattern::new(fingerprint.clone(), draft.name.trim(), occurrence.timestamp)
            });
            pattern.absorb_description(draft.context_description.as_deref(), &draft.steps);

            let appended = pattern.record_occurrence(occurrence.bind(&fingerprint));
            if appended {
                debug!(fingerprint = %fingerprint, created, occurrences = pattern.occurrences().len(), "occurrence recorded");
            } else {
                debug!(fingerprint = %fingerprint, "occurrence already recorded");
            }

            let hook = on_commit(pattern)?;
            Ok(UpsertOutcome {
                pattern: pattern.clone(),
                created,
                appended,
                hook,
            })
        })
    }

    /// Locked read/modify/write of an existing pattern.
    pub fn commit<R, F>(&self, fingerprint: &Fingerprint, mutate: F) -> Result<R, RegistryError>
    where
        F: FnOnce(&mut Pattern) -> Result<R, RegistryError>,
    {
        let key = StoreKey::pattern(fingerprint);
        self.store.commit_atomic(&key, |slot: &mut Option<Pattern>| match slot {
            Some(pattern) => mutate(pattern),
            None => Err(RegistryError::NotFound(fingerprint.clone())),
        })
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Result<Option<Pattern>, RegistryError> {
        Ok(self.store.load(&StoreKey::pattern(fingerprint))?)
    }

    /// Every pattern, ordered by fingerprint.
    pub fn list(&self) -> Result<Vec<Pattern>, RegistryError> {
        let mut patterns = Vec::new();
        for key in self.store.list(PATTERNS_DIR, RECORD_EXT)? {
            if let Some(pattern) = self.store.load::<Pattern>(&key)? {
                patterns.push(pattern);
            }
        }
        Ok(patterns)
    }

    /// Patterns currently in `state` (reporting and audit tooling).
    pub fn list_by_state(&self, state: PatternState) -> Result<Vec<Pattern>, RegistryError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|p| p.state() == state)
            .collect())
    }

    /// Fold `source` into `target` on an explicit reviewer decision.
    ///
    /// Occurrences of the source not yet present in the target are appended
    /// to the target first (running `on_target` in that commit); only then is
    /// the source deprecated with `merged_into = target`. A crash between the
    /// two commits leaves both patterns intact and the merge can be re-run.
    pub fn merge<F>(
        &self,
        target: &Fingerprint,
        source: &Fingerprint,
        on_target: F,
    ) -> Result<MergeOutcome, RegistryError>
    where
        F: FnOnce(&mut Pattern) -> Result<(), RegistryError>,
    {
        let reject = |reason: &str| RegistryError::MergeRejected {
            source_id: source.clone(),
            target: target.clone(),
            reason: reason.to_string(),
        };
        if target == source {
            return Err(reject("a pattern cannot be merged into itself"));
        }

        let source_pattern = self
            .get(source)?
            .ok_or_else(|| RegistryError::NotFound(source.clone()))?;
        if source_pattern.state().is_terminal() {
            return Err(reject(&format!("source is {}", source_pattern.state())));
        }

        let now = Utc::now();
        let (target_pattern, moved) = self.commit(target, |pattern| {
            let mut moved = 0;
            for occ in source_pattern.occurrences() {
                let mut copy = occ.clone();
                copy.pattern_id = target.clone();
                if pattern.record_occurrence(copy) {
                    moved += 1;
                }
            }
            pattern.absorb_description(
                Some(source_pattern.context_description.as_str()),
                &source_pattern.steps_summary,
            );
            if moved > 0 {
                pattern.note_absorbed(source, moved, now);
            }
            on_target(pattern)?;
            Ok((pattern.clone(), moved))
        })?;

        let source_after = self.commit(source, |pattern| {
            if pattern.merged_into() != Some(target) {
                pattern.mark_merged_into(target, now)?;
            }
            Ok(pattern.clone())
        })?;

        info!(target = %target, source = %source, moved, "patterns merged");
        Ok(MergeOutcome {
            target: target_pattern,
            source: source_after,
            moved,
        })
    }
}
