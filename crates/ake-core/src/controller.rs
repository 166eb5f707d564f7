//! Session reflection controller.
//!
//! Invoked once per worker-completion event. Each invocation walks
//!
//! ```text
//! Start → CheckIdempotency ─[marker present]→ Stop (already processed)
//!       → ParseReport → UpdateRegistry/EvaluateLifecycle → ApplyTransition
//!       → RelayMessages → MarkProcessed → Stop
//! ```
//!
//! Lifecycle evaluation runs inside the same registry commit as the
//! occurrence append, so no reader ever sees an occurrence without the state
//! it implies. Nothing is rolled back on failure: occurrences are keyed by
//! `<eventId>#<block>` and messages by content id, so a retried invocation
//! replays the remaining phases without duplicating anything. The marker is
//! only written once every phase has succeeded.

use crate::event::EventDescriptor;
use crate::pattern::{
    apply_evaluation, evaluate, Evaluation, LifecyclePolicy, OccurrenceDraft, PatternDraft,
    PatternRegistry, PatternState, PromotionEngine, PromotionRequest,
};
use crate::relay::{extract_messages, MessageRelay};
use crate::report::parse_report;
use crate::storage::{Store, StoreKey};
use ake_common::schema::default_schema_version;
use ake_common::{AgentId, EventId, Fingerprint};
use ake_config::Config;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Controller phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Start,
    CheckIdempotency,
    ParseReport,
    UpdateRegistry,
    ApplyTransition,
    RelayMessages,
    MarkProcessed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Start => "start",
            Phase::CheckIdempotency => "check_idempotency",
            Phase::ParseReport => "parse_report",
            Phase::UpdateRegistry => "update_registry",
            Phase::ApplyTransition => "apply_transition",
            Phase::RelayMessages => "relay_messages",
            Phase::MarkProcessed => "mark_processed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A controller failure, tagged with the phase it happened in.
#[derive(Debug, Error)]
#[error("{phase}: {error}")]
pub struct ControllerError {
    pub phase: Phase,
    #[source]
    pub error: ake_common::Error,
}

impl ControllerError {
    pub fn new(phase: Phase, error: impl Into<ake_common::Error>) -> Self {
        Self {
            phase,
            error: error.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.error.is_retryable()
    }
}

/// Overall time budget for one invocation, checked between phases.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    limit: Duration,
}

impl Deadline {
    pub fn after(limit: Duration) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    pub fn check(&self, next: Phase) -> Result<(), ControllerError> {
        if self.started.elapsed() >= self.limit {
            return Err(ControllerError::new(
                next,
                ake_common::Error::Timeout {
                    seconds: self.limit.as_secs(),
                    phase: next.to_string(),
                },
            ));
        }
        Ok(())
    }
}

/// Written once an event has been fully processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedEventMarker {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    pub event_id: EventId,
    pub processed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentId>,
    #[serde(default)]
    pub patterns_touched: usize,
    #[serde(default)]
    pub messages_delivered: usize,
}

/// Per-pattern result of one invocation.
#[derive(Debug, Clone, Serialize)]
pub struct PatternUpdate {
    pub fingerprint: Fingerprint,
    pub previous: PatternState,
    pub state: PatternState,
    pub occurrences: usize,
    pub success_rate: f64,
    /// False when this event's occurrence was already recorded.
    pub appended: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub promoted_artifact_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReflectionSummary {
    pub event_id: EventId,
    pub agent: AgentId,
    pub patterns: Vec<PatternUpdate>,
    pub messages_delivered: usize,
    pub messages_skipped: usize,
    pub learnings_shared: usize,
    pub feed_evicted: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReflectionOutcome {
    AlreadyProcessed {
        event_id: EventId,
        processed_at: DateTime<Utc>,
    },
    Processed(ReflectionSummary),
}

/// Persisted diagnostics for a failed invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    pub schema_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    pub phase: String,
    pub kind: String,
    pub code: u32,
    pub retryable: bool,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

/// Write a failure to `logs/errors/<eventId>.json`.
///
/// Best effort: a failure here is logged and otherwise ignored so it never
/// masks the original error.
pub fn write_error_log(
    store: &Store,
    event_id: Option<&EventId>,
    agent: Option<&AgentId>,
    err: &ControllerError,
) {
    let component = match event_id {
        Some(id) => id.storage_component(),
        None => format!("unparsed-{}", uuid::Uuid::new_v4().simple()),
    };
    let entry = ErrorLogEntry {
        schema_version: default_schema_version(),
        event_id: event_id.map(|e| e.to_string()),
        agent: agent.map(|a| a.to_string()),
        phase: err.phase.to_string(),
        kind: err.error.kind().to_string(),
        code: err.error.code(),
        retryable: err.is_retryable(),
        message: err.error.to_string(),
        occurred_at: Utc::now(),
    };
    let key = StoreKey::error_log(&component);
    let written = serde_json::to_vec_pretty(&entry)
        .map_err(|e| e.to_string())
        .and_then(|bytes| store.publish(&key, &bytes).map_err(|e| e.to_string()));
    if let Err(e) = written {
        warn!(key = %key, error = %e, "could not write error log");
    }
}

/// Ties registry, lifecycle, promotion and relay together per event.
#[derive(Debug, Clone)]
pub struct ReflectionController {
    store: Store,
    registry: PatternRegistry,
    policy: LifecyclePolicy,
    promotion: PromotionEngine,
    relay: MessageRelay,
    snippet_max_chars: usize,
    timeout: Duration,
}

impl ReflectionController {
    pub fn new(store: Store, config: &Config) -> Self {
        let registry = PatternRegistry::new(store.clone());
        let policy = LifecyclePolicy::from_config(config);
        Self {
            promotion: PromotionEngine::new(registry.clone(), policy.clone()),
            relay: MessageRelay::new(store.clone(), &config.relay),
            snippet_max_chars: config.relay.snippet_max_chars,
            timeout: config.controller.timeout(),
            store,
            registry,
            policy,
        }
    }

    /// Override the invocation time budget.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Process one event. Failures are also written to the error log.
    pub fn reflect(&self, event: &EventDescriptor) -> Result<ReflectionOutcome, ControllerError> {
        let result = self.run(event);
        match &result {
            Ok(ReflectionOutcome::Processed(summary)) => info!(
                event_id = %event.event_id,
                patterns = summary.patterns.len(),
                delivered = summary.messages_delivered,
                "event processed"
            ),
            Ok(ReflectionOutcome::AlreadyProcessed { .. }) => {
                info!(event_id = %event.event_id, "event already processed")
            }
            Err(err) => {
                warn!(event_id = %event.event_id, phase = %err.phase, error = %err.error, "reflection failed");
                write_error_log(&self.store, Some(&event.event_id), Some(&event.agent), err);
            }
        }
        result
    }

    fn run(&self, event: &EventDescriptor) -> Result<ReflectionOutcome, ControllerError> {
        let deadline = Deadline::after(self.timeout);
        let marker_key = StoreKey::processed_event(&event.event_id);
        debug!(event_id = %event.event_id, phase = %Phase::Start, "reflection started");

        deadline.check(Phase::CheckIdempotency)?;
        let existing: Option<ProcessedEventMarker> = self
            .store
            .load(&marker_key)
            .map_err(|e| ControllerError::new(Phase::CheckIdempotency, e))?;
        if let Some(marker) = existing {
            return Ok(ReflectionOutcome::AlreadyProcessed {
                event_id: marker.event_id,
                processed_at: marker.processed_at,
            });
        }

        deadline.check(Phase::ParseReport)?;
        let report = parse_report(&event.report_text, self.snippet_max_chars)
            .map_err(|e| ControllerError::new(Phase::ParseReport, e))?;
        let mut messages = extract_messages(
            &event.report_text,
            &event.agent,
            &event.event_id,
            event.timestamp,
        );
        debug!(
            event_id = %event.event_id,
            patterns = report.patterns.len(),
            messages = messages.len(),
            learnings = report.learnings.len(),
            "report parsed"
        );

        let now = Utc::now();
        let occurred_at = event.timestamp.unwrap_or(now);
        let mut touched = Vec::with_capacity(report.patterns.len());
        for block in &report.patterns {
            deadline.check(Phase::UpdateRegistry)?;
            let draft = PatternDraft {
                name: block.name.clone(),
                context_description: block.context.clone(),
                steps: block.steps.clone(),
            };
            let occurrence = OccurrenceDraft {
                key: format!("{}#{}", event.event_id, block.index),
                timestamp: occurred_at,
                reporting_agent: event.agent.clone(),
                outcome: block.outcome,
                note: block.note.clone(),
            };
            let policy = &self.policy;
            let outcome = self
                .registry
                .upsert_with(&draft, occurrence, |pattern| {
                    let evaluation = evaluate(pattern, policy, PromotionRequest::None);
                    apply_evaluation(pattern, &evaluation, now)?;
                    Ok(evaluation)
                })
                .map_err(|e| ControllerError::new(Phase::UpdateRegistry, e))?;
            if outcome.hook.should_deprecate {
                info!(fingerprint = %outcome.pattern.id, reason = ?outcome.hook.reason, "pattern deprecated");
            } else if outcome.hook.changed() {
                info!(fingerprint = %outcome.pattern.id, from = %outcome.hook.previous, to = %outcome.hook.state, "pattern advanced");
            }
            touched.push((outcome.pattern, outcome.hook, outcome.appended));
        }

        deadline.check(Phase::ApplyTransition)?;
        let mut updates = Vec::with_capacity(touched.len());
        for (mut pattern, evaluation, appended) in touched {
            let artifact = self
                .apply_promotion(&pattern, &evaluation)
                .map_err(|e| ControllerError::new(Phase::ApplyTransition, e))?;
            if artifact.is_none() && evaluation.should_promote {
                // Lost the promotion to a concurrent deprecation; report what is stored.
                if let Some(current) = self
                    .registry
                    .get(&pattern.id)
                    .map_err(|e| ControllerError::new(Phase::ApplyTransition, e))?
                {
                    pattern = current;
                }
            }
            let state = if artifact.is_some() {
                PatternState::Promoted
            } else {
                pattern.state()
            };
            updates.push(PatternUpdate {
                fingerprint: pattern.id.clone(),
                previous: evaluation.previous,
                state,
                occurrences: pattern.occurrences().len(),
                success_rate: pattern.success_rate(),
                appended,
                promoted_artifact_ref: artifact
                    .or_else(|| pattern.promoted_artifact_ref().map(str::to_string)),
            });
        }

        deadline.check(Phase::RelayMessages)?;
        let delivery = self
            .relay
            .deliver(&mut messages)
            .map_err(|e| ControllerError::new(Phase::RelayMessages, e))?;
        let shared = self
            .relay
            .share_learnings(&event.agent, &report.learnings, occurred_at)
            .map_err(|e| ControllerError::new(Phase::RelayMessages, e))?;

        deadline.check(Phase::MarkProcessed)?;
        let marker = ProcessedEventMarker {
            schema_version: default_schema_version(),
            event_id: event.event_id.clone(),
            processed_at: Utc::now(),
            agent: Some(event.agent.clone()),
            patterns_touched: updates.len(),
            messages_delivered: delivery.delivered.len(),
        };
        let created = self
            .store
            .create_once(&marker_key, &marker)
            .map_err(|e| ControllerError::new(Phase::MarkProcessed, e))?;
        if !created {
            debug!(event_id = %event.event_id, "marker already written by a concurrent invocation");
        }

        Ok(ReflectionOutcome::Processed(ReflectionSummary {
            event_id: event.event_id.clone(),
            agent: event.agent.clone(),
            patterns: updates,
            messages_delivered: delivery.delivered.len(),
            messages_skipped: delivery.skipped.len(),
            learnings_shared: shared.appended,
            feed_evicted: delivery.feed.evicted + shared.evicted,
        }))
    }

    fn apply_promotion(
        &self,
        pattern: &crate::pattern::Pattern,
        evaluation: &Evaluation,
    ) -> Result<Option<String>, crate::pattern::PromotionError> {
        if !evaluation.should_promote || pattern.state().is_terminal() {
            return Ok(None);
        }
        self.promotion.promote(pattern, evaluation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    fn controller(config: &Config) -> (ReflectionController, TempDir) {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path(), config.storage.clone());
        (ReflectionController::new(store, config), dir)
    }

    fn event(id: &str, agent: &str, text: &str) -> EventDescriptor {
        EventDescriptor {
            event_id: EventId::parse(id).unwrap(),
            agent: AgentId::parse(agent).unwrap(),
            report_text: text.to_string(),
            timestamp: None,
        }
    }

    #[test]
    fn test_phase_names() {
        assert_eq!(Phase::CheckIdempotency.to_string(), "check_idempotency");
        assert_eq!(Phase::MarkProcessed.as_str(), "mark_processed");
    }

    #[test]
    fn test_deadline_expired() {
        let deadline = Deadline::after(Duration::ZERO);
        std::thread::sleep(Duration::from_millis(2));
        let err = deadline.check(Phase::RelayMessages).unwrap_err();
        assert_eq!(err.phase, Phase::RelayMessages);
        assert_eq!(err.error.kind(), "timeout");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_processes_then_reports_already_processed() {
        let (c, _dir) = controller(&Config::default());
        let e = event("evt-1", "scout", "PATTERN: cache warmup\nOUTCOME: success\n@kai: cache is warm");

        let first = c.reflect(&e).unwrap();
        let ReflectionOutcome::Processed(summary) = first else {
            panic!("expected processed");
        };
        assert_eq!(summary.patterns.len(), 1);
        assert_eq!(summary.patterns[0].state, PatternState::Candidate);
        assert_eq!(summary.messages_delivered, 1);
        assert!(c.store().exists(&StoreKey::processed_event(&e.event_id)));

        let second = c.reflect(&e).unwrap();
        assert!(matches!(second, ReflectionOutcome::AlreadyProcessed { .. }));
    }

    #[test]
    fn test_malformed_report_writes_error_log_and_no_marker() {
        let (c, dir) = controller(&Config::default());
        let e = event("evt-bad", "scout", "PATTERN: missing outcome");
        let err = c.reflect(&e).unwrap_err();
        assert_eq!(err.phase, Phase::ParseReport);
        assert!(!err.is_retryable());
        assert!(!c.store().exists(&StoreKey::processed_event(&e.event_id)));

        let log = std::fs::read_to_string(dir.path().join("logs/errors/evt-bad.json")).unwrap();
        let entry: ErrorLogEntry = serde_json::from_str(&log).unwrap();
        assert_eq!(entry.kind, "malformed_input");
        assert_eq!(entry.phase, "parse_report");
        assert!(!entry.retryable);
    }

    #[test]
    fn test_auto_promote_policy_promotes_in_controller() {
        let mut config = Config::default();
        config.promotion.auto_promote = Some(ake_config::AutoPromotePolicy {
            min_occurrences: 4,
            min_success_rate: 0.9,
        });
        let (c, dir) = controller(&config);
        let text = "PATTERN: Debug memory leak\nSTEP: snapshot\nOUTCOME: success";
        for i in 0..4 {
            c.reflect(&event(&format!("evt-{i}"), "scout", text)).unwrap();
        }
        let fp = Fingerprint::from_name("Debug memory leak").unwrap();
        let p = c.registry.get(&fp).unwrap().unwrap();
        assert_eq!(p.state(), PatternState::Promoted);
        let artifact = p.promoted_artifact_ref().unwrap();
        assert!(dir.path().join(artifact).is_file());
    }

    #[test]
    fn test_expired_deadline_leaves_no_marker() {
        let (c, _dir) = controller(&Config::default());
        let c = c.with_timeout(Duration::ZERO);
        std::thread::sleep(Duration::from_millis(2));
        let e = event("evt-slow", "scout", "");
        let err = c.reflect(&e).unwrap_err();
        assert_eq!(err.error.kind(), "timeout");
        assert!(!c.store().exists(&StoreKey::processed_event(&e.event_id)));
    }
}
