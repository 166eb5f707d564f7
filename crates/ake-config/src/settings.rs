//! Configuration types.
//!
//! Every field has a default so an empty `{}` file is a valid configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Complete configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub schema_version: String,
    pub lifecycle: LifecycleThresholds,
    pub promotion: PromotionSettings,
    pub storage: LockSettings,
    pub relay: RelaySettings,
    pub controller: ControllerSettings,
    /// Host worker type name → agent id (e.g. `"General Worker"` → `scout`).
    pub agent_aliases: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            schema_version: crate::CONFIG_SCHEMA_VERSION.to_string(),
            lifecycle: LifecycleThresholds::default(),
            promotion: PromotionSettings::default(),
            storage: LockSettings::default(),
            relay: RelaySettings::default(),
            controller: ControllerSettings::default(),
            agent_aliases: default_agent_aliases(),
        }
    }
}

impl Config {
    /// Resolve a host worker type (or free-form agent name) to an agent id.
    pub fn alias_for<'a>(&'a self, name: &'a str) -> &'a str {
        self.agent_aliases
            .get(name)
            .map(String::as_str)
            .unwrap_or(name)
    }
}

fn default_agent_aliases() -> BTreeMap<String, String> {
    [
        ("Main Orchestrator", "ezio"),
        ("General Worker", "scout"),
        ("general-purpose", "scout"),
        ("Explore", "scout"),
        ("Solution Architect", "sage"),
        ("Plan", "sage"),
        ("AI Engineer", "kai"),
        ("Frontend Engineer", "iris"),
        ("DevOps Engineer", "devo"),
        ("QA Tester", "vera"),
        ("Frontend QA Specialist", "luna"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Occurrence thresholds driving the pattern state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleThresholds {
    /// Occurrences needed to leave `Candidate`.
    pub emerging_min_occurrences: u32,
    /// Successful occurrences needed to become `Established`.
    pub established_min_successes: u32,
    /// Success rate that must be strictly exceeded to become `Established`.
    pub established_min_success_rate: f64,
    /// Occurrences needed before a pattern may be deprecated.
    pub deprecation_min_occurrences: u32,
    /// Success rate strictly below which a pattern is deprecated.
    pub deprecation_max_success_rate: f64,
}

impl Default for LifecycleThresholds {
    fn default() -> Self {
        Self {
            emerging_min_occurrences: 2,
            established_min_successes: 4,
            established_min_success_rate: 0.80,
            deprecation_min_occurrences: 4,
            deprecation_max_success_rate: 0.40,
        }
    }
}

/// When the controller may promote without a human decision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromotionSettings {
    /// `None` means promotion is explicit only.
    pub auto_promote: Option<AutoPromotePolicy>,
}

/// Policy-triggered promotion of `Established` patterns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoPromotePolicy {
    pub min_occurrences: u32,
    /// Inclusive lower bound on the success rate.
    pub min_success_rate: f64,
}

/// Per-key advisory lock acquisition and retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    /// Bounded number of acquisition attempts before `ConcurrencyExhausted`.
    pub lock_attempts: u32,
    /// How long one attempt polls for the lock.
    pub attempt_timeout_ms: u64,
    /// First backoff delay; doubles per attempt.
    pub backoff_base_ms: u64,
    /// Ceiling on a single backoff delay.
    pub backoff_max_ms: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            lock_attempts: 5,
            attempt_timeout_ms: 200,
            backoff_base_ms: 10,
            backoff_max_ms: 500,
        }
    }
}

impl LockSettings {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    /// Un-jittered backoff before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(20)).unwrap_or(u64::MAX);
        let ms = self
            .backoff_base_ms
            .saturating_mul(factor)
            .min(self.backoff_max_ms);
        Duration::from_millis(ms)
    }
}

/// Message relay and shared-knowledge feed settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    pub feed_capacity: usize,
    pub snippet_max_chars: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            feed_capacity: 20,
            snippet_max_chars: 200,
        }
    }
}

/// Per-invocation controller limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSettings {
    pub timeout_secs: u64,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self { timeout_secs: 10 }
    }
}

impl ControllerSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
