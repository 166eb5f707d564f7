//! Semantic validation of a parsed configuration.

use crate::settings::Config;
use serde::Serialize;

/// A single validation failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Outcome of validating a configuration.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

fn is_rate(v: f64) -> bool {
    v.is_finite() && (0.0..=1.0).contains(&v)
}

/// Check cross-field and range constraints serde cannot express.
pub fn validate(config: &Config) -> ValidationResult {
    let mut errors = Vec::new();
    let lc = &config.lifecycle;

    if !ake_common::schema::is_compatible(&config.schema_version) {
        errors.push(ValidationError::new(
            "schema_version",
            format!("unsupported schema version {}", config.schema_version),
        ));
    }
    if lc.emerging_min_occurrences == 0 {
        errors.push(ValidationError::new(
            "lifecycle.emerging_min_occurrences",
            "must be at least 1",
        ));
    }
    if lc.established_min_successes == 0 {
        errors.push(ValidationError::new(
            "lifecycle.established_min_successes",
            "must be at least 1",
        ));
    }
    if !is_rate(lc.established_min_success_rate) {
        errors.push(ValidationError::new(
            "lifecycle.established_min_success_rate",
            "must be within [0, 1]",
        ));
    }
    if !is_rate(lc.deprecation_max_success_rate) {
        errors.push(ValidationError::new(
            "lifecycle.deprecation_max_success_rate",
            "must be within [0, 1]",
        ));
    }
    if lc.deprecation_max_success_rate >= lc.established_min_success_rate {
        errors.push(ValidationError::new(
            "lifecycle.deprecation_max_success_rate",
            "must be below lifecycle.established_min_success_rate",
        ));
    }
    if let Some(policy) = &config.promotion.auto_promote {
        if !is_rate(policy.min_success_rate) {
            errors.push(ValidationError::new(
                "promotion.auto_promote.min_success_rate",
                "must be within [0, 1]",
            ));
        }
    }
    if config.storage.lock_attempts == 0 {
        errors.push(ValidationError::new(
            "storage.lock_attempts",
            "must be at least 1",
        ));
    }
    if config.storage.backoff_max_ms < config.storage.backoff_base_ms {
        errors.push(ValidationError::new(
            "storage.backoff_max_ms",
            "must not be below storage.backoff_base_ms",
        ));
    }
    if config.relay.feed_capacity == 0 {
        errors.push(ValidationError::new(
            "relay.feed_capacity",
            "must be at least 1",
        ));
    }
    if config.relay.snippet_max_chars == 0 {
        errors.push(ValidationError::new(
            "relay.snippet_max_chars",
            "must be at least 1",
        ));
    }
    if config.controller.timeout_secs == 0 {
        errors.push(ValidationError::new(
            "controller.timeout_secs",
            "must be at least 1",
        ));
    }

    ValidationResult { errors }
}
