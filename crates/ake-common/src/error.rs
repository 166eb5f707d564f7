//! Error taxonomy for agent knowledge evolution.
//!
//! Component crates define their own detailed error enums; they all convert
//! into this type at the controller boundary, where retryability decides the
//! process exit code.

use thiserror::Error;

/// Result type alias for agent knowledge evolution operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Lock contention outlasted every retry.
    #[error("lock contention on {key}: gave up after {attempts} attempts")]
    ConcurrencyExhausted { key: String, attempts: u32 },

    /// The event payload or report could not be parsed.
    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("storage I/O error during {operation} on {key}: {message}")]
    StorageIo {
        operation: String,
        key: String,
        message: String,
    },

    /// The capability artifact exists but the pattern state commit failed.
    #[error("promotion of {fingerprint} is incomplete: {message}")]
    InconsistentPromotion {
        fingerprint: String,
        message: String,
    },

    #[error("invalid state transition for {fingerprint}: {from} -> {to}")]
    InvalidTransition {
        fingerprint: String,
        from: String,
        to: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("timed out after {seconds}s during {phase}")]
    Timeout { seconds: u64, phase: String },
}

impl Error {
    /// Returns the error code for this error type.
    /// Used for detailed error reporting in JSON output and error logs.
    pub fn code(&self) -> u32 {
        match self {
            Error::ConcurrencyExhausted { .. } => 10,
            Error::MalformedInput(_) => 20,
            Error::StorageIo { .. } => 30,
            Error::InconsistentPromotion { .. } => 31,
            Error::InvalidTransition { .. } => 40,
            Error::NotFound(_) => 41,
            Error::Config(_) => 50,
            Error::Timeout { .. } => 60,
        }
    }

    /// Whether re-running the same invocation may succeed.
    ///
    /// Malformed input never becomes well-formed on retry; everything that
    /// depends on disk or contention might.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::MalformedInput(_) => false,
            Error::InvalidTransition { .. } | Error::NotFound(_) => false,
            Error::ConcurrencyExhausted { .. }
            | Error::StorageIo { .. }
            | Error::InconsistentPromotion { .. }
            | Error::Config(_)
            | Error::Timeout { .. } => true,
        }
    }

    /// Short machine-readable kind name.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ConcurrencyExhausted { .. } => "concurrency_exhausted",
            Error::MalformedInput(_) => "malformed_input",
            Error::StorageIo { .. } => "storage_io",
            Error::InconsistentPromotion { .. } => "inconsistent_promotion",
            Error::InvalidTransition { .. } => "invalid_transition",
            Error::NotFound(_) => "not_found",
            Error::Config(_) => "config",
            Error::Timeout { .. } => "timeout",
        }
    }
}
