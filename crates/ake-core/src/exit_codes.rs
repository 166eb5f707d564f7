//! Exit codes for the ake-core CLI.
//!
//! `reflect` is called by an external trigger that only looks at the exit
//! code, so it sticks to the three-value contract `0/1/2`. The operator
//! commands use the wider range.

use ake_common::Error;

/// Exit codes for ake-core operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Success, including an already-processed event
    Clean = 0,

    /// Transient failure; the trigger may retry
    Transient = 1,

    /// Malformed input; retrying cannot help
    MalformedInput = 2,

    /// Configuration error
    ConfigError = 10,

    /// Unknown pattern/message or a request the state machine refuses
    NotFound = 11,

    /// I/O error
    IoError = 13,

    /// Internal/unknown error
    InternalError = 99,
}

impl ExitCode {
    /// Convert to i32 for process exit.
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn is_success(self) -> bool {
        matches!(self, ExitCode::Clean)
    }

    /// Code reported to the reflection trigger.
    pub fn for_reflect(err: &Error) -> Self {
        if err.is_retryable() {
            ExitCode::Transient
        } else {
            ExitCode::MalformedInput
        }
    }

    /// Code reported by operator commands.
    pub fn for_command(err: &Error) -> Self {
        match err {
            Error::Config(_) => ExitCode::ConfigError,
            Error::NotFound(_) | Error::InvalidTransition { .. } | Error::MalformedInput(_) => {
                ExitCode::NotFound
            }
            Error::StorageIo { .. }
            | Error::ConcurrencyExhausted { .. }
            | Error::InconsistentPromotion { .. } => ExitCode::IoError,
            Error::Timeout { .. } => ExitCode::InternalError,
        }
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reflect_contract() {
        let malformed = Error::MalformedInput("bad".to_string());
        let contention = Error::ConcurrencyExhausted {
            key: "patterns/x.record".to_string(),
            attempts: 5,
        };
        let config = Error::Config("unreadable".to_string());
        assert_eq!(ExitCode::for_reflect(&malformed).as_i32(), 2);
        assert_eq!(ExitCode::for_reflect(&contention).as_i32(), 1);
        assert_eq!(ExitCode::for_reflect(&config).as_i32(), 1);
    }

    #[test]
    fn test_command_codes() {
        assert_eq!(
            ExitCode::for_command(&Error::Config(String::new())),
            ExitCode::ConfigError
        );
        assert_eq!(
            ExitCode::for_command(&Error::NotFound("pattern x".to_string())),
            ExitCode::NotFound
        );
        assert_eq!(i32::from(ExitCode::IoError), 13);
        assert!(ExitCode::Clean.is_success());
        assert!(!ExitCode::Transient.is_success());
    }
}
