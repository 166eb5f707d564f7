//! Shared plumbing for operator commands: context and result printing.

use crate::exit_codes::ExitCode;
use crate::storage::Store;
use ake_common::{Fingerprint, OutputFormat};
use ake_config::Config;
use serde::Serialize;
use serde_json::json;

/// Everything a command needs after global flags are resolved.
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub store: Store,
    pub config: Config,
    pub format: OutputFormat,
}

/// Print `value` as pretty JSON on stdout.
pub fn print_json<T: Serialize>(value: &T) -> ExitCode {
    match serde_json::to_string_pretty(value) {
        Ok(text) => {
            println!("{text}");
            ExitCode::Clean
        }
        Err(e) => {
            eprintln!("failed to serialize output: {e}");
            ExitCode::InternalError
        }
    }
}

/// Print `value` as JSON, or the text rendering in text mode.
pub fn emit<T: Serialize>(format: OutputFormat, value: &T, text: impl FnOnce() -> String) -> ExitCode {
    match format {
        OutputFormat::Json => print_json(value),
        OutputFormat::Text => {
            println!("{}", text());
            ExitCode::Clean
        }
    }
}

/// Report a command failure on stderr and pick its exit code.
pub fn fail(format: OutputFormat, err: &ake_common::Error) -> ExitCode {
    let code = ExitCode::for_command(err);
    match format {
        OutputFormat::Json => {
            let body = json!({
                "error": {
                    "kind": err.kind(),
                    "code": err.code(),
                    "message": err.to_string(),
                }
            });
            eprintln!("{body}");
        }
        OutputFormat::Text => eprintln!("error: {err}"),
    }
    code
}

/// Accept either a fingerprint or a pattern name on the command line.
pub fn fingerprint_arg(raw: &str) -> Result<Fingerprint, ake_common::Error> {
    Fingerprint::parse(raw)
        .or_else(|| Fingerprint::from_name(raw))
        .ok_or_else(|| ake_common::Error::MalformedInput(format!("not a pattern name: {raw:?}")))
}
