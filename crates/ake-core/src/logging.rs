//! Diagnostic logging setup.
//!
//! Logs go to stderr so stdout stays machine-readable. The filter comes from
//! `AKE_LOG` when set, otherwise from the verbosity flag.

use clap::ValueEnum;
use tracing_subscriber::EnvFilter;

/// Environment variable holding a `tracing` filter directive.
pub const ENV_LOG: &str = "AKE_LOG";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Filter level for a `-v` count.
pub fn level_for(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

fn build_filter(default_level: &str) -> Result<EnvFilter, String> {
    EnvFilter::try_from_env(ENV_LOG)
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| format!("invalid log filter: {e}"))
}

/// Install the global subscriber. Calling it twice is harmless.
pub fn init_logging(format: LogFormat, verbosity: u8) -> Result<(), String> {
    let filter = build_filter(level_for(verbosity))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);
    let installed = match format {
        LogFormat::Text => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    // A subscriber may already be set (tests, embedding); keep it.
    let _ = installed;
    Ok(())
}
