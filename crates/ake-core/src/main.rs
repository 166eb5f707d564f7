//! ake-core: agent knowledge evolution CLI.
//!
//! `reflect` is the entry point a host hook calls after each worker session;
//! the remaining commands are for operators reviewing what was learned.

use ake_common::OutputFormat;
use ake_config::{resolve_config, resolve_store_root, ResolveError, ResolvedConfig, ENV_STORE};
use ake_core::controller::{write_error_log, ControllerError, Phase, ReflectionController};
use ake_core::event::EventDescriptor;
use ake_core::exit_codes::ExitCode;
use ake_core::logging::{init_logging, LogFormat};
use ake_core::output::{emit, fail, print_json, CommandContext};
use ake_core::pattern_cli::{run_patterns, PatternsArgs};
use ake_core::relay_cli::{run_feed, run_inbox, FeedArgs, InboxArgs};
use ake_core::storage::Store;
use clap::{Args, Parser, Subcommand};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error};

/// Extra time the watchdog allows past the controller timeout.
const WATCHDOG_GRACE: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "ake-core")]
#[command(version, about = "Agent knowledge evolution: patterns, lifecycle, and message relay")]
struct Cli {
    /// Store root directory
    #[arg(long, global = true, env = ENV_STORE)]
    store: Option<PathBuf>,

    /// Configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Json)]
    format: OutputFormat,

    /// Log format on stderr
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Process one worker-completion event (stdin by default)
    Reflect(ReflectArgs),
    /// Review and curate patterns
    Patterns(PatternsArgs),
    /// Read and acknowledge agent inboxes
    Inbox(InboxArgs),
    /// Inspect the shared-knowledge feed
    Feed(FeedArgs),
    /// Show or validate configuration
    Config(ConfigArgs),
}

#[derive(Args, Debug)]
struct ReflectArgs {
    /// Read the event from this file instead of stdin
    #[arg(long)]
    event_file: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print the effective configuration and where it came from
    Show,
    /// Validate a configuration file (the resolved one by default)
    Validate {
        /// File to validate
        file: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = init_logging(cli.log_format, cli.verbose) {
        eprintln!("{e}");
    }

    let code = match &cli.command {
        Commands::Reflect(args) => run_reflect(&cli, args),
        Commands::Config(args) => run_config(&cli, args),
        Commands::Patterns(args) => with_context(&cli, |ctx| run_patterns(ctx, args)),
        Commands::Inbox(args) => with_context(&cli, |ctx| run_inbox(ctx, args)),
        Commands::Feed(args) => with_context(&cli, |ctx| run_feed(ctx, args)),
    };
    std::process::exit(code.as_i32());
}

fn load_context(cli: &Cli) -> Result<CommandContext, ResolveError> {
    let resolved = resolve_config(cli.config.as_deref())?;
    let root = resolve_store_root(cli.store.as_deref())?;
    debug!(root = %root.display(), config = ?resolved.paths.config_file, "context resolved");
    Ok(CommandContext {
        store: Store::new(root, resolved.config.storage.clone()),
        config: resolved.config,
        format: cli.format,
    })
}

fn with_context(cli: &Cli, run: impl FnOnce(&CommandContext) -> ExitCode) -> ExitCode {
    match load_context(cli) {
        Ok(ctx) => run(&ctx),
        Err(e) => fail(cli.format, &ake_common::Error::from(e)),
    }
}

fn read_event(path: Option<&Path>) -> std::io::Result<String> {
    match path {
        Some(p) => std::fs::read_to_string(p),
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            Ok(buf)
        }
    }
}

/// Exit with a transient code if the invocation outlives its budget.
fn spawn_watchdog(limit: Duration) {
    std::thread::spawn(move || {
        std::thread::sleep(limit + WATCHDOG_GRACE);
        error!(timeout_secs = limit.as_secs(), "reflection exceeded its time budget");
        std::process::exit(ExitCode::Transient.as_i32());
    });
}

fn run_reflect(cli: &Cli, args: &ReflectArgs) -> ExitCode {
    // Configuration and store problems are environmental; the trigger may
    // retry once they are fixed.
    let ctx = match load_context(cli) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!(error = %e, "cannot resolve configuration");
            fail(cli.format, &ake_common::Error::from(e));
            return ExitCode::Transient;
        }
    };
    spawn_watchdog(ctx.config.controller.timeout());

    let input = match read_event(args.event_file.as_deref()) {
        Ok(input) => input,
        // Bytes that are not UTF-8 will never parse; retrying cannot help.
        Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
            let err = ake_common::Error::MalformedInput(format!("event is not valid UTF-8: {e}"));
            return reject_event(&ctx, cli.format, err);
        }
        Err(e) => {
            error!(error = %e, "cannot read event");
            return ExitCode::Transient;
        }
    };

    let event = match EventDescriptor::parse(&input, &ctx.config) {
        Ok(event) => event,
        Err(e) => return reject_event(&ctx, cli.format, e.into()),
    };

    let controller = ReflectionController::new(ctx.store.clone(), &ctx.config);
    match controller.reflect(&event) {
        Ok(outcome) => print_json(&outcome),
        Err(err) => {
            fail(cli.format, &err.error);
            ExitCode::for_reflect(&err.error)
        }
    }
}

/// Log an event that can never be processed and report it as malformed.
fn reject_event(ctx: &CommandContext, format: OutputFormat, error: ake_common::Error) -> ExitCode {
    let err = ControllerError::new(Phase::Start, error);
    error!(phase = %err.phase, error = %err.error, "malformed event");
    write_error_log(&ctx.store, None, None, &err);
    fail(format, &err.error);
    ExitCode::MalformedInput
}

fn run_config(cli: &Cli, args: &ConfigArgs) -> ExitCode {
    match &args.command {
        ConfigCommands::Show => match resolve_config(cli.config.as_deref()) {
            Ok(resolved) => emit(cli.format, &resolved, || describe_config(&resolved)),
            Err(e) => fail(cli.format, &ake_common::Error::from(e)),
        },
        ConfigCommands::Validate { file } => {
            let path = file.as_deref().or(cli.config.as_deref());
            match resolve_config(path) {
                Ok(resolved) => {
                    let output = serde_json::json!({
                        "valid": true,
                        "config_file": resolved.paths.config_file,
                        "using_defaults": resolved.using_defaults,
                    });
                    emit(cli.format, &output, || "config is valid".to_string())
                }
                Err(ResolveError::Invalid { path, errors }) => {
                    let output = serde_json::json!({
                        "valid": false,
                        "config_file": path,
                        "errors": errors,
                    });
                    emit(cli.format, &output, || {
                        errors
                            .iter()
                            .map(|e| format!("{}: {}", e.field, e.message))
                            .collect::<Vec<_>>()
                            .join("\n")
                    });
                    ExitCode::ConfigError
                }
                Err(e) => fail(cli.format, &ake_common::Error::from(e)),
            }
        }
    }
}

fn describe_config(resolved: &ResolvedConfig) -> String {
    let c = &resolved.config;
    let source = match &resolved.paths.config_file {
        Some(p) => format!("{} ({})", p.display(), resolved.paths.source),
        None => "built-in defaults".to_string(),
    };
    let auto = match &c.promotion.auto_promote {
        Some(p) => format!(
            "auto (>= {} occurrences, rate >= {:.2})",
            p.min_occurrences, p.min_success_rate
        ),
        None => "explicit".to_string(),
    };
    [
        format!("# Configuration: {source}"),
        format!(
            "  lifecycle: emerging >= {} occ; established >= {} successes, rate > {:.2}; deprecated >= {} occ, rate < {:.2}",
            c.lifecycle.emerging_min_occurrences,
            c.lifecycle.established_min_successes,
            c.lifecycle.established_min_success_rate,
            c.lifecycle.deprecation_min_occurrences,
            c.lifecycle.deprecation_max_success_rate
        ),
        format!("  promotion: {auto}"),
        format!(
            "  storage: {} lock attempts, {}ms each",
            c.storage.lock_attempts, c.storage.attempt_timeout_ms
        ),
        format!(
            "  relay: feed capacity {}, snippets <= {} chars",
            c.relay.feed_capacity, c.relay.snippet_max_chars
        ),
        format!("  controller: timeout {}s", c.controller.timeout_secs),
        format!("  agent aliases: {}", c.agent_aliases.len()),
    ]
    .join("\n")
}
