//! CLI commands for reviewing and curating patterns.
//!
//! Provides list, show, promote, deprecate, and merge subcommands. Promotion
//! and merging are the explicit reviewer decisions the controller never
//! makes on its own (unless an auto-promote policy is configured).

use crate::exit_codes::ExitCode;
use crate::output::{emit, fail, fingerprint_arg, CommandContext};
use crate::pattern::{
    apply_evaluation, evaluate, LifecyclePolicy, Pattern, PatternRegistry, PatternState,
    PromotionEngine, PromotionRequest,
};
use ake_common::SCHEMA_VERSION;
use chrono::Utc;
use clap::{Args, Subcommand};
use serde::Serialize;
use std::fmt::Write as _;

/// Arguments for the patterns command
#[derive(Args, Debug)]
pub struct PatternsArgs {
    #[command(subcommand)]
    pub command: PatternsCommands,
}

/// Pattern subcommands
#[derive(Subcommand, Debug)]
pub enum PatternsCommands {
    /// List patterns, optionally filtered by state
    List {
        /// Only show patterns in this state (candidate, emerging, established, promoted, deprecated)
        #[arg(long)]
        state: Option<String>,
    },
    /// Show one pattern with its full occurrence history
    Show {
        /// Pattern fingerprint or name
        pattern: String,
    },
    /// Promote an established pattern into a capability artifact
    Promote {
        /// Pattern fingerprint or name
        pattern: String,
    },
    /// Deprecate a pattern
    Deprecate {
        /// Pattern fingerprint or name
        pattern: String,
        /// Why the pattern is being retired
        #[arg(long)]
        reason: String,
    },
    /// Fold a duplicate pattern into another one
    Merge {
        /// Pattern that keeps living
        target: String,
        /// Pattern merged away (deprecated afterwards)
        source: String,
    },
}

#[derive(Debug, Serialize)]
struct PatternRow<'a> {
    fingerprint: &'a str,
    name: &'a str,
    state: PatternState,
    occurrences: usize,
    success_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    promoted_artifact_ref: Option<&'a str>,
}

impl<'a> From<&'a Pattern> for PatternRow<'a> {
    fn from(p: &'a Pattern) -> Self {
        Self {
            fingerprint: p.id.as_str(),
            name: &p.name,
            state: p.state(),
            occurrences: p.occurrences().len(),
            success_rate: p.success_rate(),
            promoted_artifact_ref: p.promoted_artifact_ref(),
        }
    }
}

pub fn run_patterns(ctx: &CommandContext, args: &PatternsArgs) -> ExitCode {
    let result = match &args.command {
        PatternsCommands::List { state } => run_list(ctx, state.as_deref()),
        PatternsCommands::Show { pattern } => run_show(ctx, pattern),
        PatternsCommands::Promote { pattern } => run_promote(ctx, pattern),
        PatternsCommands::Deprecate { pattern, reason } => run_deprecate(ctx, pattern, reason),
        PatternsCommands::Merge { target, source } => run_merge(ctx, target, source),
    };
    result.unwrap_or_else(|e| fail(ctx.format, &e))
}

fn engine(ctx: &CommandContext) -> PromotionEngine {
    PromotionEngine::new(
        PatternRegistry::new(ctx.store.clone()),
        LifecyclePolicy::from_config(&ctx.config),
    )
}

fn run_list(ctx: &CommandContext, state: Option<&str>) -> Result<ExitCode, ake_common::Error> {
    let registry = PatternRegistry::new(ctx.store.clone());
    let patterns = match state {
        Some(s) => {
            let state = s.parse::<PatternState>().map_err(ake_common::Error::MalformedInput)?;
            registry.list_by_state(state)?
        }
        None => registry.list()?,
    };
    let rows: Vec<PatternRow<'_>> = patterns.iter().map(PatternRow::from).collect();
    let output = serde_json::json!({
        "schema_version": SCHEMA_VERSION,
        "generated_at": Utc::now().to_rfc3339(),
        "total": rows.len(),
        "patterns": rows,
    });
    Ok(emit(ctx.format, &output, || {
        let mut out = format!("# Patterns ({} total)\n", rows.len());
        for row in &rows {
            let _ = write!(
                out,
                "\n  {:<32} {:<12} {:>4} occ  {:>5.1}%  {}",
                row.fingerprint,
                row.state,
                row.occurrences,
                row.success_rate * 100.0,
                row.name
            );
        }
        out
    }))
}

fn describe(p: &Pattern) -> String {
    let mut out = format!("# Pattern: {} ({})\n\n", p.name, p.id);
    let _ = writeln!(out, "  State: {}", p.state());
    let _ = writeln!(
        out,
        "  Occurrences: {} ({} successful, {:.1}%)",
        p.occurrences().len(),
        p.stats().successes,
        p.success_rate() * 100.0
    );
    let _ = writeln!(out, "  First seen: {}", p.first_seen.to_rfc3339());
    let _ = writeln!(out, "  Last seen: {}", p.last_seen.to_rfc3339());
    if !p.context_description.is_empty() {
        let _ = writeln!(out, "  Context: {}", p.context_description);
    }
    for (i, step) in p.steps_summary.iter().enumerate() {
        let _ = writeln!(out, "  Step {}: {}", i + 1, step);
    }
    if let Some(artifact) = p.promoted_artifact_ref() {
        let _ = writeln!(out, "  Artifact: {artifact}");
    }
    if let Some(target) = p.merged_into() {
        let _ = writeln!(out, "  Merged into: {target}");
    }
    for note in p.audit() {
        let _ = writeln!(out, "  Audit [{:?}] {}: {}", note.kind, note.timestamp.to_rfc3339(), note.detail);
    }
    out.trim_end().to_string()
}

fn run_show(ctx: &CommandContext, raw: &str) -> Result<ExitCode, ake_common::Error> {
    let fp = fingerprint_arg(raw)?;
    let pattern = PatternRegistry::new(ctx.store.clone())
        .get(&fp)?
        .ok_or_else(|| ake_common::Error::NotFound(format!("pattern {fp}")))?;
    let evaluation = evaluate(
        &pattern,
        &LifecyclePolicy::from_config(&ctx.config),
        PromotionRequest::None,
    );
    let output = serde_json::json!({
        "schema_version": SCHEMA_VERSION,
        "pattern": pattern,
        "evaluation": evaluation,
    });
    Ok(emit(ctx.format, &output, || describe(&pattern)))
}

fn run_promote(ctx: &CommandContext, raw: &str) -> Result<ExitCode, ake_common::Error> {
    let fp = fingerprint_arg(raw)?;
    let pattern = engine(ctx).promote_explicit(&fp)?;
    let output = serde_json::json!({
        "schema_version": SCHEMA_VERSION,
        "promoted": PatternRow::from(&pattern),
    });
    Ok(emit(ctx.format, &output, || {
        format!(
            "Promoted {} -> {}",
            pattern.id,
            pattern.promoted_artifact_ref().unwrap_or("-")
        )
    }))
}

fn run_deprecate(ctx: &CommandContext, raw: &str, reason: &str) -> Result<ExitCode, ake_common::Error> {
    let fp = fingerprint_arg(raw)?;
    let pattern = engine(ctx).deprecate(&fp, reason)?;
    let output = serde_json::json!({
        "schema_version": SCHEMA_VERSION,
        "deprecated": PatternRow::from(&pattern),
        "reason": reason,
    });
    Ok(emit(ctx.format, &output, || format!("Deprecated {}: {}", pattern.id, reason)))
}

fn run_merge(ctx: &CommandContext, target: &str, source: &str) -> Result<ExitCode, ake_common::Error> {
    let target = fingerprint_arg(target)?;
    let source = fingerprint_arg(source)?;
    let policy = LifecyclePolicy::from_config(&ctx.config);
    let registry = PatternRegistry::new(ctx.store.clone());
    let merged = registry.merge(&target, &source, |p| {
        let evaluation = evaluate(p, &policy, PromotionRequest::None);
        apply_evaluation(p, &evaluation, Utc::now())?;
        Ok(())
    })?;
    let output = serde_json::json!({
        "schema_version": SCHEMA_VERSION,
        "target": PatternRow::from(&merged.target),
        "source": PatternRow::from(&merged.source),
        "moved_occurrences": merged.moved,
    });
    Ok(emit(ctx.format, &output, || {
        format!(
            "Merged {} into {} ({} occurrence(s) moved); {} is now {}",
            merged.source.id,
            merged.target.id,
            merged.moved,
            merged.target.id,
            merged.target.state()
        )
    }))
}
