//! CLI commands for agent inboxes and the shared-knowledge feed.

use crate::exit_codes::ExitCode;
use crate::output::{emit, fail, CommandContext};
use crate::relay::{FeedStore, InboxResponse, InboxStore, Message};
use ake_common::{AgentId, MessageId, SCHEMA_VERSION};
use chrono::Utc;
use clap::{Args, Subcommand};
use std::fmt::Write as _;

/// Arguments for the inbox command
#[derive(Args, Debug)]
pub struct InboxArgs {
    #[command(subcommand)]
    pub command: InboxCommands,
}

/// Inbox subcommands
#[derive(Subcommand, Debug)]
pub enum InboxCommands {
    /// List messages addressed to an agent
    List {
        /// Recipient agent id
        agent: String,
        /// Only show messages not yet acknowledged
        #[arg(long)]
        unread: bool,
    },
    /// Mark a message as read
    Ack {
        /// Recipient agent id
        agent: String,
        /// Message id as shown by `inbox list`
        message_id: String,
    },
    /// List agents that have an inbox
    Agents,
}

/// Arguments for the feed command
#[derive(Args, Debug)]
pub struct FeedArgs {
    #[command(subcommand)]
    pub command: FeedCommands,
}

/// Feed subcommands
#[derive(Subcommand, Debug)]
pub enum FeedCommands {
    /// Show feed entries, oldest first
    Show,
    /// Print the context block injected into agent prompts
    Inject,
}

fn agent_arg(raw: &str) -> Result<AgentId, ake_common::Error> {
    AgentId::parse(raw).ok_or_else(|| ake_common::Error::MalformedInput(format!("invalid agent id: {raw:?}")))
}

fn render_message(out: &mut String, m: &Message) {
    let marker = if m.is_read() { " " } else { "*" };
    let _ = write!(out, "\n{marker} {}  from @{}: {}", m.id, m.from, m.body);
}

pub fn run_inbox(ctx: &CommandContext, args: &InboxArgs) -> ExitCode {
    let inboxes = InboxStore::new(ctx.store.clone());
    let result = match &args.command {
        InboxCommands::List { agent, unread } => run_list(ctx, &inboxes, agent, *unread),
        InboxCommands::Ack { agent, message_id } => run_ack(ctx, &inboxes, agent, message_id),
        InboxCommands::Agents => run_agents(ctx, &inboxes),
    };
    result.unwrap_or_else(|e| fail(ctx.format, &e))
}

fn run_list(
    ctx: &CommandContext,
    inboxes: &InboxStore,
    agent: &str,
    unread: bool,
) -> Result<ExitCode, ake_common::Error> {
    let agent = agent_arg(agent)?;
    let messages = if unread {
        inboxes.list_unread(&agent)?
    } else {
        inboxes.list(&agent)?
    };
    let response = InboxResponse::new(agent, messages);
    Ok(emit(ctx.format, &response, || {
        let mut out = format!(
            "# Inbox @{} ({} message(s), {} unread)",
            response.agent,
            response.messages.len(),
            response.unread_count
        );
        for m in &response.messages {
            render_message(&mut out, m);
        }
        out
    }))
}

fn run_ack(
    ctx: &CommandContext,
    inboxes: &InboxStore,
    agent: &str,
    message_id: &str,
) -> Result<ExitCode, ake_common::Error> {
    let agent = agent_arg(agent)?;
    let id = MessageId::parse(message_id)
        .ok_or_else(|| ake_common::Error::MalformedInput(format!("invalid message id: {message_id:?}")))?;
    let message = inboxes.acknowledge(&agent, &id)?;
    let output = serde_json::json!({
        "schema_version": SCHEMA_VERSION,
        "acknowledged": message,
    });
    Ok(emit(ctx.format, &output, || {
        format!("Acknowledged {} for @{}", message.id, agent)
    }))
}

fn run_agents(ctx: &CommandContext, inboxes: &InboxStore) -> Result<ExitCode, ake_common::Error> {
    let agents = inboxes.agents()?;
    let output = serde_json::json!({
        "schema_version": SCHEMA_VERSION,
        "agents": agents,
    });
    Ok(emit(ctx.format, &output, || {
        agents
            .iter()
            .map(|a| format!("@{a}"))
            .collect::<Vec<_>>()
            .join("\n")
    }))
}

pub fn run_feed(ctx: &CommandContext, args: &FeedArgs) -> ExitCode {
    let feeds = FeedStore::new(ctx.store.clone(), ctx.config.relay.feed_capacity);
    let feed = match feeds.load() {
        Ok(feed) => feed,
        Err(e) => return fail(ctx.format, &ake_common::Error::from(e)),
    };
    match args.command {
        FeedCommands::Show => {
            let entries: Vec<_> = feed.entries().collect();
            let output = serde_json::json!({
                "schema_version": SCHEMA_VERSION,
                "generated_at": Utc::now().to_rfc3339(),
                "capacity": feeds.capacity(),
                "total": entries.len(),
                "entries": entries,
            });
            emit(ctx.format, &output, || {
                let mut out = format!("# Shared feed ({}/{})", entries.len(), feeds.capacity());
                for e in &entries {
                    let category = e.category.as_ref().map(|c| c.as_str()).unwrap_or("note");
                    let _ = write!(
                        out,
                        "\n  {}  @{:<8} [{}] {}",
                        e.date.format("%Y-%m-%d %H:%M"),
                        e.agent,
                        category,
                        e.learning_snippet
                    );
                }
                out
            })
        }
        FeedCommands::Inject => {
            let block = feed.render_injection();
            let output = serde_json::json!({ "context": block });
            emit(ctx.format, &output, || block.clone())
        }
    }
}
