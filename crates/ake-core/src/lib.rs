//! Agent knowledge evolution core library.
//!
//! This crate turns the structured reports worker agents emit at the end of
//! a session into durable knowledge:
//! - `storage`: per-key locked, atomically replaced JSON records
//! - `pattern`: the pattern registry, lifecycle evaluation and promotion
//! - `relay`: cross-agent inboxes and the bounded shared-knowledge feed
//! - `report`/`event`: parsing of worker reports and completion events
//! - `controller`: the per-event reflection pipeline

pub mod controller;
pub mod event;
pub mod exit_codes;
pub mod logging;
pub mod output;
pub mod pattern;
pub mod pattern_cli;
pub mod relay;
pub mod relay_cli;
pub mod report;
pub mod storage;

pub use controller::{
    write_error_log, ControllerError, Phase, ReflectionController, ReflectionOutcome,
    ReflectionSummary,
};
pub use event::EventDescriptor;
pub use exit_codes::ExitCode;
pub use pattern::{PatternRegistry, PatternState, PromotionEngine};
pub use relay::{FeedStore, InboxStore, MessageRelay};
pub use storage::{Store, StoreKey};
