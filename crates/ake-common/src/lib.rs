//! Agent knowledge evolution common types, IDs, and errors.
//!
//! This crate provides foundational types shared across ake-core modules:
//! - Identity types for patterns, events, agents, and messages
//! - Schema versioning for persisted records
//! - The error taxonomy surfaced to the controller
//! - Output format specifications

pub mod error;
pub mod id;
pub mod output;
pub mod schema;

pub use error::{Error, Result};
pub use id::{safe_component, AgentId, EventId, Fingerprint, MessageId};
pub use output::OutputFormat;
pub use schema::SCHEMA_VERSION;
