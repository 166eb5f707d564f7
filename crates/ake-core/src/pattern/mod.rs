//! Pattern registry, lifecycle evaluation, and promotion.

pub mod lifecycle;
pub mod promotion;
pub mod registry;
pub mod types;

pub use lifecycle::{apply_evaluation, evaluate, Evaluation, LifecyclePolicy, PromotionRequest};
pub use promotion::{CapabilityArtifact, PromotionEngine, PromotionError};
pub use registry::{
    MergeOutcome, OccurrenceDraft, PatternDraft, PatternRegistry, RegistryError, UpsertOutcome,
};
pub use types::{
    AuditKind, AuditNote, Occurrence, OccurrenceStats, Outcome, Pattern, PatternState,
    TransitionError,
};
