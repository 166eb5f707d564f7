//! Agent knowledge evolution configuration loading and validation.
//!
//! This crate provides:
//! - Typed Rust structs for config.json (lifecycle thresholds, lock policy,
//!   relay and controller settings)
//! - Config and store-root resolution (CLI → env → XDG → defaults)
//! - Semantic validation

pub mod resolve;
pub mod settings;
pub mod validate;

pub use resolve::{
    resolve_config, resolve_store_root, ConfigPaths, ResolveError, ResolvedConfig, ENV_CONFIG,
    ENV_STORE,
};
pub use settings::{
    AutoPromotePolicy, Config, ControllerSettings, LifecycleThresholds, LockSettings,
    PromotionSettings, RelaySettings,
};
pub use validate::{validate, ValidationError, ValidationResult};

/// Schema version for configuration files.
pub const CONFIG_SCHEMA_VERSION: &str = "1.0.0";
