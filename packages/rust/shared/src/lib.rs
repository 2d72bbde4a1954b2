//! Shared types, error model, and configuration for Moood.
//!
//! This crate is the foundation depended on by all other Moood crates.
//! It provides:
//! - [`MooodError`]: the unified error type
//! - Domain types ([`Entry`], [`WorkerDescriptor`], [`EntryMetadata`], [`ChangeRecord`])
//! - Configuration ([`AppConfig`], [`RelayOptions`], [`OrchestratorOptions`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    ApiConfig, AppConfig, BatchMode, CorsConfig, OrchestratorConfig, OrchestratorOptions, RelayConfig,
    RelayOptions, StartingPosition, StorageConfig, WorkerConfig, WorkerTarget, config_dir,
    config_file_path, init_config, init_config_at, load_config, load_config_from,
};
pub use error::{MooodError, Result};
pub use types::{
    ChangeRecord, Entry, EntryId, EntryMetadata, ProcessedEntry, WorkerDescriptor, WorkerFailure,
    WorkerResult,
};
