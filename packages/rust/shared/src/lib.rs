//! Shared types, error model, configuration, and collaborator contracts.
//!
//! This crate is the foundation depended on by all other ContentMigrator crates.
//! It provides:
//! - [`MigratorError`]: the unified error type
//! - Domain types ([`Entry`], [`MigrationState`], stage payloads)
//! - Configuration ([`AppConfig`], [`MigrationSettings`], config loading)
//! - Collaborator traits ([`ContentSource`], [`AiProvider`], [`ObjectStore`], [`Destination`])

pub mod collaborators;
pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use collaborators::{
    AiProvider, ContentSource, Destination, ObjectStore, RemoteTaskState, RemoteTaskStatus,
};
pub use config::{
    AiConfig, AppConfig, DestinationConfig, FeaturesConfig, MigrationConfig, MigrationSettings,
    ObjectStoreConfig, PollerConfig, ProviderKind, RateLimitConfig, RateLimitsConfig, RatePeriod,
    RetryConfig, SourceConfig, config_dir, config_file_path, init_config, load_config,
    load_config_from, read_secret, validate_api_key,
};
pub use error::{MigratorError, Result};
pub use types::{
    AssetRef, BodyFormat, DestinationRecord, Document, Enrichment, EnrichmentKind, Entry,
    EntryStatus, EntryTimestamps, LEDGER_FORMAT_VERSION, MigrationState, SourceContent, Stage,
    StageCheckpoint,
};
