//! Shared types, error model, configuration and pseudonymization for the
//! egressos pipeline.
//!
//! This crate is the foundation depended on by all other egressos crates.
//! It provides:
//! - [`EgressosError`]: the unified error type
//! - [`IdentityHasher`]: keyed one-way identifier hashing
//! - Domain types ([`Month`], [`AgeBrackets`], manifests)
//! - Configuration ([`AppConfig`], [`FetchConfig`], config loading)

pub mod config;
pub mod error;
pub mod identity;
pub mod text;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, FetchConfig, OutputConfig, PathsConfig, PrivacyConfig, RegistryConfig,
    ScheduleConfig, config_dir, config_file_path, init_config, load_config, load_config_from,
    validate_config,
};
pub use error::{EgressosError, Result};
pub use identity::{
    IdentityHasher, JoinKeyMode, PseudonymId, clean_identifier, digits_only, is_valid_cpf,
};
pub use text::{normalize_name, token_set_similarity};
pub use types::{
    AgeBrackets, ArchiveEntry, CURRENT_SCHEMA_VERSION, FileChecksum, Month, OutputManifest,
    RegistryManifest, UNKNOWN_BRACKET,
};
