//! Configuration module
//!
//! One TOML file (`driftwatch.toml`) configures the ingestion, analyzer and
//! vacuum services. Every section is optional and falls back to defaults.

mod defaults;
mod loading;
mod types;
mod validation;

pub use loading::{
    BACKEND_ENV_PREFIX, backends_from_env, create_default_config, load_config,
    load_or_create_config, parse_config,
};
pub use types::{
    AnalyzerConfig, Config, EnsembleConfig, GraphiteConfig, IngestConfig, ListenConfig,
    ListenProtocol, NamespaceConfig, ServiceConfig, StoreConfig, VacuumConfig,
};
