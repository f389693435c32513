//! Configuration loading from files and environment variables
//!
//! Backend descriptors can be supplied through indexed environment
//! variables, which then replace the file's `backends` list entirely.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::{info, warn};

use super::types::Config;
use crate::store::BackendDescriptor;

/// Prefix of the indexed backend variables, `DRIFTWATCH_BACKEND_0`, ...
pub const BACKEND_ENV_PREFIX: &str = "DRIFTWATCH_BACKEND_";

/// Collect backends from `DRIFTWATCH_BACKEND_<n>` starting at 0
///
/// Stops at the first missing index. Returns `None` if none are set.
pub fn backends_from_env() -> Result<Option<Vec<BackendDescriptor>>> {
    backends_from(|key| std::env::var(key).ok())
}

fn backends_from(lookup: impl Fn(&str) -> Option<String>) -> Result<Option<Vec<BackendDescriptor>>> {
    let mut backends = Vec::new();
    for index in 0.. {
        let key = format!("{BACKEND_ENV_PREFIX}{index}");
        let Some(value) = lookup(&key) else {
            break;
        };
        let descriptor = value
            .parse::<BackendDescriptor>()
            .with_context(|| format!("Invalid backend in {key}"))?;
        backends.push(descriptor);
    }
    Ok((!backends.is_empty()).then_some(backends))
}

/// Parse configuration text and apply environment overrides
pub fn parse_config(text: &str) -> Result<Config> {
    let mut config: Config = toml::from_str(text)?;
    if let Some(backends) = backends_from_env()? {
        info!(
            "Using {} backend(s) from environment variables (overriding config file)",
            backends.len()
        );
        config.backends = backends;
    }
    config.validate()?;
    Ok(config)
}

/// Load and validate a configuration file
pub fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    parse_config(&text).with_context(|| format!("Failed to load config file '{}'", path.display()))
}

/// Load `path`, writing a default configuration there first if it is missing
pub fn load_or_create_config(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        warn!(
            "Config file '{}' not found, creating default config",
            path.display()
        );
        let text = toml::to_string_pretty(&create_default_config())?;
        std::fs::write(path, text)
            .with_context(|| format!("Failed to write default config '{}'", path.display()))?;
        info!("Created default config file: {}", path.display());
    }
    load_config(path)
}

/// Configuration written when none exists
#[must_use]
pub fn create_default_config() -> Config {
    Config::default()
}
