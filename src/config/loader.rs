//! Configuration loading
//!
//! Loads the YAML document, fills role-aware defaults, and validates the
//! result as a whole before anything else starts.

use std::path::Path;

use tracing::{debug, info};

use super::types::Config;
use crate::error::ConfigError;

/// Load configuration from a YAML file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read, parsed, or validated.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;
    let config = load_config_str(&contents)?;

    info!(
        role = config.role.as_str(),
        protocol = config.transport.protocol.as_str(),
        interface = %config.network.interface,
        "Configuration loaded"
    );

    Ok(config)
}

/// Load configuration from a YAML string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(yaml: &str) -> Result<Config, ConfigError> {
    let mut config: Config =
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.apply_defaults();
    config.validate().map_err(ConfigError::ValidationError)?;

    Ok(config)
}
