//! Configuration loading from disk.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::schema::DiameterConfig;
use crate::config::validation::{validate_config, ValidationError};
use crate::net::tls::TlsError;

/// Faults detected before anything is served.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("nil handler registered for {0}")]
    NilHandler(String),

    #[error("handler already registered for {0}")]
    DuplicateHandler(String),

    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),

    #[error("tls: {0}")]
    Tls(#[from] TlsError),
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<DiameterConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&content)
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<DiameterConfig, ConfigError> {
    let config: DiameterConfig = toml::from_str(content)?;
    validate_config(&config).map_err(ConfigError::Validation)?;

    tracing::debug!(
        bind_address = %config.listener.bind_address,
        tls = config.listener.tls.is_some(),
        "Configuration loaded"
    );
    Ok(config)
}
