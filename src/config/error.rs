//! Error types for workflow configuration

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid workflow '{name}': {}", errors.join("; "))]
    InvalidWorkflow { name: String, errors: Vec<String> },

    #[error("failed to read workflow file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse workflow file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: Box<toml::de::Error>,
    },
}
