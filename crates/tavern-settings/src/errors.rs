//! Settings error types.

use std::path::PathBuf;

use thiserror::Error;

/// Why settings could not be loaded or used.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings file exists but could not be read.
    #[error("cannot read {}: {source}", path.display())]
    Read {
        /// File that was being read.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid JSON.
    #[error("malformed settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// A key holds a value the server cannot run with.
    #[error("{key}: {reason}")]
    InvalidValue {
        /// camelCase key as written in the settings file.
        key: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },
}

impl SettingsError {
    pub(crate) fn invalid(key: &'static str, reason: &'static str) -> Self {
        Self::InvalidValue { key, reason }
    }
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;
