//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]`. Each type implements
//! [`Default`] with production values, and `#[serde(default)]` lets a
//! settings file name only the fields it changes.

mod server;

pub use server::*;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// Loaded from `~/.tavern/settings.json` with defaults applied for missing
/// fields. Environment variables can override specific values.
///
/// ```json
/// {
///   "server": { "name": "Friday Night Game", "port": 4000 },
///   "logging": { "level": "debug" }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TavernSettings {
    /// Application name.
    pub name: String,
    /// Connection server settings.
    pub server: ServerSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl Default for TavernSettings {
    fn default() -> Self {
        Self {
            name: tavern_core::constants::NAME.to_string(),
            server: ServerSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl TavernSettings {
    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.name.trim().is_empty() {
            return Err(SettingsError::invalid("name", "must not be empty"));
        }
        if self.server.max_message_size == 0 {
            return Err(SettingsError::invalid("maxMessageSize", "must be positive"));
        }
        if self.server.handshake_timeout_secs == 0 {
            return Err(SettingsError::invalid("handshakeTimeoutSecs", "must be positive"));
        }
        if self.server.transport.uses_webrtc() && self.server.signaling_url.is_empty() {
            return Err(SettingsError::invalid("signalingUrl", "is required for the webrtc transport"));
        }
        Ok(())
    }
}

/// Logging settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Minimum level or `EnvFilter` directive (`RUST_LOG` wins when set).
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: tavern_core::logging::DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}
