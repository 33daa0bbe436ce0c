//! # tavern-settings
//!
//! Configuration management with layered sources for the Tavern connection
//! server.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`TavernSettings::default()`]
//! 2. **User file**: `~/.tavern/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `TAVERN_*` overrides (highest priority)
//!
//! Settings are plain values passed explicitly to whatever needs them; there
//! is no process-wide settings singleton.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
