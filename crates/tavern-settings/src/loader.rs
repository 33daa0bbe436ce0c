//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`TavernSettings::default()`]
//! 2. If `~/.tavern/settings.json` exists, deep-merge user values over defaults
//! 3. Apply environment variable overrides (highest priority)
//! 4. Validate the result
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::{TavernSettings, TransportMode};

/// Resolve the path to the settings file (`~/.tavern/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".tavern").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<TavernSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or a value the server cannot
/// run with is an error.
pub fn load_settings_from_path(path: &Path) -> Result<TavernSettings> {
    let mut settings = read_settings_file(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

fn read_settings_file(path: &Path) -> Result<TavernSettings> {
    let defaults = serde_json::to_value(TavernSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides to loaded settings.
///
/// Integers must parse and fall inside their range; booleans accept
/// `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`. Invalid values are
/// ignored with a warning.
pub fn apply_env_overrides(settings: &mut TavernSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup` instead of the process environment.
pub fn apply_overrides(settings: &mut TavernSettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    if let Some(v) = env.u16("TAVERN_PORT", 0, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = env.string("TAVERN_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.string("TAVERN_SERVER_NAME") {
        settings.server.name = v;
    }
    if let Some(v) = env.transport("TAVERN_TRANSPORT") {
        settings.server.transport = v;
    }
    if let Some(v) = env.string("TAVERN_SIGNALING_URL") {
        settings.server.signaling_url = v;
    }
    if let Some(v) = env.u64("TAVERN_HANDSHAKE_TIMEOUT", 1, 3600) {
        settings.server.handshake_timeout_secs = v;
    }
    if let Some(v) = env.u64("TAVERN_REAP_INTERVAL", 0, 3600) {
        settings.server.reap_interval_secs = v;
    }
    if let Some(v) = env.bool("TAVERN_COMPRESSION") {
        settings.server.compression = v;
    }
    if let Some(v) = env.string("TAVERN_LOG_LEVEL") {
        settings.logging.level = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    /// Read `name` through `parse`, warning when the value is present but unusable.
    fn parsed<T>(&self, name: &str, kind: &str, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
        let raw = (self.lookup)(name)?;
        let parsed = parse(raw.trim());
        if parsed.is_none() {
            tracing::warn!(key = name, value = %raw, expected = kind, "ignoring unusable env override");
        }
        parsed
    }

    fn bool(&self, name: &str) -> Option<bool> {
        self.parsed(name, "boolean", parse_bool)
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        self.parsed(name, "port number", |v| parse_u16_range(v, min, max))
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        self.parsed(name, "seconds", |v| parse_u64_range(v, min, max))
    }

    fn transport(&self, name: &str) -> Option<TransportMode> {
        self.parsed(name, "socket, webrtc or both", TransportMode::parse)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SettingsError;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({
            "server": {"port": 51234, "host": "0.0.0.0"}
        });
        let source = serde_json::json!({
            "server": {"port": 4000}
        });
        let merged = deep_merge(target, source);
        assert_eq!(merged["server"]["port"], 4000);
        assert_eq!(merged["server"]["host"], "0.0.0.0");
    }

    #[test]
    fn merge_array_replace() {
        let target = serde_json::json!({"iceServers": [1, 2, 3]});
        let source = serde_json::json!({"iceServers": [4]});
        let merged = deep_merge(target, source);
        assert_eq!(merged["iceServers"], serde_json::json!([4]));
    }

    #[test]
    fn merge_null_preserves_target() {
        let target = serde_json::json!({"a": 1, "b": 2});
        let source = serde_json::json!({"a": null});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
    }

    #[test]
    fn merge_new_keys_added() {
        let merged = deep_merge(serde_json::json!({"a": 1}), serde_json::json!({"b": 2}));
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
    }

    #[test]
    fn merge_primitive_replaces_object() {
        let target = serde_json::json!({"a": {"nested": true}});
        let source = serde_json::json!({"a": 42});
        assert_eq!(deep_merge(target, source)["a"], 42);
    }

    // ── load_settings_from_path ─────────────────────────────────────

    #[test]
    fn missing_file_yields_defaults() {
        let settings = read_settings_file(Path::new("/nonexistent/settings.json")).unwrap();
        assert_eq!(settings.server.port, 51234);
        assert_eq!(settings.name, "tavern");
    }

    #[test]
    fn partial_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"server": {"name": "Friday Game", "reconnect": {"maxAttempts": 3}}}"#,
        )
        .unwrap();

        let settings = read_settings_file(&path).unwrap();
        assert_eq!(settings.server.name, "Friday Game");
        assert_eq!(settings.server.reconnect.max_attempts, 3);
        assert_eq!(settings.server.reconnect.initial_backoff_secs, 1);
        assert_eq!(settings.server.port, 51234);
    }

    #[test]
    fn ice_servers_are_replaced_not_merged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"server": {"iceServers": [{"urls": ["stun:stun.example.org:3478"]}]}}"#,
        )
        .unwrap();

        let settings = read_settings_file(&path).unwrap();
        assert_eq!(settings.server.ice_servers.len(), 1);
        assert!(settings.server.ice_servers[0].username.is_empty());
    }

    #[test]
    fn invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not valid json").unwrap();

        assert!(matches!(
            load_settings_from_path(&path),
            Err(SettingsError::Json(_))
        ));
    }

    #[test]
    fn invalid_value_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server": {"maxMessageSize": 0}}"#).unwrap();

        assert!(matches!(
            load_settings_from_path(&path),
            Err(SettingsError::InvalidValue { key: "maxMessageSize", .. })
        ));
    }

    // ── overrides ───────────────────────────────────────────────────

    #[test]
    fn overrides_apply() {
        let mut settings = TavernSettings::default();
        apply_overrides(
            &mut settings,
            env(&[
                ("TAVERN_PORT", "0"),
                ("TAVERN_SERVER_NAME", "Dungeon"),
                ("TAVERN_TRANSPORT", "both"),
                ("TAVERN_COMPRESSION", "off"),
                ("TAVERN_REAP_INTERVAL", "0"),
                ("TAVERN_LOG_LEVEL", "tavern_server=trace"),
            ]),
        );
        assert_eq!(settings.server.port, 0);
        assert_eq!(settings.server.name, "Dungeon");
        assert_eq!(settings.server.transport, TransportMode::Both);
        assert!(!settings.server.compression);
        assert_eq!(settings.server.reap_interval_secs, 0);
        assert_eq!(settings.logging.level, "tavern_server=trace");
    }

    #[test]
    fn invalid_overrides_are_ignored() {
        let mut settings = TavernSettings::default();
        apply_overrides(
            &mut settings,
            env(&[
                ("TAVERN_PORT", "99999"),
                ("TAVERN_HANDSHAKE_TIMEOUT", "0"),
                ("TAVERN_TRANSPORT", "pigeon"),
                ("TAVERN_COMPRESSION", "maybe"),
                ("TAVERN_HOST", ""),
            ]),
        );
        let defaults = TavernSettings::default();
        assert_eq!(settings.server.port, defaults.server.port);
        assert_eq!(
            settings.server.handshake_timeout_secs,
            defaults.server.handshake_timeout_secs
        );
        assert_eq!(settings.server.transport, defaults.server.transport);
        assert_eq!(settings.server.compression, defaults.server.compression);
        assert_eq!(settings.server.host, defaults.server.host);
    }

    // ── parsers ─────────────────────────────────────────────────────

    #[test]
    fn parse_bool_variants() {
        for val in &["true", "1", "yes", "on", "TRUE", "On"] {
            assert_eq!(parse_bool(val), Some(true), "failed for {val}");
        }
        for val in &["false", "0", "no", "off", "FALSE"] {
            assert_eq!(parse_bool(val), Some(false), "failed for {val}");
        }
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn parse_u16_bounds() {
        assert_eq!(parse_u16_range("4000", 0, 65535), Some(4000));
        assert_eq!(parse_u16_range("0", 1, 65535), None);
        assert_eq!(parse_u16_range("99999", 0, 65535), None);
        assert_eq!(parse_u16_range("abc", 0, 65535), None);
    }

    #[test]
    fn parse_u64_bounds() {
        assert_eq!(parse_u64_range("30", 1, 3600), Some(30));
        assert_eq!(parse_u64_range("0", 1, 3600), None);
        assert_eq!(parse_u64_range("4000", 1, 3600), None);
    }
}
