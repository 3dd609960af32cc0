//! Building [`RelaySettings`] from defaults, a JSON file and `RELAYMUX_*`
//! variables, in that order.
//!
//! The file only needs the keys it changes. It is laid over the serialized
//! defaults with [`overlay`], so a file holding `{"streams": {"maxChunkBytes":
//! 8192}}` keeps every other stream setting. An explicit `null` leaves the
//! default in place.

use std::path::{Path, PathBuf};

use relaymux_logging::LogFormat;
use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::RelaySettings;

/// Variable naming the settings file directly.
pub const SETTINGS_PATH_VAR: &str = "RELAYMUX_SETTINGS";

/// Where the agent looks for its settings file.
///
/// `$RELAYMUX_SETTINGS` if set, else `$HOME/.relaymux/settings.json`, else
/// `.relaymux/settings.json` under the working directory.
pub fn settings_path() -> PathBuf {
    settings_path_from(|name| std::env::var(name).ok())
}

/// [`settings_path`] against an arbitrary variable lookup.
pub fn settings_path_from<F>(lookup: F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    let set = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
    if let Some(explicit) = set(SETTINGS_PATH_VAR) {
        return PathBuf::from(explicit);
    }
    let base = set("HOME").map_or_else(PathBuf::new, PathBuf::from);
    base.join(".relaymux").join("settings.json")
}

/// Settings from [`settings_path`] plus variable overrides.
pub fn load_settings() -> Result<RelaySettings> {
    load_settings_from_path(&settings_path())
}

/// Settings from `path` plus variable overrides.
///
/// A missing file means defaults. An unreadable or malformed one is an error
/// rather than a silent fallback.
pub fn load_settings_from_path(path: &Path) -> Result<RelaySettings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Defaults with the file at `path` laid over them; no variable overrides.
pub fn load_file_layer(path: &Path) -> Result<RelaySettings> {
    let malformed = |source| SettingsError::Malformed {
        path: path.to_path_buf(),
        source,
    };
    let defaults = serde_json::to_value(RelaySettings::default()).map_err(malformed)?;

    if !path.exists() {
        debug!(?path, "no settings file, using defaults");
        return serde_json::from_value(defaults).map_err(malformed);
    }
    debug!(?path, "loading settings file");
    let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let file: Value = serde_json::from_str(&content).map_err(malformed)?;
    serde_json::from_value(overlay(defaults, file)).map_err(malformed)
}

/// Lay `layer` over `base`.
///
/// Objects combine key by key, recursively. Any other value in `layer`
/// replaces what `base` had, except `null`, which keeps it.
pub fn overlay(base: Value, layer: Value) -> Value {
    match (base, layer) {
        (Value::Object(mut merged), Value::Object(layer)) => {
            for (key, value) in layer.into_iter().filter(|(_, v)| !v.is_null()) {
                let combined = match merged.remove(&key) {
                    Some(existing) => overlay(existing, value),
                    None => value,
                };
                let _ = merged.insert(key, combined);
            }
            Value::Object(merged)
        }
        (_, layer) => layer,
    }
}

/// Apply `RELAYMUX_*` environment variable overrides to loaded settings.
pub fn apply_env_overrides(settings: &mut RelaySettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary variable lookup.
///
/// Integers must parse and fall within range, strings must be non-empty.
/// Invalid values are ignored with a warning (fall back to file/default).
pub fn apply_overrides<F>(settings: &mut RelaySettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    // ── Gateway ─────────────────────────────────────────────────────
    if let Some(v) = env.string("RELAYMUX_GATEWAY_URL") {
        settings.gateway.url = v;
    }
    if let Some(v) = env.u64("RELAYMUX_CONNECT_TIMEOUT_MS", 100, 600_000) {
        settings.gateway.connect_timeout_ms = v;
    }
    if let Some(v) = env.u64("RELAYMUX_RECONNECT_BACKOFF_MS", 100, 3_600_000) {
        settings.gateway.reconnect_backoff_ms = v;
    }

    // ── Identity ────────────────────────────────────────────────────
    if let Some(v) = env.string("RELAYMUX_IDENTITY") {
        settings.identity = Some(v);
    }

    // ── Streams ─────────────────────────────────────────────────────
    if let Some(v) = env.usize("RELAYMUX_MAX_CHUNK_BYTES", 1, 1024 * 1024) {
        settings.streams.max_chunk_bytes = v;
    }
    if let Some(v) = env.usize("RELAYMUX_HIGH_WATER_MARK", 1024, 1024 * 1024 * 1024) {
        settings.streams.high_water_mark_bytes = v;
    }
    if let Some(v) = env.usize("RELAYMUX_LOW_WATER_MARK", 0, 1024 * 1024 * 1024) {
        settings.streams.low_water_mark_bytes = v;
    }

    // ── Logging / metrics ───────────────────────────────────────────
    if let Some(v) = env.string("RELAYMUX_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.log_format("RELAYMUX_LOG_FORMAT") {
        settings.logging.format = v;
    }
    if let Some(v) = env.string("RELAYMUX_METRICS_ADDR") {
        settings.metrics.listen_addr = Some(v);
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Variable readers (thin wrappers) ────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.trim().is_empty())
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        let val = (self.lookup)(name)?;
        let result = parse_usize_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
        }
        result
    }

    fn log_format(&self, name: &str) -> Option<LogFormat> {
        let val = (self.lookup)(name)?;
        match val.parse() {
            Ok(format) => Some(format),
            Err(error) => {
                tracing::warn!(key = name, value = %val, %error, "invalid log format env var, ignoring");
                None
            }
        }
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

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    // ── settings_path ───────────────────────────────────────────────

    #[test]
    fn explicit_settings_path_wins() {
        let path = settings_path_from(lookup_from(&[
            ("RELAYMUX_SETTINGS", "/etc/relaymux.json"),
            ("HOME", "/home/relay"),
        ]));
        assert_eq!(path, PathBuf::from("/etc/relaymux.json"));
    }

    #[test]
    fn settings_path_under_home() {
        let path = settings_path_from(lookup_from(&[("HOME", "/home/relay")]));
        assert_eq!(path, PathBuf::from("/home/relay/.relaymux/settings.json"));
    }

    #[test]
    fn settings_path_without_home_is_relative() {
        let path = settings_path_from(lookup_from(&[("HOME", " ")]));
        assert_eq!(path, PathBuf::from(".relaymux/settings.json"));
    }

    // ── overlay ─────────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({
            "gateway": {"url": "ws://a", "reconnectBackoffMs": 5000}
        });
        let source = serde_json::json!({
            "gateway": {"url": "ws://b"}
        });
        let merged = overlay(target, source);
        assert_eq!(merged["gateway"]["url"], "ws://b");
        assert_eq!(merged["gateway"]["reconnectBackoffMs"], 5000);
    }

    #[test]
    fn merge_null_preserves_target() {
        let target = serde_json::json!({"a": 1, "b": 2});
        let source = serde_json::json!({"a": null});
        let merged = overlay(target, source);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
    }

    #[test]
    fn merge_array_replace() {
        let target = serde_json::json!({"items": [1, 2, 3]});
        let source = serde_json::json!({"items": [4]});
        let merged = overlay(target, source);
        assert_eq!(merged["items"], serde_json::json!([4]));
    }

    #[test]
    fn merge_primitive_replaces_object() {
        let target = serde_json::json!({"a": {"nested": true}});
        let source = serde_json::json!({"a": 42});
        let merged = overlay(target, source);
        assert_eq!(merged["a"], 42);
    }

    #[test]
    fn merge_new_keys_added() {
        let target = serde_json::json!({"a": 1});
        let source = serde_json::json!({"b": 2});
        let merged = overlay(target, source);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
    }

    // ── load_file_layer / load_settings_from_path ───────────────────

    #[test]
    fn load_missing_file_returns_defaults() {
        let path = Path::new("/nonexistent/relaymux/settings.json");
        let settings = load_file_layer(path).unwrap();
        assert_eq!(settings, RelaySettings::default());
    }

    #[test]
    fn load_partial_json_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"gateway": {"url": "wss://relay.example/ws"}, "identity": "bc1qabc", "logging": {"format": "pretty"}}"#,
        )
        .unwrap();

        let settings = load_file_layer(&path).unwrap();
        assert_eq!(settings.gateway.url, "wss://relay.example/ws");
        assert_eq!(settings.gateway.reconnect_backoff_ms, 5000);
        assert_eq!(settings.identity.as_deref(), Some("bc1qabc"));
        assert_eq!(settings.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn load_null_identity_keeps_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"identity": null}"#).unwrap();

        let settings = load_file_layer(&path).unwrap();
        assert!(settings.identity.is_none());
    }

    #[test]
    fn load_invalid_json_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not valid json").unwrap();

        let result = load_settings_from_path(&path);
        assert!(matches!(result.unwrap_err(), SettingsError::Malformed { .. }));
    }

    #[test]
    fn load_wrong_type_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"streams": {"maxChunkBytes": "big"}}"#).unwrap();

        assert!(matches!(load_file_layer(&path).unwrap_err(), SettingsError::Malformed { .. }));
    }

    // ── overrides ───────────────────────────────────────────────────

    #[test]
    fn overrides_apply_valid_values() {
        let mut settings = RelaySettings::default();
        apply_overrides(
            &mut settings,
            lookup_from(&[
                ("RELAYMUX_GATEWAY_URL", "ws://10.0.0.1:9000/ws"),
                ("RELAYMUX_IDENTITY", "bc1qenv"),
                ("RELAYMUX_RECONNECT_BACKOFF_MS", "2500"),
                ("RELAYMUX_MAX_CHUNK_BYTES", "8192"),
                ("RELAYMUX_LOG_FORMAT", "pretty"),
                ("RELAYMUX_METRICS_ADDR", "127.0.0.1:9100"),
            ]),
        );
        assert_eq!(settings.gateway.url, "ws://10.0.0.1:9000/ws");
        assert_eq!(settings.identity.as_deref(), Some("bc1qenv"));
        assert_eq!(settings.gateway.reconnect_backoff_ms, 2500);
        assert_eq!(settings.streams.max_chunk_bytes, 8192);
        assert_eq!(settings.logging.format, LogFormat::Pretty);
        assert_eq!(settings.metrics.listen_addr.as_deref(), Some("127.0.0.1:9100"));
    }

    #[test]
    fn overrides_ignore_invalid_values() {
        let mut settings = RelaySettings::default();
        apply_overrides(
            &mut settings,
            lookup_from(&[
                ("RELAYMUX_RECONNECT_BACKOFF_MS", "soon"),
                ("RELAYMUX_MAX_CHUNK_BYTES", "0"),
                ("RELAYMUX_LOG_FORMAT", "xml"),
                ("RELAYMUX_IDENTITY", "   "),
            ]),
        );
        assert_eq!(settings, RelaySettings::default());
    }

    #[test]
    fn no_overrides_is_identity() {
        let mut settings = RelaySettings::default();
        apply_overrides(&mut settings, |_| None);
        assert_eq!(settings, RelaySettings::default());
    }

    // ── parsers ─────────────────────────────────────────────────────

    #[test]
    fn parse_u64_range_bounds() {
        assert_eq!(parse_u64_range("100", 100, 200), Some(100));
        assert_eq!(parse_u64_range("200", 100, 200), Some(200));
        assert_eq!(parse_u64_range("99", 100, 200), None);
        assert_eq!(parse_u64_range("-1", 0, 200), None);
    }

    #[test]
    fn parse_usize_range_rejects_garbage() {
        assert_eq!(parse_usize_range("4k", 1, 10_000), None);
        assert_eq!(parse_usize_range("", 1, 10_000), None);
        assert_eq!(parse_usize_range("4096", 1, 10_000), Some(4096));
    }
}
