//! Settings loading: compiled defaults, then the JSON file deep-merged on
//! top, then `RELAY_*` environment overrides.
//!
//! Merge rules: objects merge per key, arrays and primitives are replaced,
//! `null` in the file keeps the default.

use std::path::{Path, PathBuf};

use relay_core::OutputLevel;
use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{relay_home, RelaySettings};

/// `~/.hapi-relay/settings.json`.
pub fn settings_path() -> PathBuf {
    relay_home().join("settings.json")
}

pub fn load_settings() -> Result<RelaySettings> {
    load_settings_from_path(&settings_path())
}

/// Load from `path` with env overrides applied.
///
/// A missing file yields defaults; an unreadable or malformed one is an error.
pub fn load_settings_from_path(path: &Path) -> Result<RelaySettings> {
    let defaults = serde_json::to_value(RelaySettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: RelaySettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

pub fn apply_env_overrides(settings: &mut RelaySettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary lookup. Empty values are ignored,
/// as are values that fail to parse.
pub fn apply_overrides(settings: &mut RelaySettings, lookup: impl Fn(&str) -> Option<String>) {
    let read = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

    if let Some(v) = read("RELAY_ENDPOINT") {
        settings.endpoint = v;
    }
    if let Some(v) = read("RELAY_ACCESS_TOKEN") {
        settings.access_token = v;
    }
    if let Some(v) = read("RELAY_PROXY_URL") {
        settings.proxy_url = Some(v);
    }
    if let Some(v) = read("RELAY_OUTPUT_LEVEL") {
        match v.parse::<OutputLevel>() {
            Ok(level) => settings.output_level = level,
            Err(e) => tracing::warn!(key = "RELAY_OUTPUT_LEVEL", value = %v, error = %e, "ignoring env override"),
        }
    }
    if let Some(v) = read("RELAY_LOG_LEVEL") {
        settings.log_level = v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn deep_merge_nested_objects() {
        let merged = deep_merge(
            json!({"a": {"x": 1, "y": 2}, "b": [1, 2]}),
            json!({"a": {"y": 3}, "b": [9]}),
        );
        assert_eq!(merged, json!({"a": {"x": 1, "y": 3}, "b": [9]}));
    }

    #[test]
    fn deep_merge_skips_null() {
        let merged = deep_merge(json!({"a": 1}), json!({"a": null, "b": 2}));
        assert_eq!(merged, json!({"a": 1, "b": 2}));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let s = load_settings_from_path(&dir.path().join("absent.json")).unwrap();
        assert_eq!(s.debounce_ms, 500);
        assert_eq!(s.jwt_lifetime_secs, 900);
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"endpoint": "https://hapi.example", "outputLevel": "simple", "webhooks": ["http://hook"], "proxyUrl": null}"#,
        )
        .unwrap();
        let s = load_settings_from_path(&path).unwrap();
        assert_eq!(s.endpoint, "https://hapi.example");
        assert_eq!(s.output_level, OutputLevel::Simple);
        assert_eq!(s.webhooks, vec!["http://hook".to_string()]);
        assert_eq!(s.notify_chunk_len, 4200);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(load_settings_from_path(&path).is_err());
    }

    #[test]
    fn wrong_type_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"debounceMs": "soon"}"#).unwrap();
        assert!(load_settings_from_path(&path).is_err());
    }

    #[test]
    fn overrides_from_lookup() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("RELAY_ENDPOINT", "https://env.example"),
            ("RELAY_ACCESS_TOKEN", "env-token"),
            ("RELAY_OUTPUT_LEVEL", "silence"),
            ("RELAY_LOG_LEVEL", ""),
        ]);
        let mut s = RelaySettings::default();
        apply_overrides(&mut s, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(s.endpoint, "https://env.example");
        assert_eq!(s.access_token, "env-token");
        assert_eq!(s.output_level, OutputLevel::Silence);
        assert_eq!(s.log_level, "info");
        assert!(s.proxy_url.is_none());
    }

    #[test]
    fn invalid_output_level_override_is_ignored() {
        let mut s = RelaySettings::default();
        apply_overrides(&mut s, |k| (k == "RELAY_OUTPUT_LEVEL").then(|| "loud".to_string()));
        assert_eq!(s.output_level, OutputLevel::Detail);
    }
}
