//! Server configuration.
//!
//! Loading flow:
//! 1. Start with compiled [`ServerConfig::default()`]
//! 2. If a settings file is given and exists, deep-merge its values over defaults
//! 3. Apply `RELAY_*` environment variable overrides
//!
//! Command-line flags are applied last by the binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::errors::ConfigError;

/// Paths served by the HTTP status endpoints.
const RESERVED_PATHS: [&str; 4] = ["/", "/status", "/health", "/metrics"];

/// Configuration for the relay server.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    /// Host to bind (default `"0.0.0.0"`, all interfaces).
    pub host: String,
    /// Port to bind (default `8080`, `0` for auto-assign).
    pub port: u16,
    /// Path of the `WebSocket` upgrade endpoint.
    pub path: String,
    /// Seconds between keepalive probes sent to each peer.
    pub keepalive_interval_secs: u64,
    /// Upper bound on the shutdown drain, in seconds.
    pub shutdown_timeout_secs: u64,
    /// Largest inbound payload dispatched, in bytes.
    pub max_message_size: usize,
    /// Capacity of each peer's outbound queue.
    pub send_queue_capacity: usize,
    /// Broadcast join/leave notices to the other peers.
    pub announce_presence: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            path: "/cli/ws".into(),
            keepalive_interval_secs: 30,
            shutdown_timeout_secs: 10,
            max_message_size: 1024 * 1024, // 1 MiB
            send_queue_capacity: 256,
            announce_presence: true,
        }
    }
}

impl ServerConfig {
    /// Keepalive probe interval.
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs.max(1))
    }

    /// Shutdown drain bound.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// `host:port` string handed to the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.path.starts_with('/') {
            return Err(ConfigError::InvalidValue(format!(
                "path must start with '/': {}",
                self.path
            )));
        }
        if RESERVED_PATHS.contains(&self.path.as_str()) {
            return Err(ConfigError::InvalidValue(format!(
                "path collides with an HTTP endpoint: {}",
                self.path
            )));
        }
        if self.send_queue_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "send_queue_capacity must be at least 1".into(),
            ));
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::InvalidValue(
                "max_message_size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Resolve the default settings file path (`~/.relay/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".relay").join("settings.json")
}

/// Load configuration from a settings file with process env overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_config_from_path(path: &Path) -> Result<ServerConfig, ConfigError> {
    let mut config = load_file_layer(path)?;
    apply_env_overrides(&mut config, |name| std::env::var(name).ok());
    config.validate()?;
    Ok(config)
}

fn load_file_layer(path: &Path) -> Result<ServerConfig, ConfigError> {
    let defaults = serde_json::to_value(ServerConfig::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
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

/// Apply `RELAY_*` overrides read through `lookup`.
///
/// Out-of-range or unparsable values are logged and ignored.
pub fn apply_env_overrides<F>(config: &mut ServerConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(v) = read("RELAY_HOST") {
        config.host = v;
    }
    if let Some(v) = read("RELAY_PORT") {
        match parse_u16_range(&v, 0, 65535) {
            Some(port) => config.port = port,
            None => tracing::warn!(key = "RELAY_PORT", value = %v, "invalid u16 env var, ignoring"),
        }
    }
    if let Some(v) = read("RELAY_WS_PATH") {
        config.path = v;
    }
    if let Some(v) = read("RELAY_KEEPALIVE_INTERVAL") {
        match parse_u64_range(&v, 1, 3600) {
            Some(secs) => config.keepalive_interval_secs = secs,
            None => tracing::warn!(
                key = "RELAY_KEEPALIVE_INTERVAL",
                value = %v,
                "invalid u64 env var, ignoring"
            ),
        }
    }
    if let Some(v) = read("RELAY_SHUTDOWN_TIMEOUT") {
        match parse_u64_range(&v, 0, 600) {
            Some(secs) => config.shutdown_timeout_secs = secs,
            None => tracing::warn!(
                key = "RELAY_SHUTDOWN_TIMEOUT",
                value = %v,
                "invalid u64 env var, ignoring"
            ),
        }
    }
    if let Some(v) = read("RELAY_ANNOUNCE_PRESENCE") {
        match parse_bool(&v) {
            Some(b) => config.announce_presence = b,
            None => tracing::warn!(
                key = "RELAY_ANNOUNCE_PRESENCE",
                value = %v,
                "invalid boolean env var, ignoring"
            ),
        }
    }
}

// Pure parsing, testable without env vars.

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

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_match_wire_contract() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.path, "/cli/ws");
        assert_eq!(cfg.keepalive_interval(), Duration::from_secs(30));
        assert!(cfg.announce_presence);
    }

    #[test]
    fn bind_addr_joins_host_and_port() {
        let cfg = ServerConfig {
            host: "127.0.0.1".into(),
            port: 9000,
            ..ServerConfig::default()
        };
        assert_eq!(cfg.bind_addr(), "127.0.0.1:9000");
    }

    #[test]
    fn keepalive_interval_never_zero() {
        let cfg = ServerConfig {
            keepalive_interval_secs: 0,
            ..ServerConfig::default()
        };
        assert_eq!(cfg.keepalive_interval(), Duration::from_secs(1));
    }

    #[test]
    fn validate_rejects_relative_path() {
        let cfg = ServerConfig {
            path: "cli/ws".into(),
            ..ServerConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn validate_rejects_reserved_path() {
        let cfg = ServerConfig {
            path: "/status".into(),
            ..ServerConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn validate_rejects_zero_queue() {
        let cfg = ServerConfig {
            send_queue_capacity: 0,
            ..ServerConfig::default()
        };
        assert!(cfg.validate().is_err());
        assert!(ServerConfig::default().validate().is_ok());
    }

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"server": {"port": 8080, "host": "localhost"}});
        let source = serde_json::json!({"server": {"port": 9090}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["server"]["port"], 9090);
        assert_eq!(merged["server"]["host"], "localhost");
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
    fn merge_array_replace() {
        let target = serde_json::json!({"items": [1, 2, 3]});
        let source = serde_json::json!({"items": [4, 5]});
        let merged = deep_merge(target, source);
        assert_eq!(merged["items"], serde_json::json!([4, 5]));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_file_layer(&dir.path().join("nope.json")).unwrap();
        assert_eq!(cfg, ServerConfig::default());
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"port": 9191, "keepalive_interval_secs": 10}"#).unwrap();
        let cfg = load_file_layer(&path).unwrap();
        assert_eq!(cfg.port, 9191);
        assert_eq!(cfg.keepalive_interval_secs, 10);
        assert_eq!(cfg.path, "/cli/ws");
    }

    #[test]
    fn invalid_json_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(load_file_layer(&path), Err(ConfigError::Json(_))));
    }

    #[test]
    fn env_overrides_apply() {
        let mut cfg = ServerConfig::default();
        apply_env_overrides(
            &mut cfg,
            env(&[
                ("RELAY_HOST", "127.0.0.1"),
                ("RELAY_PORT", "9999"),
                ("RELAY_WS_PATH", "/relay"),
                ("RELAY_KEEPALIVE_INTERVAL", "15"),
                ("RELAY_ANNOUNCE_PRESENCE", "off"),
            ]),
        );
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 9999);
        assert_eq!(cfg.path, "/relay");
        assert_eq!(cfg.keepalive_interval_secs, 15);
        assert!(!cfg.announce_presence);
    }

    #[test]
    fn invalid_env_values_ignored() {
        let mut cfg = ServerConfig::default();
        apply_env_overrides(
            &mut cfg,
            env(&[
                ("RELAY_PORT", "not-a-port"),
                ("RELAY_KEEPALIVE_INTERVAL", "0"),
                ("RELAY_HOST", ""),
            ]),
        );
        assert_eq!(cfg, ServerConfig::default());
    }

    #[test]
    fn parse_bool_variants() {
        assert_eq!(parse_bool("YES"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_u16_range("80", 1, 100), Some(80));
        assert_eq!(parse_u16_range("0", 1, 100), None);
        assert_eq!(parse_u64_range("3601", 1, 3600), None);
    }
}
