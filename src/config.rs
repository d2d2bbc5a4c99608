//! Configuration module for alertwatch.
//!
//! Process settings come from environment variables with sensible defaults.
//! Watch groups and delivery settings come from a JSON document.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::watch::{WatchSpec, DEVICE_ALL_SUFFIX};

/// Reserved top-level key holding [`PublishSettings`].
pub const PUBLISH_SETTINGS_KEY: &str = "publish-settings";

const DEFAULT_CONFIG_PATH: &str = "alertwatch.json";

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the RPC and status API (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "alertwatch.db")
    pub db_path: String,
    /// Path to the watch configuration (default: "alertwatch.json")
    pub config_path: String,
    /// Whether `config_path` was given explicitly.
    pub config_path_explicit: bool,
    /// This instance's identity (default: "alertwatch")
    pub identity: String,
    /// Key peers must present when forwarding alerts here.
    pub server_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "alertwatch.db".to_string(),
            config_path: DEFAULT_CONFIG_PATH.to_string(),
            config_path_explicit: false,
            identity: "alertwatch".to_string(),
            server_key: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `ALERTWATCH_HTTP_PORT`: HTTP port (default: 8080)
    /// - `ALERTWATCH_DB_PATH`: Database file path (default: "alertwatch.db")
    /// - `ALERTWATCH_CONFIG`: Watch configuration file (default: "alertwatch.json")
    /// - `ALERTWATCH_IDENTITY`: Instance identity (default: "alertwatch")
    /// - `ALERTWATCH_SERVER_KEY`: Required key for incoming remote alerts
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(port_str) = env::var("ALERTWATCH_HTTP_PORT") {
            if let Ok(port) = port_str.parse() {
                cfg.http_port = port;
            }
        }

        if let Ok(db_path) = env::var("ALERTWATCH_DB_PATH") {
            cfg.db_path = db_path;
        }

        if let Ok(config_path) = env::var("ALERTWATCH_CONFIG") {
            cfg.config_path = config_path;
            cfg.config_path_explicit = true;
        }

        if let Ok(identity) = env::var("ALERTWATCH_IDENTITY") {
            cfg.identity = identity;
        }

        cfg.server_key = env::var("ALERTWATCH_SERVER_KEY").ok().filter(|k| !k.is_empty());

        cfg
    }
}

/// Watch configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("configuration must be a JSON object")]
    NotAnObject,
    #[error("group {0}: value must be an object of topic watches")]
    InvalidGroup(String),
    #[error("topic {topic}: {reason}")]
    InvalidWatch { topic: String, reason: String },
    #[error("publish-remote is enabled but no remote block is configured")]
    MissingRemote,
    #[error("invalid publish-settings: {0}")]
    InvalidPublishSettings(String),
}

/// Peer instance to forward alerts to.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteSettings {
    pub identity: String,
    #[serde(default)]
    pub serverkey: String,
    #[serde(rename = "vip-address")]
    pub vip_address: String,
}

/// Where alerts are delivered.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PublishSettings {
    #[serde(rename = "publish-local", default = "default_true")]
    pub publish_local: bool,
    #[serde(rename = "publish-remote", default)]
    pub publish_remote: bool,
    #[serde(default)]
    pub remote: Option<RemoteSettings>,
    /// Upper bound in seconds on any remote connect or send.
    #[serde(rename = "remote-timeout", default = "default_remote_timeout")]
    pub remote_timeout: f64,
}

fn default_true() -> bool {
    true
}

fn default_remote_timeout() -> f64 {
    5.0
}

impl Default for PublishSettings {
    fn default() -> Self {
        Self {
            publish_local: true,
            publish_remote: false,
            remote: None,
            remote_timeout: default_remote_timeout(),
        }
    }
}

impl PublishSettings {
    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.remote_timeout)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.publish_remote && self.remote.is_none() {
            return Err(ConfigError::MissingRemote);
        }
        if !(self.remote_timeout.is_finite() && self.remote_timeout > 0.0) {
            return Err(ConfigError::InvalidPublishSettings(
                "remote-timeout must be a positive number".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parsed watch configuration.
#[derive(Debug, Clone, Default)]
pub struct AgentConfig {
    /// Watch specs per group name.
    pub groups: BTreeMap<String, Vec<WatchSpec>>,
    pub publish: PublishSettings,
}

impl AgentConfig {
    /// Read the configuration file.
    ///
    /// A missing file is only an error when `required` is set; otherwise the
    /// agent starts with no groups.
    pub fn load<P: AsRef<Path>>(path: P, required: bool) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(&text),
            Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!("No config at {}, starting with no groups", path.display());
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        let Value::Object(root) = value else {
            return Err(ConfigError::NotAnObject);
        };

        let mut cfg = Self::default();
        for (key, value) in root {
            if key == PUBLISH_SETTINGS_KEY {
                cfg.publish = serde_json::from_value(value)?;
                continue;
            }
            let Value::Object(entries) = value else {
                return Err(ConfigError::InvalidGroup(key));
            };
            cfg.groups.insert(key, parse_group(entries)?);
        }

        cfg.publish.validate()?;
        Ok(cfg)
    }
}

fn parse_group(entries: Map<String, Value>) -> Result<Vec<WatchSpec>, ConfigError> {
    entries
        .into_iter()
        .map(|(topic, value)| parse_watch(topic, &value))
        .collect()
}

/// Decode one `topic: <seconds> | {"seconds": n, "points": [...]}` entry.
pub fn parse_watch(topic: String, value: &Value) -> Result<WatchSpec, ConfigError> {
    match value {
        Value::Object(obj) => {
            let timeout = match obj.get("seconds") {
                Some(v) => parse_timeout(&topic, v)?,
                None => return Err(invalid(&topic, "missing \"seconds\"")),
            };
            match obj.get("points") {
                None => Ok(WatchSpec::whole_topic(topic, timeout)),
                Some(Value::Array(items)) => {
                    let points = items
                        .iter()
                        .map(|p| {
                            p.as_str()
                                .map(str::to_string)
                                .ok_or_else(|| invalid(&topic, "points must be strings"))
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    device_spec(topic, timeout, points)
                }
                Some(_) => Err(invalid(&topic, "points must be a list")),
            }
        }
        other => {
            let timeout = parse_timeout(&topic, other)?;
            Ok(WatchSpec::whole_topic(topic, timeout))
        }
    }
}

/// Build a device watch, checking the topic is an aggregate device topic.
pub fn device_spec(topic: String, timeout: u64, points: Vec<String>) -> Result<WatchSpec, ConfigError> {
    if timeout == 0 {
        return Err(invalid(&topic, "timeout must be positive"));
    }
    validate_device_topic(&topic)?;
    Ok(WatchSpec::device(topic, timeout, points))
}

/// Point watches only make sense on aggregate device topics.
pub fn validate_device_topic(topic: &str) -> Result<(), ConfigError> {
    if topic.ends_with(DEVICE_ALL_SUFFIX) {
        Ok(())
    } else {
        Err(invalid(
            topic,
            "point watches require a device topic ending in \"all\"",
        ))
    }
}

/// Whole seconds, rounding fractional timeouts up.
pub fn timeout_from_secs(topic: &str, secs: f64) -> Result<u64, ConfigError> {
    if !secs.is_finite() || secs <= 0.0 {
        return Err(invalid(topic, "timeout must be a positive number"));
    }
    Ok(secs.ceil() as u64)
}

fn parse_timeout(topic: &str, value: &Value) -> Result<u64, ConfigError> {
    match value.as_f64() {
        Some(secs) => timeout_from_secs(topic, secs),
        None => Err(invalid(topic, "timeout must be a number")),
    }
}

fn invalid(topic: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidWatch {
        topic: topic.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::WatchKind;
    use serde_json::json;

    #[test]
    fn test_default_config() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.db_path, "alertwatch.db");
        assert!(cfg.server_key.is_none());
    }

    #[test]
    fn test_parse_groups_and_settings() {
        let cfg = AgentConfig::from_value(json!({
            "building": {
                "weather/current": 60,
                "devices/campus/ahu1/all": {"seconds": 120, "points": ["fan", "temp"]}
            },
            "publish-settings": {
                "publish-local": false,
                "publish-remote": true,
                "remote": {"identity": "central", "serverkey": "abc", "vip-address": "http://10.0.0.5:8080"}
            }
        }))
        .unwrap();

        let specs = &cfg.groups["building"];
        assert_eq!(specs.len(), 2);
        let device = specs.iter().find(|s| s.topic.ends_with("all")).unwrap();
        match &device.kind {
            WatchKind::Device { timeout, points } => {
                assert_eq!(*timeout, 120);
                assert!(points.contains("fan"));
            }
            other => panic!("expected device watch, got {:?}", other),
        }

        assert!(!cfg.publish.publish_local);
        assert!(cfg.publish.publish_remote);
        assert_eq!(cfg.publish.remote.unwrap().identity, "central");
    }

    #[test]
    fn test_publish_settings_defaults() {
        let cfg = AgentConfig::from_value(json!({"g": {"t": 5}})).unwrap();
        assert!(cfg.publish.publish_local);
        assert!(!cfg.publish.publish_remote);
        assert_eq!(cfg.publish.remote_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_fractional_timeout_rounds_up() {
        let spec = parse_watch("t".to_string(), &json!(2.5)).unwrap();
        assert_eq!(spec.timeout(), 3);
    }

    #[test]
    fn test_invalid_watches_fail_fast() {
        assert!(parse_watch("t".to_string(), &json!("soon")).is_err());
        assert!(parse_watch("t".to_string(), &json!(0)).is_err());
        assert!(parse_watch("t/all".to_string(), &json!({"points": ["p"]})).is_err());
        assert!(parse_watch("t/all".to_string(), &json!({"seconds": 5, "points": "p"})).is_err());
        assert!(parse_watch("t/all".to_string(), &json!({"seconds": 5, "points": [1]})).is_err());
        assert!(parse_watch("t/x".to_string(), &json!({"seconds": 5, "points": ["p"]})).is_err());
    }

    #[test]
    fn test_remote_enabled_without_remote_block() {
        let err = AgentConfig::from_value(json!({
            "publish-settings": {"publish-remote": true}
        }))
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingRemote));
    }

    #[test]
    fn test_group_must_be_object() {
        let err = AgentConfig::from_value(json!({"g": 5})).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidGroup(_)));
    }

    #[test]
    fn test_missing_optional_file_is_empty() {
        let cfg = AgentConfig::load("/nonexistent/alertwatch.json", false).unwrap();
        assert!(cfg.groups.is_empty());
        assert!(AgentConfig::load("/nonexistent/alertwatch.json", true).is_err());
    }
}
