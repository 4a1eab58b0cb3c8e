//! Property table and derived connection configuration.
//!
//! Properties are a flat string-keyed map, loadable from a JSON object of
//! scalar values. The connection core reads a handful of them:
//!
//! - `Ice.Warn.Connections` — non-zero enables connection warnings
//! - `Ice.Blocking` — non-zero selects blocking-client mode (ignored in
//!   server mode)
//! - `Ice.MessageSizeMax` — maximum inbound frame size in KiB
//! - `Ice.Override.ConnectTimeout` — replaces the endpoint timeout during
//!   the validation handshake, in milliseconds

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default maximum message size: 1024 KiB.
const DEFAULT_MESSAGE_SIZE_MAX_KB: i32 = 1024;

/// Flat table of configuration properties.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Properties {
    map: HashMap<String, String>,
}

impl Properties {
    /// Create an empty property table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a property, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.map.insert(key.into(), value.into());
    }

    /// Look up a property.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    /// Look up a property as an integer, defaulting to 0.
    ///
    /// A malformed value logs a warning and counts as absent.
    pub fn get_int(&self, key: &str) -> i32 {
        self.get_int_with_default(key, 0)
    }

    /// Look up a property as an integer with an explicit default.
    pub fn get_int_with_default(&self, key: &str, default: i32) -> i32 {
        match self.map.get(key) {
            Some(value) => match value.parse() {
                Ok(parsed) => parsed,
                Err(_) => {
                    tracing::warn!(key, value = %value, "ignoring non-numeric property value");
                    default
                }
            },
            None => default,
        }
    }

    /// Parse a property table from a JSON object of scalar values.
    pub fn from_json(json: &str) -> Result<Self> {
        let value: serde_json::Value =
            serde_json::from_str(json).map_err(|err| Error::MarshalError {
                message: format!("invalid properties JSON: {err}"),
            })?;
        let object = value.as_object().ok_or_else(|| Error::MarshalError {
            message: "properties JSON must be an object".to_string(),
        })?;
        let mut properties = Properties::new();
        for (key, value) in object {
            let text = match value {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::Bool(b) => b.to_string(),
                _ => {
                    return Err(Error::MarshalError {
                        message: format!("property {key} must be a scalar"),
                    })
                }
            };
            properties.set(key, text);
        }
        Ok(properties)
    }
}

/// Configuration the connection core derives from [`Properties`] once, at
/// connection creation.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Maximum inbound frame size in bytes.
    pub message_size_max: usize,
    /// Emit a warning when a connection dies with an unexpected error.
    pub warn_connections: bool,
    /// Blocking-client mode: each request reads its own reply, no worker.
    pub blocking: bool,
    /// Connect-timeout override applied during the validation handshake.
    pub override_connect_timeout: Option<Duration>,
}

impl ConnectionConfig {
    /// Derive a configuration from a property table.
    pub fn from_properties(properties: &Properties) -> Self {
        let size_kb =
            properties.get_int_with_default("Ice.MessageSizeMax", DEFAULT_MESSAGE_SIZE_MAX_KB);
        let size_kb = if size_kb <= 0 {
            DEFAULT_MESSAGE_SIZE_MAX_KB
        } else {
            size_kb
        };
        let override_connect_timeout = properties
            .get("Ice.Override.ConnectTimeout")
            .map(|_| properties.get_int("Ice.Override.ConnectTimeout"))
            .filter(|ms| *ms >= 0)
            .map(|ms| Duration::from_millis(ms as u64));
        Self {
            message_size_max: size_kb as usize * 1024,
            warn_connections: properties.get_int("Ice.Warn.Connections") > 0,
            blocking: properties.get_int("Ice.Blocking") > 0,
            override_connect_timeout,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from_properties(&Properties::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.message_size_max, 1024 * 1024);
        assert!(!config.warn_connections);
        assert!(!config.blocking);
        assert_eq!(config.override_connect_timeout, None);
    }

    #[test]
    fn test_properties_drive_config() {
        let mut properties = Properties::new();
        properties.set("Ice.Warn.Connections", "1");
        properties.set("Ice.Blocking", "1");
        properties.set("Ice.MessageSizeMax", "64");
        properties.set("Ice.Override.ConnectTimeout", "250");

        let config = ConnectionConfig::from_properties(&properties);
        assert!(config.warn_connections);
        assert!(config.blocking);
        assert_eq!(config.message_size_max, 64 * 1024);
        assert_eq!(
            config.override_connect_timeout,
            Some(Duration::from_millis(250))
        );
    }

    #[test]
    fn test_zero_is_disabled() {
        let mut properties = Properties::new();
        properties.set("Ice.Warn.Connections", "0");
        properties.set("Ice.Blocking", "0");
        let config = ConnectionConfig::from_properties(&properties);
        assert!(!config.warn_connections);
        assert!(!config.blocking);
    }

    #[test]
    fn test_malformed_int_counts_as_absent() {
        let mut properties = Properties::new();
        properties.set("Ice.Blocking", "yes please");
        assert_eq!(properties.get_int("Ice.Blocking"), 0);
        let config = ConnectionConfig::from_properties(&properties);
        assert!(!config.blocking);
    }

    #[test]
    fn test_from_json() {
        let properties = Properties::from_json(
            r#"{"Ice.Blocking": 1, "Ice.Warn.Connections": "1", "Ice.MessageSizeMax": 2048}"#,
        )
        .unwrap();
        let config = ConnectionConfig::from_properties(&properties);
        assert!(config.blocking);
        assert!(config.warn_connections);
        assert_eq!(config.message_size_max, 2048 * 1024);
    }

    #[test]
    fn test_from_json_rejects_non_object() {
        assert!(Properties::from_json("[1, 2]").is_err());
        assert!(Properties::from_json(r#"{"nested": {}}"#).is_err());
    }

    #[test]
    fn test_nonpositive_message_size_falls_back() {
        let mut properties = Properties::new();
        properties.set("Ice.MessageSizeMax", "-5");
        let config = ConnectionConfig::from_properties(&properties);
        assert_eq!(config.message_size_max, 1024 * 1024);
    }
}
