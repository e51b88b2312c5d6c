//! Konfiguration der Call Engine
//!
//! Wird aus JSON geladen (Datei oder String). `CALL_RING_TIMEOUT_SECS` und
//! `CALL_TOPIC_PREFIX` überschreiben die Werte aus der Datei.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const ENV_RING_TIMEOUT: &str = "CALL_RING_TIMEOUT_SECS";
pub const ENV_TOPIC_PREFIX: &str = "CALL_TOPIC_PREFIX";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// STUN/TURN Server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

/// Standard STUN Server Konfiguration
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
        ],
        username: String::new(),
        credential: String::new(),
    }]
}

// ============================================================================
// ENGINE CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub ice_servers: Vec<IceServerConfig>,

    /// Nach wie vielen Sekunden ein unbeantworteter Anruf endet (`None`: nie)
    pub ring_timeout_secs: Option<u64>,

    /// Kapazität des `CallEvent`-Broadcasts
    pub event_capacity: usize,

    /// Heartbeat-Intervall des `RelayClient`
    pub relay_heartbeat_secs: u64,

    /// Topic eines Anrufs ist `topic_prefix + session_id`
    pub topic_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            ring_timeout_secs: Some(45),
            event_capacity: 100,
            relay_heartbeat_secs: 25,
            topic_prefix: "call:".to_string(),
        }
    }
}

impl EngineConfig {
    /// Parst JSON; fehlende Felder bekommen Standardwerte
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Lädt eine JSON-Datei und wendet Umgebungsvariablen an
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        tracing::info!("Loading engine config from {:?}", path);

        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)?.apply_env_overrides()
    }

    pub fn apply_env_overrides(self) -> Result<Self, ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(value) = lookup(ENV_RING_TIMEOUT) {
            self.ring_timeout_secs = match value.trim() {
                "" | "0" | "off" => None,
                secs => Some(secs.parse().map_err(|_| ConfigError::InvalidValue {
                    key: ENV_RING_TIMEOUT.to_string(),
                    value: value.clone(),
                })?),
            };
        }

        if let Some(prefix) = lookup(ENV_TOPIC_PREFIX) {
            self.topic_prefix = prefix;
        }

        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.event_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "event_capacity".to_string(),
                value: "0".to_string(),
            });
        }
        if self.relay_heartbeat_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "relay_heartbeat_secs".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(())
    }

    /// Setzt optionale TURN-Server Credentials
    pub fn add_turn_server(&mut self, url: String, username: String, credential: String) {
        self.ice_servers.push(IceServerConfig {
            urls: vec![url],
            username,
            credential,
        });
    }

    pub fn ring_timeout(&self) -> Option<Duration> {
        self.ring_timeout_secs.map(Duration::from_secs)
    }

    pub fn relay_heartbeat(&self) -> Duration {
        Duration::from_secs(self.relay_heartbeat_secs)
    }

    /// Signaling-Topic einer Session
    pub fn topic(&self, session_id: &str) -> String {
        format!("{}{}", self.topic_prefix, session_id)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.ring_timeout(), Some(Duration::from_secs(45)));
        assert_eq!(config.topic("chat-7"), "call:chat-7");
        assert_eq!(config.ice_servers[0].urls.len(), 2);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = EngineConfig::from_json_str(r#"{ "ring_timeout_secs": null }"#).unwrap();
        assert_eq!(config.ring_timeout(), None);
        assert_eq!(config.event_capacity, 100);
        assert_eq!(config.topic_prefix, "call:");
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let result = EngineConfig::from_json_str(r#"{ "event_capacity": 0 }"#);
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> =
            [(ENV_RING_TIMEOUT, "off"), (ENV_TOPIC_PREFIX, "rtc/")].into();
        let config = EngineConfig::default()
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.ring_timeout_secs, None);
        assert_eq!(config.topic("1"), "rtc/1");
    }

    #[test]
    fn test_invalid_ring_timeout_override() {
        let result =
            EngineConfig::default().apply_overrides(|k| (k == ENV_RING_TIMEOUT).then(|| "soon".to_string()));
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "ice_servers": [{{ "urls": ["turn:turn.example.com:3478"], "username": "u", "credential": "p" }}] }}"#
        )
        .unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].username, "u");
    }

    #[test]
    fn test_add_turn_server() {
        let mut config = EngineConfig::default();
        config.add_turn_server("turn:t:3478".into(), "user".into(), "secret".into());
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.ice_servers[1].credential, "secret");
    }
}
