//! Agent configuration. Field names follow the JSON config file keys (`BROKER_ADDRESS`, ...).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::protocol::{command_topic, truncate_id, BROADCAST_TOPIC};
use crate::transport::{ConnectOptions, Credentials};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", deny_unknown_fields)]
pub struct AgentConfig {
    /// Broker host (default localhost).
    #[serde(default = "default_broker", rename = "BROKER_ADDRESS")]
    pub broker: String,
    #[serde(default = "default_port", rename = "BROKER_PORT")]
    pub port: u16,
    /// Device id; generated when absent. Truncated to 12 characters.
    #[serde(default)]
    pub client_id: Option<String>,
    /// Subscribe filters. Empty means this device's command topic plus the broadcast topic.
    #[serde(default)]
    pub topics_subscribe: Vec<String>,
    /// Keep-alive in seconds.
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_true")]
    pub clean_session: bool,
    /// Broadcast a ping every `ping_period` seconds.
    #[serde(default)]
    pub enable_ping: bool,
    /// Answer pings with a pong.
    #[serde(default)]
    pub enable_pong: bool,
    #[serde(default = "default_ping_period")]
    pub ping_period: u64,
    /// Accept inbound file transfers (`bg_t`/`ap_t`/`end_t`).
    #[serde(default = "default_true")]
    pub enable_transfers: bool,
    #[serde(default = "default_flush_period_ms")]
    pub flush_period_ms: u64,
    /// Directory completed transfers are written to.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Largest encoded message used when sending files.
    #[serde(default = "default_chunk_budget")]
    pub chunk_budget: usize,
    /// Verbose logging; see [`AgentConfig::log_level`].
    #[serde(default)]
    pub debug: bool,
}

fn default_broker() -> String {
    "localhost".to_string()
}
fn default_port() -> u16 {
    1883
}
fn default_keep_alive() -> u64 {
    60
}
fn default_true() -> bool {
    true
}
fn default_ping_period() -> u64 {
    30
}
fn default_flush_period_ms() -> u64 {
    1000
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("received_files")
}
fn default_chunk_budget() -> usize {
    256
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            broker: default_broker(),
            port: default_port(),
            client_id: None,
            topics_subscribe: Vec::new(),
            keep_alive: default_keep_alive(),
            username: None,
            password: None,
            clean_session: true,
            enable_ping: false,
            enable_pong: false,
            ping_period: default_ping_period(),
            enable_transfers: true,
            flush_period_ms: default_flush_period_ms(),
            output_dir: default_output_dir(),
            chunk_budget: default_chunk_budget(),
            debug: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("{0} must be greater than zero")]
    ZeroPeriod(&'static str),
}

impl AgentConfig {
    pub fn with_client_id(client_id: &str) -> Self {
        Self {
            client_id: Some(client_id.to_string()),
            ..Self::default()
        }
    }

    /// Load from a JSON file using the upper-case keys.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ping_period == 0 {
            return Err(ConfigError::ZeroPeriod("PING_PERIOD"));
        }
        if self.flush_period_ms == 0 {
            return Err(ConfigError::ZeroPeriod("FLUSH_PERIOD_MS"));
        }
        Ok(())
    }

    /// Configured client id (truncated), or a fresh `agent_xxxxxx` id.
    pub fn resolve_client_id(&self) -> String {
        match &self.client_id {
            Some(id) => truncate_id(id),
            None => {
                let suffix = uuid::Uuid::new_v4().simple().to_string();
                format!("agent_{}", &suffix[..6])
            }
        }
    }

    /// Filters to subscribe for `client_id`.
    pub fn subscriptions(&self, client_id: &str) -> Vec<String> {
        if self.topics_subscribe.is_empty() {
            vec![command_topic(client_id), BROADCAST_TOPIC.to_string()]
        } else {
            self.topics_subscribe.clone()
        }
    }

    /// Credentials are passed through only when both parts are set.
    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => Some(Credentials {
                username: u.clone(),
                password: p.clone(),
            }),
            _ => None,
        }
    }

    pub fn connect_options(&self, client_id: &str) -> ConnectOptions {
        ConnectOptions {
            host: self.broker.clone(),
            port: self.port,
            client_id: client_id.to_string(),
            keep_alive: Duration::from_secs(self.keep_alive),
            clean_session: self.clean_session,
            credentials: self.credentials(),
        }
    }

    /// Default log filter for a process hosting this agent: `debug` when `DEBUG` is set.
    pub fn log_level(&self) -> &'static str {
        if self.debug {
            "debug"
        } else {
            "info"
        }
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_period)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_period_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = AgentConfig::default();
        assert_eq!(c.broker, "localhost");
        assert_eq!(c.port, 1883);
        assert_eq!(c.keep_alive, 60);
        assert!(!c.enable_ping);
        assert!(c.enable_transfers);
        assert_eq!(c.ping_interval(), Duration::from_secs(30));
    }

    #[test]
    fn parse_json_keys() {
        let text = r#"{
            "BROKER_ADDRESS": "10.0.0.2",
            "BROKER_PORT": 1884,
            "CLIENT_ID": "raspberry_pi",
            "TOPICS_SUBSCRIBE": ["devices/raspberry_pi/cmd", "devices/all/data"],
            "ENABLE_PING": true,
            "ENABLE_PONG": true,
            "PING_PERIOD": 60,
            "USERNAME": "u",
            "PASSWORD": "p",
            "DEBUG": true
        }"#;
        let c = AgentConfig::from_json_str(text).unwrap();
        assert_eq!(c.broker, "10.0.0.2");
        assert_eq!(c.port, 1884);
        assert_eq!(c.resolve_client_id(), "raspberry_pi");
        assert_eq!(c.subscriptions("raspberry_pi").len(), 2);
        assert!(c.enable_ping && c.enable_pong);
        assert_eq!(c.ping_period, 60);
        assert_eq!(c.credentials().unwrap().username, "u");
        assert!(c.debug);
        assert_eq!(c.log_level(), "debug");
    }

    #[test]
    fn debug_key_accepted_and_defaults_off() {
        let c = AgentConfig::from_json_str(
            r#"{"BROKER_ADDRESS":"localhost","CLIENT_ID":"raspberry_pi","DEBUG":true}"#,
        )
        .unwrap();
        assert!(c.debug);
        let c = AgentConfig::from_json_str(r#"{"CLIENT_ID":"raspberry_pi"}"#).unwrap();
        assert!(!c.debug);
        assert_eq!(c.log_level(), "info");
    }

    #[test]
    fn unknown_key_rejected() {
        assert!(AgentConfig::from_json_str(r#"{"BROKER_PROT": 1}"#).is_err());
    }

    #[test]
    fn zero_period_rejected() {
        assert!(matches!(
            AgentConfig::from_json_str(r#"{"PING_PERIOD": 0}"#),
            Err(ConfigError::ZeroPeriod("PING_PERIOD"))
        ));
    }

    #[test]
    fn missing_file() {
        assert!(matches!(
            AgentConfig::from_json_file("/nonexistent/agent.json"),
            Err(ConfigError::NotFound(_))
        ));
    }

    #[test]
    fn generated_client_id_fits_cap() {
        let id = AgentConfig::default().resolve_client_id();
        assert!(id.starts_with("agent_"));
        assert_eq!(id.chars().count(), 12);
    }

    #[test]
    fn default_subscriptions_follow_client_id() {
        let c = AgentConfig::default();
        assert_eq!(
            c.subscriptions("esp32_quarto"),
            vec!["devices/esp32_quarto/cmd".to_string(), "devices/all/data".to_string()]
        );
    }

    #[test]
    fn credentials_need_both_parts() {
        let c = AgentConfig {
            username: Some("u".into()),
            ..AgentConfig::default()
        };
        assert!(c.credentials().is_none());
    }
}
