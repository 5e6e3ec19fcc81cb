//! Load the demo's agent configs from file and environment.

use mesh_core::AgentConfig;
use serde::Deserialize;
use std::path::PathBuf;

/// Demo configuration. File: ~/.config/meshagent/config.toml or /etc/meshagent/config.toml.
/// Each table uses the agent config keys (`CLIENT_ID`, `PING_PERIOD`, ...).
/// Env overrides: MESHAGENT_PING_PERIOD, MESHAGENT_OUTPUT_DIR, MESHAGENT_CHUNK_BUDGET.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Agent that pings, issues commands and receives files.
    #[serde(default = "default_controller")]
    pub controller: AgentConfig,
    /// Agent that answers commands and sends a file.
    #[serde(default = "default_node")]
    pub node: AgentConfig,
    /// Seconds between demo command rounds (default 10).
    #[serde(default = "default_round_period")]
    pub round_period: u64,
    /// Problems met while loading, reported once logging is up.
    #[serde(skip)]
    pub warnings: Vec<String>,
}

fn default_controller() -> AgentConfig {
    AgentConfig {
        enable_ping: true,
        enable_pong: true,
        ..AgentConfig::with_client_id("raspberry_pi")
    }
}
fn default_node() -> AgentConfig {
    AgentConfig {
        enable_pong: true,
        ..AgentConfig::with_client_id("esp32_quarto")
    }
}
fn default_round_period() -> u64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            controller: default_controller(),
            node: default_node(),
            round_period: default_round_period(),
            warnings: Vec::new(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = match load_file() {
        Ok(Some(c)) => c,
        Ok(None) => Config::default(),
        Err(warning) => Config {
            warnings: vec![warning],
            ..Config::default()
        },
    };
    if let Some(p) = env_parse::<u64>("MESHAGENT_PING_PERIOD") {
        c.controller.ping_period = p;
        c.node.ping_period = p;
    }
    if let Ok(dir) = std::env::var("MESHAGENT_OUTPUT_DIR") {
        c.controller.output_dir = PathBuf::from(&dir);
        c.node.output_dir = PathBuf::from(dir);
    }
    if let Some(b) = env_parse::<usize>("MESHAGENT_CHUNK_BUDGET") {
        c.controller.chunk_budget = b;
        c.node.chunk_budget = b;
    }
    c
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.parse().ok()
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/meshagent/config.toml"));
    }
    out.push(PathBuf::from("/etc/meshagent/config.toml"));
    out
}

fn load_file() -> Result<Option<Config>, String> {
    let Some(path) = config_paths().into_iter().find(|p| p.exists()) else {
        return Ok(None);
    };
    let text = std::fs::read_to_string(&path)
        .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    toml::from_str::<Config>(&text)
        .map(Some)
        .map_err(|e| format!("invalid config {}, using defaults: {}", path.display(), e))
}

/// Default log filter: `debug` if either agent sets `DEBUG`.
pub fn log_level(c: &Config) -> &'static str {
    if c.controller.debug || c.node.debug {
        "debug"
    } else {
        "info"
    }
}
