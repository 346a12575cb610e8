use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Top-level configuration for a pod running the event distribution core.
///
/// Loaded from a TOML file the same way the original system config was:
/// `std::fs::read_to_string` + `toml::from_str`, no layered env overlay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub catchup: CatchupConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Tuning for the dedicated Notify Listener connection (§5 of the design).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub poll_interval_ms: u64,
    pub listen_timeout_secs: u64,
    pub reconnect_backoff_initial_ms: u64,
    pub reconnect_backoff_cap_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            listen_timeout_secs: 10,
            reconnect_backoff_initial_ms: 200,
            reconnect_backoff_cap_secs: 30,
        }
    }
}

/// Tuning for per-client socket writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub write_timeout_secs: u64,
    pub outbound_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            write_timeout_secs: 5,
            outbound_buffer: 256,
        }
    }
}

/// Catch-up window tuning (§6: hard cap of 200 events per response).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatchupConfig {
    pub max_events_per_response: i64,
}

impl Default for CatchupConfig {
    fn default() -> Self {
        Self {
            max_events_per_response: 200,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| CoreError::Config(e.to_string()))
    }
}
