use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

use crate::cluster::error::{RaftError, RaftResult};
use crate::cluster::message::MAX_DATAGRAM;

/// Upper bound for every timing value, in milliseconds (one hour).
pub const MAX_INTERVAL_MS: u64 = 60 * 60 * 1000;

/// Room left in a datagram for the AppendEntries fields around `entries`.
const ENVELOPE_RESERVE: usize = 1024;

/// Largest accepted `max_append_bytes`.
pub const MAX_APPEND_BYTES: usize = MAX_DATAGRAM - ENVELOPE_RESERVE;

// Protocol timing and queue sizes. All intervals are milliseconds.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RaftConfig {
    pub election_timeout_min: u64,
    pub election_timeout_max: u64,
    pub heartbeat_interval: u64,
    /// The leader steps down after this many heartbeat intervals without
    /// hearing from a quorum.
    pub step_down_missed_heartbeats: u32,
    pub max_entries_per_append: usize,
    /// Budget for the encoded entries of one AppendEntries. A single entry
    /// larger than this is refused at propose time.
    pub max_append_bytes: usize,
    pub outbound_queue_capacity: usize,
    pub inbound_queue_capacity: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        RaftConfig {
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            step_down_missed_heartbeats: 8,
            max_entries_per_append: 64,
            max_append_bytes: 48 * 1024,
            outbound_queue_capacity: 1000,
            inbound_queue_capacity: 1000,
        }
    }
}

impl RaftConfig {
    pub fn election_timeout_min(&self) -> Duration {
        Duration::from_millis(self.election_timeout_min)
    }

    pub fn election_timeout_max(&self) -> Duration {
        Duration::from_millis(self.election_timeout_max)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }

    pub fn step_down_interval(&self) -> Duration {
        self.heartbeat_interval() * self.step_down_missed_heartbeats
    }

    pub fn validate(&self) -> RaftResult<()> {
        let invalid = |msg: &str| Err(RaftError::InvalidConfig(msg.to_string()));

        if self.election_timeout_min == 0 {
            return invalid("election_timeout_min must be positive");
        }
        if self.election_timeout_min > self.election_timeout_max {
            return invalid("election_timeout_min must not exceed election_timeout_max");
        }
        if self.election_timeout_max > MAX_INTERVAL_MS {
            return invalid("election_timeout_max must not exceed one hour");
        }
        if self.heartbeat_interval == 0 {
            return invalid("heartbeat_interval must be positive");
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return invalid("heartbeat_interval must be shorter than election_timeout_min");
        }
        if self.step_down_missed_heartbeats == 0 {
            return invalid("step_down_missed_heartbeats must be positive");
        }
        if self.step_down_interval() > Duration::from_millis(MAX_INTERVAL_MS) {
            return invalid("step-down interval must not exceed one hour");
        }
        if self.max_entries_per_append == 0 {
            return invalid("max_entries_per_append must be positive");
        }
        if self.max_append_bytes == 0 || self.max_append_bytes > MAX_APPEND_BYTES {
            return invalid(&format!("max_append_bytes must be between 1 and {}", MAX_APPEND_BYTES));
        }
        if self.outbound_queue_capacity == 0 || self.inbound_queue_capacity == 0 {
            return invalid("queue capacities must be positive");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct NodeConfig {
    pub address: SocketAddr,
    #[serde(default)]
    pub peers: Vec<SocketAddr>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Config {
    pub node: NodeConfig,
    #[serde(default)]
    pub raft: RaftConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn from_toml_str(text: &str) -> RaftResult<Self> {
        let config: Config = toml::from_str(text)?;
        config.raft.validate()?;
        config.level()?;
        Ok(config)
    }

    /// `log_level` as a tracing level (`trace` through `error`).
    pub fn level(&self) -> RaftResult<Level> {
        Level::from_str(&self.log_level)
            .map_err(|_| RaftError::InvalidConfig(format!("unknown log_level '{}'", self.log_level)))
    }

    pub fn load(path: impl AsRef<Path>) -> RaftResult<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::from_toml_str(
            r#"
            [node]
            address = "127.0.0.1:5600"
            "#,
        )
        .unwrap();

        assert_eq!(config.node.address, "127.0.0.1:5600".parse().unwrap());
        assert!(config.node.peers.is_empty());
        assert_eq!(config.raft, RaftConfig::default());
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_full_config() {
        let config = Config::from_toml_str(
            r#"
            log_level = "debug"

            [node]
            address = "127.0.0.1:5600"
            peers = ["127.0.0.1:5601", "127.0.0.1:5602"]

            [raft]
            election_timeout_min = 300
            election_timeout_max = 600
            heartbeat_interval = 100
            "#,
        )
        .unwrap();

        assert_eq!(config.node.peers.len(), 2);
        assert_eq!(config.raft.election_timeout_min(), Duration::from_millis(300));
        assert_eq!(config.raft.step_down_interval(), Duration::from_millis(800));
        assert_eq!(config.raft.max_entries_per_append, 64);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_default_step_down_window() {
        let config = RaftConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.step_down_interval(), Duration::from_millis(400));
    }

    #[test]
    fn test_invalid_timing_rejected() {
        let err = Config::from_toml_str(
            r#"
            [node]
            address = "127.0.0.1:5600"

            [raft]
            election_timeout_min = 300
            election_timeout_max = 150
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, RaftError::InvalidConfig(_)));

        let config = RaftConfig {
            heartbeat_interval: 200,
            ..RaftConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_oversized_timing_rejected() {
        let config = RaftConfig {
            election_timeout_max: u64::MAX,
            ..RaftConfig::default()
        };
        assert!(matches!(config.validate(), Err(RaftError::InvalidConfig(_))));

        // Bounded heartbeat, but too many of them
        let config = RaftConfig {
            step_down_missed_heartbeats: u32::MAX,
            ..RaftConfig::default()
        };
        assert!(config.validate().is_err());

        let config = RaftConfig {
            election_timeout_min: MAX_INTERVAL_MS,
            election_timeout_max: MAX_INTERVAL_MS,
            heartbeat_interval: 1000,
            ..RaftConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_append_byte_budget_bounds() {
        for bytes in [0, MAX_APPEND_BYTES + 1] {
            let config = RaftConfig {
                max_append_bytes: bytes,
                ..RaftConfig::default()
            };
            assert!(config.validate().is_err());
        }
        let config = RaftConfig {
            max_append_bytes: MAX_APPEND_BYTES,
            ..RaftConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_log_level() {
        let text = |level: &str| {
            format!("log_level = \"{}\"\n[node]\naddress = \"127.0.0.1:5600\"\n", level)
        };
        let config = Config::from_toml_str(&text("warn")).unwrap();
        assert_eq!(config.level().unwrap(), Level::WARN);

        let err = Config::from_toml_str(&text("loud")).unwrap_err();
        assert!(matches!(err, RaftError::InvalidConfig(ref msg) if msg.contains("loud")));
    }

    #[test]
    fn test_malformed_toml() {
        let err = Config::from_toml_str("[node]\naddress = 5").unwrap_err();
        assert!(matches!(err, RaftError::Config(_)));
    }
}
