//! Server configuration.
//!
//! Settings are resolved in three layers, each overriding the previous:
//! built-in defaults, then the YAML file named by `WIREBUS_CONFIG`, then
//! individual `WIREBUS_*` environment variables.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use wirebus_protocol::DEFAULT_PORT;

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Dispatch pool configuration.
    pub pool: PoolSettings,
    /// Packet codec configuration.
    pub codec: CodecSettings,
    /// Authentication configuration.
    pub auth: AuthSettings,
}

impl Config {
    /// Loads configuration from file, then applies environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("WIREBUS_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.pool.apply_env_overrides();
        self.codec.apply_env_overrides();
        self.auth.apply_env_overrides();
    }
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("WIREBUS_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }
    }
}

/// Dispatch pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Number of worker tasks and shard queues.
    pub workers: usize,
    /// Bounded capacity of each shard queue.
    pub shard_capacity: usize,
    /// Dispatch through queues; disabling runs handlers inline.
    pub queueing: bool,
    /// Use the assured pool (every request gets a response).
    pub assured: bool,
    /// Seconds a worker waits on its shard before re-checking liveness.
    pub poll_timeout_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            shard_capacity: 256,
            queueing: true,
            assured: false,
            poll_timeout_secs: 60,
        }
    }
}

impl PoolSettings {
    fn apply_env_overrides(&mut self) {
        if let Ok(workers) = std::env::var("WIREBUS_POOL_WORKERS") {
            if let Ok(n) = workers.parse() {
                self.workers = n;
            }
        }
        if let Ok(capacity) = std::env::var("WIREBUS_POOL_CAPACITY") {
            if let Ok(n) = capacity.parse() {
                self.shard_capacity = n;
            }
        }
        if let Ok(assured) = std::env::var("WIREBUS_POOL_ASSURED") {
            self.assured = assured == "1" || assured.to_lowercase() == "true";
        }
    }

    /// Returns the poll timeout as a Duration.
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }
}

/// Packet codec configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecSettings {
    /// Compress packet bodies.
    pub compression: bool,
    /// Skip compressing payloads smaller than this many bytes.
    pub min_compress_len: usize,
}

impl Default for CodecSettings {
    fn default() -> Self {
        Self {
            compression: false,
            min_compress_len: 512,
        }
    }
}

impl CodecSettings {
    fn apply_env_overrides(&mut self) {
        if let Ok(compression) = std::env::var("WIREBUS_COMPRESSION") {
            self.compression = compression == "1" || compression.to_lowercase() == "true";
        }
        if let Ok(len) = std::env::var("WIREBUS_MIN_COMPRESS_LEN") {
            if let Ok(n) = len.parse() {
                self.min_compress_len = n;
            }
        }
    }
}

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// Consecutive failures tolerated before the connection is cut.
    pub max_failures: u32,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            max_failures: crate::auth::DEFAULT_MAX_FAILURES,
        }
    }
}

impl AuthSettings {
    fn apply_env_overrides(&mut self) {
        if let Ok(max) = std::env::var("WIREBUS_AUTH_MAX_FAILURES") {
            if let Ok(n) = max.parse() {
                self.max_failures = n;
            }
        }
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {}", .0.display(), .1)]
    Io(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config file '{}': {}", .0.display(), .1)]
    Parse(PathBuf, String),
}

/// Serde adapter keeping SocketAddr a plain string in YAML.
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.network.bind_addr.port(), DEFAULT_PORT);
        assert_eq!(config.pool.workers, 4);
        assert!(config.pool.queueing);
        assert!(!config.pool.assured);
        assert_eq!(config.auth.max_failures, 3);
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.network.bind_addr, config.network.bind_addr);
        assert_eq!(parsed.pool.workers, config.pool.workers);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let parsed: Config = serde_yaml::from_str("pool:\n  workers: 8\n").unwrap();
        assert_eq!(parsed.pool.workers, 8);
        assert_eq!(parsed.pool.shard_capacity, 256);
        assert_eq!(parsed.network.bind_addr.port(), DEFAULT_PORT);
    }
}
