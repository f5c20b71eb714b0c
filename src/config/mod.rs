//! Configuration module for Basalt.

use crate::error::{BasaltError, Result};
use crate::types::{ErasureConfig, NodeId};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for a Basalt storage node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BasaltConfig {
    /// Node identity and local disks.
    pub node: NodeConfig,
    /// Peer transport configuration.
    pub network: NetworkConfig,
    /// Recovery engine configuration.
    pub recovery: RecoveryConfig,
    /// Extent storage configuration.
    pub storage: StorageConfig,
    /// Observability configuration.
    pub observability: ObservabilityConfig,
}

impl BasaltConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BasaltError::Config(format!("failed to read config file: {}", e)))?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| BasaltError::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.node.id == 0 {
            return Err(BasaltError::InvalidConfig {
                field: "node.id".to_string(),
                reason: "node ID must be non-zero".to_string(),
            });
        }

        if self.node.data_dirs.is_empty() {
            return Err(BasaltError::InvalidConfig {
                field: "node.data_dirs".to_string(),
                reason: "at least one data directory is required".to_string(),
            });
        }

        if self.recovery.max_concurrent_tasks == 0 {
            return Err(BasaltError::InvalidConfig {
                field: "recovery.max_concurrent_tasks".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        self.storage.erasure.validate()?;

        Ok(())
    }

    /// Create a minimal single-disk development configuration.
    pub fn development() -> Self {
        Self {
            node: NodeConfig {
                id: 1,
                name: "dev-node".to_string(),
                listen_addr: "127.0.0.1:9301".parse().expect("valid socket address"),
                data_dirs: vec![PathBuf::from("/tmp/basalt/data")],
            },
            network: NetworkConfig::default(),
            recovery: RecoveryConfig::default(),
            storage: StorageConfig {
                bytes_per_sync: 512 * 1024,
                preallocate_size: 0,
                erasure: ErasureConfig::SMALL_CLUSTER,
            },
            observability: ObservabilityConfig::default(),
        }
    }
}

/// Node-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier.
    pub id: NodeId,
    /// Human-readable node name.
    pub name: String,
    /// Address to bind the extent service.
    pub listen_addr: SocketAddr,
    /// One directory per disk; new extents pick a disk uniformly at random.
    pub data_dirs: Vec<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: 1,
            name: "basalt-node".to_string(),
            listen_addr: "0.0.0.0:9301".parse().expect("valid socket address"),
            data_dirs: vec![PathBuf::from("/var/lib/basalt/data")],
        }
    }
}

/// Peer transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Heartbeat push interval.
    #[serde(with = "humantime_serde")]
    pub echo_duration: Duration,
    /// Deadline for the three-way append fan-out.
    #[serde(with = "humantime_serde")]
    pub append_timeout: Duration,
    /// Connection establishment timeout.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Per-request timeout for unary peer calls.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            echo_duration: Duration::from_secs(3),
            append_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Recovery engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Cap on simultaneous recovery workers on this node.
    pub max_concurrent_tasks: usize,
    /// Sleep between failed recovery attempts, before refreshing the
    /// extent info and trying again.
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,
    /// Deadline for submitting a recovery task to the manager.
    #[serde(with = "humantime_serde")]
    pub submit_timeout: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 8,
            retry_interval: Duration::from_secs(30),
            submit_timeout: Duration::from_secs(5),
        }
    }
}

/// Extent storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Schedule a range sync every this many appended bytes; 0 disables.
    pub bytes_per_sync: u64,
    /// Preallocate file space ahead of the append offset in steps of this
    /// size; 0 disables.
    pub preallocate_size: u64,
    /// Erasure-coding parameters for shard extents.
    pub erasure: ErasureConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bytes_per_sync: 512 * 1024,
            preallocate_size: 4 * 1024 * 1024,
            erasure: ErasureConfig::DEFAULT,
        }
    }
}

impl StorageConfig {
    pub fn syncing_options(&self) -> crate::storage::SyncingFileOptions {
        crate::storage::SyncingFileOptions {
            bytes_per_sync: self.bytes_per_sync,
            preallocate_size: self.preallocate_size,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level filter (tracing EnvFilter syntax).
    pub log_level: String,
    /// Emit JSON-formatted logs.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Serde helper storing `Duration` fields as strings like `"1500ms"`,
/// `"30s"`, or `"5m"`. A bare number is taken as milliseconds.
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse_duration(raw.trim())
            .ok_or_else(|| serde::de::Error::custom(format!("invalid duration: {:?}", raw)))
    }

    fn parse_duration(s: &str) -> Option<Duration> {
        let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
            Some(split) => s.split_at(split),
            None => (s, "ms"),
        };
        let value: u64 = digits.parse().ok()?;
        match unit {
            "ms" => Some(Duration::from_millis(value)),
            "s" => Some(Duration::from_secs(value)),
            "m" => Some(Duration::from_secs(value * 60)),
            _ => None,
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = BasaltConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.recovery.max_concurrent_tasks, 8);
    }

    #[test]
    fn test_development_config() {
        let config = BasaltConfig::development();
        assert!(config.validate().is_ok());
        assert_eq!(config.storage.erasure.data_shards, 2);
        assert_eq!(config.storage.erasure.parity_shards, 1);
    }

    #[test]
    fn test_rejects_zero_node_id() {
        let mut config = BasaltConfig::development();
        config.node.id = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_empty_data_dirs() {
        let mut config = BasaltConfig::development();
        config.node.data_dirs.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duration_round_trip() {
        let config = BasaltConfig::development();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: BasaltConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(
            parsed.network.echo_duration,
            config.network.echo_duration
        );
        assert_eq!(
            parsed.recovery.retry_interval,
            config.recovery.retry_interval
        );
    }
}
