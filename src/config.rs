use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{IsolationLevel, NodeId};

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Node-wide configuration loaded at startup.
///
/// Every section has defaults, so a config file only needs the values it
/// overrides.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct TidemarkConfig {
    /// Identifier of this node. Stamped into every transaction id it issues.
    pub node_id: NodeId,
    pub cluster: ClusterConfig,
    pub fan_out: FanOutConfig,
    pub transactions: TransactionConfig,
}

/// Shape of the (local) cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClusterConfig {
    pub nodes: u32,
    pub partition_count: u32,
    /// Buffered change events before slow listeners start lagging.
    pub event_capacity: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            nodes: 3,
            partition_count: 32,
            event_capacity: 1024,
        }
    }
}

/// Retry policy of the fan-out coordinator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FanOutConfig {
    /// Dispatch attempts per unit before the target is declared unavailable.
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl FanOutConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Default for FanOutConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            retry_backoff_ms: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TransactionConfig {
    /// Age after which an open transaction may be force-expired.
    pub max_age_ms: u64,
    pub default_isolation: IsolationLevel,
    /// Above this many changed keys in one bulk call the transaction tracks
    /// whole partitions instead of individual keys.
    pub key_tracking_limit: usize,
}

impl TransactionConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_millis(self.max_age_ms)
    }
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            max_age_ms: 30_000,
            default_isolation: IsolationLevel::RepeatableRead,
            key_tracking_limit: 1024,
        }
    }
}

impl TidemarkConfig {
    pub fn new(node_id: NodeId, cluster: ClusterConfig) -> Self {
        Self {
            node_id,
            cluster,
            ..Self::default()
        }
    }

    pub fn with_fan_out(mut self, fan_out: FanOutConfig) -> Self {
        self.fan_out = fan_out;
        self
    }

    pub fn with_transactions(mut self, transactions: TransactionConfig) -> Self {
        self.transactions = transactions;
        self
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster.nodes == 0 {
            return Err(ConfigError::Invalid("cluster.nodes must be at least 1".into()));
        }
        if self.cluster.partition_count == 0 {
            return Err(ConfigError::Invalid(
                "cluster.partition_count must be at least 1".into(),
            ));
        }
        if self.fan_out.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "fan_out.max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = TidemarkConfig::from_json_str(
            r#"{ "node_id": 4, "cluster": { "partition_count": 8 },
                 "transactions": { "default_isolation": "read_committed" } }"#,
        )
        .unwrap();
        assert_eq!(config.node_id, 4);
        assert_eq!(config.cluster.partition_count, 8);
        assert_eq!(config.cluster.nodes, 3);
        assert_eq!(
            config.transactions.default_isolation,
            IsolationLevel::ReadCommitted
        );
        assert_eq!(config.fan_out, FanOutConfig::default());
    }

    #[test]
    fn rejects_empty_layouts() {
        let err = TidemarkConfig::from_json_str(r#"{ "cluster": { "nodes": 0 } }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        let err = TidemarkConfig::from_json_str(r#"{ "fan_out": { "max_attempts": 0 } }"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(matches!(
            TidemarkConfig::from_json_str("not json").unwrap_err(),
            ConfigError::Parse(_)
        ));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "fan_out": {{ "retry_backoff_ms": 0 }} }}"#).unwrap();
        let config = TidemarkConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.fan_out.retry_backoff(), Duration::ZERO);
        assert_eq!(config.fan_out.max_attempts, 8);
    }
}
