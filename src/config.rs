//! Configuration module for plockd.

use crate::error::{PlockError, Result};
use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration for a plockd instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlockConfig {
    /// Node configuration.
    pub node: NodeConfig,
    /// Lock coordination tunables.
    pub plock: PlockTuning,
    /// Observability configuration.
    pub observability: ObservabilityConfig,
}

impl PlockConfig {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PlockError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| PlockError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.node.id == 0 {
            return Err(PlockError::InvalidConfig {
                field: "node.id".to_string(),
                reason: "Node ID must be non-zero".to_string(),
            });
        }

        if self.plock.ownership && self.plock.drop_count == 0 {
            return Err(PlockError::InvalidConfig {
                field: "plock.drop_count".to_string(),
                reason: "Drop sweep requires a non-zero per-sweep count".to_string(),
            });
        }

        if self.plock.drop_age.is_zero() && self.plock.ownership {
            return Err(PlockError::InvalidConfig {
                field: "plock.drop_age".to_string(),
                reason: "Drop age must be non-zero".to_string(),
            });
        }

        Ok(())
    }

    /// Create a minimal development configuration.
    pub fn development() -> Self {
        Self {
            node: NodeConfig {
                id: 1,
                name: "dev-node".to_string(),
            },
            plock: PlockTuning {
                enabled: true,
                ownership: true,
                rate_limit: 0,
                drop_interval: Duration::from_secs(1),
                drop_count: 10,
                drop_age: Duration::from_secs(1),
            },
            observability: ObservabilityConfig::default(),
        }
    }
}

/// Node-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier (must match the membership service's id).
    pub id: NodeId,
    /// Human-readable node name.
    pub name: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: 1,
            name: "plockd-node".to_string(),
        }
    }
}

/// Lock coordination tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlockTuning {
    /// Process plocks at all. When disabled every kernel request is answered
    /// with an offline error.
    pub enabled: bool,
    /// Enable the per-resource ownership optimization. When disabled every
    /// resource stays fully replicated and every operation is broadcast.
    pub ownership: bool,
    /// Kernel ops per rate-limit window; 0 disables rate limiting. After
    /// every `rate_limit` ops the daemon pauses reading the kernel channel
    /// until at least one second has elapsed in the window.
    pub rate_limit: u32,
    /// Interval between drop-resources sweeps.
    #[serde(with = "humantime_serde")]
    pub drop_interval: Duration,
    /// Maximum resources dropped per sweep.
    pub drop_count: u32,
    /// Minimum idle age before a resource is eligible for dropping.
    #[serde(with = "humantime_serde")]
    pub drop_age: Duration,
}

impl Default for PlockTuning {
    fn default() -> Self {
        Self {
            enabled: true,
            ownership: true,
            rate_limit: 100,
            drop_interval: Duration::from_secs(10),
            drop_count: 10,
            drop_age: Duration::from_secs(10),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level.
    pub log_level: String,
    /// Enable JSON logging.
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

/// Serde helper for Duration using humantime format.
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
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        } else if let Some(s_val) = s.strip_suffix('s') {
            s_val
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| e.to_string())
        } else if let Some(m) = s.strip_suffix('m') {
            m.parse::<u64>()
                .map(|v| Duration::from_secs(v * 60))
                .map_err(|e| e.to_string())
        } else {
            s.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        }
    }
}
