//! Configuration
//!
//! Nested config structs for the commit-log engine, TOML-loadable and
//! serde-serializable. Production values via `Default`, fast values for
//! tests via `test()`.

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Error type for configuration loading and validation
#[derive(Debug)]
pub enum ConfigError {
    /// I/O error reading a config file
    Io(std::io::Error),
    /// TOML parse error
    Parse(toml::de::Error),
    /// Semantically invalid configuration (fatal at first use)
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "I/O error: {}", e),
            ConfigError::Parse(e) => write!(f, "TOML error: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Top-level configuration for the commit-log engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChronicleConfig {
    /// Number of commit-log buckets. A capacity-planning knob: more buckets
    /// means less contention per bucket and more checkpoint fan-out.
    pub bucket_count: u32,
    /// Admin server bind address
    pub admin_addr: String,
    pub checkpoint: CheckpointConfig,
    pub export: ExportConfig,
    pub prune: PruneConfig,
    pub retry: RetryPolicy,
}

impl Default for ChronicleConfig {
    fn default() -> Self {
        ChronicleConfig {
            bucket_count: 100,
            admin_addr: "127.0.0.1:9090".to_string(),
            checkpoint: CheckpointConfig::default(),
            export: ExportConfig::default(),
            prune: PruneConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl ChronicleConfig {
    /// Configuration for tests (few buckets, fast intervals)
    pub fn test() -> Self {
        ChronicleConfig {
            bucket_count: 3,
            admin_addr: "127.0.0.1:0".to_string(),
            checkpoint: CheckpointConfig::test(),
            export: ExportConfig::test(),
            prune: PruneConfig::test(),
            retry: RetryPolicy::test(),
        }
    }

    /// Load from a TOML file and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Parse from TOML text and validate.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: ChronicleConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject fatal misconfiguration up front rather than at first use.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bucket_count == 0 {
            return Err(ConfigError::Invalid(
                "bucket_count must be at least 1".to_string(),
            ));
        }
        if self.export.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "export.batch_size must be at least 1".to_string(),
            ));
        }
        if self.prune.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "prune.batch_size must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Checkpoint strategy configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Subtracted from "now" to form the candidate checkpoint time. Covers
    /// the backing store's eventual-consistency window; tune to the actual
    /// storage backend, never hard-code.
    #[serde(with = "duration_millis")]
    pub safety_margin: Duration,
    /// Interval between checkpoint attempts
    #[serde(with = "duration_millis")]
    pub interval: Duration,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        CheckpointConfig {
            safety_margin: Duration::from_secs(10),
            interval: Duration::from_secs(180),
        }
    }
}

impl CheckpointConfig {
    /// Configuration for tests (no margin, fast interval)
    pub fn test() -> Self {
        CheckpointConfig {
            safety_margin: Duration::ZERO,
            interval: Duration::from_millis(50),
        }
    }
}

/// Diff exporter configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Manifests per batch; bounds exporter memory
    pub batch_size: usize,
    /// Blob key prefix for exported diffs
    pub prefix: String,
}

impl Default for ExportConfig {
    fn default() -> Self {
        ExportConfig {
            batch_size: 250,
            prefix: "diffs/".to_string(),
        }
    }
}

impl ExportConfig {
    /// Configuration for tests (tiny batches to exercise prefetch)
    pub fn test() -> Self {
        ExportConfig {
            batch_size: 2,
            prefix: "diffs/".to_string(),
        }
    }
}

/// Stale-log pruner configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneConfig {
    /// Manifests younger than this are always kept
    #[serde(with = "duration_millis")]
    pub retention_window: Duration,
    /// Manifests deleted per batch
    pub batch_size: usize,
    /// Interval between prune passes
    #[serde(with = "duration_millis")]
    pub interval: Duration,
}

impl Default for PruneConfig {
    fn default() -> Self {
        PruneConfig {
            retention_window: Duration::from_secs(30 * 24 * 3600), // 30 days
            batch_size: 200,
            interval: Duration::from_secs(3600),
        }
    }
}

impl PruneConfig {
    /// Configuration for tests (short retention, small batches)
    pub fn test() -> Self {
        PruneConfig {
            retention_window: Duration::from_millis(100),
            batch_size: 10,
            interval: Duration::from_millis(50),
        }
    }
}

/// Serde helper for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
