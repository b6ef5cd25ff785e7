//! Configuration management for Tributary
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. Environment variables (TRIBUTARY__* prefix, highest precedence)
//! 2. tributary.local.toml (gitignored, local overrides)
//! 3. tributary.toml (git-tracked, project config)
//! 4. ~/.config/tributary/config.toml (user defaults)
//! 5. Built-in defaults (lowest precedence)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::Paths;

/// Main Tributary configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TributaryConfig {
    pub queue: QueueConfig,
    pub checkpoint: CheckpointConfig,
    pub writers: WriterConfig,
}

/// Memory budget for in-flight records and checkpoint markers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Share of `available_memory_bytes` that queued items may occupy.
    /// Zero disables the limit.
    pub max_message_queue_memory_usage_ratio: f64,
    /// Extra in-memory footprint per item, relative to its serialized size.
    pub estimated_record_memory_overhead_ratio: f64,
    /// Memory the budget ratio applies to.
    pub available_memory_bytes: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_message_queue_memory_usage_ratio: 0.2,
            estimated_record_memory_overhead_ratio: 0.1,
            available_memory_bytes: 2 * 1024 * 1024 * 1024,
        }
    }
}

impl QueueConfig {
    /// Total reservation budget in bytes, or `None` when unbounded.
    pub fn memory_budget_bytes(&self) -> Option<u64> {
        if self.max_message_queue_memory_usage_ratio <= 0.0 {
            return None;
        }
        let budget = self.max_message_queue_memory_usage_ratio * self.available_memory_bytes as f64;
        Some(budget.floor() as u64)
    }

    /// Estimated memory footprint of an item of `serialized_bytes`.
    pub fn estimated_footprint(&self, serialized_bytes: u64) -> u64 {
        let factor = 1.0 + self.estimated_record_memory_overhead_ratio;
        (serialized_bytes as f64 * factor).ceil() as u64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Upper bound on the time between successful checkpoint flushes before
    /// writers are told to flush partial batches.
    pub max_checkpoint_flush_time_ms: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            max_checkpoint_flush_time_ms: 15 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    pub partition_count: usize,
    /// Batch size, in serialized bytes, that triggers a natural flush.
    pub batch_size_bytes: u64,
    pub partition_strategy: PartitionStrategy,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            partition_count: 4,
            batch_size_bytes: 16 * 1024 * 1024,
            partition_strategy: PartitionStrategy::ByStream,
        }
    }
}

/// How records are assigned to writer partitions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionStrategy {
    /// Every record of a stream lands on the same partition.
    ByStream,
    /// Records are spread across partitions in turn.
    RoundRobin,
}

impl TributaryConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    /// Load configuration from specific project directory
    pub fn load_from_dir(project_dir: impl AsRef<Path>) -> Result<Self> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }

    /// Parse a single TOML document on top of the built-in defaults.
    pub fn from_toml_str(path: impl Into<PathBuf>, content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|source| ConfigError::ParseError {
            path: path.into(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration for tests and for media where another stage already
    /// bounds concurrency: unbounded queue, one partition.
    pub fn unbounded() -> Self {
        Self {
            queue: QueueConfig {
                max_message_queue_memory_usage_ratio: 0.0,
                ..Default::default()
            },
            writers: WriterConfig {
                partition_count: 1,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Rejects values the runtime cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ratio = self.queue.max_message_queue_memory_usage_ratio;
        if !(0.0..=1.0).contains(&ratio) {
            return Err(ConfigError::ValidationError(format!(
                "queue.max_message_queue_memory_usage_ratio must be within [0, 1], got {ratio}"
            )));
        }
        let overhead = self.queue.estimated_record_memory_overhead_ratio;
        if !overhead.is_finite() || overhead < 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "queue.estimated_record_memory_overhead_ratio must be non-negative, got {overhead}"
            )));
        }
        if self.checkpoint.max_checkpoint_flush_time_ms == 0 {
            return Err(ConfigError::ValidationError(
                "checkpoint.max_checkpoint_flush_time_ms must be positive".to_string(),
            ));
        }
        if self.writers.partition_count == 0 {
            return Err(ConfigError::ValidationError(
                "writers.partition_count must be positive".to_string(),
            ));
        }
        if self.writers.partition_count > u32::MAX as usize {
            return Err(ConfigError::ValidationError(format!(
                "writers.partition_count must fit in 32 bits, got {}",
                self.writers.partition_count
            )));
        }
        if self.writers.batch_size_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "writers.batch_size_bytes must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_default_config() {
        let config = TributaryConfig::default();
        assert_eq!(config.writers.partition_count, 4);
        assert_eq!(config.checkpoint.max_checkpoint_flush_time_ms, 900_000);
        assert_eq!(config.writers.partition_strategy, PartitionStrategy::ByStream);
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn test_memory_budget() {
        let queue = QueueConfig {
            max_message_queue_memory_usage_ratio: 0.5,
            estimated_record_memory_overhead_ratio: 0.1,
            available_memory_bytes: 1000,
        };
        assert_eq!(queue.memory_budget_bytes(), Some(500));
        assert_eq!(queue.estimated_footprint(100), 110);
    }

    #[test]
    fn test_zero_ratio_is_unbounded() {
        let config = TributaryConfig::unbounded();
        assert_eq!(config.queue.memory_budget_bytes(), None);
        assert_eq!(config.writers.partition_count, 1);
    }

    #[test]
    fn test_from_toml_str() {
        let config = TributaryConfig::from_toml_str(
            "inline.toml",
            r#"
[queue]
max_message_queue_memory_usage_ratio = 0.3

[writers]
partition_count = 8
partition_strategy = "round-robin"
"#,
        )
        .expect("valid config");

        assert_eq!(config.writers.partition_count, 8);
        assert_eq!(config.writers.partition_strategy, PartitionStrategy::RoundRobin);
        assert!((config.queue.max_message_queue_memory_usage_ratio - 0.3).abs() < f64::EPSILON);
        // Untouched sections keep their defaults
        assert_eq!(config.checkpoint.max_checkpoint_flush_time_ms, 900_000);
    }

    #[test]
    fn test_from_toml_str_parse_error() {
        let err = TributaryConfig::from_toml_str("bad.toml", "[writers\npartition_count = 2")
            .expect_err("malformed TOML");
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test_case("[queue]\nmax_message_queue_memory_usage_ratio = 1.5"; "ratio above one")]
    #[test_case("[queue]\nestimated_record_memory_overhead_ratio = -0.1"; "negative overhead")]
    #[test_case("[checkpoint]\nmax_checkpoint_flush_time_ms = 0"; "zero cadence")]
    #[test_case("[writers]\npartition_count = 0"; "no partitions")]
    #[test_case("[writers]\nbatch_size_bytes = 0"; "empty batches")]
    fn test_validation_rejects(content: &str) {
        let err = TributaryConfig::from_toml_str("invalid.toml", content)
            .expect_err("config should be rejected");
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }
}
