use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{RecallError, Result};
use crate::memory::relevance::RelevanceWeights;

/// Main configuration structure for Recall
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Two-tier cache configuration
    #[serde(default)]
    pub cache: CacheConfig,
    /// Write batching configuration
    #[serde(default)]
    pub batch: BatchConfig,
    /// Relevance ranking configuration
    #[serde(default)]
    pub ranking: RankingConfig,
    /// Background worker configuration
    #[serde(default)]
    pub worker: WorkerConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RecallError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| RecallError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Default locations searched when no explicit path is given
    pub fn default_paths() -> Vec<PathBuf> {
        [
            dirs::home_dir().map(|h| h.join(".recall").join("config.toml")),
            dirs::config_dir().map(|c| c.join("recall").join("config.toml")),
            Some(PathBuf::from("config.toml")),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    /// Reject settings the cache and buffer cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.cache.l1_max_entries == 0 {
            return Err(RecallError::Config(
                "cache.l1_max_entries must be greater than 0".to_string(),
            ));
        }
        if self.cache.l1_ttl_secs == 0 || self.cache.l2_ttl_secs == 0 {
            return Err(RecallError::Config(
                "cache TTLs must be greater than 0".to_string(),
            ));
        }
        let prefix = &self.cache.key_prefix;
        if prefix.is_empty()
            || !prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(RecallError::Config(format!(
                "cache.key_prefix must be non-empty and contain only [A-Za-z0-9_-], got {prefix:?}"
            )));
        }
        if self.batch.batch_size == 0 {
            return Err(RecallError::Config(
                "batch.batch_size must be greater than 0".to_string(),
            ));
        }
        if self.batch.batch_timeout_ms == 0 {
            return Err(RecallError::Config(
                "batch.batch_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.batch.requeue_factor == 0 {
            return Err(RecallError::Config(
                "batch.requeue_factor must be greater than 0".to_string(),
            ));
        }
        if self.worker.queue_capacity == 0 {
            return Err(RecallError::Config(
                "worker.queue_capacity must be greater than 0".to_string(),
            ));
        }
        self.ranking.weights().validate()
    }
}

/// Two-tier cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of entries held by the in-process tier
    #[serde(default = "default_l1_max_entries")]
    pub l1_max_entries: usize,
    /// Time-to-live for in-process entries, in seconds
    #[serde(default = "default_l1_ttl_secs")]
    pub l1_ttl_secs: u64,
    /// Time-to-live for shared-tier entries, in seconds
    #[serde(default = "default_l2_ttl_secs")]
    pub l2_ttl_secs: u64,
    /// Prefix for every cache key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl CacheConfig {
    pub fn l1_ttl(&self) -> Duration {
        Duration::from_secs(self.l1_ttl_secs)
    }

    pub fn l2_ttl(&self) -> Duration {
        Duration::from_secs(self.l2_ttl_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_max_entries: default_l1_max_entries(),
            l1_ttl_secs: default_l1_ttl_secs(),
            l2_ttl_secs: default_l2_ttl_secs(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_l1_max_entries() -> usize {
    1000
}

fn default_l1_ttl_secs() -> u64 {
    300
}

fn default_l2_ttl_secs() -> u64 {
    600
}

fn default_key_prefix() -> String {
    "mem".to_string()
}

/// Write batching configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Number of pending writes that triggers an immediate flush
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Maximum time a write waits in the buffer before a delayed flush, in milliseconds
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,
    /// Failed batches are requeued only while the buffer stays under
    /// `requeue_factor * batch_size` items
    #[serde(default = "default_requeue_factor")]
    pub requeue_factor: usize,
}

impl BatchConfig {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    /// Upper bound on buffer length when requeueing a failed batch
    pub fn requeue_cap(&self) -> usize {
        self.batch_size.saturating_mul(self.requeue_factor)
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_timeout_ms: default_batch_timeout_ms(),
            requeue_factor: default_requeue_factor(),
        }
    }
}

fn default_batch_size() -> usize {
    100
}

fn default_batch_timeout_ms() -> u64 {
    1000
}

fn default_requeue_factor() -> usize {
    3
}

/// Relevance ranking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankingConfig {
    /// Weight of the recency component (0.0-1.0)
    #[serde(default = "default_recency_weight")]
    pub recency_weight: f32,
    /// Weight of the access-frequency component (0.0-1.0)
    #[serde(default = "default_frequency_weight")]
    pub frequency_weight: f32,
    /// Weight of the explicit importance component (0.0-1.0)
    #[serde(default = "default_importance_weight")]
    pub importance_weight: f32,
    /// Maximum number of candidates scored per ranked read
    #[serde(default = "default_candidate_pool")]
    pub candidate_pool: usize,
    /// Default look-back window for ranked reads, in days
    #[serde(default = "default_recency_window_days")]
    pub recency_window_days: i64,
}

impl RankingConfig {
    pub fn weights(&self) -> RelevanceWeights {
        RelevanceWeights {
            recency: self.recency_weight,
            frequency: self.frequency_weight,
            importance: self.importance_weight,
        }
    }

    pub fn recency_window(&self) -> chrono::Duration {
        chrono::Duration::days(self.recency_window_days)
    }
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            recency_weight: default_recency_weight(),
            frequency_weight: default_frequency_weight(),
            importance_weight: default_importance_weight(),
            candidate_pool: default_candidate_pool(),
            recency_window_days: default_recency_window_days(),
        }
    }
}

fn default_recency_weight() -> f32 {
    0.3
}

fn default_frequency_weight() -> f32 {
    0.2
}

fn default_importance_weight() -> f32 {
    0.5
}

fn default_candidate_pool() -> usize {
    500
}

fn default_recency_window_days() -> i64 {
    30
}

/// Background worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Bounded capacity of the job queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_queue_capacity() -> usize {
    1024
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.cache.l1_max_entries, 1000);
        assert_eq!(config.cache.l1_ttl_secs, 300);
        assert_eq!(config.cache.l2_ttl_secs, 600);
        assert_eq!(config.cache.key_prefix, "mem");
        assert_eq!(config.batch.batch_size, 100);
        assert_eq!(config.batch.batch_timeout_ms, 1000);
        assert_eq!(config.batch.requeue_factor, 3);
        assert_eq!(config.batch.requeue_cap(), 300);
        assert_eq!(config.ranking.candidate_pool, 500);
        assert_eq!(config.ranking.recency_window_days, 30);
        assert_eq!(config.worker.queue_capacity, 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_weights() {
        let weights = Config::default().ranking.weights();
        assert!((weights.recency - 0.3).abs() < f32::EPSILON);
        assert!((weights.frequency - 0.2).abs() < f32::EPSILON);
        assert!((weights.importance - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_l2_ttl_longer_than_l1() {
        let config = Config::default();
        assert!(config.cache.l2_ttl() > config.cache.l1_ttl());
    }

    #[test]
    fn test_toml_deserialization() {
        let toml_str = r#"
[cache]
l1_max_entries = 50
l1_ttl_secs = 10
l2_ttl_secs = 20
key_prefix = "test"

[batch]
batch_size = 5
batch_timeout_ms = 250
requeue_factor = 2

[ranking]
recency_weight = 0.4
frequency_weight = 0.1
importance_weight = 0.5
candidate_pool = 100
recency_window_days = 7

[worker]
queue_capacity = 16
"#;

        let config: Config = toml::from_str(toml_str).expect("Failed to parse TOML");

        assert_eq!(config.cache.l1_max_entries, 50);
        assert_eq!(config.cache.l1_ttl(), Duration::from_secs(10));
        assert_eq!(config.cache.l2_ttl(), Duration::from_secs(20));
        assert_eq!(config.cache.key_prefix, "test");
        assert_eq!(config.batch.batch_size, 5);
        assert_eq!(config.batch.batch_timeout(), Duration::from_millis(250));
        assert_eq!(config.batch.requeue_cap(), 10);
        assert!((config.ranking.recency_weight - 0.4).abs() < f32::EPSILON);
        assert_eq!(config.ranking.candidate_pool, 100);
        assert_eq!(config.ranking.recency_window(), chrono::Duration::days(7));
        assert_eq!(config.worker.queue_capacity, 16);
    }

    #[test]
    fn test_toml_partial_deserialization() {
        let toml_str = r#"
[batch]
batch_size = 10
"#;

        let config: Config = toml::from_str(toml_str).expect("Failed to parse partial TOML");

        assert_eq!(config.batch.batch_size, 10);
        assert_eq!(config.batch.batch_timeout_ms, 1000); // default
        assert_eq!(config.cache.l1_max_entries, 1000); // default
        assert_eq!(config.worker.queue_capacity, 1024); // default
    }

    #[test]
    fn test_validate_rejects_zero_batch_size() {
        let mut config = Config::default();
        config.batch.batch_size = 0;
        assert!(matches!(config.validate(), Err(RecallError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = Config::default();
        config.cache.l1_max_entries = 0;
        assert!(matches!(config.validate(), Err(RecallError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_key_prefix() {
        for prefix in ["", "a:b", "mem*"] {
            let mut config = Config::default();
            config.cache.key_prefix = prefix.to_string();
            assert!(matches!(config.validate(), Err(RecallError::Config(_))));
        }
    }

    #[test]
    fn test_validate_rejects_negative_weight() {
        let mut config = Config::default();
        config.ranking.frequency_weight = -0.1;
        assert!(matches!(config.validate(), Err(RecallError::Config(_))));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[cache]\nl1_max_entries = 42").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.cache.l1_max_entries, 42);
    }

    #[test]
    fn test_from_file_missing() {
        let result = Config::from_file(Path::new("/nonexistent/recall/config.toml"));
        assert!(matches!(result, Err(RecallError::Config(_))));
    }

    #[test]
    fn test_from_file_invalid_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[batch]\nbatch_timeout_ms = 0").unwrap();

        let result = Config::from_file(file.path());
        assert!(matches!(result, Err(RecallError::Config(_))));
    }
}
