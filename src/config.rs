use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::defaults;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub queue: QueueConfig,
    pub chunking: ChunkingConfig,
    pub workers: WorkerConfig,
    pub strategy: StrategyConfig,
}

/// Queue backpressure and retry configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    /// Unsettled jobs accepted before enqueue is rejected.
    pub max_queue_size: usize,
    /// Re-dispatches allowed for a batch job after its first attempt.
    pub max_retries: u32,
    /// How long a lease holds a job before it returns to pending, in ms.
    pub lease_timeout_ms: u64,
    /// Consumer poll interval when the queue is empty, in ms.
    pub poll_interval_ms: u64,
}

/// Streaming chunk configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChunkingConfig {
    pub sample_rate: u32,
    pub chunk_duration_s: f32,
    pub chunk_overlap_s: f32,
    /// Circular buffer capacity, in seconds of audio.
    pub buffer_capacity_s: f32,
    /// Transient-failure retries per chunk before it becomes a gap.
    pub max_chunk_retries: u32,
    /// Chunks transcribed concurrently.
    pub max_concurrent_chunks: usize,
    /// Wait for in-flight chunks after stop, in ms.
    pub grace_timeout_ms: u64,
    /// Deduplicate repeated words at overlapped chunk boundaries.
    pub dedup_boundaries: bool,
}

/// Worker pool configuration (advanced mode)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    pub worker_count: usize,
    pub health_check_interval_ms: u64,
    /// Consecutive failed probes before a worker is marked unhealthy.
    pub health_failure_threshold: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    /// Per-request response deadline, in ms.
    pub response_timeout_ms: u64,
}

/// Strategy selection configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StrategyConfig {
    /// Recordings longer than this stream, provided capture is chunked.
    pub streaming_threshold_s: f32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: defaults::MAX_QUEUE_SIZE,
            max_retries: defaults::MAX_RETRIES,
            lease_timeout_ms: defaults::LEASE_TIMEOUT_MS,
            poll_interval_ms: defaults::POLL_INTERVAL_MS,
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            sample_rate: defaults::SAMPLE_RATE,
            chunk_duration_s: defaults::CHUNK_DURATION_S,
            chunk_overlap_s: defaults::CHUNK_OVERLAP_S,
            buffer_capacity_s: defaults::BUFFER_CAPACITY_S,
            max_chunk_retries: defaults::MAX_CHUNK_RETRIES,
            max_concurrent_chunks: defaults::MAX_CONCURRENT_CHUNKS,
            grace_timeout_ms: defaults::GRACE_TIMEOUT_MS,
            dedup_boundaries: true,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: defaults::WORKER_COUNT,
            health_check_interval_ms: defaults::HEALTH_CHECK_INTERVAL_MS,
            health_failure_threshold: defaults::HEALTH_FAILURE_THRESHOLD,
            backoff_initial_ms: defaults::BACKOFF_INITIAL_MS,
            backoff_max_ms: defaults::BACKOFF_MAX_MS,
            response_timeout_ms: defaults::RESPONSE_TIMEOUT_MS,
        }
    }
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            streaming_threshold_s: defaults::STREAMING_THRESHOLD_S,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file contains invalid TOML.
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from a file or return defaults if file doesn't exist
    ///
    /// Only returns defaults if the file is missing.
    /// Returns errors for invalid TOML.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(e) => {
                if e.downcast_ref::<std::io::Error>()
                    .map(|io_err| io_err.kind() == std::io::ErrorKind::NotFound)
                    .unwrap_or(false)
                {
                    Ok(Self::default())
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - SCRIBEQ_MAX_QUEUE_SIZE → queue.max_queue_size
    /// - SCRIBEQ_MAX_RETRIES → queue.max_retries
    /// - SCRIBEQ_WORKER_COUNT → workers.worker_count
    /// - SCRIBEQ_CHUNK_DURATION_S → chunking.chunk_duration_s
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(value) = std::env::var("SCRIBEQ_MAX_QUEUE_SIZE")
            && let Ok(parsed) = value.parse()
        {
            self.queue.max_queue_size = parsed;
        }

        if let Ok(value) = std::env::var("SCRIBEQ_MAX_RETRIES")
            && let Ok(parsed) = value.parse()
        {
            self.queue.max_retries = parsed;
        }

        if let Ok(value) = std::env::var("SCRIBEQ_WORKER_COUNT")
            && let Ok(parsed) = value.parse()
        {
            self.workers.worker_count = parsed;
        }

        if let Ok(value) = std::env::var("SCRIBEQ_CHUNK_DURATION_S")
            && let Ok(parsed) = value.parse()
        {
            self.chunking.chunk_duration_s = parsed;
        }

        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    // Mutex to serialize tests that modify environment variables
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    // SAFETY: These helpers are only used in tests with ENV_LOCK held,
    // ensuring no concurrent access to environment variables.
    fn set_env(key: &str, value: &str) {
        unsafe { std::env::set_var(key, value) }
    }

    fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) }
    }

    fn clear_scribeq_env() {
        remove_env("SCRIBEQ_MAX_QUEUE_SIZE");
        remove_env("SCRIBEQ_MAX_RETRIES");
        remove_env("SCRIBEQ_WORKER_COUNT");
        remove_env("SCRIBEQ_CHUNK_DURATION_S");
    }

    #[test]
    fn default_config_has_documented_values() {
        let config = Config::default();

        assert_eq!(config.queue.max_queue_size, 100);
        assert_eq!(config.queue.max_retries, 10);
        assert_eq!(config.chunking.chunk_duration_s, 5.0);
        assert_eq!(config.chunking.chunk_overlap_s, 0.0);
        assert_eq!(config.chunking.max_chunk_retries, 2);
        assert_eq!(config.workers.worker_count, 2);
        assert_eq!(config.workers.health_failure_threshold, 3);
        assert_eq!(config.strategy.streaming_threshold_s, 5.0);
    }

    #[test]
    fn load_from_toml_file() {
        let toml_content = r#"
            [queue]
            max_queue_size = 8
            max_retries = 3

            [chunking]
            chunk_duration_s = 2.5
            chunk_overlap_s = 0.5
            max_concurrent_chunks = 4

            [workers]
            worker_count = 3
            backoff_initial_ms = 500

            [strategy]
            streaming_threshold_s = 10.0
        "#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();

        let config = Config::load(temp_file.path()).unwrap();

        assert_eq!(config.queue.max_queue_size, 8);
        assert_eq!(config.queue.max_retries, 3);
        assert_eq!(config.chunking.chunk_duration_s, 2.5);
        assert_eq!(config.chunking.chunk_overlap_s, 0.5);
        assert_eq!(config.chunking.max_concurrent_chunks, 4);
        assert_eq!(config.workers.worker_count, 3);
        assert_eq!(config.workers.backoff_initial_ms, 500);
        assert_eq!(config.strategy.streaming_threshold_s, 10.0);
    }

    #[test]
    fn partial_config_uses_defaults() {
        let toml_content = r#"
            [queue]
            max_retries = 1
        "#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();

        let config = Config::load(temp_file.path()).unwrap();

        assert_eq!(config.queue.max_retries, 1);
        assert_eq!(config.queue.max_queue_size, 100);
        assert_eq!(config.workers.worker_count, 2);
    }

    #[test]
    fn env_overrides_apply() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_scribeq_env();

        set_env("SCRIBEQ_MAX_QUEUE_SIZE", "7");
        set_env("SCRIBEQ_WORKER_COUNT", "5");
        let config = Config::default().with_env_overrides();

        assert_eq!(config.queue.max_queue_size, 7);
        assert_eq!(config.workers.worker_count, 5);
        assert_eq!(config.queue.max_retries, 10); // Not overridden

        clear_scribeq_env();
    }

    #[test]
    fn env_override_invalid_value_ignored() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_scribeq_env();

        set_env("SCRIBEQ_MAX_RETRIES", "not-a-number");
        let config = Config::default().with_env_overrides();

        assert_eq!(config.queue.max_retries, 10);

        clear_scribeq_env();
    }

    #[test]
    fn invalid_toml_returns_error() {
        let invalid_toml = r#"
            [queue
            max_retries = "broken
        "#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(invalid_toml.as_bytes()).unwrap();

        assert!(Config::load(temp_file.path()).is_err());
        assert!(Config::load_or_default(temp_file.path()).is_err());
    }

    #[test]
    fn load_or_default_returns_default_for_missing_file() {
        let missing_path = Path::new("/tmp/nonexistent_scribeq_config_12345.toml");
        let config = Config::load_or_default(missing_path).unwrap();

        assert_eq!(config, Config::default());
    }
}
