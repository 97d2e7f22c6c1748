//! Error types for scribeq.
//!
//! Each seam (executor, queue, worker boundary, storage sink, chunk buffer)
//! has its own small error enum so callers can match on exactly the failures
//! that seam produces; `ScribeqError` is the top-level aggregate.

use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ScribeqError {
    // Configuration errors
    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // Component errors
    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    // Session lifecycle errors
    #[error("Session error: {message}")]
    Session { message: String },

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, ScribeqError>;

/// Errors from the transcription executor.
///
/// `Timeout` and `Unavailable` are transient and retried up to the configured
/// ceiling; `Model` failures are never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("Transcription timed out")]
    Timeout,

    #[error("No transcription capacity available")]
    Unavailable,

    #[error("Model error: {0}")]
    Model(String),
}

impl ExecutorError {
    /// Transient errors are eligible for retry; model errors are terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Unavailable)
    }
}

/// Errors from the durable job queue.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue is full (limit {limit})")]
    Full { limit: usize },

    #[error("Job {id} has no active lease")]
    NotLeased { id: Uuid },

    #[error("Queue storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("Queue encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Queue decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("Queue transport error: {message}")]
    Transport { message: String },
}

/// Errors at the external worker process boundary.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to spawn worker process: {message}")]
    Spawn { message: String },

    #[error("Worker response timed out")]
    Timeout,

    #[error("Worker channel closed")]
    Closed,

    #[error("Worker protocol error: {message}")]
    Protocol { message: String },

    #[error("Worker is {state}, expected Idle")]
    NotIdle { state: String },
}

/// Error reported by a storage sink when persisting a finished session.
#[derive(Error, Debug, Clone)]
#[error("Storage sink failure: {message}")]
pub struct StorageError {
    pub message: String,
}

impl StorageError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Errors from the circular chunk buffer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("Window starting at sample {start} was overwritten (oldest resident: {oldest})")]
    Stale { start: u64, oldest: u64 },

    #[error("Window ends at sample {requested_end} but only {written} samples written")]
    Underrun { requested_end: u64, written: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executor_error_retryability() {
        assert!(ExecutorError::Timeout.is_retryable());
        assert!(ExecutorError::Unavailable.is_retryable());
        assert!(!ExecutorError::Model("bad audio".to_string()).is_retryable());
    }

    #[test]
    fn queue_full_display() {
        let err = QueueError::Full { limit: 2 };
        assert_eq!(err.to_string(), "Queue is full (limit 2)");
    }

    #[test]
    fn buffer_stale_display() {
        let err = BufferError::Stale {
            start: 100,
            oldest: 4800,
        };
        assert!(err.to_string().contains("overwritten"));
    }

    #[test]
    fn storage_error_wraps_into_top_level() {
        let err: ScribeqError = StorageError::new("disk full").into();
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn errors_are_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<ScribeqError>();
        assert_sync::<ScribeqError>();
        assert_send::<ExecutorError>();
        assert_sync::<ExecutorError>();
    }
}
