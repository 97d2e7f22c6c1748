//! Storage sink: where finished sessions go.
//!
//! Persistence happens exactly once per session, after the terminal event
//! has been emitted. A sink failure is a scheduler-level error; the session
//! itself already finished.

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::StorageError;
use crate::protocol::{PerformanceRecord, Transcript};

#[async_trait]
pub trait StorageSink: Send + Sync {
    async fn persist(
        &self,
        transcript: &Transcript,
        metrics: &PerformanceRecord,
    ) -> Result<(), StorageError>;
}

/// In-memory sink for tests and callers that persist elsewhere.
pub struct MemorySink {
    entries: Mutex<Vec<(Transcript, PerformanceRecord)>>,
    fail_with: Mutex<Option<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            fail_with: Mutex::new(None),
        }
    }

    /// Make every subsequent persist fail, for error-path tests.
    pub async fn fail_with(&self, message: impl Into<String>) {
        *self.fail_with.lock().await = Some(message.into());
    }

    pub async fn entries(&self) -> Vec<(Transcript, PerformanceRecord)> {
        self.entries.lock().await.clone()
    }

    pub async fn take(&self) -> Vec<(Transcript, PerformanceRecord)> {
        std::mem::take(&mut *self.entries.lock().await)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageSink for MemorySink {
    async fn persist(
        &self,
        transcript: &Transcript,
        metrics: &PerformanceRecord,
    ) -> Result<(), StorageError> {
        if let Some(message) = self.fail_with.lock().await.as_ref() {
            return Err(StorageError::new(message.clone()));
        }
        self.entries
            .lock()
            .await
            .push((transcript.clone(), metrics.clone()));
        Ok(())
    }
}
