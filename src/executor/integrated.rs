//! In-process executor: runs a `SpeechModel` on blocking threads behind a
//! semaphore bound.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::error::ExecutorError;
use crate::model::SpeechModel;
use crate::protocol::JobPayload;

use super::{Executor, ExecutorOutput};

#[derive(Debug, Clone)]
pub struct IntegratedExecutorConfig {
    /// Transcriptions running at once. Defaults to available parallelism.
    pub max_concurrent: usize,
    /// Deadline for one submission, queue wait included.
    pub submit_timeout: Duration,
}

impl Default for IntegratedExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2),
            submit_timeout: Duration::from_millis(crate::defaults::SUBMIT_TIMEOUT_MS),
        }
    }
}

/// Executor that transcribes with an in-process model. Model inference is
/// blocking, so each submission runs on a `spawn_blocking` thread; the
/// semaphore caps how many run at once.
pub struct IntegratedExecutor<M: SpeechModel + 'static> {
    model: Arc<M>,
    semaphore: Arc<Semaphore>,
    submit_timeout: Duration,
}

impl<M: SpeechModel + 'static> IntegratedExecutor<M> {
    pub fn new(model: M) -> Self {
        Self::with_config(model, IntegratedExecutorConfig::default())
    }

    pub fn with_config(model: M, config: IntegratedExecutorConfig) -> Self {
        Self {
            model: Arc::new(model),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            submit_timeout: config.submit_timeout,
        }
    }
}

#[async_trait]
impl<M: SpeechModel + 'static> Executor for IntegratedExecutor<M> {
    async fn submit(&self, payload: &JobPayload) -> Result<ExecutorOutput, ExecutorError> {
        let permit = match tokio::time::timeout(
            self.submit_timeout,
            Arc::clone(&self.semaphore).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(ExecutorError::Unavailable),
            Err(_) => return Err(ExecutorError::Timeout),
        };

        let model = Arc::clone(&self.model);
        let payload = payload.clone();
        let started = Instant::now();

        let work = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            match &payload {
                JobPayload::Chunk(chunk) => model.transcribe(&chunk.samples),
                JobPayload::File(path) => model.transcribe_file(path),
            }
        });

        let remaining = self
            .submit_timeout
            .saturating_sub(started.elapsed().min(self.submit_timeout));
        match tokio::time::timeout(remaining.max(Duration::from_millis(1)), work).await {
            Ok(Ok(Ok(text))) => {
                let timing_ms = started.elapsed().as_millis() as u64;
                debug!(timing_ms, "integrated transcription finished");
                Ok(ExecutorOutput { text, timing_ms })
            }
            Ok(Ok(Err(failure))) => Err(ExecutorError::Model(failure.message)),
            Ok(Err(join_err)) => Err(ExecutorError::Model(format!(
                "model thread panicked: {join_err}"
            ))),
            Err(_) => Err(ExecutorError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MockModel;
    use crate::protocol::AudioChunk;
    use chrono::Utc;

    fn chunk_payload() -> JobPayload {
        JobPayload::Chunk(AudioChunk {
            index: 0,
            start_sample: 0,
            end_sample: 10,
            samples: vec![0.0; 10],
            sample_rate: 16_000,
            captured_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn transcribes_chunk_through_model() {
        let executor = IntegratedExecutor::new(MockModel::new().with_response("hello world"));
        let out = executor.submit(&chunk_payload()).await.unwrap();
        assert_eq!(out.text, "hello world");
    }

    #[tokio::test]
    async fn model_failure_maps_to_model_error() {
        let executor = IntegratedExecutor::new(MockModel::new().with_failure("garbled audio"));
        let err = executor.submit(&chunk_payload()).await.unwrap_err();
        assert_eq!(err, ExecutorError::Model("garbled audio".to_string()));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn slow_model_times_out() {
        let config = IntegratedExecutorConfig {
            max_concurrent: 1,
            submit_timeout: Duration::from_millis(20),
        };
        let executor = IntegratedExecutor::with_config(
            MockModel::new().with_delay(Duration::from_millis(500)),
            config,
        );
        let err = executor.submit(&chunk_payload()).await.unwrap_err();
        assert_eq!(err, ExecutorError::Timeout);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn concurrent_submissions_respect_the_bound() {
        let config = IntegratedExecutorConfig {
            max_concurrent: 1,
            submit_timeout: Duration::from_secs(5),
        };
        let executor = Arc::new(IntegratedExecutor::with_config(
            MockModel::new().with_delay(Duration::from_millis(30)),
            config,
        ));

        let a = {
            let executor = Arc::clone(&executor);
            tokio::spawn(async move { executor.submit(&chunk_payload()).await })
        };
        let b = {
            let executor = Arc::clone(&executor);
            tokio::spawn(async move { executor.submit(&chunk_payload()).await })
        };

        // Both finish; the second just waits for the first's permit.
        assert!(a.await.unwrap().is_ok());
        assert!(b.await.unwrap().is_ok());
    }
}
