//! Executor seam: where transcription work is actually performed.
//!
//! Coordinators hand a payload to an `Executor` and get text back; whether
//! that runs in-process (`IntegratedExecutor`) or on an external worker
//! pool (`PooledExecutor`) is invisible above this trait.

mod integrated;
mod pooled;

pub use integrated::{IntegratedExecutor, IntegratedExecutorConfig};
pub use pooled::PooledExecutor;

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ExecutorError;
use crate::protocol::JobPayload;

/// Successful transcription output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorOutput {
    pub text: String,
    pub timing_ms: u64,
}

/// Performs one transcription. Implementations bound their own concurrency;
/// submitting more work than capacity yields `Unavailable`, not a panic.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn submit(&self, payload: &JobPayload) -> Result<ExecutorOutput, ExecutorError>;
}

/// Scripted executor for tests. Responses are consumed in submission order;
/// once the script is exhausted, the default response is returned.
pub struct MockExecutor {
    script: Mutex<VecDeque<Result<String, ExecutorError>>>,
    default_response: String,
    delay: Option<Duration>,
    calls: AtomicU64,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default_response: "mock transcription".to_string(),
            delay: None,
            calls: AtomicU64::new(0),
        }
    }

    pub fn with_response(self, text: impl Into<String>) -> Self {
        self.script
            .lock()
            .expect("mock lock poisoned")
            .push_back(Ok(text.into()));
        self
    }

    pub fn with_error(self, error: ExecutorError) -> Self {
        self.script
            .lock()
            .expect("mock lock poisoned")
            .push_back(Err(error));
        self
    }

    pub fn with_default_response(mut self, text: impl Into<String>) -> Self {
        self.default_response = text.into();
        self
    }

    /// Await this long per submission, simulating inference latency.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for MockExecutor {
    async fn submit(&self, _payload: &JobPayload) -> Result<ExecutorOutput, ExecutorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self
            .script
            .lock()
            .expect("mock lock poisoned")
            .pop_front();
        match next {
            Some(Ok(text)) => Ok(ExecutorOutput { text, timing_ms: 1 }),
            Some(Err(error)) => Err(error),
            None => Ok(ExecutorOutput {
                text: self.default_response.clone(),
                timing_ms: 1,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn mock_executor_plays_script_then_default() {
        let executor = MockExecutor::new()
            .with_response("one")
            .with_error(ExecutorError::Timeout)
            .with_default_response("fallback");
        let payload = JobPayload::File(PathBuf::from("a.wav"));

        assert_eq!(executor.submit(&payload).await.unwrap().text, "one");
        assert_eq!(
            executor.submit(&payload).await.unwrap_err(),
            ExecutorError::Timeout
        );
        assert_eq!(executor.submit(&payload).await.unwrap().text, "fallback");
        assert_eq!(executor.call_count(), 3);
    }
}
